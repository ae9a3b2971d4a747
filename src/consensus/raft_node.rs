//! Raft consensus node
//!
//! One replica of the consensus group. All protocol state lives behind a
//! single mutex that is never held across an `.await`: RPCs are built under
//! the lock, sent without it, and their responses folded back in under the
//! lock again after checking the term has not moved.
//!
//! Lock order: `state` before `fsm` before `store`.

use crate::common::scheduler::PeriodicTask;
use crate::common::{MetricsRegistry, RaftConfig};
use crate::consensus::fsm::{ClusterEvent, ClusterFsm};
use crate::consensus::log_store::{HardState, LogStore};
use crate::consensus::raft::{
    AppendRequest, AppendResponse, Command, InstallSnapshotRequest, InstallSnapshotResponse,
    LogEntry, SessionRegistration, TimeoutNowRequest, VoteRequest, VoteResponse,
};
use crate::consensus::state::{RaftRole, RaftState};
use crate::consensus::transport::RaftTransport;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;

/// Upper bound on entries shipped in one AppendEntries
const MAX_ENTRIES_PER_APPEND: usize = 256;
const EVENT_CHANNEL_CAPACITY: usize = 1024;

enum Outbound {
    Append(AppendRequest),
    Snapshot(InstallSnapshotRequest),
}

enum Reply {
    Append(AppendResponse),
    Snapshot(InstallSnapshotResponse),
}

pub struct RaftNode {
    id: String,
    config: RaftConfig,
    state: Mutex<RaftState>,
    fsm: RwLock<ClusterFsm>,
    store: Option<Mutex<LogStore>>,
    transport: Arc<dyn RaftTransport>,
    commit_tx: watch::Sender<u64>,
    events: broadcast::Sender<ClusterEvent>,
    election_deadline: Mutex<Instant>,
    last_broadcast: Mutex<Instant>,
    /// Last successful exchange with each peer
    contacts: Mutex<HashMap<String, DateTime<Utc>>>,
    metrics: Arc<MetricsRegistry>,
}

impl RaftNode {
    /// In-memory replica seeded with the initial voter set `members` (id -> address)
    pub fn new(
        id: impl Into<String>,
        config: RaftConfig,
        members: BTreeMap<String, String>,
        transport: Arc<dyn RaftTransport>,
        metrics: Arc<MetricsRegistry>,
    ) -> Arc<Self> {
        Self::build(id.into(), config, members, transport, metrics, None, RaftState::new())
    }

    /// Durable replica: reloads hard state and log segments from `log_dir`
    pub fn open(
        id: impl Into<String>,
        config: RaftConfig,
        members: BTreeMap<String, String>,
        transport: Arc<dyn RaftTransport>,
        metrics: Arc<MetricsRegistry>,
        log_dir: &Path,
        segment_max_bytes: u64,
    ) -> Result<Arc<Self>> {
        let id = id.into();
        let (store, entries) = LogStore::open(log_dir, segment_max_bytes)?;
        let hard = store.load_hard_state()?;

        let mut state = RaftState::new();
        state.current_term = hard.current_term;
        state.voted_for = hard.voted_for;
        if let Some(first) = entries.first() {
            // entries before the first segment record live in a snapshot
            state.snapshot_index = first.index - 1;
        }
        state.log = entries;

        tracing::info!(
            node_id = %id,
            term = state.current_term,
            last_index = state.last_log_index(),
            "Recovered raft state"
        );

        Ok(Self::build(
            id,
            config,
            members,
            transport,
            metrics,
            Some(store),
            state,
        ))
    }

    fn build(
        id: String,
        config: RaftConfig,
        members: BTreeMap<String, String>,
        transport: Arc<dyn RaftTransport>,
        metrics: Arc<MetricsRegistry>,
        store: Option<LogStore>,
        state: RaftState,
    ) -> Arc<Self> {
        let (commit_tx, _) = watch::channel(0);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let node = Self {
            id,
            state: Mutex::new(state),
            fsm: RwLock::new(ClusterFsm::bootstrap(members)),
            store: store.map(Mutex::new),
            transport,
            commit_tx,
            events,
            election_deadline: Mutex::new(Instant::now()),
            last_broadcast: Mutex::new(Instant::now()),
            contacts: Mutex::new(HashMap::new()),
            metrics,
            config,
        };
        node.reset_election_deadline();
        Arc::new(node)
    }

    // === Accessors ===

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn role(&self) -> RaftRole {
        self.state.lock().role
    }

    pub fn is_leader(&self) -> bool {
        self.state.lock().role == RaftRole::Leader
    }

    pub fn leader_id(&self) -> Option<String> {
        self.state.lock().leader_id.clone()
    }

    pub fn current_term(&self) -> u64 {
        self.state.lock().current_term
    }

    pub fn commit_index(&self) -> u64 {
        self.state.lock().commit_index
    }

    pub fn last_applied(&self) -> u64 {
        self.state.lock().last_applied
    }

    pub fn last_log_index(&self) -> u64 {
        self.state.lock().last_log_index()
    }

    /// First index still held in the log (everything before is in a snapshot)
    pub fn snapshot_index(&self) -> u64 {
        self.state.lock().snapshot_index
    }

    /// Committed voting members
    pub fn members(&self) -> BTreeMap<String, String> {
        self.fsm.read().members.clone()
    }

    pub fn is_member(&self, id: &str) -> bool {
        self.fsm.read().is_member(id)
    }

    /// Sessions whose registration has committed
    pub fn registered_sessions(&self) -> BTreeMap<String, SessionRegistration> {
        self.fsm.read().sessions.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> {
        self.events.subscribe()
    }

    pub fn peer_contact(&self, peer: &str) -> Option<DateTime<Utc>> {
        self.contacts.lock().get(peer).copied()
    }

    pub fn config(&self) -> &RaftConfig {
        &self.config
    }

    fn peers(&self) -> Vec<String> {
        self.fsm
            .read()
            .members
            .keys()
            .filter(|id| **id != self.id)
            .cloned()
            .collect()
    }

    fn quorum(&self) -> usize {
        self.fsm.read().members.len() / 2 + 1
    }

    fn reset_election_deadline(&self) {
        let timeout = rand::thread_rng()
            .gen_range(self.config.election_timeout_min_ms..=self.config.election_timeout_max_ms);
        *self.election_deadline.lock() = Instant::now() + Duration::from_millis(timeout);
    }

    fn record_contact(&self, peer: &str) {
        self.contacts.lock().insert(peer.to_string(), Utc::now());
    }

    fn emit(&self, event: ClusterEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    fn persist_hard_state(&self, state: &RaftState) -> Result<()> {
        if let Some(store) = &self.store {
            store.lock().save_hard_state(&HardState {
                current_term: state.current_term,
                voted_for: state.voted_for.clone(),
            })?;
        }
        Ok(())
    }

    fn persist_append(&self, entries: &[LogEntry]) -> Result<()> {
        if let Some(store) = &self.store {
            store.lock().append(entries)?;
        }
        Ok(())
    }

    fn persist_rewrite(&self, state: &RaftState) -> Result<()> {
        if let Some(store) = &self.store {
            store
                .lock()
                .rewrite(&state.log, state.last_log_index() + 1)?;
        }
        Ok(())
    }

    /// Step down to follower. Emits a leader change if the leader is now unknown.
    fn step_down(&self, state: &mut RaftState, term: u64) -> Result<()> {
        let term_changed = term > state.current_term;
        let was_leader = state.role == RaftRole::Leader;
        state.become_follower(term);
        if term_changed || was_leader {
            state.leader_id = None;
            self.emit(ClusterEvent::LeaderChanged {
                term: state.current_term,
                leader_id: None,
            });
        }
        if term_changed {
            self.persist_hard_state(state)?;
        }
        Ok(())
    }

    // === Driver ===

    /// One driver iteration: leaders heartbeat, followers and candidates
    /// campaign once their election deadline passes.
    pub async fn tick(&self) {
        let now = Instant::now();
        if self.is_leader() {
            let due = *self.last_broadcast.lock() + self.config.heartbeat_interval();
            if now >= due {
                self.replicate().await;
            }
            return;
        }

        if now >= *self.election_deadline.lock() {
            if !self.is_member(&self.id) {
                self.reset_election_deadline();
                return;
            }
            if let Err(e) = self.start_election().await {
                tracing::warn!(node_id = %self.id, error = %e, "Election failed");
            }
        }
    }

    /// Periodic task that drives this replica
    pub fn driver(self: &Arc<Self>) -> PeriodicTask {
        let node = self.clone();
        PeriodicTask::new(
            format!("raft-driver-{}", self.id),
            self.config.tick_interval(),
            move || {
                let node = node.clone();
                async move { node.tick().await }
            },
        )
    }

    // === Elections ===

    async fn start_election(&self) -> Result<()> {
        let req = {
            let mut state = self.state.lock();
            state.become_candidate(&self.id);
            self.persist_hard_state(&state)?;
            VoteRequest {
                term: state.current_term,
                candidate_id: self.id.clone(),
                last_log_index: state.last_log_index(),
                last_log_term: state.last_log_term(),
            }
        };
        self.reset_election_deadline();
        self.metrics.elections_total.inc();
        tracing::info!(node_id = %self.id, term = req.term, "Starting election");

        let term = req.term;
        let peers = self.peers();
        let quorum = self.quorum();
        let rpc_timeout = self.config.rpc_timeout();

        let requests = peers.iter().map(|peer| {
            let req = req.clone();
            async move {
                let result =
                    tokio::time::timeout(rpc_timeout, self.transport.request_vote(peer, req)).await;
                (peer.clone(), result)
            }
        });
        let results = join_all(requests).await;

        let mut votes = 1;
        for (peer, result) in results {
            match result {
                Ok(Ok(resp)) => {
                    if resp.term > term {
                        let mut state = self.state.lock();
                        if resp.term > state.current_term {
                            self.step_down(&mut state, resp.term)?;
                        }
                        return Ok(());
                    }
                    if resp.vote_granted {
                        votes += 1;
                        tracing::debug!(node_id = %self.id, peer = %peer, term, "Vote granted");
                    }
                }
                Ok(Err(e)) => tracing::debug!(peer = %peer, error = %e, "Vote request failed"),
                Err(_) => tracing::debug!(peer = %peer, "Vote request timed out"),
            }
        }

        if votes < quorum {
            tracing::debug!(node_id = %self.id, term, votes, quorum, "Election lost");
            return Ok(());
        }

        {
            let mut state = self.state.lock();
            if state.role != RaftRole::Candidate || state.current_term != term {
                return Ok(());
            }
            state.become_leader(&self.id, &peers);
            let noop = state.append_entry(Command::Noop);
            self.persist_append(std::slice::from_ref(&noop))?;
            tracing::info!(node_id = %self.id, term, votes, "Became leader");
        }
        self.metrics.leader_changes_total.inc();
        self.emit(ClusterEvent::LeaderChanged {
            term,
            leader_id: Some(self.id.clone()),
        });

        self.replicate().await;
        Ok(())
    }

    // === Replication ===

    /// Send AppendEntries (or InstallSnapshot for lagging peers) to every
    /// peer, then advance the commit index.
    pub async fn replicate(&self) {
        *self.last_broadcast.lock() = Instant::now();
        let peers = self.peers();

        let (term, outbound) = {
            let state = self.state.lock();
            if state.role != RaftRole::Leader {
                return;
            }
            let mut outbound = Vec::with_capacity(peers.len());
            for peer in &peers {
                let next = state
                    .next_index
                    .get(peer)
                    .copied()
                    .unwrap_or(state.last_log_index() + 1)
                    .max(1);
                let message = if next <= state.snapshot_index {
                    match self.snapshot_request(&state) {
                        Ok(req) => Outbound::Snapshot(req),
                        Err(e) => {
                            tracing::warn!(peer = %peer, error = %e, "Cannot build snapshot for peer");
                            continue;
                        }
                    }
                } else {
                    let prev_log_index = next - 1;
                    let mut entries = state.entries_from(next);
                    entries.truncate(MAX_ENTRIES_PER_APPEND);
                    Outbound::Append(AppendRequest {
                        term: state.current_term,
                        leader_id: self.id.clone(),
                        prev_log_index,
                        prev_log_term: state.term_at(prev_log_index).unwrap_or(0),
                        entries,
                        leader_commit: state.commit_index,
                    })
                };
                outbound.push((peer.clone(), message));
            }
            (state.current_term, outbound)
        };

        let rpc_timeout = self.config.rpc_timeout();
        let calls = outbound.into_iter().map(|(peer, message)| async move {
            let (sent_last, result) = match message {
                Outbound::Append(req) => {
                    let sent_last = req.prev_log_index + req.entries.len() as u64;
                    let result =
                        tokio::time::timeout(rpc_timeout, self.transport.append_entries(&peer, req))
                            .await
                            .map(|r| r.map(Reply::Append));
                    (sent_last, result)
                }
                Outbound::Snapshot(req) => {
                    let sent_last = req.last_included_index;
                    let result = tokio::time::timeout(
                        rpc_timeout,
                        self.transport.install_snapshot(&peer, req),
                    )
                    .await
                    .map(|r| r.map(Reply::Snapshot));
                    (sent_last, result)
                }
            };
            (peer, sent_last, result)
        });
        let results = join_all(calls).await;

        let events = {
            let mut state = self.state.lock();
            if state.role != RaftRole::Leader || state.current_term != term {
                return;
            }

            for (peer, sent_last, result) in results {
                let reply = match result {
                    Ok(Ok(reply)) => reply,
                    Ok(Err(e)) => {
                        tracing::trace!(peer = %peer, error = %e, "Replication failed");
                        continue;
                    }
                    Err(_) => {
                        tracing::trace!(peer = %peer, "Replication timed out");
                        continue;
                    }
                };
                self.record_contact(&peer);

                let reply_term = match &reply {
                    Reply::Append(resp) => resp.term,
                    Reply::Snapshot(resp) => resp.term,
                };
                if reply_term > term {
                    tracing::info!(node_id = %self.id, term = reply_term, "Stepping down, saw higher term");
                    if let Err(e) = self.step_down(&mut state, reply_term) {
                        tracing::error!(node_id = %self.id, error = %e, "Failed to persist hard state");
                    }
                    return;
                }

                match reply {
                    Reply::Append(resp) if resp.success => {
                        let matched = state.match_index.entry(peer.clone()).or_insert(0);
                        *matched = (*matched).max(resp.match_index);
                        let matched = *matched;
                        state.next_index.insert(peer, matched + 1);
                    }
                    Reply::Append(resp) => {
                        // follower's hint is its last index that could still match
                        let next = (resp.match_index + 1).max(1);
                        state.next_index.insert(peer, next);
                    }
                    Reply::Snapshot(_) => {
                        let matched = state.match_index.entry(peer.clone()).or_insert(0);
                        *matched = (*matched).max(sent_last);
                        let matched = *matched;
                        state.next_index.insert(peer, matched + 1);
                    }
                }
            }

            self.advance_commit(&mut state)
        };

        for event in events {
            self.emit(event);
        }
    }

    fn snapshot_request(&self, state: &RaftState) -> Result<InstallSnapshotRequest> {
        let last_included_index = state.last_applied;
        let last_included_term = state
            .term_at(last_included_index)
            .unwrap_or(state.snapshot_term);
        Ok(InstallSnapshotRequest {
            term: state.current_term,
            leader_id: self.id.clone(),
            last_included_index,
            last_included_term,
            data: self.fsm.read().to_bytes()?,
        })
    }

    /// Majority match index, restricted to entries of the current term
    fn advance_commit(&self, state: &mut RaftState) -> Vec<ClusterEvent> {
        let members: Vec<String> = self.fsm.read().members.keys().cloned().collect();
        let mut matched: Vec<u64> = members
            .iter()
            .map(|id| {
                if *id == self.id {
                    state.last_log_index()
                } else {
                    state.match_index.get(id).copied().unwrap_or(0)
                }
            })
            .collect();
        if !members.contains(&self.id) {
            // a leader being removed still counts its own log for the final commit
            matched.push(state.last_log_index());
        }
        matched.sort_unstable_by(|a, b| b.cmp(a));

        let quorum = members.len() / 2 + 1;
        let candidate = matched.get(quorum - 1).copied().unwrap_or(0);
        if candidate > state.commit_index && state.term_at(candidate) == Some(state.current_term) {
            state.commit_index = candidate;
            tracing::debug!(node_id = %self.id, commit_index = candidate, "Advanced commit index");
        }
        self.apply_committed(state)
    }

    /// Apply every committed but unapplied entry to the FSM
    fn apply_committed(&self, state: &mut RaftState) -> Vec<ClusterEvent> {
        let mut events = Vec::new();
        if state.last_applied >= state.commit_index {
            return events;
        }

        {
            let mut fsm = self.fsm.write();
            while state.last_applied < state.commit_index {
                let next = state.last_applied + 1;
                let Some(entry) = state.get_entry(next) else {
                    break;
                };
                events.extend(fsm.apply(entry));
                state.last_applied = next;
            }
        }

        events.push(ClusterEvent::StateChanged {
            term: state.current_term,
            commit_index: state.commit_index,
        });
        self.commit_tx.send_replace(state.last_applied);

        if state.role == RaftRole::Leader && !self.fsm.read().is_member(&self.id) {
            tracing::info!(node_id = %self.id, "Removed from membership, stepping down");
            state.become_follower(state.current_term);
            state.leader_id = None;
            events.push(ClusterEvent::LeaderChanged {
                term: state.current_term,
                leader_id: None,
            });
        }
        events
    }

    // === Proposals ===

    /// Append `command` to the log and wait until it is committed and applied.
    /// Returns the log index of the entry.
    pub async fn propose(&self, command: Command) -> Result<u64> {
        let started = std::time::Instant::now();
        let kind = command.kind();
        let (index, term) = {
            let mut state = self.state.lock();
            if state.role != RaftRole::Leader {
                return Err(Error::NotLeader(state.leader_id.clone()));
            }
            let entry = state.append_entry(command);
            self.persist_append(std::slice::from_ref(&entry))?;
            (entry.index, entry.term)
        };
        self.metrics.proposals_total.inc();
        tracing::debug!(node_id = %self.id, index, term, command = kind, "Proposed entry");

        self.replicate().await;

        let mut commits = self.commit_tx.subscribe();
        let waited = tokio::time::timeout(self.config.proposal_timeout(), async {
            loop {
                if *commits.borrow_and_update() >= index {
                    return true;
                }
                if commits.changed().await.is_err() {
                    return false;
                }
            }
        })
        .await;

        match waited {
            Ok(true) => {}
            Ok(false) => return Err(Error::Raft("commit channel closed".into())),
            Err(_) => {
                self.metrics.proposal_timeouts_total.inc();
                tracing::warn!(node_id = %self.id, index, command = kind, "Proposal timed out");
                return Err(Error::ConsensusTimeout);
            }
        }

        let state = self.state.lock();
        match state.term_at(index) {
            Some(t) if t != term => Err(Error::NotLeader(state.leader_id.clone())),
            _ => {
                self.metrics.commit_latency.observe_duration(started.elapsed());
                Ok(index)
            }
        }
    }

    // === RPC handlers ===

    pub fn handle_request_vote(&self, req: VoteRequest) -> Result<VoteResponse> {
        // a removed voter never hears of its removal; its rising terms must
        // not unseat the leader
        let candidate_is_member = self.is_member(&req.candidate_id);
        let mut state = self.state.lock();
        if !candidate_is_member {
            tracing::debug!(
                node_id = %self.id,
                candidate = %req.candidate_id,
                term = req.term,
                "Ignoring vote request from non-member"
            );
            return Ok(VoteResponse {
                term: state.current_term,
                vote_granted: false,
            });
        }
        if req.term > state.current_term {
            self.step_down(&mut state, req.term)?;
        }

        let can_vote = state.voted_for.is_none()
            || state.voted_for.as_deref() == Some(req.candidate_id.as_str());
        let vote_granted = req.term == state.current_term
            && can_vote
            && state.is_log_up_to_date(req.last_log_index, req.last_log_term);

        if vote_granted {
            state.voted_for = Some(req.candidate_id.clone());
            self.persist_hard_state(&state)?;
            self.reset_election_deadline();
        }

        Ok(VoteResponse {
            term: state.current_term,
            vote_granted,
        })
    }

    pub fn handle_append_entries(&self, req: AppendRequest) -> Result<AppendResponse> {
        let mut state = self.state.lock();
        if req.term < state.current_term {
            return Ok(AppendResponse {
                term: state.current_term,
                success: false,
                match_index: state.last_log_index(),
            });
        }

        if req.term > state.current_term || state.role != RaftRole::Follower {
            self.step_down(&mut state, req.term)?;
        }
        self.accept_leader(&mut state, &req.leader_id);

        // entries already folded into our snapshot are committed; skip them
        let mut prev_log_index = req.prev_log_index;
        let mut prev_log_term = req.prev_log_term;
        let mut entries = req.entries;
        if prev_log_index < state.snapshot_index {
            entries.retain(|e| e.index > state.snapshot_index);
            prev_log_index = state.snapshot_index;
            prev_log_term = state.snapshot_term;
        }

        if state.term_at(prev_log_index) != Some(prev_log_term) {
            let hint = if prev_log_index > state.last_log_index() {
                state.last_log_index()
            } else {
                prev_log_index.saturating_sub(1)
            };
            return Ok(AppendResponse {
                term: state.current_term,
                success: false,
                match_index: hint,
            });
        }

        let last_new = prev_log_index + entries.len() as u64;
        let mut truncated = false;
        let mut appended = Vec::new();
        for entry in entries {
            match state.term_at(entry.index) {
                Some(t) if t == entry.term => continue,
                Some(_) => {
                    state.truncate_from(entry.index);
                    truncated = true;
                }
                None => {}
            }
            state.log.push(entry.clone());
            appended.push(entry);
        }

        if truncated {
            self.persist_rewrite(&state)?;
        } else {
            self.persist_append(&appended)?;
        }

        let mut events = Vec::new();
        // commit only moves forward; a stale or short append can name a
        // last_new below what is already committed
        let leader_commit = req.leader_commit.min(last_new);
        if leader_commit > state.commit_index {
            state.commit_index = leader_commit;
            events = self.apply_committed(&mut state);
        }
        let response = AppendResponse {
            term: state.current_term,
            success: true,
            match_index: last_new,
        };
        drop(state);

        for event in events {
            self.emit(event);
        }
        Ok(response)
    }

    fn accept_leader(&self, state: &mut RaftState, leader_id: &str) {
        self.reset_election_deadline();
        self.record_contact(leader_id);
        if state.leader_id.as_deref() != Some(leader_id) {
            state.leader_id = Some(leader_id.to_string());
            tracing::info!(node_id = %self.id, leader = %leader_id, term = state.current_term, "Following new leader");
            self.metrics.leader_changes_total.inc();
            self.emit(ClusterEvent::LeaderChanged {
                term: state.current_term,
                leader_id: Some(leader_id.to_string()),
            });
        }
    }

    pub fn handle_install_snapshot(
        &self,
        req: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        let mut state = self.state.lock();
        if req.term < state.current_term {
            return Ok(InstallSnapshotResponse {
                term: state.current_term,
            });
        }
        if req.term > state.current_term || state.role != RaftRole::Follower {
            self.step_down(&mut state, req.term)?;
        }
        self.accept_leader(&mut state, &req.leader_id);

        if req.last_included_index > state.last_applied {
            let fsm = ClusterFsm::from_bytes(&req.data)?;
            self.install_state(&mut state, fsm, req.last_included_index, req.last_included_term)?;
            tracing::info!(
                node_id = %self.id,
                index = req.last_included_index,
                "Installed snapshot from leader"
            );
        }

        Ok(InstallSnapshotResponse {
            term: state.current_term,
        })
    }

    fn install_state(
        &self,
        state: &mut RaftState,
        fsm: ClusterFsm,
        index: u64,
        term: u64,
    ) -> Result<()> {
        if index > 0 && index == state.snapshot_index {
            // boundary recovered from the segments; only its term was unknown
            state.snapshot_term = term;
        } else if state.term_at(index) == Some(term) {
            state.compact_to(index, term);
        } else {
            state.log.clear();
            state.snapshot_index = index;
            state.snapshot_term = term;
        }
        *self.fsm.write() = fsm;
        state.commit_index = state.commit_index.max(index);
        state.last_applied = index;
        self.persist_rewrite(state)?;
        self.commit_tx.send_replace(index);
        self.emit(ClusterEvent::StateChanged {
            term: state.current_term,
            commit_index: state.commit_index,
        });
        Ok(())
    }

    /// Start an election right away on the next tick
    pub fn handle_timeout_now(&self, req: TimeoutNowRequest) {
        let current_term = self.state.lock().current_term;
        if req.term < current_term {
            return;
        }
        tracing::info!(node_id = %self.id, from = %req.leader_id, "Received TimeoutNow");
        *self.election_deadline.lock() = Instant::now();
    }

    // === Leadership transfer ===

    /// Step down and hand leadership to `target` (or the most caught-up peer).
    /// Returns `false` when this replica is not the leader.
    pub async fn transfer_leadership(&self, target: Option<&str>) -> Result<bool> {
        if !self.is_leader() {
            return Ok(false);
        }
        self.replicate().await;

        let (term, target) = {
            let mut state = self.state.lock();
            if state.role != RaftRole::Leader {
                return Ok(false);
            }
            let target = match target {
                Some(t) => Some(t.to_string()),
                None => state
                    .match_index
                    .iter()
                    .max_by_key(|(_, matched)| **matched)
                    .map(|(id, _)| id.clone()),
            };
            let term = state.current_term;
            self.step_down(&mut state, term)?;
            (term, target)
        };
        // give the target a head start before this replica campaigns again
        *self.election_deadline.lock() =
            Instant::now() + Duration::from_millis(self.config.election_timeout_max_ms * 2);

        tracing::info!(node_id = %self.id, term, target = ?target, "Transferring leadership");
        if let Some(target) = target {
            let req = TimeoutNowRequest {
                term,
                leader_id: self.id.clone(),
            };
            if let Err(e) = self.transport.timeout_now(&target, req).await {
                tracing::warn!(target = %target, error = %e, "TimeoutNow failed");
            }
        }
        Ok(true)
    }

    // === Snapshots & log lifecycle ===

    /// Serialized FSM at the last applied index: `(index, term, bytes)`
    pub fn snapshot_data(&self) -> Result<(u64, u64, Vec<u8>)> {
        let state = self.state.lock();
        let index = state.last_applied;
        let term = state.term_at(index).unwrap_or(state.snapshot_term);
        let bytes = self.fsm.read().to_bytes()?;
        Ok((index, term, bytes))
    }

    /// Drop log entries up to `index`, which a persisted snapshot now covers
    pub fn compact_log(&self, index: u64) -> Result<()> {
        let mut state = self.state.lock();
        if index <= state.snapshot_index {
            return Ok(());
        }
        if index > state.last_applied {
            return Err(Error::Raft(format!(
                "cannot compact to {} beyond applied index {}",
                index, state.last_applied
            )));
        }
        let term = state
            .term_at(index)
            .ok_or_else(|| Error::Raft(format!("no term for index {}", index)))?;
        state.compact_to(index, term);
        self.persist_rewrite(&state)?;
        tracing::debug!(node_id = %self.id, index, "Compacted raft log");
        Ok(())
    }

    /// Load a snapshot into the FSM. Restoring a snapshot at or behind the
    /// applied index is a no-op, so repeating a restore is harmless.
    pub fn restore_snapshot(&self, index: u64, term: u64, data: &[u8]) -> Result<bool> {
        let fsm = ClusterFsm::from_bytes(data)?;
        let mut state = self.state.lock();
        if index <= state.last_applied && state.last_applied > 0 {
            return Ok(false);
        }
        self.install_state(&mut state, fsm, index, term)?;
        Ok(true)
    }

    /// Total bytes of on-disk log segments
    pub fn log_size(&self) -> Result<u64> {
        match &self.store {
            Some(store) => store.lock().total_size(),
            None => Ok(0),
        }
    }

    /// Archive the current log segments under `archive_root` and continue in
    /// a fresh segment. Returns `None` for an in-memory replica.
    pub fn rotate_log(&self, archive_root: &Path, timestamp: u64) -> Result<Option<PathBuf>> {
        let Some(store) = &self.store else {
            return Ok(None);
        };
        let state = self.state.lock();
        let archive = store.lock().rotate(
            archive_root,
            timestamp,
            &state.log,
            state.last_log_index() + 1,
        )?;
        Ok(Some(archive))
    }
}

impl std::fmt::Debug for RaftNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("RaftNode")
            .field("id", &self.id)
            .field("role", &state.role)
            .field("term", &state.current_term)
            .field("commit_index", &state.commit_index)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::transport::LocalTransport;

    fn single(id: &str) -> Arc<RaftNode> {
        with_members(id, &[id])
    }

    /// `id` sees `ids` as its committed configuration
    fn with_members(id: &str, ids: &[&str]) -> Arc<RaftNode> {
        let transport = LocalTransport::new();
        let members: BTreeMap<String, String> = ids
            .iter()
            .map(|m| (m.to_string(), format!("mem://{}", m)))
            .collect();
        let node = RaftNode::new(
            id,
            RaftConfig::default(),
            members,
            transport.clone(),
            Arc::new(MetricsRegistry::new()),
        );
        transport.register(&node);
        node
    }

    #[tokio::test]
    async fn test_single_node_elects_itself_and_commits() {
        let node = single("n1");
        node.start_election().await.unwrap();
        assert!(node.is_leader());
        assert_eq!(node.leader_id().as_deref(), Some("n1"));
        // the leader's noop is committed immediately in a group of one
        assert_eq!(node.commit_index(), 1);

        let index = node
            .propose(Command::AddPeer {
                id: "n2".into(),
                address: "mem://n2".into(),
            })
            .await
            .unwrap();
        assert_eq!(index, 2);
        assert!(node.is_member("n2"));
    }

    #[tokio::test]
    async fn test_propose_on_follower_is_rejected() {
        let node = single("n1");
        let err = node.propose(Command::Noop).await.unwrap_err();
        assert!(matches!(err, Error::NotLeader(None)));
        assert_eq!(node.last_log_index(), 0);
    }

    #[test]
    fn test_vote_once_per_term() {
        let node = with_members("n1", &["n1", "n2", "n3"]);
        let vote = |candidate: &str| VoteRequest {
            term: 3,
            candidate_id: candidate.into(),
            last_log_index: 0,
            last_log_term: 0,
        };
        assert!(node.handle_request_vote(vote("n2")).unwrap().vote_granted);
        assert!(!node.handle_request_vote(vote("n3")).unwrap().vote_granted);
        // same candidate may ask again
        assert!(node.handle_request_vote(vote("n2")).unwrap().vote_granted);
        assert_eq!(node.current_term(), 3);
    }

    #[test]
    fn test_vote_from_removed_peer_is_ignored() {
        let node = with_members("n1", &["n1", "n2"]);
        let resp = node
            .handle_request_vote(VoteRequest {
                term: 10,
                candidate_id: "n3".into(),
                last_log_index: 50,
                last_log_term: 9,
            })
            .unwrap();
        assert!(!resp.vote_granted);
        assert_eq!(resp.term, 0);
        assert_eq!(node.current_term(), 0);

        // members are still heard
        let resp = node
            .handle_request_vote(VoteRequest {
                term: 10,
                candidate_id: "n2".into(),
                last_log_index: 0,
                last_log_term: 0,
            })
            .unwrap();
        assert!(resp.vote_granted);
        assert_eq!(node.current_term(), 10);
    }

    #[tokio::test]
    async fn test_leader_not_unseated_by_non_member() {
        let node = single("n1");
        node.start_election().await.unwrap();
        let term = node.current_term();
        let resp = node
            .handle_request_vote(VoteRequest {
                term: term + 5,
                candidate_id: "gone".into(),
                last_log_index: 100,
                last_log_term: term + 4,
            })
            .unwrap();
        assert!(!resp.vote_granted);
        assert!(node.is_leader());
        assert_eq!(node.current_term(), term);
    }

    #[test]
    fn test_append_entries_conflict_truncates() {
        let node = single("n1");
        let append = |prev: u64, prev_term: u64, entries: Vec<LogEntry>, commit: u64| AppendRequest {
            term: 2,
            leader_id: "n2".into(),
            prev_log_index: prev,
            prev_log_term: prev_term,
            entries,
            leader_commit: commit,
        };
        let noop = |term, index| LogEntry {
            term,
            index,
            command: Command::Noop,
        };

        let resp = node
            .handle_append_entries(append(0, 0, vec![noop(1, 1), noop(1, 2)], 0))
            .unwrap();
        assert!(resp.success);
        assert_eq!(resp.match_index, 2);
        assert_eq!(node.leader_id().as_deref(), Some("n2"));

        // gap: follower reports its last index
        let resp = node.handle_append_entries(append(5, 2, vec![], 0)).unwrap();
        assert!(!resp.success);
        assert_eq!(resp.match_index, 2);

        // conflicting entry at index 2 replaced by the leader's
        let resp = node
            .handle_append_entries(append(1, 1, vec![noop(2, 2)], 2))
            .unwrap();
        assert!(resp.success);
        assert_eq!(node.last_log_index(), 2);
        assert_eq!(node.commit_index(), 2);
        assert_eq!(node.last_applied(), 2);
    }

    #[test]
    fn test_stale_append_never_lowers_commit() {
        let node = single("n1");
        let noop = |index| LogEntry {
            term: 1,
            index,
            command: Command::Noop,
        };
        let append = |prev: u64, entries: Vec<LogEntry>, commit: u64| AppendRequest {
            term: 1,
            leader_id: "n2".into(),
            prev_log_index: prev,
            prev_log_term: if prev == 0 { 0 } else { 1 },
            entries,
            leader_commit: commit,
        };

        node.handle_append_entries(append(0, vec![noop(1), noop(2)], 2))
            .unwrap();
        assert_eq!(node.commit_index(), 2);
        assert_eq!(node.last_applied(), 2);

        // delayed heartbeat anchored at index 1 with a newer leader commit
        let resp = node.handle_append_entries(append(1, vec![], 3)).unwrap();
        assert!(resp.success);
        assert_eq!(node.commit_index(), 2);
        assert_eq!(node.last_applied(), 2);
        assert_eq!(node.last_log_index(), 2);
    }

    #[test]
    fn test_restore_snapshot_is_idempotent() {
        let node = single("n1");
        let mut fsm = ClusterFsm::bootstrap([("n1".to_string(), "mem://n1".to_string())]);
        fsm.members.insert("n9".into(), "mem://n9".into());
        let bytes = fsm.to_bytes().unwrap();

        assert!(node.restore_snapshot(7, 2, &bytes).unwrap());
        assert!(!node.restore_snapshot(7, 2, &bytes).unwrap());
        assert!(node.is_member("n9"));
        assert_eq!(node.commit_index(), 7);
        assert_eq!(node.snapshot_index(), 7);
        assert_eq!(node.last_log_index(), 7);
    }

    #[tokio::test]
    async fn test_durable_node_recovers_log() {
        let dir = tempfile::tempdir().unwrap();
        let members = BTreeMap::from([("n1".to_string(), "mem://n1".to_string())]);
        {
            let transport = LocalTransport::new();
            let node = RaftNode::open(
                "n1",
                RaftConfig::default(),
                members.clone(),
                transport.clone(),
                Arc::new(MetricsRegistry::new()),
                dir.path(),
                1 << 20,
            )
            .unwrap();
            transport.register(&node);
            node.start_election().await.unwrap();
            node.propose(Command::UnregisterSession { name: "x".into() })
                .await
                .unwrap();
        }

        let transport = LocalTransport::new();
        let node = RaftNode::open(
            "n1",
            RaftConfig::default(),
            members,
            transport.clone(),
            Arc::new(MetricsRegistry::new()),
            dir.path(),
            1 << 20,
        )
        .unwrap();
        assert_eq!(node.current_term(), 1);
        assert_eq!(node.last_log_index(), 2);

        transport.register(&node);
        node.start_election().await.unwrap();
        assert_eq!(node.current_term(), 2);
        assert_eq!(node.commit_index(), 3);
    }
}
