//! Membership layer over the Raft node.
//!
//! Peer joins and leaves go through the replicated log and only take effect
//! once committed. Proposals go to whichever replica of the local
//! [`ReplicaGroup`] leads. Peer liveness is tracked separately with the heartbeat
//! health state machine; an unhealthy peer stays a member until someone
//! removes it explicitly.

use crate::common::health::{classify, since};
use crate::common::{HealthStatus, HealthTally};
use crate::consensus::fsm::ClusterEvent;
use crate::consensus::group::ReplicaGroup;
use crate::consensus::raft::Command;
use crate::consensus::raft_node::RaftNode;
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Receives cluster notifications on its own task, away from the commit path.
#[async_trait]
pub trait ClusterObserver: Send + Sync {
    async fn on_leader_change(&self, _term: u64, _leader_id: Option<String>) {}

    async fn on_peer_join(&self, _id: &str, _address: &str) {}

    async fn on_peer_leave(&self, _id: &str) {}

    async fn on_cluster_state_change(&self, _state: ClusterState) {}
}

/// Liveness record for one peer
#[derive(Debug, Clone, Serialize)]
pub struct PeerInfo {
    pub id: String,
    pub address: String,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub health: HealthStatus,
}

/// Point-in-time view of the consensus group, computed on demand
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClusterState {
    pub self_id: String,
    pub is_leader: bool,
    pub leader_id: Option<String>,
    pub term: u64,
    pub commit_index: u64,
    /// Members other than this replica
    pub peer_count: usize,
    pub healthy: usize,
    pub degraded: usize,
    pub unhealthy: usize,
}

pub struct Membership {
    node: Arc<RaftNode>,
    group: ReplicaGroup,
    threshold: Duration,
    peers: RwLock<HashMap<String, PeerInfo>>,
    observers_token: CancellationToken,
}

impl Membership {
    pub fn new(group: impl Into<ReplicaGroup>) -> Self {
        let group = group.into();
        let node = group.local().clone();
        let threshold = node.config().peer_health_threshold();
        Self {
            node,
            group,
            threshold,
            peers: RwLock::new(HashMap::new()),
            observers_token: CancellationToken::new(),
        }
    }

    pub fn node(&self) -> &Arc<RaftNode> {
        &self.node
    }

    /// Propose adding a voting member and wait for it to commit
    pub async fn add_peer(&self, id: &str, address: &str) -> Result<()> {
        let index = self
            .group
            .propose(Command::AddPeer {
                id: id.to_string(),
                address: address.to_string(),
            })
            .await?;
        tracing::info!(peer = %id, address = %address, index, "Peer added");
        Ok(())
    }

    /// Propose removing a voting member and wait for it to commit
    pub async fn remove_peer(&self, id: &str) -> Result<()> {
        let index = self
            .group
            .propose(Command::RemovePeer { id: id.to_string() })
            .await?;
        self.peers.write().remove(id);
        tracing::info!(peer = %id, index, "Peer removed");
        Ok(())
    }

    /// Voluntary leadership transfer by the group's leader. No-op when no
    /// local replica leads.
    pub async fn force_leader_election(&self) -> Result<()> {
        let Ok(leader) = self.group.leader() else {
            tracing::debug!(node_id = %self.node.id(), "Not leader, ignoring forced election");
            return Ok(());
        };
        if leader.transfer_leadership(None).await? {
            tracing::info!(node_id = %leader.id(), "Stepped down for re-election");
        }
        Ok(())
    }

    /// A liveness signal from `id`; any heartbeat makes the peer healthy again
    pub fn record_peer_heartbeat(&self, id: &str) -> Result<()> {
        let members = self.node.members();
        let address = members
            .get(id)
            .ok_or_else(|| Error::NodeNotFound(id.to_string()))?;

        let mut peers = self.peers.write();
        let peer = peers.entry(id.to_string()).or_insert_with(|| PeerInfo {
            id: id.to_string(),
            address: address.clone(),
            last_heartbeat: None,
            health: HealthStatus::Unknown,
        });
        peer.last_heartbeat = Some(Utc::now());
        peer.health = HealthStatus::Healthy;
        Ok(())
    }

    /// Recompute every peer's health from its latest heartbeat or RPC
    /// contact, keeping the table in line with committed membership.
    pub fn sweep_health(&self, now: DateTime<Utc>) -> HealthTally {
        let members = self.node.members();
        let mut peers = self.peers.write();
        peers.retain(|id, _| members.contains_key(id));

        let mut tally = HealthTally::default();
        for (id, address) in members.iter().filter(|(id, _)| *id != self.node.id()) {
            let peer = peers.entry(id.clone()).or_insert_with(|| PeerInfo {
                id: id.clone(),
                address: address.clone(),
                last_heartbeat: None,
                health: HealthStatus::Unknown,
            });
            peer.address = address.clone();

            let contact = self.node.peer_contact(id);
            peer.last_heartbeat = match (peer.last_heartbeat, contact) {
                (Some(a), Some(b)) => Some(a.max(b)),
                (a, b) => a.or(b),
            };

            let previous = peer.health;
            peer.health = match peer.last_heartbeat {
                Some(last) => classify(since(last, now), self.threshold),
                None => HealthStatus::Unknown,
            };
            if previous != peer.health {
                tracing::debug!(peer = %id, from = %previous, to = %peer.health, "Peer health changed");
            }
            tally.record(peer.health);
        }
        tally
    }

    pub fn peers(&self) -> Vec<PeerInfo> {
        let mut peers: Vec<PeerInfo> = self.peers.read().values().cloned().collect();
        peers.sort_by(|a, b| a.id.cmp(&b.id));
        peers
    }

    pub fn peer_health(&self, id: &str) -> Option<HealthStatus> {
        self.peers.read().get(id).map(|p| p.health)
    }

    pub fn cluster_state(&self) -> ClusterState {
        let members = self.node.members();
        let tally: HealthTally = {
            let peers = self.peers.read();
            members
                .keys()
                .filter(|id| *id != self.node.id())
                .map(|id| peers.get(id).map(|p| p.health).unwrap_or_default())
                .collect()
        };
        let peer_count = members.keys().filter(|id| *id != self.node.id()).count();

        ClusterState {
            self_id: self.node.id().to_string(),
            is_leader: self.node.is_leader(),
            leader_id: self.node.leader_id(),
            term: self.node.current_term(),
            commit_index: self.node.commit_index(),
            peer_count,
            healthy: tally.healthy,
            degraded: tally.degraded,
            unhealthy: tally.unhealthy,
        }
    }

    /// Read-only counters for external monitoring
    pub fn metrics_surface(&self) -> BTreeMap<String, serde_json::Value> {
        let state = self.cluster_state();
        BTreeMap::from([
            ("node_id".to_string(), state.self_id.into()),
            ("is_leader".to_string(), state.is_leader.into()),
            ("leader_id".to_string(), state.leader_id.into()),
            ("term".to_string(), state.term.into()),
            ("commit_index".to_string(), state.commit_index.into()),
            ("peer_count".to_string(), state.peer_count.into()),
            ("healthy_peers".to_string(), state.healthy.into()),
            ("degraded_peers".to_string(), state.degraded.into()),
            ("unhealthy_peers".to_string(), state.unhealthy.into()),
        ])
    }

    /// Deliver cluster events to `observer` on a dedicated task
    pub fn add_observer(self: &Arc<Self>, observer: Arc<dyn ClusterObserver>) -> JoinHandle<()> {
        let mut events = self.node.subscribe();
        let token = self.observers_token.child_token();
        let membership = self.clone();

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    event = events.recv() => event,
                };
                match event {
                    Ok(event) => membership.dispatch(observer.as_ref(), event).await,
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Cluster observer lagging, events dropped");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    async fn dispatch(&self, observer: &dyn ClusterObserver, event: ClusterEvent) {
        match event {
            ClusterEvent::LeaderChanged { term, leader_id } => {
                observer.on_leader_change(term, leader_id).await
            }
            ClusterEvent::PeerJoined { id, address } => observer.on_peer_join(&id, &address).await,
            ClusterEvent::PeerLeft { id } => observer.on_peer_leave(&id).await,
            ClusterEvent::StateChanged { .. } => {
                observer.on_cluster_state_change(self.cluster_state()).await
            }
            ClusterEvent::SessionRegistered { .. } | ClusterEvent::SessionUnregistered { .. } => {}
        }
    }

    /// Stop every observer task
    pub fn shutdown_observers(&self) {
        self.observers_token.cancel();
    }
}

impl Drop for Membership {
    fn drop(&mut self) {
        self.observers_token.cancel();
    }
}
