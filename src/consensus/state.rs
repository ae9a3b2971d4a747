//! Raft protocol state of one replica.

use crate::consensus::raft::{Command, LogEntry};
use std::collections::HashMap;

/// Raft node role
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RaftRole {
    #[default]
    Follower,
    Candidate,
    Leader,
}

impl std::fmt::Display for RaftRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RaftRole::Follower => write!(f, "follower"),
            RaftRole::Candidate => write!(f, "candidate"),
            RaftRole::Leader => write!(f, "leader"),
        }
    }
}

/// Persistent and volatile state of a replica.
///
/// The in-memory log only holds entries after `snapshot_index`; everything
/// up to and including it is represented by the latest snapshot.
///
/// Safety rules kept here:
/// - one vote per term (`voted_for` is cleared only when the term advances)
/// - leaders only append; truncation happens on followers resolving conflicts
/// - a candidate must have a log at least as up-to-date as the voter's
#[derive(Debug, Default)]
pub struct RaftState {
    // Persistent state
    pub current_term: u64,
    pub voted_for: Option<String>,
    pub log: Vec<LogEntry>,
    pub snapshot_index: u64,
    pub snapshot_term: u64,

    // Volatile state on all servers
    pub commit_index: u64,
    pub last_applied: u64,

    // Volatile state on leaders (reinitialized after election)
    pub next_index: HashMap<String, u64>,
    pub match_index: HashMap<String, u64>,

    pub role: RaftRole,
    pub leader_id: Option<String>,
}

impl RaftState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_log_index(&self) -> u64 {
        self.log
            .last()
            .map(|e| e.index)
            .unwrap_or(self.snapshot_index)
    }

    pub fn last_log_term(&self) -> u64 {
        self.log.last().map(|e| e.term).unwrap_or(self.snapshot_term)
    }

    /// Entry at `index`, if it is still held in memory
    pub fn get_entry(&self, index: u64) -> Option<&LogEntry> {
        if index <= self.snapshot_index {
            return None;
        }
        self.log.get((index - self.snapshot_index - 1) as usize)
    }

    /// Term of the entry at `index`, including the snapshot boundary
    pub fn term_at(&self, index: u64) -> Option<u64> {
        if index == 0 {
            return Some(0);
        }
        if index == self.snapshot_index {
            return Some(self.snapshot_term);
        }
        self.get_entry(index).map(|e| e.term)
    }

    /// Entries from `start_index` (inclusive) onwards
    pub fn entries_from(&self, start_index: u64) -> Vec<LogEntry> {
        let start = start_index.max(self.snapshot_index + 1);
        let offset = (start - self.snapshot_index - 1) as usize;
        if offset >= self.log.len() {
            return Vec::new();
        }
        self.log[offset..].to_vec()
    }

    /// Append a new entry in the current term
    pub fn append_entry(&mut self, command: Command) -> LogEntry {
        let entry = LogEntry {
            term: self.current_term,
            index: self.last_log_index() + 1,
            command,
        };
        self.log.push(entry.clone());
        entry
    }

    /// Drop entries at `from_index` and after
    pub fn truncate_from(&mut self, from_index: u64) {
        if from_index <= self.snapshot_index {
            self.log.clear();
            return;
        }
        let keep = (from_index - self.snapshot_index - 1) as usize;
        self.log.truncate(keep);
    }

    /// Discard entries up to and including `index`, which is now covered by a
    /// snapshot taken at `term`.
    pub fn compact_to(&mut self, index: u64, term: u64) {
        if index <= self.snapshot_index {
            return;
        }
        let drop = ((index - self.snapshot_index) as usize).min(self.log.len());
        self.log.drain(..drop);
        self.snapshot_index = index;
        self.snapshot_term = term;
    }

    /// Check if candidate's log is at least as up-to-date as ours
    pub fn is_log_up_to_date(&self, last_log_index: u64, last_log_term: u64) -> bool {
        let our_last_term = self.last_log_term();
        last_log_term > our_last_term
            || (last_log_term == our_last_term && last_log_index >= self.last_log_index())
    }

    pub fn become_follower(&mut self, term: u64) {
        self.role = RaftRole::Follower;
        if term > self.current_term {
            self.current_term = term;
            self.voted_for = None;
        }
    }

    pub fn become_candidate(&mut self, my_id: &str) {
        self.role = RaftRole::Candidate;
        self.current_term += 1;
        self.voted_for = Some(my_id.to_string());
        self.leader_id = None;
    }

    pub fn become_leader(&mut self, my_id: &str, peer_ids: &[String]) {
        self.role = RaftRole::Leader;
        self.leader_id = Some(my_id.to_string());

        let last_log_index = self.last_log_index();
        self.next_index.clear();
        self.match_index.clear();
        for peer_id in peer_ids {
            self.next_index.insert(peer_id.clone(), last_log_index + 1);
            self.match_index.insert(peer_id.clone(), 0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(term: u64, index: u64) -> LogEntry {
        LogEntry {
            term,
            index,
            command: Command::Noop,
        }
    }

    #[test]
    fn test_new_state_is_follower() {
        let state = RaftState::new();
        assert_eq!(state.role, RaftRole::Follower);
        assert_eq!(state.current_term, 0);
        assert_eq!(state.last_log_index(), 0);
    }

    #[test]
    fn test_become_candidate_and_leader() {
        let mut state = RaftState::new();
        state.become_candidate("n1");
        assert_eq!(state.role, RaftRole::Candidate);
        assert_eq!(state.current_term, 1);
        assert_eq!(state.voted_for.as_deref(), Some("n1"));

        state.become_leader("n1", &["n2".to_string(), "n3".to_string()]);
        assert_eq!(state.role, RaftRole::Leader);
        assert_eq!(state.next_index.get("n2"), Some(&1));
        assert_eq!(state.match_index.get("n3"), Some(&0));
    }

    #[test]
    fn test_follower_keeps_vote_within_same_term() {
        let mut state = RaftState::new();
        state.become_candidate("n1");
        state.become_follower(1);
        assert_eq!(state.voted_for.as_deref(), Some("n1"));
        state.become_follower(2);
        assert_eq!(state.voted_for, None);
        assert_eq!(state.current_term, 2);
    }

    #[test]
    fn test_append_and_truncate() {
        let mut state = RaftState::new();
        state.current_term = 1;
        state.append_entry(Command::Noop);
        state.append_entry(Command::Noop);
        state.append_entry(Command::Noop);

        state.truncate_from(2);
        assert_eq!(state.last_log_index(), 1);
        assert!(state.get_entry(2).is_none());
    }

    #[test]
    fn test_compaction_keeps_offsets() {
        let mut state = RaftState::new();
        state.log = (1..=5).map(|i| noop(1, i)).collect();

        state.compact_to(3, 1);
        assert_eq!(state.snapshot_index, 3);
        assert_eq!(state.log.len(), 2);
        assert!(state.get_entry(3).is_none());
        assert_eq!(state.get_entry(4).unwrap().index, 4);
        assert_eq!(state.term_at(3), Some(1));
        assert_eq!(state.last_log_index(), 5);

        let tail = state.entries_from(1);
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].index, 4);

        // compacting past the log end leaves an empty log at the snapshot point
        state.compact_to(9, 2);
        assert!(state.log.is_empty());
        assert_eq!(state.last_log_index(), 9);
        assert_eq!(state.last_log_term(), 2);
    }

    #[test]
    fn test_is_log_up_to_date() {
        let mut state = RaftState::new();
        assert!(state.is_log_up_to_date(0, 0));

        state.log = vec![noop(1, 1), noop(2, 2)];
        assert!(state.is_log_up_to_date(1, 3));
        assert!(state.is_log_up_to_date(2, 2));
        assert!(!state.is_log_up_to_date(5, 1));
        assert!(!state.is_log_up_to_date(1, 2));
    }
}
