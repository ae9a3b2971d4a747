//! Raft message structures exchanged between replicas, and the commands
//! carried by the replicated log.

use serde::{Deserialize, Serialize};

/// Commands that can be replicated through Raft
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    /// Add a voting member
    AddPeer { id: String, address: String },
    /// Remove a voting member
    RemovePeer { id: String },
    /// Make a session part of the replicated session membership
    RegisterSession(SessionRegistration),
    /// Drop a session from the replicated session membership
    UnregisterSession { name: String },
    /// Appended by every new leader so entries from earlier terms can commit
    Noop,
}

impl Command {
    pub fn kind(&self) -> &'static str {
        match self {
            Command::AddPeer { .. } => "add_peer",
            Command::RemovePeer { .. } => "remove_peer",
            Command::RegisterSession(_) => "register_session",
            Command::UnregisterSession { .. } => "unregister_session",
            Command::Noop => "noop",
        }
    }
}

/// Replicated identity of a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRegistration {
    /// Replica that accepted the registration
    pub node_id: String,
    pub session_name: String,
    pub tier: String,
    pub provider: String,
    pub max_concurrent_tasks: u32,
}

/// A single entry in the Raft log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: u64,
    pub index: u64,
    pub command: Command,
}

#[derive(Debug, Clone)]
pub struct VoteRequest {
    pub term: u64,
    pub candidate_id: String,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

#[derive(Debug, Clone)]
pub struct VoteResponse {
    pub term: u64,
    pub vote_granted: bool,
}

#[derive(Debug, Clone)]
pub struct AppendRequest {
    pub term: u64,
    pub leader_id: String,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<LogEntry>,
    pub leader_commit: u64,
}

#[derive(Debug, Clone)]
pub struct AppendResponse {
    pub term: u64,
    pub success: bool,
    /// Follower's last matching index on success, or its last log index as
    /// a catch-up hint on failure
    pub match_index: u64,
}

/// Sent instead of AppendEntries when the follower needs entries the
/// leader has already compacted away
#[derive(Debug, Clone)]
pub struct InstallSnapshotRequest {
    pub term: u64,
    pub leader_id: String,
    pub last_included_index: u64,
    pub last_included_term: u64,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct InstallSnapshotResponse {
    pub term: u64,
}

/// Leadership transfer: tells the target to start an election immediately
#[derive(Debug, Clone)]
pub struct TimeoutNowRequest {
    pub term: u64,
    pub leader_id: String,
}
