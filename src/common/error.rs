//! Error types for minifleet

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    // === Consensus Errors ===
    #[error("Not leader: current leader is {}", .0.as_deref().unwrap_or("unknown"))]
    NotLeader(Option<String>),

    #[error("Consensus timeout")]
    ConsensusTimeout,

    #[error("Raft error: {0}")]
    Raft(String),

    #[error("Transport error talking to {peer}: {reason}")]
    Transport { peer: String, reason: String },

    // === Registry / Assignment Errors ===
    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Assignment not found: {0}")]
    AssignmentNotFound(String),

    #[error("No available nodes")]
    NoAvailableNodes,

    #[error("No nodes advertise service: {0}")]
    NoNodesWithService(String),

    // === Session Errors ===
    #[error("Invalid session: {0}")]
    InvalidSession(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("No available sessions")]
    NoAvailableSessions,

    #[error("Repository error: {0}")]
    Repository(String),

    // === Snapshot / Log Errors ===
    #[error("Snapshot already recent: last taken {elapsed_secs}s ago")]
    AlreadyRecent { elapsed_secs: u64 },

    #[error("Corrupt snapshot: {filename}")]
    CorruptSnapshot { filename: String },

    #[error("Snapshot not found: {0}")]
    SnapshotNotFound(String),

    #[error("Log rotation failed: {0}")]
    LogRotation(String),

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // === Generic ===
    #[error("Not implemented: {0}")]
    NotImplemented(&'static str),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Is this a retryable error?
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ConsensusTimeout
                | Error::NotLeader(_)
                | Error::Transport { .. }
                | Error::NoAvailableNodes
                | Error::NoAvailableSessions
        )
    }

    /// Expected, caller-recoverable conditions. These are returned to the
    /// caller and never logged as incidents.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Error::NotLeader(_)
                | Error::InvalidSession(_)
                | Error::SessionNotFound(_)
                | Error::NodeNotFound(_)
                | Error::AssignmentNotFound(_)
                | Error::NoAvailableNodes
                | Error::NoNodesWithService(_)
                | Error::NoAvailableSessions
                | Error::AlreadyRecent { .. }
        )
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Error::InvalidConfig(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejection_taxonomy() {
        assert!(Error::NotLeader(None).is_rejection());
        assert!(Error::NoAvailableNodes.is_rejection());
        assert!(Error::NoNodesWithService("gpu".into()).is_rejection());
        assert!(!Error::ConsensusTimeout.is_rejection());
        assert!(!Error::CorruptSnapshot {
            filename: "1_2.snap".into()
        }
        .is_rejection());
    }

    #[test]
    fn test_not_leader_display() {
        assert_eq!(
            Error::NotLeader(Some("node-2".into())).to_string(),
            "Not leader: current leader is node-2"
        );
        assert_eq!(
            Error::NotLeader(None).to_string(),
            "Not leader: current leader is unknown"
        );
    }

    #[test]
    fn test_retryable() {
        assert!(Error::ConsensusTimeout.is_retryable());
        assert!(!Error::NodeNotFound("a".into()).is_retryable());
    }
}
