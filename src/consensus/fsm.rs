//! Replicated state machine: the cluster membership and the set of
//! registered sessions every replica converges on.

use crate::consensus::raft::{Command, LogEntry, SessionRegistration};
use crate::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Notifications produced as entries are applied or leadership moves
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterEvent {
    LeaderChanged {
        term: u64,
        leader_id: Option<String>,
    },
    PeerJoined {
        id: String,
        address: String,
    },
    PeerLeft {
        id: String,
    },
    SessionRegistered {
        name: String,
    },
    SessionUnregistered {
        name: String,
    },
    /// Commit position moved
    StateChanged {
        term: u64,
        commit_index: u64,
    },
}

/// Applied state. Snapshots serialize exactly this structure.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterFsm {
    /// Voting members: id -> address
    pub members: BTreeMap<String, String>,
    /// Registered sessions by name
    pub sessions: BTreeMap<String, SessionRegistration>,
}

impl ClusterFsm {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the initial voter set (only used before the first snapshot)
    pub fn bootstrap<I>(members: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        Self {
            members: members.into_iter().collect(),
            sessions: BTreeMap::new(),
        }
    }

    pub fn apply(&mut self, entry: &LogEntry) -> Vec<ClusterEvent> {
        match &entry.command {
            Command::AddPeer { id, address } => {
                let previous = self.members.insert(id.clone(), address.clone());
                if previous.as_deref() == Some(address.as_str()) {
                    return Vec::new();
                }
                vec![ClusterEvent::PeerJoined {
                    id: id.clone(),
                    address: address.clone(),
                }]
            }
            Command::RemovePeer { id } => match self.members.remove(id) {
                Some(_) => vec![ClusterEvent::PeerLeft { id: id.clone() }],
                None => Vec::new(),
            },
            Command::RegisterSession(registration) => {
                let name = registration.session_name.clone();
                self.sessions.insert(name.clone(), registration.clone());
                vec![ClusterEvent::SessionRegistered { name }]
            }
            Command::UnregisterSession { name } => match self.sessions.remove(name) {
                Some(_) => vec![ClusterEvent::SessionUnregistered { name: name.clone() }],
                None => Vec::new(),
            },
            Command::Noop => Vec::new(),
        }
    }

    pub fn is_member(&self, id: &str) -> bool {
        self.members.contains_key(id)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}
