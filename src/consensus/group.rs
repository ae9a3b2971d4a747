//! The replicas hosted by one process.
//!
//! Proposals must reach the Raft leader. When several replicas of the group
//! live in this process, [`ReplicaGroup::leader`] hands back whichever of
//! them currently leads, so callers holding the group never see `NotLeader`
//! just because a sibling replica won the election.

use crate::consensus::raft::Command;
use crate::consensus::raft_node::RaftNode;
use crate::{Error, Result};
use std::sync::Arc;

#[derive(Clone)]
pub struct ReplicaGroup {
    /// `replicas[0]` is the replica this process speaks for
    replicas: Vec<Arc<RaftNode>>,
}

impl ReplicaGroup {
    pub fn new(replicas: Vec<Arc<RaftNode>>) -> Result<Self> {
        if replicas.is_empty() {
            return Err(Error::InvalidConfig(
                "replica group needs at least one replica".into(),
            ));
        }
        Ok(Self { replicas })
    }

    pub fn local(&self) -> &Arc<RaftNode> {
        &self.replicas[0]
    }

    pub fn replicas(&self) -> &[Arc<RaftNode>] {
        &self.replicas
    }

    pub fn get(&self, id: &str) -> Option<&Arc<RaftNode>> {
        self.replicas.iter().find(|r| r.id() == id)
    }

    /// The in-process replica that currently leads. Prefers the local
    /// replica, then the local leader hint, then the highest-term replica
    /// claiming leadership. `NotLeader` carries the hint when the leader is
    /// hosted elsewhere or no election has finished.
    pub fn leader(&self) -> Result<Arc<RaftNode>> {
        let local = self.local();
        if local.is_leader() {
            return Ok(local.clone());
        }
        let hint = local.leader_id();
        if let Some(node) = hint.as_deref().and_then(|id| self.get(id)) {
            if node.is_leader() {
                return Ok(node.clone());
            }
        }
        self.replicas
            .iter()
            .filter(|r| r.is_leader())
            .max_by_key(|r| r.current_term())
            .cloned()
            .ok_or(Error::NotLeader(hint))
    }

    /// Propose through the current leader and wait for the commit
    pub async fn propose(&self, command: Command) -> Result<u64> {
        let leader = self.leader()?;
        leader.propose(command).await
    }
}

impl From<Arc<RaftNode>> for ReplicaGroup {
    fn from(node: Arc<RaftNode>) -> Self {
        Self {
            replicas: vec![node],
        }
    }
}
