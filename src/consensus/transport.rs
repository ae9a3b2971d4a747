//! Raft RPC transport between replicas

use crate::consensus::raft::{
    AppendRequest, AppendResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    TimeoutNowRequest, VoteRequest, VoteResponse,
};
use crate::consensus::raft_node::RaftNode;
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

/// Delivers Raft RPCs to the replica named `target`
#[async_trait]
pub trait RaftTransport: Send + Sync {
    async fn request_vote(&self, target: &str, req: VoteRequest) -> Result<VoteResponse>;

    async fn append_entries(&self, target: &str, req: AppendRequest) -> Result<AppendResponse>;

    async fn install_snapshot(
        &self,
        target: &str,
        req: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse>;

    async fn timeout_now(&self, target: &str, req: TimeoutNowRequest) -> Result<()>;
}

/// In-process transport for a consensus group living in one process.
///
/// Replicas can be isolated to simulate a network partition: every RPC from
/// or to an isolated replica fails with a transport error.
#[derive(Default)]
pub struct LocalTransport {
    nodes: RwLock<HashMap<String, Weak<RaftNode>>>,
    isolated: RwLock<HashSet<String>>,
}

impl LocalTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, node: &Arc<RaftNode>) {
        self.nodes
            .write()
            .insert(node.id().to_string(), Arc::downgrade(node));
    }

    pub fn deregister(&self, id: &str) {
        self.nodes.write().remove(id);
    }

    /// Cut `id` off from every other replica
    pub fn isolate(&self, id: &str) {
        self.isolated.write().insert(id.to_string());
    }

    pub fn heal(&self, id: &str) {
        self.isolated.write().remove(id);
    }

    pub fn heal_all(&self) {
        self.isolated.write().clear();
    }

    fn resolve(&self, from: &str, target: &str) -> Result<Arc<RaftNode>> {
        {
            let isolated = self.isolated.read();
            if isolated.contains(from) || isolated.contains(target) {
                return Err(Error::Transport {
                    peer: target.to_string(),
                    reason: "partitioned".into(),
                });
            }
        }

        self.nodes
            .read()
            .get(target)
            .and_then(Weak::upgrade)
            .ok_or_else(|| Error::Transport {
                peer: target.to_string(),
                reason: "unreachable".into(),
            })
    }
}

#[async_trait]
impl RaftTransport for LocalTransport {
    async fn request_vote(&self, target: &str, req: VoteRequest) -> Result<VoteResponse> {
        let node = self.resolve(&req.candidate_id, target)?;
        tokio::task::yield_now().await;
        node.handle_request_vote(req)
    }

    async fn append_entries(&self, target: &str, req: AppendRequest) -> Result<AppendResponse> {
        let node = self.resolve(&req.leader_id, target)?;
        tokio::task::yield_now().await;
        node.handle_append_entries(req)
    }

    async fn install_snapshot(
        &self,
        target: &str,
        req: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        let node = self.resolve(&req.leader_id, target)?;
        tokio::task::yield_now().await;
        node.handle_install_snapshot(req)
    }

    async fn timeout_now(&self, target: &str, req: TimeoutNowRequest) -> Result<()> {
        let node = self.resolve(&req.leader_id, target)?;
        node.handle_timeout_now(req);
        Ok(())
    }
}
