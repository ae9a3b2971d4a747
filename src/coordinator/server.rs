//! One running deployment
//!
//! [`Node`] assembles the consensus group, the snapshot and log lifecycle,
//! and the coordinator selected by [`DeploymentMode`], then drives every
//! background loop from a single [`Scheduler`].

use crate::common::{Config, DeploymentMode, MetricsRegistry, PeriodicTask, Scheduler};
use crate::consensus::{
    ClusterObserver, ClusterState, LocalTransport, Membership, RaftNode, ReplicaGroup,
};
use crate::coordinator::cluster::ClusterCoordinator;
use crate::coordinator::registry::Registry;
use crate::coordinator::session::{Repositories, SessionCoordinator};
use crate::coordinator::WorkCoordinator;
use crate::ops::{LogRotator, SnapshotManager};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Logs cluster events
struct LoggingObserver;

#[async_trait]
impl ClusterObserver for LoggingObserver {
    async fn on_leader_change(&self, term: u64, leader_id: Option<String>) {
        tracing::info!(term, leader = ?leader_id, "Leader changed");
    }

    async fn on_peer_join(&self, id: &str, address: &str) {
        tracing::info!(peer = %id, %address, "Peer joined");
    }

    async fn on_peer_leave(&self, id: &str) {
        tracing::info!(peer = %id, "Peer left");
    }

    async fn on_cluster_state_change(&self, state: ClusterState) {
        tracing::debug!(?state, "Cluster state changed");
    }
}

/// The coordinator a deployment runs
#[derive(Clone)]
pub enum Deployment {
    Fleet(Arc<ClusterCoordinator>),
    SessionPool(Arc<SessionCoordinator>),
}

impl Deployment {
    pub fn mode(&self) -> DeploymentMode {
        match self {
            Deployment::Fleet(_) => DeploymentMode::Fleet,
            Deployment::SessionPool(_) => DeploymentMode::SessionPool,
        }
    }

    pub fn coordinator(&self) -> Arc<dyn WorkCoordinator> {
        match self {
            Deployment::Fleet(c) => c.clone(),
            Deployment::SessionPool(c) => c.clone(),
        }
    }
}

pub struct Node {
    config: Config,
    group: ReplicaGroup,
    transport: Arc<LocalTransport>,
    membership: Arc<Membership>,
    snapshots: Arc<SnapshotManager>,
    rotator: Arc<LogRotator>,
    deployment: Deployment,
    metrics: Arc<MetricsRegistry>,
    scheduler: Scheduler,
}

/// Replica ids of an in-process group: the configured id, then `{id}-r{n}`
fn replica_ids(node_id: &str, replicas: usize) -> Vec<String> {
    let mut ids = vec![node_id.to_string()];
    ids.extend((1..replicas.max(1)).map(|n| format!("{}-r{}", node_id, n)));
    ids
}

impl Node {
    /// Start with in-memory session collaborators
    pub async fn start(config: Config, replicas: usize, token: CancellationToken) -> Result<Self> {
        Self::start_with(config, replicas, Repositories::in_memory(), token).await
    }

    /// Boot an in-process consensus group of `replicas` members, restore the
    /// latest snapshot, build the coordinator for `config.mode` and spawn all
    /// background tasks on `token`.
    pub async fn start_with(
        config: Config,
        replicas: usize,
        repos: Repositories,
        token: CancellationToken,
    ) -> Result<Self> {
        config.validate()?;
        let metrics = Arc::new(MetricsRegistry::new());
        let transport = LocalTransport::new();

        let ids = replica_ids(&config.node_id, replicas);
        let members: BTreeMap<String, String> = ids
            .iter()
            .map(|id| (id.clone(), format!("local://{}", id)))
            .collect();

        let mut group = Vec::with_capacity(ids.len());
        for (n, id) in ids.iter().enumerate() {
            // only the local replica reports into the shared registry
            let replica_metrics = if n == 0 {
                metrics.clone()
            } else {
                Arc::new(MetricsRegistry::new())
            };
            let node = RaftNode::open(
                id.clone(),
                config.raft.clone(),
                members.clone(),
                transport.clone(),
                replica_metrics,
                &config.log_dir().join(id),
                config.snapshot.segment_max_bytes,
            )?;
            transport.register(&node);
            group.push(node);
        }
        let group = ReplicaGroup::new(group)?;
        let local = group.local().clone();

        let membership = Arc::new(Membership::new(group.clone()));
        membership.add_observer(Arc::new(LoggingObserver));

        let snapshots = Arc::new(SnapshotManager::new(
            local.clone(),
            config.snapshot_dir(),
            config.snapshot.interval(),
            metrics.clone(),
        )?);
        match snapshots.restore_latest() {
            Ok(Some(info)) => tracing::info!(snapshot = %info.filename, index = info.index, "Recovered from snapshot"),
            Ok(None) => tracing::debug!("No snapshot to recover from"),
            Err(e) => tracing::warn!(error = %e, "Snapshot recovery failed, replaying log only"),
        }

        let rotator = Arc::new(LogRotator::new(
            local.clone(),
            config.archive_dir(),
            config.snapshot.max_log_size_bytes,
            metrics.clone(),
        ));

        let deployment = match config.mode {
            DeploymentMode::Fleet => {
                let registry = Arc::new(Registry::new(config.health.heartbeat_threshold()));
                Deployment::Fleet(Arc::new(ClusterCoordinator::new(
                    registry,
                    config.balancer.strategy,
                    metrics.clone(),
                )))
            }
            DeploymentMode::SessionPool => {
                let sessions = Arc::new(SessionCoordinator::new(
                    group.clone(),
                    repos,
                    config.session.clone(),
                    metrics.clone(),
                ));
                sessions.load_sessions().await?;
                Deployment::SessionPool(sessions)
            }
        };

        let mut scheduler = Scheduler::with_token(token);
        for replica in group.replicas() {
            scheduler.spawn(replica.driver());
        }
        let peers = membership.clone();
        scheduler.spawn(PeriodicTask::new(
            "peer-health",
            config.raft.peer_health_sweep(),
            move || {
                let peers = peers.clone();
                async move {
                    peers.sweep_health(Utc::now());
                }
            },
        ));
        match &deployment {
            Deployment::Fleet(fleet) => {
                let fleet = fleet.clone();
                scheduler.spawn(PeriodicTask::new(
                    "worker-health",
                    config.health.sweep_interval(),
                    move || {
                        let fleet = fleet.clone();
                        async move { fleet.sweep_health(Utc::now()) }
                    },
                ));
            }
            Deployment::SessionPool(sessions) => scheduler.spawn(sessions.failure_detector()),
        }
        scheduler.spawn(snapshots.schedule_periodic_snapshots(config.snapshot.interval()));
        scheduler.spawn(rotator.periodic(config.snapshot.rotation_check()));

        tracing::info!(
            node_id = %config.node_id,
            mode = %config.mode,
            replicas = group.replicas().len(),
            data_dir = %config.data_dir.display(),
            tasks = ?scheduler.task_names(),
            "Node started"
        );

        Ok(Self {
            config,
            group,
            transport,
            membership,
            snapshots,
            rotator,
            deployment,
            metrics,
            scheduler,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The replica this process speaks for
    pub fn local(&self) -> &Arc<RaftNode> {
        self.group.local()
    }

    pub fn replicas(&self) -> &[Arc<RaftNode>] {
        self.group.replicas()
    }

    pub fn group(&self) -> &ReplicaGroup {
        &self.group
    }

    pub fn transport(&self) -> &Arc<LocalTransport> {
        &self.transport
    }

    pub fn membership(&self) -> &Arc<Membership> {
        &self.membership
    }

    pub fn snapshots(&self) -> &Arc<SnapshotManager> {
        &self.snapshots
    }

    pub fn rotator(&self) -> &Arc<LogRotator> {
        &self.rotator
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    pub fn deployment(&self) -> &Deployment {
        &self.deployment
    }

    pub fn coordinator(&self) -> Arc<dyn WorkCoordinator> {
        self.deployment.coordinator()
    }

    pub fn scheduled_tasks(&self) -> Vec<&str> {
        self.scheduler.task_names()
    }

    /// Wait until some replica is leader. Returns its id.
    pub async fn wait_for_leader(&self, timeout: Duration) -> Result<String> {
        let wait = async {
            loop {
                if let Ok(leader) = self.group.leader() {
                    return leader.id().to_string();
                }
                tokio::time::sleep(self.config.raft.tick_interval()).await;
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| Error::ConsensusTimeout)
    }

    /// Read-only monitoring map: consensus position and peer health, plus
    /// the balancer strategy and round-robin cursor for a fleet.
    pub fn metrics_surface(&self) -> BTreeMap<String, serde_json::Value> {
        let mut surface = self.membership.metrics_surface();
        surface.insert("mode".to_string(), self.deployment.mode().to_string().into());
        match &self.deployment {
            Deployment::Fleet(fleet) => {
                surface.insert(
                    "balancer_strategy".to_string(),
                    fleet.strategy().as_str().into(),
                );
                surface.insert("rr_cursor".to_string(), fleet.balancer().cursor().into());
            }
            Deployment::SessionPool(sessions) => {
                surface.insert(
                    "active_sessions".to_string(),
                    sessions.active_session_count().into(),
                );
                surface.insert(
                    "lease_timeout_ms".to_string(),
                    sessions.config().lease_timeout_ms.into(),
                );
            }
        }
        surface
    }

    /// Counters in Prometheus text format
    pub fn prometheus(&self) -> String {
        self.metrics.to_prometheus()
    }

    /// Run until the scheduler's token is cancelled, then shut down
    pub async fn serve(self) -> Result<()> {
        let token = self.scheduler.token();
        tracing::info!(node_id = %self.config.node_id, "Node serving");
        token.cancelled().await;
        self.shutdown().await
    }

    /// Final snapshot, then stop observers and every background task
    pub async fn shutdown(self) -> Result<()> {
        tracing::info!(node_id = %self.config.node_id, "Shutting down");
        if let Err(e) = self.snapshots.take_snapshot_forced() {
            tracing::warn!(error = %e, "Shutdown snapshot failed");
        }
        self.membership.shutdown_observers();
        self.scheduler.shutdown().await;
        tracing::info!(node_id = %self.config.node_id, "Shutdown complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::registry::Worker;
    use crate::coordinator::session::Session;
    use tempfile::TempDir;

    fn config(dir: &TempDir, mode: DeploymentMode) -> Config {
        Config {
            node_id: "coord".into(),
            mode,
            data_dir: dir.path().to_path_buf(),
            ..Default::default()
        }
    }

    #[test]
    fn test_replica_ids() {
        assert_eq!(replica_ids("a", 3), vec!["a", "a-r1", "a-r2"]);
        assert_eq!(replica_ids("a", 0), vec!["a"]);
    }

    #[tokio::test]
    async fn test_fleet_node_lifecycle() {
        let dir = TempDir::new().unwrap();
        let node = Node::start(config(&dir, DeploymentMode::Fleet), 3, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(node.replicas().len(), 3);
        assert!(node.scheduled_tasks().contains(&"worker-health"));
        assert!(node.scheduled_tasks().contains(&"snapshot"));
        node.wait_for_leader(Duration::from_secs(5)).await.unwrap();

        let Deployment::Fleet(fleet) = node.deployment().clone() else {
            panic!("expected fleet deployment");
        };
        fleet.register_node(Worker::new("w1", "10.0.0.1:7000", 2));
        let coordinator = node.coordinator();
        assert_eq!(coordinator.select_worker(None).await.unwrap(), "w1");

        let surface = node.metrics_surface();
        assert_eq!(surface["balancer_strategy"], "least_loaded");
        assert_eq!(surface["node_id"], "coord");
        assert!(surface.contains_key("rr_cursor"));
        assert!(node.prometheus().contains("minifleet_elections_total"));

        node.shutdown().await.unwrap();
        // shutdown leaves a snapshot behind
        let snapshots = std::fs::read_dir(dir.path().join("snapshots")).unwrap().count();
        assert_eq!(snapshots, 1);
    }

    #[tokio::test]
    async fn test_session_pool_node_registers_through_consensus() {
        let dir = TempDir::new().unwrap();
        let node = Node::start(
            config(&dir, DeploymentMode::SessionPool),
            1,
            CancellationToken::new(),
        )
        .await
        .unwrap();
        assert!(node.scheduled_tasks().contains(&"session-failure-detector"));
        node.wait_for_leader(Duration::from_secs(5)).await.unwrap();

        let Deployment::SessionPool(sessions) = node.deployment().clone() else {
            panic!("expected session pool deployment");
        };
        sessions
            .register_session(Session::new("s1", "pro", "claude"))
            .await
            .unwrap();
        assert!(node.local().registered_sessions().contains_key("s1"));
        assert_eq!(node.metrics_surface()["active_sessions"], 1);
        node.shutdown().await.unwrap();
    }
}
