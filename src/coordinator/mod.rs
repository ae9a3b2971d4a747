//! Work coordination
//!
//! Two coordinators share the registry, balancer and health logic:
//! - [`ClusterCoordinator`]: a plain worker fleet with agent assignments
//! - [`SessionCoordinator`]: long-lived sessions registered through consensus
//!
//! A deployment runs one of them, chosen by [`DeploymentMode`], behind the
//! [`WorkCoordinator`] trait.

pub mod balancer;
pub mod cluster;
pub mod registry;
pub mod repository;
pub mod server;
pub mod session;

pub use balancer::{LoadBalancer, PartialSelection, Strategy};
pub use cluster::{Assignment, AssignmentStatus, ClusterCoordinator, ClusterStats};
pub use registry::{NodeRole, NodeStatus, Registry, RegistryStats, Worker, WorkerGauges};
pub use repository::{
    DistributedLockRepository, DistributedTaskRepository, InMemoryAffinityRepository,
    InMemoryLockRepository, InMemorySessionRepository, InMemoryTaskRepository,
    SessionAffinityRepository, SessionRepository,
};
pub use server::Node;
pub use session::{
    Repositories, Session, SessionCoordinator, SessionStats, SessionStatus,
    SessionStatusSummary, SweepReport,
};

use crate::common::DeploymentMode;
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// The narrow surface the request-handling layer talks to
#[async_trait]
pub trait WorkCoordinator: Send + Sync {
    fn mode(&self) -> DeploymentMode;

    /// Liveness report for a worker id or session name
    async fn heartbeat(&self, id: &str) -> Result<()>;

    /// Where the next unit of work should go. The hint is a service tag for
    /// a fleet and an affinity key for a session pool.
    async fn select_worker(&self, hint: Option<&str>) -> Result<String>;

    /// One health sweep or failure-detection pass
    async fn sweep(&self, now: DateTime<Utc>);

    fn stats(&self) -> serde_json::Value;

    async fn rebalance(&self) -> Result<()> {
        Err(Error::NotImplemented("rebalance"))
    }
}
