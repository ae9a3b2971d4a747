//! Fleet coordinator: registry + balancer + assignment records
//!
//! Assignment is select-then-increment under the assignment table's write
//! lock, so one agent never takes two worker slots. Lock order is the
//! assignment table, then the registry.

use crate::common::{DeploymentMode, MetricsRegistry};
use crate::coordinator::balancer::{LoadBalancer, Strategy};
use crate::coordinator::registry::{
    NodeStatus, Registry, RegistryStats, Worker, WorkerGauges,
};
use crate::coordinator::WorkCoordinator;
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssignmentStatus {
    #[default]
    Active,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    pub agent_id: String,
    pub worker_id: String,
    pub assigned_at: DateTime<Utc>,
    pub status: AssignmentStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClusterStats {
    #[serde(flatten)]
    pub registry: RegistryStats,
    pub assignments: usize,
    pub strategy: Strategy,
    /// Registry-local leader, not the consensus leader
    pub leader: Option<String>,
}

pub struct ClusterCoordinator {
    registry: Arc<Registry>,
    balancer: LoadBalancer,
    assignments: RwLock<HashMap<String, Assignment>>,
    metrics: Arc<MetricsRegistry>,
}

impl ClusterCoordinator {
    pub fn new(registry: Arc<Registry>, strategy: Strategy, metrics: Arc<MetricsRegistry>) -> Self {
        let balancer = LoadBalancer::new(registry.clone(), strategy, metrics.clone());
        Self {
            registry,
            balancer,
            assignments: RwLock::new(HashMap::new()),
            metrics,
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn balancer(&self) -> &LoadBalancer {
        &self.balancer
    }

    /// Register or re-register a worker. A duplicate id replaces the
    /// previous entry; returns `true` in that case.
    pub fn register_node(&self, worker: Worker) -> bool {
        self.registry.register(worker)
    }

    /// Remove a worker and forget the assignments that pointed at it
    pub fn unregister_node(&self, id: &str) -> Result<Worker> {
        let worker = self.registry.unregister(id)?;
        let mut assignments = self.assignments.write();
        let before = assignments.len();
        assignments.retain(|_, a| a.worker_id != id);
        let dropped = before - assignments.len();
        if dropped > 0 {
            tracing::debug!(node_id = %id, dropped, "Dropped assignments of unregistered worker");
        }
        Ok(worker)
    }

    pub fn heartbeat(&self, id: &str, gauges: Option<WorkerGauges>) -> Result<()> {
        self.registry.heartbeat(id, gauges)
    }

    /// Stop routing new work to a worker; existing assignments stay
    pub fn drain_node(&self, id: &str) -> Result<()> {
        self.registry.set_status(id, NodeStatus::Draining)?;
        tracing::info!(node_id = %id, "Worker draining");
        Ok(())
    }

    /// Place `agent_id` on a worker. An agent that already has an
    /// assignment keeps it.
    pub fn assign_agent(&self, agent_id: &str) -> Result<Assignment> {
        let mut assignments = self.assignments.write();
        if let Some(existing) = assignments.get(agent_id) {
            return Ok(existing.clone());
        }

        let worker = self.balancer.select_node()?;
        self.registry.increment_active(&worker.id)?;

        let assignment = Assignment {
            agent_id: agent_id.to_string(),
            worker_id: worker.id.clone(),
            assigned_at: Utc::now(),
            status: AssignmentStatus::Active,
        };
        assignments.insert(agent_id.to_string(), assignment.clone());
        drop(assignments);
        self.metrics.assignments_total.inc();
        tracing::debug!(agent_id, node_id = %worker.id, strategy = %self.balancer.strategy(), "Agent assigned");
        Ok(assignment)
    }

    pub fn unassign_agent(&self, agent_id: &str) -> Result<Assignment> {
        let mut assignments = self.assignments.write();
        let assignment = assignments
            .remove(agent_id)
            .ok_or_else(|| Error::AssignmentNotFound(agent_id.to_string()))?;

        // The worker may have been unregistered since
        if let Err(e) = self.registry.decrement_active(&assignment.worker_id) {
            tracing::debug!(agent_id, node_id = %assignment.worker_id, error = %e, "Worker gone on unassign");
        }
        drop(assignments);
        self.metrics.unassignments_total.inc();
        tracing::debug!(agent_id, node_id = %assignment.worker_id, "Agent unassigned");
        Ok(assignment)
    }

    pub fn assignment(&self, agent_id: &str) -> Option<Assignment> {
        self.assignments.read().get(agent_id).cloned()
    }

    pub fn assignments_for(&self, worker_id: &str) -> Vec<Assignment> {
        let mut found: Vec<Assignment> = self
            .assignments
            .read()
            .values()
            .filter(|a| a.worker_id == worker_id)
            .cloned()
            .collect();
        found.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        found
    }

    /// Registry-local promotion, last write wins. This is not consensus
    /// leadership; see [`crate::consensus::Membership`] for that.
    pub fn promote_to_leader(&self, id: &str) -> Result<()> {
        let previous = self.registry.promote_leader(id)?;
        tracing::info!(node_id = %id, previous = ?previous, "Worker promoted to registry leader");
        Ok(())
    }

    pub fn registry_leader(&self) -> Option<Worker> {
        self.registry.leader()
    }

    pub fn strategy(&self) -> Strategy {
        self.balancer.strategy()
    }

    pub fn set_strategy(&self, strategy: Strategy) {
        self.balancer.set_strategy(strategy);
    }

    pub fn sweep_health(&self, now: DateTime<Utc>) {
        let tally = self.registry.sweep_health(now);
        if tally.degraded + tally.unhealthy > 0 {
            tracing::debug!(
                healthy = tally.healthy,
                degraded = tally.degraded,
                unhealthy = tally.unhealthy,
                "Worker health sweep"
            );
        }
    }

    pub fn stats(&self) -> ClusterStats {
        ClusterStats {
            registry: self.registry.stats(),
            assignments: self.assignments.read().len(),
            strategy: self.balancer.strategy(),
            leader: self.registry.leader().map(|w| w.id),
        }
    }
}

#[async_trait]
impl WorkCoordinator for ClusterCoordinator {
    fn mode(&self) -> DeploymentMode {
        DeploymentMode::Fleet
    }

    async fn heartbeat(&self, id: &str) -> Result<()> {
        ClusterCoordinator::heartbeat(self, id, None)
    }

    /// The hint is a service tag
    async fn select_worker(&self, hint: Option<&str>) -> Result<String> {
        let worker = match hint {
            Some(service) => self.balancer.select_node_with_service(service)?,
            None => self.balancer.select_node()?,
        };
        Ok(worker.id)
    }

    async fn sweep(&self, now: DateTime<Utc>) {
        self.sweep_health(now);
    }

    fn stats(&self) -> serde_json::Value {
        serde_json::to_value(ClusterCoordinator::stats(self)).unwrap_or_default()
    }
}
