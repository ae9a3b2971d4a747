//! Worker registry
//!
//! In-memory directory of workers and their live capacity and health
//! attributes. Every mutation goes through the registry's own lock; callers
//! only ever see cloned snapshots.

use crate::common::health::{classify, since};
use crate::common::{HealthStatus, HealthTally};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    #[default]
    Online,
    Offline,
    Draining,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    Leader,
    #[default]
    Worker,
    Replica,
    Standby,
}

/// Resource gauges reported with a heartbeat
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerGauges {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub disk_percent: f64,
    pub load_average: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Worker {
    pub id: String,
    pub address: String,
    pub max_agents: u32,
    pub active_agents: u32,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub disk_percent: f64,
    pub load_average: f64,
    pub status: NodeStatus,
    pub health: HealthStatus,
    pub role: NodeRole,
    /// Capability tags the worker advertises
    pub services: BTreeSet<String>,
    pub last_heartbeat: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
}

impl Worker {
    /// An online, healthy worker that just checked in
    pub fn new(id: impl Into<String>, address: impl Into<String>, max_agents: u32) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            address: address.into(),
            max_agents,
            active_agents: 0,
            cpu_percent: 0.0,
            memory_percent: 0.0,
            disk_percent: 0.0,
            load_average: 0.0,
            status: NodeStatus::Online,
            health: HealthStatus::Healthy,
            role: NodeRole::Worker,
            services: BTreeSet::new(),
            last_heartbeat: now,
            registered_at: now,
        }
    }

    pub fn with_services<I, S>(mut self, services: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.services = services.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_gauges(mut self, gauges: WorkerGauges) -> Self {
        self.apply_gauges(gauges);
        self
    }

    fn apply_gauges(&mut self, gauges: WorkerGauges) {
        self.cpu_percent = gauges.cpu_percent;
        self.memory_percent = gauges.memory_percent;
        self.disk_percent = gauges.disk_percent;
        self.load_average = gauges.load_average;
    }

    /// Online, healthy and below capacity. A worker with no capacity is
    /// never available.
    pub fn is_available(&self) -> bool {
        self.status == NodeStatus::Online
            && self.health.is_healthy()
            && self.max_agents > 0
            && self.active_agents < self.max_agents
    }

    /// Active agents as a percentage of capacity
    pub fn utilization(&self) -> f64 {
        if self.max_agents == 0 {
            return 100.0;
        }
        self.active_agents as f64 / self.max_agents as f64 * 100.0
    }

    pub fn provides(&self, service: &str) -> bool {
        self.services.contains(service)
    }
}

/// Aggregates computed by scanning the registry
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RegistryStats {
    pub total: usize,
    pub online: usize,
    pub offline: usize,
    pub draining: usize,
    pub available: usize,
    pub health: HealthTally,
    pub total_capacity: u64,
    pub active_agents: u64,
}

pub struct Registry {
    /// Registration order is kept; selection ties resolve to the earliest
    workers: RwLock<Vec<Worker>>,
    heartbeat_threshold: Duration,
}

impl Registry {
    pub fn new(heartbeat_threshold: Duration) -> Self {
        Self {
            workers: RwLock::new(Vec::new()),
            heartbeat_threshold,
        }
    }

    /// Add a worker. An existing entry with the same id is replaced in place.
    /// Returns `true` when an entry was replaced.
    pub fn register(&self, worker: Worker) -> bool {
        let mut workers = self.workers.write();
        match workers.iter_mut().find(|w| w.id == worker.id) {
            Some(existing) => {
                tracing::debug!(node_id = %worker.id, "Replacing registered worker");
                *existing = worker;
                true
            }
            None => {
                tracing::info!(node_id = %worker.id, address = %worker.address, max_agents = worker.max_agents, "Registered worker");
                workers.push(worker);
                false
            }
        }
    }

    pub fn unregister(&self, id: &str) -> Result<Worker> {
        let mut workers = self.workers.write();
        let pos = workers
            .iter()
            .position(|w| w.id == id)
            .ok_or_else(|| Error::NodeNotFound(id.to_string()))?;
        let worker = workers.remove(pos);
        tracing::info!(node_id = %id, "Unregistered worker");
        Ok(worker)
    }

    pub fn get(&self, id: &str) -> Option<Worker> {
        self.workers.read().iter().find(|w| w.id == id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.workers.read().iter().any(|w| w.id == id)
    }

    /// All workers in registration order
    pub fn snapshot(&self) -> Vec<Worker> {
        self.workers.read().clone()
    }

    pub fn available(&self) -> Vec<Worker> {
        self.workers
            .read()
            .iter()
            .filter(|w| w.is_available())
            .cloned()
            .collect()
    }

    /// Workers advertising `service`, available or not
    pub fn with_service(&self, service: &str) -> Vec<Worker> {
        self.workers
            .read()
            .iter()
            .filter(|w| w.provides(service))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.workers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.read().is_empty()
    }

    fn update<T>(&self, id: &str, f: impl FnOnce(&mut Worker) -> T) -> Result<T> {
        let mut workers = self.workers.write();
        let worker = workers
            .iter_mut()
            .find(|w| w.id == id)
            .ok_or_else(|| Error::NodeNotFound(id.to_string()))?;
        Ok(f(worker))
    }

    /// Record a heartbeat; the worker is healthy again immediately
    pub fn heartbeat(&self, id: &str, gauges: Option<WorkerGauges>) -> Result<()> {
        self.update(id, |w| {
            w.last_heartbeat = Utc::now();
            if w.health != HealthStatus::Healthy {
                tracing::info!(node_id = %w.id, from = %w.health, "Worker healthy again");
            }
            w.health = HealthStatus::Healthy;
            if let Some(gauges) = gauges {
                w.apply_gauges(gauges);
            }
        })
    }

    /// Reclassify every worker from the age of its last heartbeat
    pub fn sweep_health(&self, now: DateTime<Utc>) -> HealthTally {
        let mut workers = self.workers.write();
        let mut tally = HealthTally::default();
        for worker in workers.iter_mut() {
            let health = classify(since(worker.last_heartbeat, now), self.heartbeat_threshold);
            if health != worker.health {
                tracing::warn!(node_id = %worker.id, from = %worker.health, to = %health, "Worker health changed");
                worker.health = health;
            }
            tally.record(health);
        }
        tally
    }

    pub fn increment_active(&self, id: &str) -> Result<u32> {
        self.update(id, |w| {
            w.active_agents = w.active_agents.saturating_add(1);
            w.active_agents
        })
    }

    /// Decrement, never below zero
    pub fn decrement_active(&self, id: &str) -> Result<u32> {
        self.update(id, |w| {
            w.active_agents = w.active_agents.saturating_sub(1);
            w.active_agents
        })
    }

    pub fn set_status(&self, id: &str, status: NodeStatus) -> Result<()> {
        self.update(id, |w| w.status = status)
    }

    /// Make `id` the single registry-local leader, demoting any other.
    /// Returns the previous leader, if it was a different worker.
    pub fn promote_leader(&self, id: &str) -> Result<Option<String>> {
        let mut workers = self.workers.write();
        if !workers.iter().any(|w| w.id == id) {
            return Err(Error::NodeNotFound(id.to_string()));
        }
        let mut previous = None;
        for worker in workers.iter_mut() {
            if worker.id == id {
                worker.role = NodeRole::Leader;
            } else if worker.role == NodeRole::Leader {
                worker.role = NodeRole::Worker;
                previous = Some(worker.id.clone());
            }
        }
        Ok(previous)
    }

    pub fn leader(&self) -> Option<Worker> {
        self.workers
            .read()
            .iter()
            .find(|w| w.role == NodeRole::Leader)
            .cloned()
    }

    pub fn stats(&self) -> RegistryStats {
        let workers = self.workers.read();
        let mut stats = RegistryStats {
            total: workers.len(),
            ..Default::default()
        };
        for w in workers.iter() {
            match w.status {
                NodeStatus::Online => stats.online += 1,
                NodeStatus::Offline => stats.offline += 1,
                NodeStatus::Draining => stats.draining += 1,
            }
            if w.is_available() {
                stats.available += 1;
            }
            stats.health.record(w.health);
            stats.total_capacity += w.max_agents as u64;
            stats.active_agents += w.active_agents as u64;
        }
        stats
    }
}
