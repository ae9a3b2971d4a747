//! Worker selection strategies
//!
//! The balancer holds no state of its own beyond the round-robin cursor; it
//! selects from whatever candidate list it is given, either the whole
//! registry or a pre-filtered subset.
//!
//! Round robin indexes the *current* available list with `cursor mod len`,
//! so it only approximates global round robin while membership changes.

use crate::common::MetricsRegistry;
use crate::coordinator::registry::{Registry, Worker};
use crate::{Error, Result};
use parking_lot::RwLock;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    RoundRobin,
    #[default]
    LeastLoaded,
    LeastAgents,
    Random,
    Weighted,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::RoundRobin => "round_robin",
            Strategy::LeastLoaded => "least_loaded",
            Strategy::LeastAgents => "least_agents",
            Strategy::Random => "random",
            Strategy::Weighted => "weighted",
        }
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Strategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "round_robin" => Ok(Strategy::RoundRobin),
            "least_loaded" => Ok(Strategy::LeastLoaded),
            "least_agents" => Ok(Strategy::LeastAgents),
            "random" => Ok(Strategy::Random),
            "weighted" => Ok(Strategy::Weighted),
            other => Err(Error::InvalidConfig(format!(
                "unknown balancing strategy: {}",
                other
            ))),
        }
    }
}

/// `0.4·cpu + 0.3·mem + 0.3·utilization`; lower is better
pub fn load_score(worker: &Worker) -> f64 {
    0.4 * worker.cpu_percent + 0.3 * worker.memory_percent + 0.3 * worker.utilization()
}

/// Free capacity as a percentage; zero for full or capacity-less workers
pub fn weight(worker: &Worker) -> f64 {
    if worker.max_agents == 0 {
        return 0.0;
    }
    let free = worker.max_agents.saturating_sub(worker.active_agents);
    free as f64 / worker.max_agents as f64 * 100.0
}

/// Picks made before a multi-node selection failed
#[derive(Debug, thiserror::Error)]
#[error("selected {} node(s) before failing: {error}", .selected.len())]
pub struct PartialSelection {
    pub selected: Vec<Worker>,
    pub error: Error,
}

pub struct LoadBalancer {
    registry: Arc<Registry>,
    strategy: RwLock<Strategy>,
    cursor: AtomicU64,
    metrics: Arc<MetricsRegistry>,
}

impl LoadBalancer {
    pub fn new(registry: Arc<Registry>, strategy: Strategy, metrics: Arc<MetricsRegistry>) -> Self {
        Self {
            registry,
            strategy: RwLock::new(strategy),
            cursor: AtomicU64::new(0),
            metrics,
        }
    }

    pub fn strategy(&self) -> Strategy {
        *self.strategy.read()
    }

    pub fn set_strategy(&self, strategy: Strategy) {
        let previous = std::mem::replace(&mut *self.strategy.write(), strategy);
        if previous != strategy {
            tracing::info!(from = %previous, to = %strategy, "Load balancing strategy changed");
        }
    }

    /// Current round-robin cursor
    pub fn cursor(&self) -> u64 {
        self.cursor.load(Ordering::Relaxed)
    }

    /// Select one worker from the whole registry
    pub fn select_node(&self) -> Result<Worker> {
        self.select_from(&self.registry.snapshot())
    }

    /// Select `n` workers, one selection at a time. Duplicates are possible
    /// for strategies other than round robin.
    pub fn select_nodes(&self, n: usize) -> std::result::Result<Vec<Worker>, PartialSelection> {
        let mut selected = Vec::with_capacity(n);
        for _ in 0..n {
            match self.select_node() {
                Ok(worker) => selected.push(worker),
                Err(error) => return Err(PartialSelection { selected, error }),
            }
        }
        Ok(selected)
    }

    /// Select among workers advertising `service`
    pub fn select_node_with_service(&self, service: &str) -> Result<Worker> {
        let providers = self.registry.with_service(service);
        if providers.is_empty() {
            self.metrics.selection_failures_total.inc();
            return Err(Error::NoNodesWithService(service.to_string()));
        }
        self.select_from(&providers)
    }

    /// Filter `candidates` to available workers, then apply the strategy
    pub fn select_from(&self, candidates: &[Worker]) -> Result<Worker> {
        let available: Vec<Worker> = candidates
            .iter()
            .filter(|w| w.is_available())
            .cloned()
            .collect();
        if available.is_empty() {
            self.metrics.selection_failures_total.inc();
            return Err(Error::NoAvailableNodes);
        }
        self.choose(&available)
    }

    /// Apply the active strategy to `workers` as given, without any
    /// availability filtering.
    pub fn choose(&self, workers: &[Worker]) -> Result<Worker> {
        if workers.is_empty() {
            return Err(Error::NoAvailableNodes);
        }
        let index = match self.strategy() {
            Strategy::RoundRobin => self.round_robin(workers.len()),
            Strategy::LeastLoaded => min_index(workers, load_score),
            Strategy::LeastAgents => min_index(workers, |w| w.active_agents as f64),
            Strategy::Random => rand::thread_rng().gen_range(0..workers.len()),
            Strategy::Weighted => self.weighted(workers),
        };
        Ok(workers[index].clone())
    }

    fn round_robin(&self, len: usize) -> usize {
        let cursor = self.cursor.fetch_add(1, Ordering::Relaxed);
        (cursor % len as u64) as usize
    }

    fn weighted(&self, workers: &[Worker]) -> usize {
        let weights: Vec<f64> = workers.iter().map(weight).collect();
        let total: f64 = weights.iter().sum();
        if total <= 0.0 {
            return self.round_robin(workers.len());
        }

        let mut target = rand::thread_rng().gen_range(0.0..total);
        for (i, w) in weights.iter().enumerate() {
            if target < *w {
                return i;
            }
            target -= w;
        }
        // float rounding can leave `target` just past the last bucket
        weights.iter().rposition(|w| *w > 0.0).unwrap_or(0)
    }
}

/// Index of the minimum score; ties go to the earliest worker
fn min_index(workers: &[Worker], score: impl Fn(&Worker) -> f64) -> usize {
    let mut best = 0;
    let mut best_score = f64::INFINITY;
    for (i, worker) in workers.iter().enumerate() {
        let s = score(worker);
        if s < best_score {
            best = i;
            best_score = s;
        }
    }
    best
}
