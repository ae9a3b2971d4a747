//! Heartbeat-driven health state machine shared by the worker registry,
//! the consensus peer table and the session coordinator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Liveness classification of a worker, peer or session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    #[default]
    Unknown,
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Unknown => write!(f, "unknown"),
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Time elapsed since `last_heartbeat`, clamped at zero for clock skew.
pub fn since(last_heartbeat: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - last_heartbeat).to_std().unwrap_or(Duration::ZERO)
}

/// `< T` Healthy, `[T, 2T)` Degraded, `>= 2T` Unhealthy.
pub fn classify(elapsed: Duration, threshold: Duration) -> HealthStatus {
    if elapsed < threshold {
        HealthStatus::Healthy
    } else if elapsed < threshold * 2 {
        HealthStatus::Degraded
    } else {
        HealthStatus::Unhealthy
    }
}

/// Outcome of checking a session lease
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseState {
    Live,
    /// Within `[lease/2, lease]`: warn, keep serving
    Expiring,
    /// Beyond `lease`: declare failed
    Expired,
}

pub fn classify_lease(elapsed: Duration, lease: Duration) -> LeaseState {
    if elapsed > lease {
        LeaseState::Expired
    } else if elapsed >= lease / 2 {
        LeaseState::Expiring
    } else {
        LeaseState::Live
    }
}

/// Per-status counts over a set of heartbeating members
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthTally {
    pub healthy: usize,
    pub degraded: usize,
    pub unhealthy: usize,
    pub unknown: usize,
}

impl HealthTally {
    pub fn record(&mut self, status: HealthStatus) {
        match status {
            HealthStatus::Healthy => self.healthy += 1,
            HealthStatus::Degraded => self.degraded += 1,
            HealthStatus::Unhealthy => self.unhealthy += 1,
            HealthStatus::Unknown => self.unknown += 1,
        }
    }
}

impl FromIterator<HealthStatus> for HealthTally {
    fn from_iter<I: IntoIterator<Item = HealthStatus>>(iter: I) -> Self {
        let mut tally = HealthTally::default();
        for status in iter {
            tally.record(status);
        }
        tally
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_boundaries() {
        let t = Duration::from_secs(10);
        assert_eq!(classify(Duration::ZERO, t), HealthStatus::Healthy);
        assert_eq!(classify(Duration::from_millis(9_999), t), HealthStatus::Healthy);
        assert_eq!(classify(t, t), HealthStatus::Degraded);
        assert_eq!(classify(Duration::from_millis(19_999), t), HealthStatus::Degraded);
        assert_eq!(classify(t * 2, t), HealthStatus::Unhealthy);
        assert_eq!(classify(Duration::from_secs(3600), t), HealthStatus::Unhealthy);
    }

    #[test]
    fn test_classify_lease() {
        let lease = Duration::from_secs(30);
        assert_eq!(classify_lease(Duration::from_secs(14), lease), LeaseState::Live);
        assert_eq!(classify_lease(Duration::from_secs(15), lease), LeaseState::Expiring);
        assert_eq!(classify_lease(lease, lease), LeaseState::Expiring);
        assert_eq!(classify_lease(Duration::from_secs(31), lease), LeaseState::Expired);
    }

    #[test]
    fn test_since_clamps_future_heartbeats() {
        let now = Utc::now();
        let future = now + chrono::Duration::seconds(5);
        assert_eq!(since(future, now), Duration::ZERO);
        assert_eq!(
            since(now - chrono::Duration::seconds(5), now),
            Duration::from_secs(5)
        );
    }

    #[test]
    fn test_tally() {
        let tally: HealthTally = [
            HealthStatus::Healthy,
            HealthStatus::Healthy,
            HealthStatus::Degraded,
            HealthStatus::Unhealthy,
        ]
        .into_iter()
        .collect();
        assert_eq!(tally.healthy, 2);
        assert_eq!(tally.degraded, 1);
        assert_eq!(tally.unhealthy, 1);
        assert_eq!(tally.unknown, 0);
    }
}
