//! Common utilities and types shared across minifleet

pub mod config;
pub mod error;
pub mod health;
pub mod metrics;
pub mod scheduler;
pub mod utils;

pub use config::{
    BalancerConfig, Config, DeploymentMode, HealthConfig, RaftConfig, SessionConfig,
    SnapshotConfig,
};
pub use error::{Error, Result};
pub use health::{classify, classify_lease, HealthStatus, HealthTally, LeaseState};
pub use metrics::MetricsRegistry;
pub use scheduler::{PeriodicTask, Scheduler};
pub use utils::{crc32, format_bytes, timestamp_now_millis};
