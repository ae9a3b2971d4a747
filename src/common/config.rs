//! Configuration for minifleet components
//!
//! Values are layered: built-in defaults, then an optional TOML file, then
//! `MINIFLEET__SECTION__KEY` environment variables.

use crate::coordinator::balancer::Strategy;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Global configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Node ID (unique identifier inside the consensus group)
    #[serde(default = "default_node_id")]
    pub node_id: String,

    /// Which coordinator this node runs
    #[serde(default)]
    pub mode: DeploymentMode,

    /// Root directory for snapshots, log segments and archives
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub raft: RaftConfig,

    #[serde(default)]
    pub health: HealthConfig,

    #[serde(default)]
    pub balancer: BalancerConfig,

    #[serde(default)]
    pub snapshot: SnapshotConfig,

    #[serde(default)]
    pub session: SessionConfig,
}

fn default_node_id() -> String {
    "node-1".to_string()
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("./fleet-data")
}
fn default_log_level() -> String {
    "info".to_string()
}

/// Deployment mode: a plain worker fleet, or a consensus-replicated session pool
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentMode {
    #[default]
    Fleet,
    SessionPool,
}

impl std::fmt::Display for DeploymentMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeploymentMode::Fleet => write!(f, "fleet"),
            DeploymentMode::SessionPool => write!(f, "session_pool"),
        }
    }
}

impl std::str::FromStr for DeploymentMode {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "fleet" => Ok(DeploymentMode::Fleet),
            "session_pool" | "session-pool" => Ok(DeploymentMode::SessionPool),
            other => Err(crate::Error::InvalidConfig(format!(
                "unknown deployment mode: {}",
                other
            ))),
        }
    }
}

/// Consensus configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaftConfig {
    /// Lower bound of the randomized election timeout
    #[serde(default = "default_election_timeout_min")]
    pub election_timeout_min_ms: u64,

    /// Upper bound of the randomized election timeout
    #[serde(default = "default_election_timeout_max")]
    pub election_timeout_max_ms: u64,

    /// Leader heartbeat (empty AppendEntries) interval
    #[serde(default = "default_raft_heartbeat")]
    pub heartbeat_interval_ms: u64,

    /// Driver tick period
    #[serde(default = "default_tick")]
    pub tick_interval_ms: u64,

    /// How long a proposal waits for commit before `ConsensusTimeout`
    #[serde(default = "default_proposal_timeout")]
    pub proposal_timeout_ms: u64,

    /// Per-RPC timeout
    #[serde(default = "default_rpc_timeout")]
    pub rpc_timeout_ms: u64,

    /// Peer health threshold `T` (Degraded at `T`, Unhealthy at `2T`)
    #[serde(default = "default_peer_health_threshold")]
    pub peer_health_threshold_ms: u64,

    /// Peer health sweep period
    #[serde(default = "default_peer_health_sweep")]
    pub peer_health_sweep_ms: u64,
}

fn default_election_timeout_min() -> u64 {
    150
}
fn default_election_timeout_max() -> u64 {
    300
}
fn default_raft_heartbeat() -> u64 {
    50
}
fn default_tick() -> u64 {
    10
}
fn default_proposal_timeout() -> u64 {
    5_000
}
fn default_rpc_timeout() -> u64 {
    100
}
fn default_peer_health_threshold() -> u64 {
    10_000
}
fn default_peer_health_sweep() -> u64 {
    5_000
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            election_timeout_min_ms: default_election_timeout_min(),
            election_timeout_max_ms: default_election_timeout_max(),
            heartbeat_interval_ms: default_raft_heartbeat(),
            tick_interval_ms: default_tick(),
            proposal_timeout_ms: default_proposal_timeout(),
            rpc_timeout_ms: default_rpc_timeout(),
            peer_health_threshold_ms: default_peer_health_threshold(),
            peer_health_sweep_ms: default_peer_health_sweep(),
        }
    }
}

impl RaftConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn proposal_timeout(&self) -> Duration {
        Duration::from_millis(self.proposal_timeout_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn peer_health_threshold(&self) -> Duration {
        Duration::from_millis(self.peer_health_threshold_ms)
    }

    pub fn peer_health_sweep(&self) -> Duration {
        Duration::from_millis(self.peer_health_sweep_ms)
    }
}

/// Worker registry health configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Heartbeat threshold `T` for registered workers
    #[serde(default = "default_worker_threshold")]
    pub heartbeat_threshold_ms: u64,

    /// Registry health sweep period
    #[serde(default = "default_worker_sweep")]
    pub sweep_interval_ms: u64,
}

fn default_worker_threshold() -> u64 {
    30_000
}
fn default_worker_sweep() -> u64 {
    10_000
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            heartbeat_threshold_ms: default_worker_threshold(),
            sweep_interval_ms: default_worker_sweep(),
        }
    }
}

impl HealthConfig {
    pub fn heartbeat_threshold(&self) -> Duration {
        Duration::from_millis(self.heartbeat_threshold_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

/// Load balancer configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BalancerConfig {
    #[serde(default)]
    pub strategy: Strategy,
}

/// Snapshot and log lifecycle configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotConfig {
    /// Minimum spacing between non-forced snapshots
    #[serde(default = "default_snapshot_interval")]
    pub interval_secs: u64,

    /// Total on-disk log size that triggers rotation
    #[serde(default = "default_max_log_size")]
    pub max_log_size_bytes: u64,

    /// Size at which the active segment rolls over
    #[serde(default = "default_segment_size")]
    pub segment_max_bytes: u64,

    /// Log rotation check period
    #[serde(default = "default_rotation_check")]
    pub rotation_check_secs: u64,
}

fn default_snapshot_interval() -> u64 {
    3_600
}
fn default_max_log_size() -> u64 {
    64 * 1024 * 1024
}
fn default_segment_size() -> u64 {
    8 * 1024 * 1024
}
fn default_rotation_check() -> u64 {
    300
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_snapshot_interval(),
            max_log_size_bytes: default_max_log_size(),
            segment_max_bytes: default_segment_size(),
            rotation_check_secs: default_rotation_check(),
        }
    }
}

impl SnapshotConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn rotation_check(&self) -> Duration {
        Duration::from_secs(self.rotation_check_secs)
    }
}

/// Session coordinator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// A session with no heartbeat for longer than this is declared failed
    #[serde(default = "default_lease_timeout")]
    pub lease_timeout_ms: u64,

    /// Failure-detection sweep period
    #[serde(default = "default_session_heartbeat")]
    pub heartbeat_interval_ms: u64,

    /// Consecutive task errors before a session is marked degraded
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Applied when a session registers without a limit
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: u32,
}

fn default_lease_timeout() -> u64 {
    30_000
}
fn default_session_heartbeat() -> u64 {
    10_000
}
fn default_failure_threshold() -> u32 {
    3
}
fn default_max_concurrent_tasks() -> u32 {
    5
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            lease_timeout_ms: default_lease_timeout(),
            heartbeat_interval_ms: default_session_heartbeat(),
            failure_threshold: default_failure_threshold(),
            max_concurrent_tasks: default_max_concurrent_tasks(),
        }
    }
}

impl SessionConfig {
    pub fn lease_timeout(&self) -> Duration {
        Duration::from_millis(self.lease_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            mode: DeploymentMode::default(),
            data_dir: default_data_dir(),
            log_level: default_log_level(),
            raft: RaftConfig::default(),
            health: HealthConfig::default(),
            balancer: BalancerConfig::default(),
            snapshot: SnapshotConfig::default(),
            session: SessionConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from defaults, an optional TOML file and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("MINIFLEET")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: Config = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(crate::Error::InvalidConfig(msg.to_string()));

        if self.node_id.trim().is_empty() {
            return invalid("node_id cannot be empty");
        }
        if self.raft.election_timeout_min_ms == 0
            || self.raft.election_timeout_min_ms > self.raft.election_timeout_max_ms
        {
            return invalid("election timeout range is empty");
        }
        if self.raft.heartbeat_interval_ms >= self.raft.election_timeout_min_ms {
            return invalid("raft heartbeat must be shorter than the election timeout");
        }
        if self.raft.tick_interval_ms == 0 {
            return invalid("tick interval must be positive");
        }
        if self.health.heartbeat_threshold_ms == 0 || self.raft.peer_health_threshold_ms == 0 {
            return invalid("health thresholds must be positive");
        }
        if self.session.lease_timeout_ms == 0 || self.session.heartbeat_interval_ms == 0 {
            return invalid("session lease and heartbeat interval must be positive");
        }
        if self.snapshot.segment_max_bytes == 0 {
            return invalid("segment size must be positive");
        }
        Ok(())
    }

    pub fn snapshot_dir(&self) -> PathBuf {
        self.data_dir.join("snapshots")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("raft-log")
    }

    pub fn archive_dir(&self) -> PathBuf {
        self.data_dir.join("archive")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.mode, DeploymentMode::Fleet);
        assert_eq!(config.balancer.strategy, Strategy::LeastLoaded);
        assert_eq!(config.session.max_concurrent_tasks, 5);
    }

    #[test]
    fn test_load_from_toml() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
node_id = "coord-7"
mode = "session_pool"

[balancer]
strategy = "round_robin"

[session]
lease_timeout_ms = 4000
"#
        )
        .unwrap();

        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!(config.node_id, "coord-7");
        assert_eq!(config.mode, DeploymentMode::SessionPool);
        assert_eq!(config.balancer.strategy, Strategy::RoundRobin);
        assert_eq!(config.session.lease_timeout_ms, 4000);
        // untouched sections keep their defaults
        assert_eq!(config.raft.heartbeat_interval_ms, 50);
    }

    #[test]
    fn test_validate_rejects_bad_election_range() {
        let mut config = Config::default();
        config.raft.election_timeout_min_ms = 500;
        config.raft.election_timeout_max_ms = 100;
        assert!(matches!(
            config.validate(),
            Err(crate::Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_deployment_mode_parse() {
        assert_eq!(
            "session-pool".parse::<DeploymentMode>().unwrap(),
            DeploymentMode::SessionPool
        );
        assert!("mesh".parse::<DeploymentMode>().is_err());
    }
}
