//! # minifleet
//!
//! Fleet coordination core:
//! - Raft consensus for membership and session registration
//! - Heartbeat failure detection for peers, workers and sessions
//! - Pluggable load balancing over a worker registry
//! - Snapshots, log compaction and log rotation
//!
//! ## Architecture

#![allow(clippy::result_large_err)]
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │        Consensus group (Raft)            │
//! │   - Leader: proposes membership changes  │
//! │   - Followers: replicate, vote           │
//! └───────┬──────────────────────┬───────────┘
//!         │ commits              │ log position
//! ┌───────▼──────────┐   ┌───────▼──────────┐
//! │ Coordinator      │   │ Snapshots & log  │
//! │  fleet | sessions│   │  rotation        │
//! │  + balancer      │   └──────────────────┘
//! │  + registry      │
//! └──────────────────┘
//! ```
//!
//! ## Usage
//!
//! ### Start a coordinator
//! ```bash
//! minifleet-coord serve \
//!   --id coord-1 \
//!   --data-dir ./fleet-data \
//!   --mode session_pool \
//!   --replicas 3
//! ```

pub mod common;
pub mod consensus;
pub mod coordinator;
pub mod ops;

// Re-export commonly used types
pub use common::{Config, DeploymentMode, Error, Result};
pub use consensus::{Membership, RaftNode};
pub use coordinator::{ClusterCoordinator, Node, SessionCoordinator, WorkCoordinator};
pub use ops::{LogRotator, SnapshotManager};

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build info
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");
