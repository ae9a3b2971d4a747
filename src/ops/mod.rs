//! Snapshot and log lifecycle management

pub mod rotate;
pub mod snapshot;
pub mod verify;

pub use rotate::LogRotator;
pub use snapshot::{SnapshotInfo, SnapshotManager};
pub use verify::verify_snapshot_integrity;
