//! Size-triggered rotation of the on-disk Raft log

use crate::common::scheduler::PeriodicTask;
use crate::common::{format_bytes, timestamp_now_millis, MetricsRegistry};
use crate::consensus::RaftNode;
use crate::{Error, Result};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Archives log segments into `archive_dir/logs_{millis}` once the log has
/// grown by more than `max_log_size` since the last rotation. Only moves
/// files; committed state is untouched.
///
/// A rotation keeps the entries no snapshot covers yet, so the fresh segment
/// is not empty. That retained size is the baseline the next check measures
/// growth from; it drops again when compaction shrinks the log.
pub struct LogRotator {
    node: Arc<RaftNode>,
    archive_dir: PathBuf,
    max_log_size: u64,
    baseline: Mutex<u64>,
    metrics: Arc<MetricsRegistry>,
}

impl LogRotator {
    pub fn new(
        node: Arc<RaftNode>,
        archive_dir: impl Into<PathBuf>,
        max_log_size: u64,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            node,
            archive_dir: archive_dir.into(),
            max_log_size,
            baseline: Mutex::new(0),
            metrics,
        }
    }

    /// Rotate if the log is over its size limit. Returns the archive
    /// directory when a rotation happened.
    pub fn check_and_rotate_logs(&self) -> Result<Option<PathBuf>> {
        let size = self
            .node
            .log_size()
            .map_err(|e| Error::LogRotation(format!("measuring log size: {}", e)))?;
        let mut baseline = self.baseline.lock();
        *baseline = (*baseline).min(size);
        if size - *baseline <= self.max_log_size {
            tracing::trace!(
                size = %format_bytes(size),
                retained = %format_bytes(*baseline),
                "Log below rotation threshold"
            );
            return Ok(None);
        }

        let archived = self
            .node
            .rotate_log(&self.archive_dir, timestamp_now_millis())
            .map_err(|e| Error::LogRotation(e.to_string()))?;

        if let Some(archive) = &archived {
            *baseline = self
                .node
                .log_size()
                .map_err(|e| Error::LogRotation(format!("measuring log size: {}", e)))?;
            self.metrics.log_rotations_total.inc();
            tracing::info!(
                size = %format_bytes(size),
                limit = %format_bytes(self.max_log_size),
                archive = %archive.display(),
                "Rotated raft log"
            );
        }
        Ok(archived)
    }

    pub fn periodic(self: &Arc<Self>, interval: Duration) -> PeriodicTask {
        let rotator = self.clone();
        PeriodicTask::new("log-rotation", interval, move || {
            let rotator = rotator.clone();
            async move {
                if let Err(e) = rotator.check_and_rotate_logs() {
                    tracing::error!(error = %e, "Log rotation check failed");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::RaftConfig;
    use crate::consensus::{Command, LocalTransport, LogStore};
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_rotation_archives_and_keeps_state() {
        let log_dir = tempdir().unwrap();
        let archive_dir = tempdir().unwrap();
        let transport = LocalTransport::new();
        let node = RaftNode::open(
            "n1",
            RaftConfig::default(),
            BTreeMap::from([("n1".to_string(), "mem://n1".to_string())]),
            transport.clone(),
            Arc::new(MetricsRegistry::new()),
            log_dir.path(),
            1 << 20,
        )
        .unwrap();
        transport.register(&node);
        while !node.is_leader() {
            tokio::time::sleep(Duration::from_millis(20)).await;
            node.tick().await;
        }
        for i in 0..5 {
            node.propose(Command::UnregisterSession {
                name: format!("s{}", i),
            })
            .await
            .unwrap();
        }

        let metrics = Arc::new(MetricsRegistry::new());
        let roomy = LogRotator::new(node.clone(), archive_dir.path(), 1 << 30, metrics.clone());
        assert!(roomy.check_and_rotate_logs().unwrap().is_none());

        let tight = LogRotator::new(node.clone(), archive_dir.path(), 1, metrics.clone());
        let archive = tight.check_and_rotate_logs().unwrap().unwrap();
        assert!(archive
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap()
            .starts_with("logs_"));
        assert!(!LogStore::list_segments(&archive).unwrap().is_empty());
        assert_eq!(metrics.log_rotations_total.get(), 1);

        // committed state is unchanged and the fresh segment still replays
        assert_eq!(node.commit_index(), 6);
        let (_, recovered) = LogStore::open(log_dir.path(), 1 << 20).unwrap();
        assert_eq!(recovered.len(), 6);
    }

    #[tokio::test]
    async fn test_rotation_waits_for_new_growth() {
        let log_dir = tempdir().unwrap();
        let archive_dir = tempdir().unwrap();
        let transport = LocalTransport::new();
        let node = RaftNode::open(
            "n1",
            RaftConfig::default(),
            BTreeMap::from([("n1".to_string(), "mem://n1".to_string())]),
            transport.clone(),
            Arc::new(MetricsRegistry::new()),
            log_dir.path(),
            1 << 20,
        )
        .unwrap();
        transport.register(&node);
        while !node.is_leader() {
            tokio::time::sleep(Duration::from_millis(20)).await;
            node.tick().await;
        }
        for i in 0..5 {
            node.propose(Command::UnregisterSession {
                name: format!("s{}", i),
            })
            .await
            .unwrap();
        }

        let metrics = Arc::new(MetricsRegistry::new());
        let rotator = LogRotator::new(node.clone(), archive_dir.path(), 64, metrics.clone());
        assert!(rotator.check_and_rotate_logs().unwrap().is_some());
        let retained = node.log_size().unwrap();
        assert!(retained > 64);

        // the retained tail alone never triggers another rotation
        for _ in 0..3 {
            assert!(rotator.check_and_rotate_logs().unwrap().is_none());
        }
        assert_eq!(metrics.log_rotations_total.get(), 1);
        assert_eq!(std::fs::read_dir(archive_dir.path()).unwrap().count(), 1);

        for i in 0..5 {
            node.propose(Command::UnregisterSession {
                name: format!("t{}", i),
            })
            .await
            .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
        assert!(rotator.check_and_rotate_logs().unwrap().is_some());
        assert_eq!(metrics.log_rotations_total.get(), 2);
    }

    #[test]
    fn test_in_memory_node_never_rotates() {
        let node = RaftNode::new(
            "n1",
            RaftConfig::default(),
            BTreeMap::new(),
            LocalTransport::new(),
            Arc::new(MetricsRegistry::new()),
        );
        let rotator = LogRotator::new(node, "/nonexistent", 0, Arc::new(MetricsRegistry::new()));
        assert!(rotator.check_and_rotate_logs().unwrap().is_none());
    }
}
