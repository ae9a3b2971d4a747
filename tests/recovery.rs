//! Recovery tests: snapshot, restart, restore, rotation and corruption

use minifleet::common::{MetricsRegistry, RaftConfig};
use minifleet::consensus::{Command, LocalTransport, RaftNode, SessionRegistration};
use minifleet::ops::{verify_snapshot_integrity, LogRotator, SnapshotManager};
use minifleet::Error;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const HOUR: Duration = Duration::from_secs(3600);

fn open(log_dir: &Path) -> Arc<RaftNode> {
    let transport = LocalTransport::new();
    let node = RaftNode::open(
        "n1",
        RaftConfig::default(),
        BTreeMap::from([("n1".to_string(), "local://n1".to_string())]),
        transport.clone(),
        Arc::new(MetricsRegistry::new()),
        log_dir,
        1 << 20,
    )
    .unwrap();
    transport.register(&node);
    node
}

async fn elect(node: &Arc<RaftNode>) {
    while !node.is_leader() {
        node.tick().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn register(node: &RaftNode, name: &str) -> u64 {
    node.propose(Command::RegisterSession(SessionRegistration {
        node_id: node.id().to_string(),
        session_name: name.to_string(),
        tier: "pro".to_string(),
        provider: "claude".to_string(),
        max_concurrent_tasks: 5,
    }))
    .await
    .unwrap()
}

#[tokio::test]
async fn snapshot_survives_restart() {
    let dir = TempDir::new().unwrap();
    let log_dir = dir.path().join("raft-log");
    let snap_dir = dir.path().join("snapshots");

    let taken = {
        let node = open(&log_dir);
        elect(&node).await;
        for name in ["s0", "s1", "s2"] {
            register(&node, name).await;
        }
        let manager =
            SnapshotManager::new(node.clone(), &snap_dir, HOUR, Arc::new(MetricsRegistry::new()))
                .unwrap();
        let info = manager.take_snapshot_forced().unwrap();
        assert_eq!(info.index, node.last_applied());
        assert!(info.filename.starts_with(&format!("{}_", info.index)));
        assert_eq!(node.snapshot_index(), info.index);

        assert!(matches!(
            manager.take_snapshot(),
            Err(Error::AlreadyRecent { .. })
        ));

        // written after the snapshot, only in the log
        register(&node, "s3").await;
        info
    };

    let node = open(&log_dir);
    assert_eq!(node.snapshot_index(), taken.index);
    assert!(node.registered_sessions().is_empty());

    let manager =
        SnapshotManager::new(node.clone(), &snap_dir, HOUR, Arc::new(MetricsRegistry::new()))
            .unwrap();
    let restored = manager.restore_latest().unwrap().unwrap();
    assert_eq!(restored.filename, taken.filename);
    let sessions = node.registered_sessions();
    assert_eq!(
        sessions.keys().cloned().collect::<Vec<_>>(),
        vec!["s0", "s1", "s2"]
    );

    // restoring again changes nothing
    assert!(!manager.restore_from_snapshot(&taken.filename).unwrap());
    assert_eq!(node.registered_sessions(), sessions);

    // the post-snapshot entry comes back once the log commits again
    elect(&node).await;
    assert!(node.registered_sessions().contains_key("s3"));

    // a recent snapshot on disk counts towards the interval
    assert!(matches!(
        manager.take_snapshot(),
        Err(Error::AlreadyRecent { .. })
    ));
}

#[tokio::test]
async fn corrupt_snapshot_is_reported_by_name() {
    let dir = TempDir::new().unwrap();
    let node = open(&dir.path().join("raft-log"));
    elect(&node).await;
    register(&node, "s0").await;

    let manager = SnapshotManager::new(
        node.clone(),
        dir.path().join("snapshots"),
        HOUR,
        Arc::new(MetricsRegistry::new()),
    )
    .unwrap();
    let info = manager.take_snapshot_forced().unwrap();
    assert_eq!(verify_snapshot_integrity(manager.dir()).unwrap(), 1);

    // truncate inside the header
    let path = manager.dir().join(&info.filename);
    let bytes = std::fs::read(&path).unwrap();
    std::fs::write(&path, &bytes[..20]).unwrap();

    match verify_snapshot_integrity(manager.dir()) {
        Err(Error::CorruptSnapshot { filename }) => assert_eq!(filename, info.filename),
        other => panic!("expected CorruptSnapshot, got {:?}", other),
    }
    assert!(matches!(
        manager.restore_from_snapshot(&info.filename),
        Err(Error::CorruptSnapshot { .. })
    ));
    assert!(matches!(
        manager.restore_from_snapshot("missing.snap"),
        Err(Error::SnapshotNotFound(_))
    ));
}

#[tokio::test]
async fn oversized_log_is_archived() {
    let dir = TempDir::new().unwrap();
    let node = open(&dir.path().join("raft-log"));
    elect(&node).await;
    for n in 0..20 {
        register(&node, &format!("session-{}", n)).await;
    }
    let committed = node.commit_index();

    let archive_root = dir.path().join("archive");
    let metrics = Arc::new(MetricsRegistry::new());
    let roomy = LogRotator::new(node.clone(), &archive_root, 1 << 30, metrics.clone());
    assert!(roomy.check_and_rotate_logs().unwrap().is_none());

    let tight = LogRotator::new(node.clone(), &archive_root, 64, metrics.clone());
    let archive = tight.check_and_rotate_logs().unwrap().unwrap();
    assert!(archive
        .file_name()
        .unwrap()
        .to_string_lossy()
        .starts_with("logs_"));
    assert!(std::fs::read_dir(&archive).unwrap().count() >= 1);
    assert_eq!(metrics.log_rotations_total.get(), 1);

    // storage hygiene only: consensus state is untouched
    assert_eq!(node.commit_index(), committed);
    assert_eq!(node.registered_sessions().len(), 20);
    register(&node, "after-rotation").await;
}
