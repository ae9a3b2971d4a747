//! Session coordinator integration: restart hydration, failure detection, node wiring

use chrono::Utc;
use minifleet::common::{Config, DeploymentMode, MetricsRegistry, RaftConfig, SessionConfig};
use minifleet::consensus::{LocalTransport, RaftNode};
use minifleet::coordinator::server::Deployment;
use minifleet::coordinator::{
    InMemoryTaskRepository, Node, Repositories, Session, SessionCoordinator, SessionStatus,
    WorkCoordinator,
};
use minifleet::Error;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

async fn single_leader() -> Arc<RaftNode> {
    let transport = LocalTransport::new();
    let node = RaftNode::new(
        "n1",
        RaftConfig::default(),
        BTreeMap::from([("n1".to_string(), "local://n1".to_string())]),
        transport.clone(),
        Arc::new(MetricsRegistry::new()),
    );
    transport.register(&node);
    while !node.is_leader() {
        node.tick().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    node
}

fn coordinator_with(
    node: Arc<RaftNode>,
    repos: Repositories,
    config: SessionConfig,
) -> Arc<SessionCoordinator> {
    Arc::new(SessionCoordinator::new(
        node,
        repos,
        config,
        Arc::new(MetricsRegistry::new()),
    ))
}

fn coordinator(node: Arc<RaftNode>, repos: Repositories) -> Arc<SessionCoordinator> {
    coordinator_with(node, repos, SessionConfig::default())
}

#[tokio::test]
async fn load_sessions_reproduces_active_set() {
    let node = single_leader().await;
    let repos = Repositories::in_memory();

    let before = {
        let sc = coordinator(node.clone(), repos.clone());
        for name in ["alpha", "beta", "gamma"] {
            sc.register_session(Session::new(name, "pro", "claude"))
                .await
                .unwrap();
        }
        sc.begin_task("beta", None).await.unwrap();
        sc.active_session_names()
    };

    let restarted = coordinator(node, repos);
    assert_eq!(restarted.load_sessions().await.unwrap(), 3);
    assert_eq!(restarted.active_session_names(), before);

    // the repository is the source of truth for counters
    let beta = restarted.get_session("beta").unwrap();
    assert_eq!(beta.current_task_count, 1);
    assert_eq!(beta.status, SessionStatus::Busy);
    // stats cache starts over
    assert_eq!(restarted.session_stats("beta").unwrap().tasks_completed, 0);
}

#[tokio::test]
async fn failed_session_is_not_reloaded() {
    let node = single_leader().await;
    let tasks = Arc::new(InMemoryTaskRepository::new());
    let repos = Repositories {
        tasks: tasks.clone(),
        ..Repositories::in_memory()
    };
    let short_lease = SessionConfig {
        lease_timeout_ms: 200,
        ..Default::default()
    };
    let sc = coordinator_with(node.clone(), repos.clone(), short_lease);
    let stale = sc
        .register_session(Session::new("stale", "pro", "claude"))
        .await
        .unwrap();
    sc.register_session(Session::new("fresh", "pro", "claude"))
        .await
        .unwrap();
    tasks.assign("task-1", stale.id);

    // only "fresh" keeps heartbeating past the lease
    tokio::time::sleep(Duration::from_millis(300)).await;
    sc.record_heartbeat("fresh").await.unwrap();
    let report = sc.perform_health_check(Utc::now()).await;
    assert_eq!(report.failed, vec!["stale"]);
    assert_eq!(tasks.pending(), vec!["task-1"]);
    assert!(matches!(
        sc.get_available_session(None).await,
        Ok(session) if session.session_name == "fresh"
    ));

    let restarted = coordinator(node, repos);
    assert_eq!(restarted.load_sessions().await.unwrap(), 1);
    assert_eq!(restarted.active_session_names(), vec!["fresh"]);
    assert_eq!(restarted.failed_sessions()[0].0, "stale");
}

#[tokio::test]
async fn session_pool_node_end_to_end() {
    let dir = TempDir::new().unwrap();
    let config = Config {
        node_id: "pool".into(),
        mode: DeploymentMode::SessionPool,
        data_dir: dir.path().to_path_buf(),
        ..Default::default()
    };
    let node = Node::start(config, 3, CancellationToken::new())
        .await
        .unwrap();
    let leader = node.wait_for_leader(Duration::from_secs(5)).await.unwrap();

    // registration has to work while a sibling replica leads
    if leader == "pool" {
        node.local()
            .transfer_leadership(Some("pool-r2"))
            .await
            .unwrap();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !matches!(node.group().leader(), Ok(l) if l.id() != "pool") {
            assert!(tokio::time::Instant::now() < deadline, "transfer did not finish");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
    assert!(!node.local().is_leader());

    let Deployment::SessionPool(sessions) = node.deployment().clone() else {
        panic!("expected session pool");
    };
    sessions
        .register_session(Session::new("s1", "pro", "claude"))
        .await
        .unwrap();
    // every replica converges on the registration
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !node
        .replicas()
        .iter()
        .all(|r| r.registered_sessions().contains_key("s1"))
    {
        assert!(tokio::time::Instant::now() < deadline, "replicas did not converge");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let coordinator = node.coordinator();
    assert_eq!(coordinator.select_worker(None).await.unwrap(), "s1");
    coordinator.heartbeat("s1").await.unwrap();
    assert!(matches!(
        coordinator.heartbeat("nobody").await,
        Err(Error::SessionNotFound(_))
    ));
    coordinator.sweep(Utc::now()).await;
    assert_eq!(coordinator.stats()["total_sessions"], 1);

    // membership changes route to the same leader
    node.membership().add_peer("pool-r9", "local://pool-r9").await.unwrap();
    assert!(node.group().leader().unwrap().is_member("pool-r9"));
    node.membership().remove_peer("pool-r9").await.unwrap();

    node.shutdown().await.unwrap();
}
