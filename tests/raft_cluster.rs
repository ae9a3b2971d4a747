//! Raft integration test: election, replication, partition, leadership transfer

use minifleet::common::{MetricsRegistry, RaftConfig, Scheduler};
use minifleet::consensus::{LocalTransport, Membership, RaftNode};
use minifleet::Error;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

struct Cluster {
    transport: Arc<LocalTransport>,
    nodes: Vec<Arc<RaftNode>>,
    scheduler: Scheduler,
}

impl Cluster {
    fn start(ids: &[&str]) -> Self {
        let config = RaftConfig {
            proposal_timeout_ms: 500,
            ..Default::default()
        };
        let transport = LocalTransport::new();
        let members: BTreeMap<String, String> = ids
            .iter()
            .map(|id| (id.to_string(), format!("local://{}", id)))
            .collect();

        let mut scheduler = Scheduler::new();
        let nodes: Vec<Arc<RaftNode>> = ids
            .iter()
            .map(|id| {
                let node = RaftNode::new(
                    *id,
                    config.clone(),
                    members.clone(),
                    transport.clone(),
                    Arc::new(MetricsRegistry::new()),
                );
                transport.register(&node);
                scheduler.spawn(node.driver());
                node
            })
            .collect();

        Self {
            transport,
            nodes,
            scheduler,
        }
    }

    fn leaders(&self) -> Vec<Arc<RaftNode>> {
        self.nodes.iter().filter(|n| n.is_leader()).cloned().collect()
    }

    fn node(&self, id: &str) -> Arc<RaftNode> {
        self.nodes
            .iter()
            .find(|n| n.id() == id)
            .cloned()
            .expect("unknown node")
    }

    async fn wait_for_leader(&self) -> Arc<RaftNode> {
        assert!(
            wait_until(Duration::from_secs(5), || self.leaders().len() == 1).await,
            "no leader elected"
        );
        self.leaders().remove(0)
    }
}

async fn wait_until(timeout: Duration, cond: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

#[tokio::test]
async fn raft_election_and_replication() {
    let cluster = Cluster::start(&["n1", "n2", "n3"]);
    let leader = cluster.wait_for_leader().await;
    let term = leader.current_term();

    // every replica agrees on who leads
    assert!(
        wait_until(Duration::from_secs(2), || cluster
            .nodes
            .iter()
            .all(|n| n.leader_id().as_deref() == Some(leader.id())))
        .await
    );

    let membership = Membership::new(leader.clone());
    membership.add_peer("n4", "local://n4").await.unwrap();
    assert!(leader.is_member("n4"));

    // followers learn the change once the commit index reaches them
    assert!(
        wait_until(Duration::from_secs(2), || cluster
            .nodes
            .iter()
            .all(|n| n.is_member("n4")))
        .await
    );
    assert_eq!(leader.current_term(), term);
    assert_eq!(membership.cluster_state().peer_count, 3);

    membership.remove_peer("n4").await.unwrap();
    assert!(!leader.is_member("n4"));

    cluster.scheduler.shutdown().await;
}

#[tokio::test]
async fn add_peer_on_follower_is_rejected() {
    let cluster = Cluster::start(&["n1", "n2", "n3"]);
    let leader = cluster.wait_for_leader().await;
    let follower = cluster
        .nodes
        .iter()
        .find(|n| n.id() != leader.id())
        .cloned()
        .unwrap();
    assert!(
        wait_until(Duration::from_secs(2), || follower.leader_id().as_deref()
            == Some(leader.id()))
        .await
    );
    let before = follower.last_log_index();

    let membership = Membership::new(follower.clone());
    let err = membership.add_peer("n9", "local://n9").await.unwrap_err();
    match err {
        Error::NotLeader(hint) => assert_eq!(hint.as_deref(), Some(leader.id())),
        other => panic!("expected NotLeader, got {:?}", other),
    }
    assert_eq!(follower.last_log_index(), before);
    assert!(cluster.nodes.iter().all(|n| !n.is_member("n9")));

    cluster.scheduler.shutdown().await;
}

#[tokio::test]
async fn partitioned_leader_is_replaced() {
    let cluster = Cluster::start(&["n1", "n2", "n3"]);
    let old = cluster.wait_for_leader().await;
    let old_term = old.current_term();

    cluster.transport.isolate(old.id());

    // the majority side elects someone else in a later term
    assert!(
        wait_until(Duration::from_secs(5), || cluster
            .nodes
            .iter()
            .any(|n| n.id() != old.id() && n.is_leader()))
        .await
    );
    let new = cluster
        .leaders()
        .into_iter()
        .find(|n| n.id() != old.id())
        .unwrap();
    assert!(new.current_term() > old_term);

    // the isolated replica cannot commit anything
    let err = Membership::new(old.clone())
        .add_peer("n5", "local://n5")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ConsensusTimeout | Error::NotLeader(_)));

    cluster.transport.heal_all();
    assert!(
        wait_until(Duration::from_secs(5), || !old.is_leader()
            && old.leader_id().is_some()
            && cluster.leaders().len() == 1)
        .await
    );
    // the uncommitted entry never took effect anywhere
    assert!(
        wait_until(Duration::from_secs(2), || cluster
            .nodes
            .iter()
            .all(|n| !n.is_member("n5")))
        .await
    );

    cluster.scheduler.shutdown().await;
}

#[tokio::test]
async fn leadership_transfer_to_chosen_peer() {
    let cluster = Cluster::start(&["n1", "n2", "n3"]);
    let leader = cluster.wait_for_leader().await;
    let target_id = if leader.id() == "n2" { "n3" } else { "n2" };
    let target = cluster.node(target_id);

    assert!(leader.transfer_leadership(Some(target_id)).await.unwrap());
    assert!(!leader.is_leader());
    assert!(wait_until(Duration::from_secs(5), || target.is_leader()).await);

    // a follower cannot transfer
    assert!(!leader.transfer_leadership(None).await.unwrap());

    cluster.scheduler.shutdown().await;
}
