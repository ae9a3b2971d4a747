//! Replicated-log consensus: the Raft engine, its durable log and the
//! membership layer built on top of it.

pub mod fsm;
pub mod group;
pub mod log_store;
pub mod membership;
pub mod raft;
pub mod raft_node;
pub mod state;
pub mod transport;

pub use fsm::{ClusterEvent, ClusterFsm};
pub use group::ReplicaGroup;
pub use log_store::{HardState, LogStore};
pub use membership::{ClusterObserver, ClusterState, Membership, PeerInfo};
pub use raft::{Command, LogEntry, SessionRegistration};
pub use raft_node::RaftNode;
pub use state::{RaftRole, RaftState};
pub use transport::{LocalTransport, RaftTransport};
