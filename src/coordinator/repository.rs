//! Persistence collaborators used by the session coordinator.
//!
//! The coordinator only calls the narrow methods below; storage formats are
//! the implementor's business. In-memory implementations back tests and
//! single-process deployments.

use crate::common::HealthStatus;
use crate::coordinator::session::{Session, SessionStatus};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};
use uuid::Uuid;

#[async_trait]
pub trait SessionRepository: Send + Sync {
    /// Insert or replace the record for `session.session_name`
    async fn create(&self, session: &Session) -> Result<()>;

    async fn delete(&self, id: Uuid) -> Result<()>;

    async fn find_by_name(&self, name: &str) -> Result<Option<Session>>;

    async fn list(&self) -> Result<Vec<Session>>;

    async fn record_heartbeat(&self, id: Uuid, at: DateTime<Utc>) -> Result<()>;

    async fn update_status(&self, id: Uuid, status: SessionStatus) -> Result<()>;

    async fn update_health_status(&self, id: Uuid, health: HealthStatus) -> Result<()>;

    async fn update_task_count(&self, id: Uuid, count: u32) -> Result<()>;
}

#[async_trait]
pub trait DistributedTaskRepository: Send + Sync {
    /// Release every task owned by a failed session back to the pending
    /// pool. Returns how many tasks were released.
    async fn reassign_failed_session_tasks(&self, session_id: Uuid) -> Result<usize>;
}

#[async_trait]
pub trait SessionAffinityRepository: Send + Sync {
    /// Best match for `affinity_key` among `candidates` (session names)
    async fn best_session_for(
        &self,
        affinity_key: &str,
        candidates: &[String],
    ) -> Result<Option<String>>;

    async fn record_affinity(&self, affinity_key: &str, session_name: &str) -> Result<()>;
}

#[async_trait]
pub trait DistributedLockRepository: Send + Sync {
    /// Take `key` for `holder` unless someone else holds an unexpired lease
    async fn try_acquire(&self, key: &str, holder: &str, ttl: Duration) -> Result<bool>;

    async fn release(&self, key: &str, holder: &str) -> Result<()>;
}

// === In-memory implementations ===

#[derive(Default)]
pub struct InMemorySessionRepository {
    sessions: Mutex<BTreeMap<String, Session>>,
}

impl InMemorySessionRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<Session> {
        self.sessions.lock().get(name).cloned()
    }

    fn update(&self, id: Uuid, f: impl FnOnce(&mut Session)) -> Result<()> {
        let mut sessions = self.sessions.lock();
        let session = sessions
            .values_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| Error::Repository(format!("no session with id {}", id)))?;
        f(session);
        session.updated_at = Utc::now();
        Ok(())
    }
}

#[async_trait]
impl SessionRepository for InMemorySessionRepository {
    async fn create(&self, session: &Session) -> Result<()> {
        self.sessions
            .lock()
            .insert(session.session_name.clone(), session.clone());
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<()> {
        self.sessions.lock().retain(|_, s| s.id != id);
        Ok(())
    }

    async fn find_by_name(&self, name: &str) -> Result<Option<Session>> {
        Ok(self.get(name))
    }

    async fn list(&self) -> Result<Vec<Session>> {
        Ok(self.sessions.lock().values().cloned().collect())
    }

    async fn record_heartbeat(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        self.update(id, |s| {
            s.last_heartbeat = at;
            s.status = SessionStatus::Idle;
        })
    }

    async fn update_status(&self, id: Uuid, status: SessionStatus) -> Result<()> {
        self.update(id, |s| s.status = status)
    }

    async fn update_health_status(&self, id: Uuid, health: HealthStatus) -> Result<()> {
        self.update(id, |s| s.health = health)
    }

    async fn update_task_count(&self, id: Uuid, count: u32) -> Result<()> {
        self.update(id, |s| s.current_task_count = count)
    }
}

/// Task ownership table: task id -> owning session (`None` = pending)
#[derive(Default)]
pub struct InMemoryTaskRepository {
    tasks: Mutex<HashMap<String, Option<Uuid>>>,
}

impl InMemoryTaskRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn assign(&self, task_id: &str, session_id: Uuid) {
        self.tasks
            .lock()
            .insert(task_id.to_string(), Some(session_id));
    }

    pub fn owner(&self, task_id: &str) -> Option<Uuid> {
        self.tasks.lock().get(task_id).copied().flatten()
    }

    pub fn pending(&self) -> Vec<String> {
        let mut pending: Vec<String> = self
            .tasks
            .lock()
            .iter()
            .filter(|(_, owner)| owner.is_none())
            .map(|(id, _)| id.clone())
            .collect();
        pending.sort();
        pending
    }
}

#[async_trait]
impl DistributedTaskRepository for InMemoryTaskRepository {
    async fn reassign_failed_session_tasks(&self, session_id: Uuid) -> Result<usize> {
        let mut released = 0;
        for owner in self.tasks.lock().values_mut() {
            if *owner == Some(session_id) {
                *owner = None;
                released += 1;
            }
        }
        Ok(released)
    }
}

/// Counts how often each session served an affinity key; the most
/// frequent candidate wins.
#[derive(Default)]
pub struct InMemoryAffinityRepository {
    hits: Mutex<HashMap<String, HashMap<String, u64>>>,
}

impl InMemoryAffinityRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionAffinityRepository for InMemoryAffinityRepository {
    async fn best_session_for(
        &self,
        affinity_key: &str,
        candidates: &[String],
    ) -> Result<Option<String>> {
        let hits = self.hits.lock();
        let Some(scores) = hits.get(affinity_key) else {
            return Ok(None);
        };
        let mut best: Option<(&String, u64)> = None;
        for name in candidates {
            if let Some(&score) = scores.get(name) {
                if best.map(|(_, s)| score > s).unwrap_or(true) {
                    best = Some((name, score));
                }
            }
        }
        Ok(best.map(|(name, _)| name.clone()))
    }

    async fn record_affinity(&self, affinity_key: &str, session_name: &str) -> Result<()> {
        *self
            .hits
            .lock()
            .entry(affinity_key.to_string())
            .or_default()
            .entry(session_name.to_string())
            .or_insert(0) += 1;
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryLockRepository {
    locks: Mutex<HashMap<String, (String, Instant)>>,
}

impl InMemoryLockRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn holder(&self, key: &str) -> Option<String> {
        self.locks
            .lock()
            .get(key)
            .filter(|(_, expires)| *expires > Instant::now())
            .map(|(holder, _)| holder.clone())
    }
}

#[async_trait]
impl DistributedLockRepository for InMemoryLockRepository {
    async fn try_acquire(&self, key: &str, holder: &str, ttl: Duration) -> Result<bool> {
        let mut locks = self.locks.lock();
        let now = Instant::now();
        if let Some((current, expires)) = locks.get(key) {
            if current != holder && *expires > now {
                return Ok(false);
            }
        }
        locks.insert(key.to_string(), (holder.to_string(), now + ttl));
        Ok(true)
    }

    async fn release(&self, key: &str, holder: &str) -> Result<()> {
        let mut locks = self.locks.lock();
        if locks.get(key).map(|(h, _)| h == holder).unwrap_or(false) {
            locks.remove(key);
        }
        Ok(())
    }
}
