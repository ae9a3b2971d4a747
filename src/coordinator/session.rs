//! Distributed session coordinator
//!
//! Long-lived execution sessions register through the replicated log so
//! every replica agrees on session membership. Liveness is a lease: a
//! session that stops heartbeating is first marked degraded, then declared
//! failed and its tasks handed back for reassignment.
//!
//! The per-session stats map is a local cache only. It is rebuilt from the
//! session repository on restart and may be lost at any time.
//!
//! No lock on the session table is held across an `.await`; repository and
//! consensus calls happen between short critical sections.

use crate::common::health::{classify_lease, since, LeaseState};
use crate::common::scheduler::PeriodicTask;
use crate::common::{DeploymentMode, HealthStatus, MetricsRegistry, SessionConfig};
use crate::consensus::{Command, ReplicaGroup, SessionRegistration};
use crate::coordinator::repository::{
    DistributedLockRepository, DistributedTaskRepository, InMemoryAffinityRepository,
    InMemoryLockRepository, InMemorySessionRepository, InMemoryTaskRepository,
    SessionAffinityRepository, SessionRepository,
};
use crate::coordinator::WorkCoordinator;
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    #[default]
    Idle,
    Busy,
    Failed,
    Offline,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub session_name: String,
    pub tier: String,
    pub provider: String,
    /// Replica that accepted the registration
    pub node_id: String,
    pub status: SessionStatus,
    pub health: HealthStatus,
    pub max_concurrent_tasks: u32,
    pub current_task_count: u32,
    pub consecutive_failures: u32,
    pub last_heartbeat: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    /// Unregistered session; identity, health and capacity defaults are
    /// filled in by [`SessionCoordinator::register_session`].
    pub fn new(
        session_name: impl Into<String>,
        tier: impl Into<String>,
        provider: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::nil(),
            session_name: session_name.into(),
            tier: tier.into(),
            provider: provider.into(),
            node_id: String::new(),
            status: SessionStatus::Idle,
            health: HealthStatus::Unknown,
            max_concurrent_tasks: 0,
            current_task_count: 0,
            consecutive_failures: 0,
            last_heartbeat: now,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_max_concurrent_tasks(mut self, max: u32) -> Self {
        self.max_concurrent_tasks = max;
        self
    }

    pub fn is_active(&self) -> bool {
        matches!(self.status, SessionStatus::Idle | SessionStatus::Busy)
    }

    pub fn is_healthy(&self) -> bool {
        self.health.is_healthy()
    }

    pub fn has_capacity(&self) -> bool {
        self.current_task_count < self.max_concurrent_tasks
    }
}

/// Local performance cache for one session
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionStats {
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub average_task_ms: f64,
    pub consecutive_errors: u32,
}

impl SessionStats {
    fn new(registered_at: DateTime<Utc>, last_heartbeat: DateTime<Utc>) -> Self {
        Self {
            registered_at,
            last_heartbeat,
            tasks_completed: 0,
            tasks_failed: 0,
            average_task_ms: 0.0,
            consecutive_errors: 0,
        }
    }

    fn record_task(&mut self, succeeded: bool, elapsed: Duration) {
        if succeeded {
            self.tasks_completed += 1;
            self.consecutive_errors = 0;
        } else {
            self.tasks_failed += 1;
            self.consecutive_errors += 1;
        }
        let n = (self.tasks_completed + self.tasks_failed) as f64;
        let ms = elapsed.as_secs_f64() * 1000.0;
        self.average_task_ms += (ms - self.average_task_ms) / n;
    }
}

/// Counts over the active sessions
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionStatusSummary {
    pub total_sessions: usize,
    pub healthy_sessions: usize,
    pub idle_sessions: usize,
    pub busy_sessions: usize,
    pub timestamp: DateTime<Utc>,
}

/// Outcome of one failure-detection pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub failed: Vec<String>,
    pub degraded: Vec<String>,
    pub reassigned_tasks: usize,
}

/// Persistence collaborators
#[derive(Clone)]
pub struct Repositories {
    pub sessions: Arc<dyn SessionRepository>,
    pub tasks: Arc<dyn DistributedTaskRepository>,
    pub affinity: Arc<dyn SessionAffinityRepository>,
    pub locks: Arc<dyn DistributedLockRepository>,
}

impl Repositories {
    pub fn in_memory() -> Self {
        Self {
            sessions: Arc::new(InMemorySessionRepository::new()),
            tasks: Arc::new(InMemoryTaskRepository::new()),
            affinity: Arc::new(InMemoryAffinityRepository::new()),
            locks: Arc::new(InMemoryLockRepository::new()),
        }
    }
}

#[derive(Default)]
struct SessionTable {
    active: BTreeMap<String, Session>,
    stats: HashMap<String, SessionStats>,
    failed: HashMap<String, DateTime<Utc>>,
}

pub struct SessionCoordinator {
    group: ReplicaGroup,
    repos: Repositories,
    config: SessionConfig,
    table: RwLock<SessionTable>,
    metrics: Arc<MetricsRegistry>,
}

fn require(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::InvalidSession(format!("session {} is required", field)));
    }
    Ok(())
}

impl SessionCoordinator {
    pub fn new(
        group: impl Into<ReplicaGroup>,
        repos: Repositories,
        config: SessionConfig,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            group: group.into(),
            repos,
            config,
            table: RwLock::new(SessionTable::default()),
            metrics,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    fn update_gauge(&self, table: &SessionTable) {
        self.metrics.active_sessions.set(table.active.len() as u64);
    }

    /// Validate, persist and replicate a new session, then track it locally.
    /// If the registration does not commit, the persisted record is put back
    /// the way it was.
    pub async fn register_session(&self, mut session: Session) -> Result<Session> {
        require("name", &session.session_name)?;
        require("tier", &session.tier)?;
        require("provider", &session.provider)?;

        if session.id.is_nil() {
            session.id = Uuid::new_v4();
        }
        if session.max_concurrent_tasks == 0 {
            session.max_concurrent_tasks = self.config.max_concurrent_tasks;
        }
        // a registration always starts a clean lease
        let now = Utc::now();
        session.status = SessionStatus::Idle;
        session.health = HealthStatus::Healthy;
        session.current_task_count = 0;
        session.consecutive_failures = 0;
        session.node_id = self.group.local().id().to_string();
        session.last_heartbeat = now;
        session.created_at = now;
        session.updated_at = now;

        let previous = self
            .repos
            .sessions
            .find_by_name(&session.session_name)
            .await?;
        self.repos.sessions.create(&session).await?;

        let command = Command::RegisterSession(SessionRegistration {
            node_id: session.node_id.clone(),
            session_name: session.session_name.clone(),
            tier: session.tier.clone(),
            provider: session.provider.clone(),
            max_concurrent_tasks: session.max_concurrent_tasks,
        });
        if let Err(e) = self.group.propose(command).await {
            let rollback = match &previous {
                Some(prior) => self.repos.sessions.create(prior).await,
                None => self.repos.sessions.delete(session.id).await,
            };
            if let Err(rollback) = rollback {
                tracing::error!(session = %session.session_name, error = %rollback, "Failed to roll back session record");
            }
            if !e.is_rejection() {
                tracing::warn!(session = %session.session_name, error = %e, "Session registration not committed");
            }
            return Err(e);
        }

        {
            let mut table = self.table.write();
            let name = session.session_name.clone();
            table.active.insert(name.clone(), session.clone());
            table.stats.insert(name.clone(), SessionStats::new(now, now));
            table.failed.remove(&name);
            self.update_gauge(&table);
        }
        self.metrics.sessions_registered_total.inc();
        tracing::info!(
            session = %session.session_name,
            tier = %session.tier,
            provider = %session.provider,
            max_tasks = session.max_concurrent_tasks,
            "Session registered"
        );
        Ok(session)
    }

    pub async fn unregister_session(&self, name: &str) -> Result<Session> {
        let session = self
            .table
            .read()
            .active
            .get(name)
            .cloned()
            .ok_or_else(|| Error::SessionNotFound(name.to_string()))?;

        self.repos.sessions.delete(session.id).await?;

        if let Ok(leader) = self.group.leader() {
            let command = Command::UnregisterSession {
                name: name.to_string(),
            };
            if let Err(e) = leader.propose(command).await {
                tracing::warn!(session = %name, error = %e, "Session unregistration not committed");
            }
        }

        let mut table = self.table.write();
        table.active.remove(name);
        table.stats.remove(name);
        table.failed.remove(name);
        self.update_gauge(&table);
        tracing::info!(session = %name, "Session unregistered");
        Ok(session)
    }

    /// Refresh the lease. Resets status to idle and clears accumulated
    /// failures, restoring health to healthy.
    pub async fn record_heartbeat(&self, name: &str) -> Result<()> {
        let (id, had_failures) = {
            let table = self.table.read();
            let session = table
                .active
                .get(name)
                .ok_or_else(|| Error::SessionNotFound(name.to_string()))?;
            (
                session.id,
                session.consecutive_failures > 0 || !session.is_healthy(),
            )
        };

        let now = Utc::now();
        self.repos.sessions.record_heartbeat(id, now).await?;

        {
            let mut table = self.table.write();
            if let Some(session) = table.active.get_mut(name) {
                session.last_heartbeat = now;
                session.status = SessionStatus::Idle;
                session.updated_at = now;
                if had_failures {
                    session.health = HealthStatus::Healthy;
                    session.consecutive_failures = 0;
                }
            }
            if let Some(stats) = table.stats.get_mut(name) {
                stats.last_heartbeat = now;
                stats.consecutive_errors = 0;
            }
        }

        if had_failures {
            if let Err(e) = self
                .repos
                .sessions
                .update_health_status(id, HealthStatus::Healthy)
                .await
            {
                tracing::warn!(session = %name, error = %e, "Failed to persist recovered health");
            }
        }
        Ok(())
    }

    /// Best session for the next task. With an affinity hint the affinity
    /// repository picks among the candidates; otherwise (or when it has no
    /// opinion) the least busy session wins.
    pub async fn get_available_session(&self, affinity_hint: Option<&str>) -> Result<Session> {
        let candidates: Vec<Session> = self
            .table
            .read()
            .active
            .values()
            .filter(|s| s.is_active() && s.is_healthy() && s.has_capacity())
            .cloned()
            .collect();
        if candidates.is_empty() {
            return Err(Error::NoAvailableSessions);
        }

        if let Some(key) = affinity_hint {
            let names: Vec<String> = candidates.iter().map(|s| s.session_name.clone()).collect();
            match self.repos.affinity.best_session_for(key, &names).await {
                Ok(Some(name)) => {
                    if let Some(session) = candidates.iter().find(|s| s.session_name == name) {
                        return Ok(session.clone());
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(affinity = %key, error = %e, "Affinity lookup failed, using least loaded");
                }
            }
        }

        let mut best = &candidates[0];
        for session in &candidates[1..] {
            if session.current_task_count < best.current_task_count {
                best = session;
            }
        }
        Ok(best.clone())
    }

    /// Account a task started on `name`. Returns the session's task count.
    pub async fn begin_task(&self, name: &str, affinity_key: Option<&str>) -> Result<u32> {
        let (id, count, became_busy) = {
            let mut table = self.table.write();
            let session = table
                .active
                .get_mut(name)
                .ok_or_else(|| Error::SessionNotFound(name.to_string()))?;
            if !session.is_active() || !session.has_capacity() {
                return Err(Error::InvalidSession(format!(
                    "session {} cannot accept more tasks",
                    name
                )));
            }
            let became_busy = session.status != SessionStatus::Busy;
            session.current_task_count += 1;
            session.status = SessionStatus::Busy;
            session.updated_at = Utc::now();
            (session.id, session.current_task_count, became_busy)
        };

        self.persist_load(name, id, count, became_busy.then_some(SessionStatus::Busy))
            .await;
        if let Some(key) = affinity_key {
            if let Err(e) = self.repos.affinity.record_affinity(key, name).await {
                tracing::warn!(session = %name, affinity = %key, error = %e, "Failed to record affinity");
            }
        }
        Ok(count)
    }

    /// Account a finished task. Reaching the configured number of consecutive
    /// failures marks the session degraded.
    pub async fn finish_task(&self, name: &str, succeeded: bool, elapsed: Duration) -> Result<()> {
        let (id, count, became_idle, degraded) = {
            let mut guard = self.table.write();
            let SessionTable { active, stats, .. } = &mut *guard;
            let session = active
                .get_mut(name)
                .ok_or_else(|| Error::SessionNotFound(name.to_string()))?;

            session.current_task_count = session.current_task_count.saturating_sub(1);
            let became_idle =
                session.current_task_count == 0 && session.status == SessionStatus::Busy;
            if became_idle {
                session.status = SessionStatus::Idle;
            }
            if succeeded {
                session.consecutive_failures = 0;
            } else {
                session.consecutive_failures += 1;
            }
            stats
                .entry(name.to_string())
                .or_insert_with(|| SessionStats::new(session.created_at, session.last_heartbeat))
                .record_task(succeeded, elapsed);

            let degraded = !succeeded
                && session.consecutive_failures >= self.config.failure_threshold
                && session.health != HealthStatus::Degraded;
            if degraded {
                session.health = HealthStatus::Degraded;
            }
            session.updated_at = Utc::now();
            (session.id, session.current_task_count, became_idle, degraded)
        };

        self.persist_load(name, id, count, became_idle.then_some(SessionStatus::Idle))
            .await;
        if degraded {
            tracing::warn!(
                session = %name,
                threshold = self.config.failure_threshold,
                "Session degraded after consecutive task failures"
            );
            if let Err(e) = self
                .repos
                .sessions
                .update_health_status(id, HealthStatus::Degraded)
                .await
            {
                tracing::warn!(session = %name, error = %e, "Failed to persist degraded health");
            }
        }
        Ok(())
    }

    /// Write the task count, and the status when it flipped
    async fn persist_load(&self, name: &str, id: Uuid, count: u32, status: Option<SessionStatus>) {
        if let Err(e) = self.repos.sessions.update_task_count(id, count).await {
            tracing::warn!(session = %name, error = %e, "Failed to persist task count");
        }
        if let Some(status) = status {
            if let Err(e) = self.repos.sessions.update_status(id, status).await {
                tracing::warn!(session = %name, ?status, error = %e, "Failed to persist session status");
            }
        }
    }

    /// One failure-detection pass over the active sessions
    pub async fn perform_health_check(&self, now: DateTime<Utc>) -> SweepReport {
        let lease = self.config.lease_timeout();
        let checks: Vec<(String, Uuid, DateTime<Utc>, HealthStatus)> = self
            .table
            .read()
            .active
            .values()
            .map(|s| (s.session_name.clone(), s.id, s.last_heartbeat, s.health))
            .collect();

        let mut report = SweepReport::default();
        for (name, id, last_heartbeat, health) in checks {
            match classify_lease(since(last_heartbeat, now), lease) {
                LeaseState::Live => {}
                LeaseState::Expiring => {
                    if health == HealthStatus::Degraded {
                        continue;
                    }
                    if let Err(e) = self
                        .repos
                        .sessions
                        .update_health_status(id, HealthStatus::Degraded)
                        .await
                    {
                        tracing::warn!(session = %name, error = %e, "Failed to persist degraded health");
                    }
                    let mut table = self.table.write();
                    if let Some(session) = table.active.get_mut(&name) {
                        if session.last_heartbeat == last_heartbeat {
                            session.health = HealthStatus::Degraded;
                            tracing::warn!(session = %name, "Session lease expiring, marked degraded");
                            report.degraded.push(name);
                        }
                    }
                }
                LeaseState::Expired => {
                    if let Some(reassigned) =
                        self.handle_session_failure(&name, id, last_heartbeat, now).await
                    {
                        report.reassigned_tasks += reassigned;
                        report.failed.push(name);
                    }
                }
            }
        }
        report
    }

    /// Persist the failure and hand the session's tasks back. The distributed
    /// lock keeps a second replica from doing the same work concurrently.
    /// Returns the number of reassigned tasks, or `None` if a heartbeat
    /// arrived in the meantime and the session stays.
    async fn handle_session_failure(
        &self,
        name: &str,
        id: Uuid,
        observed_heartbeat: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Option<usize> {
        let lock_key = format!("session-failure/{}", name);
        let holder = self.group.local().id().to_string();
        let acquired = match self
            .repos
            .locks
            .try_acquire(&lock_key, &holder, self.config.lease_timeout())
            .await
        {
            Ok(acquired) => acquired,
            Err(e) => {
                tracing::warn!(session = %name, error = %e, "Failure lock unavailable");
                false
            }
        };

        let still_expired = self
            .table
            .read()
            .active
            .get(name)
            .map(|s| s.last_heartbeat == observed_heartbeat)
            .unwrap_or(false);
        if !still_expired {
            if acquired {
                self.release_failure_lock(&lock_key, &holder).await;
            }
            return None;
        }

        let mut reassigned = 0;
        if acquired {
            if let Err(e) = self
                .repos
                .sessions
                .update_status(id, SessionStatus::Failed)
                .await
            {
                tracing::error!(session = %name, error = %e, "Failed to persist session failure");
            }
            match self.repos.tasks.reassign_failed_session_tasks(id).await {
                Ok(n) => {
                    reassigned = n;
                    self.metrics.tasks_reassigned_total.add(n as u64);
                }
                Err(e) => {
                    tracing::error!(session = %name, error = %e, "Failed to reassign tasks of failed session");
                }
            }
            self.release_failure_lock(&lock_key, &holder).await;
        } else {
            tracing::debug!(session = %name, "Failure already being handled elsewhere");
        }

        let mut table = self.table.write();
        let unchanged = table
            .active
            .get(name)
            .map(|s| s.last_heartbeat == observed_heartbeat)
            .unwrap_or(false);
        if !unchanged {
            return None;
        }
        table.active.remove(name);
        table.failed.insert(name.to_string(), now);
        self.update_gauge(&table);
        drop(table);

        self.metrics.sessions_failed_total.inc();
        tracing::warn!(session = %name, reassigned, "Session lease expired, declared failed");
        Some(reassigned)
    }

    async fn release_failure_lock(&self, key: &str, holder: &str) {
        if let Err(e) = self.repos.locks.release(key, holder).await {
            tracing::warn!(lock = %key, error = %e, "Failed to release failure lock");
        }
    }

    /// Rebuild the active set and stats cache from the session repository
    pub async fn load_sessions(&self) -> Result<usize> {
        let sessions = self.repos.sessions.list().await?;

        let mut table = self.table.write();
        let mut loaded = 0;
        for session in sessions {
            let name = session.session_name.clone();
            if session.is_active() {
                table.stats.insert(
                    name.clone(),
                    SessionStats::new(session.created_at, session.last_heartbeat),
                );
                table.active.insert(name, session);
                loaded += 1;
            } else if session.status == SessionStatus::Failed {
                table.failed.insert(name, session.updated_at);
            }
        }
        self.update_gauge(&table);
        tracing::info!(loaded, "Loaded sessions from repository");
        Ok(loaded)
    }

    pub fn get_session(&self, name: &str) -> Option<Session> {
        self.table.read().active.get(name).cloned()
    }

    pub fn healthy_sessions(&self) -> Vec<Session> {
        self.table
            .read()
            .active
            .values()
            .filter(|s| s.is_active() && s.is_healthy())
            .cloned()
            .collect()
    }

    pub fn active_session_count(&self) -> usize {
        self.table.read().active.len()
    }

    /// Names of the active sessions, sorted
    pub fn active_session_names(&self) -> Vec<String> {
        self.table.read().active.keys().cloned().collect()
    }

    pub fn session_status(&self) -> SessionStatusSummary {
        let table = self.table.read();
        let mut summary = SessionStatusSummary {
            total_sessions: table.active.len(),
            healthy_sessions: 0,
            idle_sessions: 0,
            busy_sessions: 0,
            timestamp: Utc::now(),
        };
        for session in table.active.values() {
            if session.is_healthy() {
                summary.healthy_sessions += 1;
            }
            match session.status {
                SessionStatus::Idle => summary.idle_sessions += 1,
                SessionStatus::Busy => summary.busy_sessions += 1,
                _ => {}
            }
        }
        summary
    }

    pub fn session_stats(&self, name: &str) -> Option<SessionStats> {
        self.table.read().stats.get(name).cloned()
    }

    pub fn all_session_stats(&self) -> HashMap<String, SessionStats> {
        self.table.read().stats.clone()
    }

    /// Sessions declared failed and when
    pub fn failed_sessions(&self) -> Vec<(String, DateTime<Utc>)> {
        let mut failed: Vec<_> = self
            .table
            .read()
            .failed
            .iter()
            .map(|(name, at)| (name.clone(), *at))
            .collect();
        failed.sort();
        failed
    }

    /// Background lease checker on the configured heartbeat interval
    pub fn failure_detector(self: &Arc<Self>) -> PeriodicTask {
        let coordinator = self.clone();
        PeriodicTask::new(
            "session-failure-detector",
            self.config.heartbeat_interval(),
            move || {
                let coordinator = coordinator.clone();
                async move {
                    let report = coordinator.perform_health_check(Utc::now()).await;
                    if !report.failed.is_empty() || !report.degraded.is_empty() {
                        tracing::debug!(?report, "Session health check");
                    }
                }
            },
        )
    }
}

#[async_trait]
impl WorkCoordinator for SessionCoordinator {
    fn mode(&self) -> DeploymentMode {
        DeploymentMode::SessionPool
    }

    async fn heartbeat(&self, id: &str) -> Result<()> {
        self.record_heartbeat(id).await
    }

    async fn select_worker(&self, hint: Option<&str>) -> Result<String> {
        Ok(self.get_available_session(hint).await?.session_name)
    }

    async fn sweep(&self, now: DateTime<Utc>) {
        self.perform_health_check(now).await;
    }

    fn stats(&self) -> serde_json::Value {
        serde_json::to_value(self.session_status()).unwrap_or_default()
    }
}
