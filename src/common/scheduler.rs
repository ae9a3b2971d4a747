//! Periodic background tasks driven by one scheduler.
//!
//! Every loop (raft driver, health sweeps, snapshot schedule, log rotation
//! check, session failure detection) is a [`PeriodicTask`] value. They all
//! share the scheduler's cancellation token, so cancelling it stops every
//! loop after its current iteration.

use futures_util::future::BoxFuture;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

type TaskBody = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// A named body run on a fixed period
pub struct PeriodicTask {
    name: String,
    interval: Duration,
    body: TaskBody,
}

impl PeriodicTask {
    pub fn new<F, Fut>(name: impl Into<String>, interval: Duration, body: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            name: name.into(),
            interval,
            body: Arc::new(move || Box::pin(body())),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Run until `token` is cancelled. The first iteration happens one
    /// `interval` after start; an iteration already running is allowed to finish.
    pub async fn run(self, token: CancellationToken) {
        let start = tokio::time::Instant::now() + self.interval;
        let mut ticker = tokio::time::interval_at(start, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = ticker.tick() => (self.body)().await,
            }
        }

        tracing::debug!(task = %self.name, "Periodic task stopped");
    }
}

impl std::fmt::Debug for PeriodicTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeriodicTask")
            .field("name", &self.name)
            .field("interval", &self.interval)
            .finish()
    }
}

/// Owns the running tasks and their shared cancellation signal
pub struct Scheduler {
    token: CancellationToken,
    handles: Vec<(String, JoinHandle<()>)>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::with_token(CancellationToken::new())
    }

    /// Use an externally owned token, e.g. one cancelled by a signal handler
    pub fn with_token(token: CancellationToken) -> Self {
        Self {
            token,
            handles: Vec::new(),
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn spawn(&mut self, task: PeriodicTask) {
        tracing::debug!(task = %task.name, interval_ms = task.interval.as_millis() as u64, "Spawning periodic task");
        let name = task.name.clone();
        let handle = tokio::spawn(task.run(self.token.child_token()));
        self.handles.push((name, handle));
    }

    pub fn task_names(&self) -> Vec<&str> {
        self.handles.iter().map(|(name, _)| name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Cancel every task and wait for all of them to exit
    pub async fn shutdown(self) {
        self.token.cancel();
        for (name, handle) in self.handles {
            if let Err(e) = handle.await {
                tracing::error!(task = %name, error = %e, "Periodic task panicked");
            }
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_task_runs_on_period() {
        let count = Arc::new(AtomicU64::new(0));
        let c = count.clone();
        let mut scheduler = Scheduler::new();
        scheduler.spawn(PeriodicTask::new("count", Duration::from_secs(1), move || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
            }
        }));

        tokio::time::sleep(Duration::from_millis(3_500)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);

        scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_all_tasks() {
        let count = Arc::new(AtomicU64::new(0));
        let mut scheduler = Scheduler::new();
        for name in ["a", "b"] {
            let c = count.clone();
            scheduler.spawn(PeriodicTask::new(name, Duration::from_millis(100), move || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                }
            }));
        }
        assert_eq!(scheduler.task_names(), vec!["a", "b"]);

        tokio::time::sleep(Duration::from_millis(250)).await;
        let token = scheduler.token();
        scheduler.shutdown().await;
        assert!(token.is_cancelled());

        let after_shutdown = count.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(count.load(Ordering::SeqCst), after_shutdown);
        assert_eq!(after_shutdown, 4);
    }
}
