//! Centralized background task orchestration.
//!
//! Components that run periodic loops (membership heartbeats, session
//! keepalives) register them here so teardown is uniform: one shutdown
//! broadcast stops every loop, and `shutdown_all` waits for them to
//! drain.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Status of a background task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    /// Task is currently running.
    Running,
    /// Task finished (completed or received shutdown).
    Finished,
}

/// Central registry for background task management.
pub struct TaskRegistry {
    tasks: HashMap<&'static str, JoinHandle<()>>,
    shutdown_tx: broadcast::Sender<()>,
    shutting_down: bool,
}

impl TaskRegistry {
    /// Create a new task registry.
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            tasks: HashMap::new(),
            shutdown_tx,
            shutting_down: false,
        }
    }

    /// Spawn a named background task.
    ///
    /// The task races against the registry's shutdown signal; it should
    /// be written to run until cancelled.
    pub fn spawn<F>(&mut self, name: &'static str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.shutting_down {
            tracing::warn!(task = name, "Ignoring spawn during shutdown");
            return;
        }

        // A task with the same name replaces its previous instance.
        if let Some(old) = self.tasks.remove(name) {
            old.abort();
            tracing::debug!(task = name, "Aborted previous task instance");
        }

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = task => {
                    tracing::debug!(task = name, "Task completed");
                }
                _ = shutdown_rx.recv() => {
                    tracing::debug!(task = name, "Task received shutdown signal");
                }
            }
        });

        tracing::debug!(task = name, "Spawned background task");
        self.tasks.insert(name, handle);
    }

    /// Spawn a periodic task that runs at a fixed interval.
    ///
    /// The first tick fires immediately; the closure receives the tick
    /// count.
    pub fn spawn_periodic<F, Fut>(&mut self, name: &'static str, interval: Duration, mut task: F)
    where
        F: FnMut(u64) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        self.spawn(name, async move {
            let mut tick = 0u64;
            let mut timer = tokio::time::interval(interval);
            loop {
                timer.tick().await;
                task(tick).await;
                tick = tick.wrapping_add(1);
            }
        });
    }

    /// Get the status of all tasks as (name, status) pairs.
    pub fn health_check(&self) -> Vec<(&'static str, TaskStatus)> {
        self.tasks
            .iter()
            .map(|(name, handle)| {
                let status = if handle.is_finished() {
                    TaskStatus::Finished
                } else {
                    TaskStatus::Running
                };
                (*name, status)
            })
            .collect()
    }

    /// Signal shutdown and wait for every task to stop.
    pub async fn shutdown_all(&mut self) {
        self.shutting_down = true;
        let _ = self.shutdown_tx.send(());

        for (name, handle) in self.tasks.drain() {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    tracing::warn!(task = name, error = %e, "Background task ended abnormally");
                }
            }
        }
    }

    /// Number of registered tasks.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether the registry has no tasks.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn spawned_task_runs_and_shuts_down() {
        let mut registry = TaskRegistry::new();
        let ticks = Arc::new(AtomicU32::new(0));

        let counter = ticks.clone();
        registry.spawn("ticker", async move {
            loop {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        });

        tokio::time::sleep(Duration::from_millis(30)).await;
        registry.shutdown_all().await;
        let seen = ticks.load(Ordering::SeqCst);
        assert!(seen > 0);

        // No further ticks once shut down.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), seen);
    }

    #[tokio::test]
    async fn periodic_task_receives_tick_count() {
        let mut registry = TaskRegistry::new();
        let last_tick = Arc::new(AtomicU32::new(0));

        let seen = last_tick.clone();
        registry.spawn_periodic("periodic", Duration::from_millis(5), move |tick| {
            let seen = seen.clone();
            async move {
                seen.store(tick as u32 + 1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(40)).await;
        registry.shutdown_all().await;
        assert!(last_tick.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn respawn_replaces_previous_instance() {
        let mut registry = TaskRegistry::new();
        registry.spawn("job", std::future::pending());
        registry.spawn("job", std::future::pending());
        assert_eq!(registry.len(), 1);
        registry.shutdown_all().await;
    }

    #[tokio::test]
    async fn spawn_after_shutdown_is_ignored() {
        let mut registry = TaskRegistry::new();
        registry.shutdown_all().await;
        registry.spawn("late", std::future::pending());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn health_check_reports_running_tasks() {
        let mut registry = TaskRegistry::new();
        registry.spawn("alive", std::future::pending());
        let health = registry.health_check();
        assert_eq!(health, vec![("alive", TaskStatus::Running)]);
        registry.shutdown_all().await;
    }
}
