//! Component lifecycle: the `Managed` capability and the single-threaded
//! orchestration context that serializes every lifecycle transition.
//!
//! The composition root holds its components as an ordered list of
//! [`Managed`] values and drives them strictly in sequence on a
//! [`SerialContext`]: a queue drained by one dispatcher task, one job at
//! a time. Serializing transitions this way eliminates races between a
//! partial open and a concurrent close without any explicit locking.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{ConclaveError, Result};
use crate::metrics;

/// Capability shared by every component the composition root manages.
///
/// `close` must be tolerant of a component that never opened: calling it
/// on a closed or never-opened component succeeds as a no-op.
#[async_trait]
pub trait Managed: Send + Sync {
    /// Stable component name used in logs and metrics.
    fn name(&self) -> &'static str;

    /// Bring the component up. Completes when the component is usable.
    async fn open(&self) -> Result<()>;

    /// Tear the component down, releasing its resources.
    async fn close(&self) -> Result<()>;

    /// Whether the component is currently open.
    fn is_open(&self) -> bool;
}

type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

struct ContextState {
    receiver: Option<mpsc::UnboundedReceiver<Job>>,
    worker: Option<JoinHandle<()>>,
}

/// Single-threaded cooperative executor for lifecycle transitions.
///
/// Jobs submitted through [`run`](SerialContext::run) execute one at a
/// time in submission order. A job may suspend awaiting I/O; the next
/// job starts only after the previous one completed.
pub struct SerialContext {
    sender: mpsc::UnboundedSender<Job>,
    state: Mutex<ContextState>,
}

impl SerialContext {
    /// Create a context. The dispatcher task is spawned lazily on first
    /// use so the constructor stays synchronous.
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            state: Mutex::new(ContextState {
                receiver: Some(receiver),
                worker: None,
            }),
        }
    }

    fn ensure_worker(&self) {
        let mut state = self.state.lock().expect("context state poisoned");
        if state.worker.is_none() {
            if let Some(mut receiver) = state.receiver.take() {
                state.worker = Some(tokio::spawn(async move {
                    while let Some(job) = receiver.recv().await {
                        job.await;
                    }
                }));
            }
        }
    }

    /// Run a job on the context, awaiting its result.
    ///
    /// Jobs are strictly serialized: no two run concurrently, and they
    /// execute in submission order.
    pub async fn run<T, F>(&self, job: F) -> Result<T>
    where
        T: Send + 'static,
        F: Future<Output = T> + Send + 'static,
    {
        self.ensure_worker();

        let (done_tx, done_rx) = oneshot::channel();
        let wrapped: Job = Box::pin(async move {
            let _ = done_tx.send(job.await);
        });

        self.sender
            .send(wrapped)
            .map_err(|_| ConclaveError::NotOpen)?;
        done_rx.await.map_err(|_| ConclaveError::NotOpen)
    }

    /// Release the context. Pending jobs are abandoned; subsequent
    /// `run` calls fail with `NotOpen`.
    pub fn release(&self) {
        let mut state = self.state.lock().expect("context state poisoned");
        state.receiver = None;
        if let Some(worker) = state.worker.take() {
            worker.abort();
        }
    }
}

impl Default for SerialContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Open components in list order, each transition serialized on the
/// context.
///
/// If any component fails to open, the components opened so far are
/// closed in reverse order before the error surfaces.
pub async fn open_all(context: &SerialContext, components: &[Arc<dyn Managed>]) -> Result<()> {
    let mut opened: Vec<Arc<dyn Managed>> = Vec::new();

    for component in components {
        let target = component.clone();
        let result = context
            .run(async move { target.open().await })
            .await
            .and_then(|inner| inner);

        match result {
            Ok(()) => {
                debug!(component = component.name(), "Component opened");
                metrics::record_lifecycle(component.name(), "open");
                opened.push(component.clone());
            }
            Err(e) => {
                error!(
                    component = component.name(),
                    error = %e,
                    "Component failed to open, rolling back"
                );
                close_all(context, &opened).await;
                return Err(e);
            }
        }
    }

    Ok(())
}

/// Close components in reverse list order, each transition serialized
/// on the context.
///
/// Close always resolves: individual close errors are logged and
/// swallowed so teardown reaches every component.
pub async fn close_all(context: &SerialContext, components: &[Arc<dyn Managed>]) {
    for component in components.iter().rev() {
        let target = component.clone();
        let result = context
            .run(async move { target.close().await })
            .await
            .and_then(|inner| inner);

        match result {
            Ok(()) => {
                debug!(component = component.name(), "Component closed");
                metrics::record_lifecycle(component.name(), "close");
            }
            Err(e) => {
                warn!(
                    component = component.name(),
                    error = %e,
                    "Component close failed; continuing teardown"
                );
            }
        }
    }
    info!(components = components.len(), "Teardown complete");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn run_returns_job_result() {
        let context = SerialContext::new();
        let value = context.run(async { 41 + 1 }).await.unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn jobs_do_not_interleave() {
        let context = Arc::new(SerialContext::new());
        let in_flight = Arc::new(AtomicU32::new(0));
        let overlapped = Arc::new(AtomicBool::new(false));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let context = context.clone();
            let in_flight = in_flight.clone();
            let overlapped = overlapped.clone();
            handles.push(tokio::spawn(async move {
                context
                    .run(async move {
                        if in_flight.fetch_add(1, Ordering::SeqCst) > 0 {
                            overlapped.store(true, Ordering::SeqCst);
                        }
                        tokio::time::sleep(Duration::from_millis(2)).await;
                        in_flight.fetch_sub(1, Ordering::SeqCst);
                    })
                    .await
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(!overlapped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn released_context_rejects_jobs() {
        let context = SerialContext::new();
        context.run(async {}).await.unwrap();
        context.release();
        let result = context.run(async { 1 }).await;
        assert!(matches!(result, Err(ConclaveError::NotOpen)));
    }

    struct FlakyComponent {
        name: &'static str,
        fail_open: bool,
        open: AtomicBool,
        opens: AtomicU32,
        closes: AtomicU32,
    }

    impl FlakyComponent {
        fn new(name: &'static str, fail_open: bool) -> Arc<Self> {
            Arc::new(Self {
                name,
                fail_open,
                open: AtomicBool::new(false),
                opens: AtomicU32::new(0),
                closes: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl Managed for FlakyComponent {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn open(&self) -> Result<()> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            if self.fail_open {
                return Err(ConclaveError::Transport("refused".into()));
            }
            self.open.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn close(&self) -> Result<()> {
            self.open.store(false, Ordering::SeqCst);
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn is_open(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }
    }

    #[tokio::test]
    async fn open_failure_rolls_back_in_reverse() {
        let context = SerialContext::new();
        let first = FlakyComponent::new("first", false);
        let second = FlakyComponent::new("second", false);
        let third = FlakyComponent::new("third", true);

        let components: Vec<Arc<dyn Managed>> =
            vec![first.clone(), second.clone(), third.clone()];

        let result = open_all(&context, &components).await;
        assert!(result.is_err());

        // The failed component never opened; the ones before it were
        // closed during rollback.
        assert!(!first.is_open());
        assert!(!second.is_open());
        assert_eq!(first.closes.load(Ordering::SeqCst), 1);
        assert_eq!(second.closes.load(Ordering::SeqCst), 1);
        assert_eq!(third.closes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn close_all_reaches_every_component() {
        let context = SerialContext::new();
        let a = FlakyComponent::new("a", false);
        let b = FlakyComponent::new("b", false);
        let components: Vec<Arc<dyn Managed>> = vec![a.clone(), b.clone()];

        open_all(&context, &components).await.unwrap();
        close_all(&context, &components).await;

        assert!(!a.is_open());
        assert!(!b.is_open());
    }
}
