//! Blocking-safety adapter.
//!
//! Event listeners registered through this adapter are dispatched on the
//! user-supplied executor, never inline on the session or transport task
//! that produced the event. A listener that blocks (or re-enters the
//! proxy and waits) therefore cannot deadlock the worker its completion
//! depends on.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::runtime::Handle;

use crate::error::Result;
use crate::proxy::{EventListener, PrimitiveProxy, ProxyOperation};
use crate::session::session::SessionState;

/// Proxy adapter rescheduling user callbacks off I/O tasks.
pub struct BlockingAwareProxy {
    inner: Arc<dyn PrimitiveProxy>,
    executor: Handle,
}

impl BlockingAwareProxy {
    /// Wrap `inner`, dispatching listener callbacks on `executor`.
    pub fn new(inner: Arc<dyn PrimitiveProxy>, executor: Handle) -> Self {
        Self { inner, executor }
    }
}

#[async_trait]
impl PrimitiveProxy for BlockingAwareProxy {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn type_id(&self) -> &str {
        self.inner.type_id()
    }

    fn session_state(&self) -> SessionState {
        self.inner.session_state()
    }

    async fn execute(&self, operation: ProxyOperation) -> Result<Value> {
        self.inner.execute(operation).await
    }

    fn on_event(&self, listener: EventListener) {
        let executor = self.executor.clone();
        self.inner.on_event(Arc::new(move |event| {
            let listener = listener.clone();
            // Never run the user's callback inline on the producing task.
            executor.spawn(async move {
                listener(event);
            });
        }));
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}
