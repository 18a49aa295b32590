//! Session recovery adapter.
//!
//! On an inner `SessionExpired`, opens a replacement proxy through its
//! factory, replays registered event listeners onto it, and swaps it in
//! atomically. The interrupted call surfaces `OperationLost`: whether to
//! resubmit is the caller's decision, which is why the retrying layer
//! composes *above* this one.

use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{ConclaveError, Result};
use crate::proxy::{EventListener, PrimitiveProxy, ProxyFactory, ProxyOperation};
use crate::session::session::SessionState;

/// Proxy adapter that transparently replaces expired sessions.
pub struct RecoveringProxy {
    name: String,
    type_id: String,
    factory: ProxyFactory,
    inner: RwLock<Arc<dyn PrimitiveProxy>>,
    listeners: Mutex<Vec<EventListener>>,
    recovery_gate: tokio::sync::Mutex<()>,
}

impl RecoveringProxy {
    /// Build the adapter, creating the initial inner proxy.
    pub async fn build(factory: ProxyFactory) -> Result<Arc<Self>> {
        let initial = factory().await?;
        Ok(Arc::new(Self {
            name: initial.name().to_string(),
            type_id: initial.type_id().to_string(),
            factory,
            inner: RwLock::new(initial),
            listeners: Mutex::new(Vec::new()),
            recovery_gate: tokio::sync::Mutex::new(()),
        }))
    }

    fn current(&self) -> Arc<dyn PrimitiveProxy> {
        self.inner.read().expect("inner proxy lock poisoned").clone()
    }

    /// Replace `failed` with a freshly built proxy, unless a concurrent
    /// caller already did.
    async fn recover(&self, failed: Arc<dyn PrimitiveProxy>) {
        let _gate = self.recovery_gate.lock().await;

        {
            let current = self.inner.read().expect("inner proxy lock poisoned");
            if !Arc::ptr_eq(&*current, &failed) {
                return;
            }
        }

        match (self.factory)().await {
            Ok(replacement) => {
                let listeners: Vec<EventListener> = self
                    .listeners
                    .lock()
                    .expect("listener registry poisoned")
                    .clone();
                for listener in listeners {
                    replacement.on_event(listener);
                }
                *self.inner.write().expect("inner proxy lock poisoned") = replacement;
                debug!(primitive = %self.name, "Session recovered");
            }
            Err(e) => {
                // The next call will hit the expired session and try
                // again.
                warn!(primitive = %self.name, error = %e, "Session recovery failed");
            }
        }
    }
}

#[async_trait]
impl PrimitiveProxy for RecoveringProxy {
    fn name(&self) -> &str {
        &self.name
    }

    fn type_id(&self) -> &str {
        &self.type_id
    }

    fn session_state(&self) -> SessionState {
        self.current().session_state()
    }

    async fn execute(&self, operation: ProxyOperation) -> Result<Value> {
        let current = self.current();
        match current.execute(operation).await {
            Err(e) if e.is_session_fatal() => {
                self.recover(current).await;
                Err(ConclaveError::OperationLost)
            }
            other => other,
        }
    }

    fn on_event(&self, listener: EventListener) {
        self.listeners
            .lock()
            .expect("listener registry poisoned")
            .push(listener.clone());
        self.current().on_event(listener);
    }

    async fn close(&self) -> Result<()> {
        self.current().close().await
    }
}
