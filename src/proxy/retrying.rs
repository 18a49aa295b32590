//! Transient-error retry adapter.
//!
//! Retries `Unavailable`, `LeaderUnknown`, and `OperationLost` with a
//! fixed delay, up to a configured number of retries. Terminal kinds
//! (`Timeout`, `Application`, session expiry) pass through unchanged.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backon::{ConstantBuilder, Retryable};
use serde_json::Value;
use tracing::debug;

use crate::error::Result;
use crate::metrics;
use crate::proxy::{EventListener, PrimitiveProxy, ProxyOperation};
use crate::session::session::SessionState;

/// Proxy adapter retrying transient errors.
pub struct RetryingProxy {
    inner: Arc<dyn PrimitiveProxy>,
    max_retries: u32,
    retry_delay: Duration,
}

impl RetryingProxy {
    /// Wrap `inner` with up to `max_retries` fixed-delay retries.
    pub fn new(inner: Arc<dyn PrimitiveProxy>, max_retries: u32, retry_delay: Duration) -> Self {
        Self {
            inner,
            max_retries,
            retry_delay,
        }
    }

    fn policy(&self) -> ConstantBuilder {
        ConstantBuilder::default()
            .with_delay(self.retry_delay)
            .with_max_times(self.max_retries as usize)
    }
}

#[async_trait]
impl PrimitiveProxy for RetryingProxy {
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
        let result = (|| {
            let inner = self.inner.clone();
            let operation = operation.clone();
            async move { inner.execute(operation).await }
        })
        .retry(self.policy())
        .when(|e| {
            let transient = e.is_transient();
            if transient {
                metrics::PROXY_RETRIES.with_label_values(&["attempt"]).inc();
                debug!(error = %e, "Retrying transient proxy error");
            }
            transient
        })
        .await;

        match &result {
            Ok(_) => {}
            Err(e) if e.is_transient() => {
                metrics::PROXY_RETRIES
                    .with_label_values(&["exhausted"])
                    .inc();
            }
            Err(_) => {}
        }
        result
    }

    fn on_event(&self, listener: EventListener) {
        self.inner.on_event(listener);
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}
