//! Outermost delegating adapter.
//!
//! Gives the caller a stable handle: inner proxies may be replaced by
//! the recovering layer, but references to the delegating proxy stay
//! valid for the life of the primitive.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;
use crate::proxy::{EventListener, PrimitiveProxy, ProxyOperation};
use crate::session::session::SessionState;

/// Stable-identity forwarding proxy.
pub struct DelegatingProxy {
    inner: Arc<dyn PrimitiveProxy>,
}

impl DelegatingProxy {
    /// Wrap the assembled stack.
    pub fn new(inner: Arc<dyn PrimitiveProxy>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl PrimitiveProxy for DelegatingProxy {
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
        self.inner.on_event(listener);
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}

impl fmt::Display for DelegatingProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.type_id(), self.name())
    }
}
