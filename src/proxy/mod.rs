//! The primitive proxy stack.
//!
//! A user-facing primitive handle is a raw session-bound proxy wrapped
//! by up to four adapters, composed innermost first:
//!
//! ```text
//! SessionProxy → Recovering(·)? → Retrying(·)? → BlockingAware(·) → Delegating(·)
//! ```
//!
//! Each adapter is a value wrapping a peer; the "why this order" lives
//! in one place, [`assemble`].

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::runtime::Handle;

use crate::constants::{DEFAULT_MAX_RETRIES, DEFAULT_RETRY_DELAY};
use crate::error::Result;
use crate::session::SessionState;
use crate::session::participant::OperationKind;
use crate::types::ReadConsistency;

pub mod blocking;
pub mod delegating;
pub mod recovering;
pub mod retrying;
pub mod session_proxy;

pub use blocking::BlockingAwareProxy;
pub use delegating::DelegatingProxy;
pub use recovering::RecoveringProxy;
pub use retrying::RetryingProxy;
pub use session_proxy::SessionProxy;

/// What to do when the backing session expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecoveryStrategy {
    /// Surface the expiry to the caller; the proxy becomes unusable.
    #[default]
    Close,
    /// Transparently open a replacement session and resume.
    Recover,
}

/// Configuration of one assembled proxy stack.
#[derive(Clone)]
pub struct ProxyOptions {
    /// Session recovery behavior.
    pub recovery: RecoveryStrategy,
    /// Retries for transient errors; zero disables the retrying layer.
    pub max_retries: u32,
    /// Fixed delay between retries.
    pub retry_delay: Duration,
    /// Read consistency for queries on the backing session.
    pub consistency: ReadConsistency,
    /// Executor for user callbacks; defaults to the current runtime.
    pub executor: Option<Handle>,
}

impl Default for ProxyOptions {
    fn default() -> Self {
        Self {
            recovery: RecoveryStrategy::default(),
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
            consistency: ReadConsistency::default(),
            executor: None,
        }
    }
}

/// An operation passing through the proxy stack.
#[derive(Debug, Clone)]
pub struct ProxyOperation {
    /// Operation name in the primitive's vocabulary.
    pub name: String,
    /// Operation input.
    pub input: Value,
    /// Command or query.
    pub kind: OperationKind,
}

impl ProxyOperation {
    /// Create a mutating command.
    pub fn command(name: impl Into<String>, input: Value) -> Self {
        Self {
            name: name.into(),
            input,
            kind: OperationKind::Command,
        }
    }

    /// Create a read-only query.
    pub fn query(name: impl Into<String>, input: Value) -> Self {
        Self {
            name: name.into(),
            input,
            kind: OperationKind::Query,
        }
    }
}

/// An event delivered to primitive listeners.
#[derive(Debug, Clone)]
pub struct ProxyEvent {
    /// The primitive that published the event.
    pub primitive: String,
    /// Event payload.
    pub payload: Value,
}

/// Callback invoked for primitive events.
pub type EventListener = Arc<dyn Fn(ProxyEvent) + Send + Sync>;

/// A live handle on a primitive, bound (directly or through adapters) to
/// a session.
#[async_trait]
pub trait PrimitiveProxy: Send + Sync {
    /// The primitive's name.
    fn name(&self) -> &str;

    /// The primitive's type id.
    fn type_id(&self) -> &str;

    /// State of the backing session.
    fn session_state(&self) -> SessionState;

    /// Execute an operation.
    async fn execute(&self, operation: ProxyOperation) -> Result<Value>;

    /// Register a listener for events published by the primitive.
    fn on_event(&self, listener: EventListener);

    /// Close the proxy and its backing session.
    async fn close(&self) -> Result<()>;
}

impl fmt::Debug for dyn PrimitiveProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrimitiveProxy")
            .field("name", &self.name())
            .field("type", &self.type_id())
            .field("session", &self.session_state())
            .finish()
    }
}

/// Factory producing a fresh raw proxy; the recovering layer calls it
/// again after a session expires.
pub type ProxyFactory = Arc<
    dyn Fn() -> Pin<Box<dyn Future<Output = Result<Arc<dyn PrimitiveProxy>>> + Send>>
        + Send
        + Sync,
>;

/// Assemble the user-facing proxy stack in its fixed composition order.
///
/// Retrying sits *outside* recovering so that a session replacement
/// surfaces a retryable `OperationLost` to a layer able to consume it.
/// Blocking-awareness sits outside both retry and recovery because only
/// it knows the user's executor. Delegating is outermost to give the
/// caller a stable handle even when recovery replaces the inner proxy.
pub async fn assemble(
    factory: ProxyFactory,
    options: ProxyOptions,
) -> Result<Arc<dyn PrimitiveProxy>> {
    let mut proxy: Arc<dyn PrimitiveProxy> = match options.recovery {
        RecoveryStrategy::Recover => RecoveringProxy::build(factory).await?,
        RecoveryStrategy::Close => factory().await?,
    };

    if options.max_retries > 0 {
        proxy = Arc::new(RetryingProxy::new(
            proxy,
            options.max_retries,
            options.retry_delay,
        ));
    }

    let executor = options.executor.clone().unwrap_or_else(Handle::current);
    proxy = Arc::new(BlockingAwareProxy::new(proxy, executor));

    Ok(Arc::new(DelegatingProxy::new(proxy)))
}


#[cfg(test)]
mod tests {
    use super::*;
    use test_support::ScriptedProxy;

    #[tokio::test]
    async fn assemble_produces_a_stable_outer_handle() {
        let raw = ScriptedProxy::new(vec![Ok(Value::from(1))]);
        let factory: ProxyFactory = {
            let raw = raw.clone();
            Arc::new(move || {
                let raw = raw.clone();
                Box::pin(async move { Ok(raw as Arc<dyn PrimitiveProxy>) })
            })
        };

        let proxy = assemble(factory, ProxyOptions::default()).await.unwrap();
        assert_eq!(proxy.name(), "scripted");
        assert_eq!(proxy.type_id(), "test");

        let value = proxy
            .execute(ProxyOperation::command("op", Value::Null))
            .await
            .unwrap();
        assert_eq!(value, Value::from(1));
    }

    #[tokio::test]
    async fn default_options_skip_recovery_and_retry() {
        let raw = ScriptedProxy::new(vec![Err(test_support::unavailable())]);
        let factory: ProxyFactory = {
            let raw = raw.clone();
            Arc::new(move || {
                let raw = raw.clone();
                Box::pin(async move { Ok(raw as Arc<dyn PrimitiveProxy>) })
            })
        };

        let proxy = assemble(factory, ProxyOptions::default()).await.unwrap();
        let result = proxy
            .execute(ProxyOperation::command("op", Value::Null))
            .await;
        assert!(result.is_err());
        // No retry layer: exactly one inner call.
        assert_eq!(raw.call_count(), 1);
    }
}
