//! Point-to-point messaging seam.
//!
//! The runtime consumes messaging through the [`MessagingService`] trait:
//! fire-and-forget sends, request/reply exchanges, and subject
//! subscriptions. Production deployments plug a network transport in
//! behind this trait; the crate ships [`LoopbackTransport`], an
//! in-memory implementation backed by a shared [`LoopbackHub`], which
//! lets a whole multi-node cluster run inside one process. That is the
//! default transport for tests and local development.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::constants::DEFAULT_REQUEST_TIMEOUT;
use crate::error::{ConclaveError, Result};
use crate::lifecycle::Managed;

/// A network address a node's transport binds to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    /// Create an endpoint from host and port.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// The host component.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The port component.
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Future returned by a message handler.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Bytes>> + Send + 'static>>;

/// Handler invoked for messages arriving on a subscribed subject.
///
/// Receives the sender's endpoint and the payload; the returned bytes
/// become the reply for request/reply exchanges.
pub type MessageHandler = Arc<dyn Fn(Endpoint, Bytes) -> HandlerFuture + Send + Sync>;

/// Point-to-point messaging consumed by the cluster fabrics.
#[async_trait]
pub trait MessagingService: Send + Sync {
    /// The endpoint this service is bound to.
    fn endpoint(&self) -> &Endpoint;

    /// Send a one-way message to a subject at a remote endpoint.
    async fn send(&self, to: &Endpoint, subject: &str, payload: Bytes) -> Result<()>;

    /// Send a request to a subject at a remote endpoint and await the reply.
    async fn request(&self, to: &Endpoint, subject: &str, payload: Bytes) -> Result<Bytes>;

    /// Register a handler for a subject.
    fn subscribe(&self, subject: &str, handler: MessageHandler);

    /// Remove the handler for a subject.
    fn unsubscribe(&self, subject: &str);
}

type SubjectTable = Arc<DashMap<String, MessageHandler>>;

/// Shared in-memory switchboard connecting loopback transports.
///
/// Every transport created against the same hub can reach every other;
/// the hub is the process-local stand-in for a network.
#[derive(Default)]
pub struct LoopbackHub {
    bindings: DashMap<Endpoint, SubjectTable>,
}

impl LoopbackHub {
    /// Create a hub shared by a set of transports.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create a transport bound to `endpoint` on this hub.
    pub fn transport(self: &Arc<Self>, endpoint: Endpoint) -> Arc<LoopbackTransport> {
        Arc::new(LoopbackTransport {
            hub: self.clone(),
            endpoint,
            subjects: Arc::new(DashMap::new()),
            open: AtomicBool::new(false),
        })
    }

    fn resolve(&self, to: &Endpoint, subject: &str) -> Result<MessageHandler> {
        let table = self.bindings.get(to).ok_or_else(|| {
            ConclaveError::Transport(format!("no transport bound at {}", to))
        })?;
        let handler = table.get(subject).ok_or_else(|| {
            ConclaveError::Transport(format!("no handler for subject {} at {}", subject, to))
        })?;
        Ok(handler.clone())
    }
}

/// In-memory [`MessagingService`] implementation.
pub struct LoopbackTransport {
    hub: Arc<LoopbackHub>,
    endpoint: Endpoint,
    subjects: SubjectTable,
    open: AtomicBool,
}

#[async_trait]
impl MessagingService for LoopbackTransport {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    async fn send(&self, to: &Endpoint, subject: &str, payload: Bytes) -> Result<()> {
        let handler = self.hub.resolve(to, subject)?;
        let from = self.endpoint.clone();
        trace!(to = %to, subject, bytes = payload.len(), "send");
        // Delivery happens on a separate task, as it would on a real
        // network: the caller never observes handler execution inline.
        tokio::spawn(async move {
            let _ = handler(from, payload).await;
        });
        Ok(())
    }

    async fn request(&self, to: &Endpoint, subject: &str, payload: Bytes) -> Result<Bytes> {
        let handler = self.hub.resolve(to, subject)?;
        let from = self.endpoint.clone();
        trace!(to = %to, subject, bytes = payload.len(), "request");
        let reply = tokio::time::timeout(DEFAULT_REQUEST_TIMEOUT, async move {
            tokio::spawn(handler(from, payload))
                .await
                .map_err(|e| ConclaveError::Transport(format!("handler aborted: {}", e)))?
        })
        .await
        .map_err(|_| ConclaveError::Timeout {
            elapsed: DEFAULT_REQUEST_TIMEOUT,
        })??;
        Ok(reply)
    }

    fn subscribe(&self, subject: &str, handler: MessageHandler) {
        self.subjects.insert(subject.to_string(), handler);
    }

    fn unsubscribe(&self, subject: &str) {
        self.subjects.remove(subject);
    }
}

#[async_trait]
impl Managed for LoopbackTransport {
    fn name(&self) -> &'static str {
        "transport"
    }

    async fn open(&self) -> Result<()> {
        self.hub
            .bindings
            .insert(self.endpoint.clone(), self.subjects.clone());
        self.open.store(true, Ordering::SeqCst);
        debug!(endpoint = %self.endpoint, "Transport bound");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.hub.bindings.remove(&self.endpoint);
        self.open.store(false, Ordering::SeqCst);
        debug!(endpoint = %self.endpoint, "Transport unbound");
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}
