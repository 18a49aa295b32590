//! Typed request-reply and direct messaging over the transport.
//!
//! The communicator resolves node ids to endpoints through membership,
//! wraps payloads in a serde envelope carrying the sender's identity,
//! and hands decoded messages to typed handlers. Everything above the
//! transport (session forwarding, the event fabric) speaks through this
//! layer.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cluster::membership::ClusterMembership;
use crate::error::{ConclaveError, Result};
use crate::lifecycle::Managed;
use crate::transport::MessagingService;
use crate::types::NodeId;

/// Envelope carried by every fabric message.
#[derive(Debug, Serialize, Deserialize)]
struct Envelope<M> {
    from: NodeId,
    payload: M,
}

/// Typed request-reply and direct-message layer over transport plus
/// membership.
pub struct ClusterCommunicator {
    membership: Arc<ClusterMembership>,
    messaging: Arc<dyn MessagingService>,
    subjects: Mutex<Vec<String>>,
    open: AtomicBool,
}

impl ClusterCommunicator {
    /// Create the communicator.
    pub fn new(
        membership: Arc<ClusterMembership>,
        messaging: Arc<dyn MessagingService>,
    ) -> Arc<Self> {
        Arc::new(Self {
            membership,
            messaging,
            subjects: Mutex::new(Vec::new()),
            open: AtomicBool::new(false),
        })
    }

    fn encode<M: Serialize>(&self, payload: &M) -> Result<Bytes> {
        let envelope = Envelope {
            from: self.membership.local().id().clone(),
            payload,
        };
        Ok(Bytes::from(serde_json::to_vec(&envelope)?))
    }

    fn endpoint_of(&self, to: &NodeId) -> Result<crate::transport::Endpoint> {
        self.membership
            .endpoint_of(to)
            .ok_or_else(|| ConclaveError::Transport(format!("unknown node {}", to)))
    }

    /// Send a one-way message to a node.
    pub async fn unicast<M: Serialize>(&self, to: &NodeId, subject: &str, message: &M) -> Result<()> {
        let endpoint = self.endpoint_of(to)?;
        let payload = self.encode(message)?;
        self.messaging.send(&endpoint, subject, payload).await
    }

    /// Send a request to a node and decode the typed reply.
    pub async fn request<M, R>(&self, to: &NodeId, subject: &str, message: &M) -> Result<R>
    where
        M: Serialize,
        R: DeserializeOwned,
    {
        let endpoint = self.endpoint_of(to)?;
        let payload = self.encode(message)?;
        let reply = self.messaging.request(&endpoint, subject, payload).await?;
        Ok(serde_json::from_slice(&reply)?)
    }

    /// Send a one-way message to every reachable member except the local
    /// node. Delivery is best-effort; failures are logged.
    pub async fn broadcast<M: Serialize>(&self, subject: &str, message: &M) -> Result<()> {
        let payload = self.encode(message)?;
        let local = self.membership.local().id().clone();
        for member in self.membership.snapshot().reachable() {
            if member.node.id() == &local {
                continue;
            }
            if let Err(e) = self
                .messaging
                .send(member.node.endpoint(), subject, payload.clone())
                .await
            {
                debug!(peer = %member.node.id(), subject, error = %e, "Broadcast delivery failed");
            }
        }
        Ok(())
    }

    /// Register a typed request handler for a subject.
    ///
    /// The handler receives the sender's node id and the decoded message;
    /// its reply is encoded back to the requester.
    pub fn subscribe<M, R, F, Fut>(&self, subject: &str, handler: F)
    where
        M: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(NodeId, M) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<R>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.messaging.subscribe(
            subject,
            Arc::new(move |_endpoint, payload: Bytes| {
                let handler = handler.clone();
                Box::pin(async move {
                    let envelope: Envelope<M> = serde_json::from_slice(&payload)?;
                    let reply = handler(envelope.from, envelope.payload).await?;
                    Ok(Bytes::from(serde_json::to_vec(&reply)?))
                })
            }),
        );
        self.subjects
            .lock()
            .expect("subject registry poisoned")
            .push(subject.to_string());
    }

    /// Remove the handler for a subject.
    pub fn unsubscribe(&self, subject: &str) {
        self.messaging.unsubscribe(subject);
        self.subjects
            .lock()
            .expect("subject registry poisoned")
            .retain(|s| s != subject);
    }
}

#[async_trait]
impl Managed for ClusterCommunicator {
    fn name(&self) -> &'static str {
        "communication"
    }

    async fn open(&self) -> Result<()> {
        self.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let subjects: Vec<String> = self
            .subjects
            .lock()
            .expect("subject registry poisoned")
            .drain(..)
            .collect();
        for subject in subjects {
            self.messaging.unsubscribe(&subject);
        }
        if self.open.swap(false, Ordering::SeqCst) {
            debug!("Communicator closed");
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::membership::MembershipConfig;
    use crate::cluster::node::{ClusterMetadata, Node};
    use crate::transport::{Endpoint, LoopbackHub};
    use std::time::Duration;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Ping {
        seq: u32,
    }

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Pong {
        seq: u32,
        from: NodeId,
    }

    async fn communicator_pair() -> (Arc<ClusterCommunicator>, Arc<ClusterCommunicator>) {
        let hub = LoopbackHub::new();
        let nodes = [
            Node::core("n1", Endpoint::new("127.0.0.1", 1111)),
            Node::core("n2", Endpoint::new("127.0.0.1", 2222)),
        ];

        let mut fabrics = Vec::new();
        for local in &nodes {
            let transport = hub.transport(local.endpoint().clone());
            transport.open().await.unwrap();
            let metadata = ClusterMetadata::new(local.clone(), nodes.clone()).unwrap();
            let membership = ClusterMembership::new(
                metadata,
                transport.clone(),
                MembershipConfig {
                    heartbeat_interval: Duration::from_secs(60),
                    ..Default::default()
                },
            );
            membership.open().await.unwrap();
            let communicator = ClusterCommunicator::new(membership, transport);
            communicator.open().await.unwrap();
            fabrics.push(communicator);
        }
        let mut iter = fabrics.into_iter();
        (iter.next().unwrap(), iter.next().unwrap())
    }

    #[tokio::test]
    async fn typed_request_reply() {
        let (a, b) = communicator_pair().await;

        b.subscribe("ping", |from: NodeId, ping: Ping| async move {
            Ok(Pong {
                seq: ping.seq,
                from,
            })
        });

        let pong: Pong = a
            .request(&NodeId::from("n2"), "ping", &Ping { seq: 9 })
            .await
            .unwrap();
        assert_eq!(pong.seq, 9);
        assert_eq!(pong.from, NodeId::from("n1"));
    }

    #[tokio::test]
    async fn request_to_unknown_node_fails() {
        let (a, _b) = communicator_pair().await;
        let result: Result<Pong> = a
            .request(&NodeId::from("ghost"), "ping", &Ping { seq: 1 })
            .await;
        assert!(matches!(result, Err(ConclaveError::Transport(_))));
    }

    #[tokio::test]
    async fn close_removes_subscriptions() {
        let (a, b) = communicator_pair().await;
        b.subscribe("ping", |_from: NodeId, ping: Ping| async move {
            Ok(Pong {
                seq: ping.seq,
                from: NodeId::from("n2"),
            })
        });
        b.close().await.unwrap();

        let result: Result<Pong> = a.request(&NodeId::from("n2"), "ping", &Ping { seq: 1 }).await;
        assert!(result.is_err());
    }
}
