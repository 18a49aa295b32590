//! Cluster-wide topic publish/subscribe over the communication fabric.
//!
//! Publishing delivers to local subscribers directly and fans out to
//! every reachable peer through the communicator. Remote deliveries are
//! best-effort; a missing peer never fails the publish.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::cluster::communication::ClusterCommunicator;
use crate::error::Result;
use crate::lifecycle::Managed;
use crate::types::NodeId;

const EVENTS_SUBJECT: &str = "fabric/events";

/// Capacity of each topic's local delivery channel.
const TOPIC_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Serialize, Deserialize)]
struct TopicEvent {
    topic: String,
    payload: Vec<u8>,
}

/// Cluster-wide event fabric.
pub struct ClusterEventBus {
    communicator: Arc<ClusterCommunicator>,
    topics: Arc<DashMap<String, broadcast::Sender<Bytes>>>,
    open: AtomicBool,
}

impl ClusterEventBus {
    /// Create the event bus over a communicator.
    pub fn new(communicator: Arc<ClusterCommunicator>) -> Arc<Self> {
        Arc::new(Self {
            communicator,
            topics: Arc::new(DashMap::new()),
            open: AtomicBool::new(false),
        })
    }

    fn sender_for(&self, topic: &str) -> broadcast::Sender<Bytes> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CHANNEL_CAPACITY).0)
            .clone()
    }

    /// Subscribe to a topic. Events arrive as raw payload bytes; use
    /// [`decode`] for typed payloads.
    pub fn subscribe(&self, topic: &str) -> broadcast::Receiver<Bytes> {
        self.sender_for(topic).subscribe()
    }

    /// Publish a typed event to a topic, cluster-wide.
    pub async fn publish<M: Serialize>(&self, topic: &str, message: &M) -> Result<()> {
        let payload = serde_json::to_vec(message)?;

        // Local subscribers first.
        if let Some(sender) = self.topics.get(topic) {
            let _ = sender.send(Bytes::from(payload.clone()));
        }

        // Then every reachable peer, best-effort.
        let event = TopicEvent {
            topic: topic.to_string(),
            payload,
        };
        self.communicator.broadcast(EVENTS_SUBJECT, &event).await
    }
}

/// Decode a typed event payload.
pub fn decode<M: DeserializeOwned>(payload: &Bytes) -> Result<M> {
    Ok(serde_json::from_slice(payload)?)
}

#[async_trait]
impl Managed for ClusterEventBus {
    fn name(&self) -> &'static str {
        "events"
    }

    async fn open(&self) -> Result<()> {
        let topics = self.topics.clone();
        self.communicator
            .subscribe(EVENTS_SUBJECT, move |_from: NodeId, event: TopicEvent| {
                let topics = topics.clone();
                async move {
                    if let Some(sender) = topics.get(&event.topic) {
                        let _ = sender.send(Bytes::from(event.payload));
                    }
                    Ok(())
                }
            });
        self.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.communicator.unsubscribe(EVENTS_SUBJECT);
        self.topics.clear();
        if self.open.swap(false, Ordering::SeqCst) {
            debug!("Event bus closed");
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}
