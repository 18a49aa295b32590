//! Cluster membership: node set, liveness, and local identity.
//!
//! Each node announces itself to its peers on a fixed heartbeat
//! interval. A detector loop counts missed heartbeats and moves peers
//! through three liveness states:
//!
//! 1. **Active** - heartbeats received on time
//! 2. **Suspect** - some heartbeats missed (potential network blip)
//! 3. **Dead** - enough heartbeats missed to declare failure
//!
//! The suspect state reduces false positives from transient network
//! issues.
//!
//! The membership view is copy-on-write: readers take an `Arc` snapshot
//! without holding any lock across their use of it, writers swap in a
//! rebuilt snapshot under a short write lock.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, info, warn};

use crate::cluster::node::{ClusterMetadata, Node};
use crate::constants::{
    DEFAULT_FAILURE_THRESHOLD, DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_SUSPICION_THRESHOLD,
};
use crate::error::Result;
use crate::lifecycle::Managed;
use crate::tasks::TaskRegistry;
use crate::transport::{Endpoint, MessagingService};
use crate::types::NodeId;

const HEARTBEAT_SUBJECT: &str = "membership/heartbeat";

/// Liveness state of a cluster member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// Heartbeats received on time.
    Active,
    /// Some heartbeats missed.
    Suspect,
    /// Enough heartbeats missed to declare the node dead.
    Dead,
}

/// Event emitted when a member changes liveness state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipEvent {
    pub node: NodeId,
    pub previous: NodeState,
    pub current: NodeState,
}

/// A member and its current liveness state.
#[derive(Debug, Clone)]
pub struct Member {
    pub node: Node,
    pub state: NodeState,
}

/// Immutable membership snapshot observed by readers.
#[derive(Debug, Clone, Default)]
pub struct MembershipSnapshot {
    members: BTreeMap<NodeId, Member>,
}

impl MembershipSnapshot {
    /// All members in id order.
    pub fn members(&self) -> impl Iterator<Item = &Member> {
        self.members.values()
    }

    /// Look up a member by id.
    pub fn member(&self, id: &NodeId) -> Option<&Member> {
        self.members.get(id)
    }

    /// Members currently considered reachable (not dead).
    pub fn reachable(&self) -> impl Iterator<Item = &Member> {
        self.members
            .values()
            .filter(|m| m.state != NodeState::Dead)
    }

    /// Number of members.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Whether the snapshot holds no members.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// Tuning knobs for the liveness detector.
#[derive(Debug, Clone)]
pub struct MembershipConfig {
    /// How often the local node announces itself.
    pub heartbeat_interval: Duration,
    /// Missed heartbeats before a peer becomes suspect.
    pub suspicion_threshold: u32,
    /// Missed heartbeats before a peer is declared dead.
    pub failure_threshold: u32,
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            suspicion_threshold: DEFAULT_SUSPICION_THRESHOLD,
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Heartbeat {
    from: NodeId,
}

/// Cluster membership service.
pub struct ClusterMembership {
    metadata: ClusterMetadata,
    messaging: Arc<dyn MessagingService>,
    config: MembershipConfig,
    snapshot: RwLock<Arc<MembershipSnapshot>>,
    last_seen: Arc<DashMap<NodeId, Instant>>,
    events: broadcast::Sender<MembershipEvent>,
    tasks: Mutex<TaskRegistry>,
    open: AtomicBool,
    weak_self: Weak<ClusterMembership>,
}

impl ClusterMembership {
    /// Create the membership service over cluster metadata and a transport.
    pub fn new(
        metadata: ClusterMetadata,
        messaging: Arc<dyn MessagingService>,
        config: MembershipConfig,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new_cyclic(|weak| Self {
            metadata,
            messaging,
            config,
            snapshot: RwLock::new(Arc::new(MembershipSnapshot::default())),
            last_seen: Arc::new(DashMap::new()),
            events,
            tasks: Mutex::new(TaskRegistry::new()),
            open: AtomicBool::new(false),
            weak_self: weak.clone(),
        })
    }

    /// The local node.
    pub fn local(&self) -> &Node {
        self.metadata.local()
    }

    /// Current membership snapshot. Cheap; readers never block writers.
    pub fn snapshot(&self) -> Arc<MembershipSnapshot> {
        self.snapshot.read().expect("membership lock poisoned").clone()
    }

    /// Resolve a member's endpoint.
    pub fn endpoint_of(&self, id: &NodeId) -> Option<Endpoint> {
        self.snapshot().member(id).map(|m| m.node.endpoint().clone())
    }

    /// Subscribe to liveness state changes.
    pub fn subscribe(&self) -> broadcast::Receiver<MembershipEvent> {
        self.events.subscribe()
    }

    fn set_state(&self, id: &NodeId, state: NodeState) {
        let mut guard = self.snapshot.write().expect("membership lock poisoned");
        let current = guard.member(id).map(|m| m.state);
        let Some(previous) = current else { return };
        if previous == state {
            return;
        }

        let mut next = (**guard).clone();
        if let Some(member) = next.members.get_mut(id) {
            member.state = state;
        }
        *guard = Arc::new(next);
        drop(guard);

        debug!(node = %id, ?previous, ?state, "Member state changed");
        let _ = self.events.send(MembershipEvent {
            node: id.clone(),
            previous,
            current: state,
        });
    }

    fn seed_snapshot(&self) {
        let members: BTreeMap<NodeId, Member> = self
            .metadata
            .bootstrap()
            .map(|node| {
                (
                    node.id().clone(),
                    Member {
                        node: node.clone(),
                        state: NodeState::Active,
                    },
                )
            })
            .collect();
        *self.snapshot.write().expect("membership lock poisoned") =
            Arc::new(MembershipSnapshot { members });
    }

    fn check_liveness(&self) {
        let local_id = self.metadata.local().id().clone();
        let interval = self.config.heartbeat_interval;
        for member in self.snapshot().members() {
            let id = member.node.id().clone();
            if id == local_id {
                continue;
            }
            let elapsed = self
                .last_seen
                .get(&id)
                .map(|seen| seen.elapsed())
                .unwrap_or_else(|| Duration::ZERO);
            let missed = (elapsed.as_millis() / interval.as_millis().max(1)) as u32;

            let state = if missed >= self.config.failure_threshold {
                NodeState::Dead
            } else if missed >= self.config.suspicion_threshold {
                NodeState::Suspect
            } else {
                NodeState::Active
            };
            self.set_state(&id, state);
        }
    }
}

#[async_trait]
impl Managed for ClusterMembership {
    fn name(&self) -> &'static str {
        "membership"
    }

    async fn open(&self) -> Result<()> {
        self.seed_snapshot();

        // Peers that have never spoken start their clocks at open time so
        // a slow starter is not declared dead instantly.
        let now = Instant::now();
        for node in self.metadata.bootstrap() {
            self.last_seen.insert(node.id().clone(), now);
        }

        // Record inbound heartbeats.
        let last_seen = self.last_seen.clone();
        self.messaging.subscribe(
            HEARTBEAT_SUBJECT,
            Arc::new(move |_from, payload: Bytes| {
                let last_seen = last_seen.clone();
                Box::pin(async move {
                    if let Ok(beat) = serde_json::from_slice::<Heartbeat>(&payload) {
                        last_seen.insert(beat.from, Instant::now());
                    }
                    Ok(Bytes::new())
                })
            }),
        );

        let mut tasks = self.tasks.lock().await;

        // Announce ourselves to every peer.
        let messaging = self.messaging.clone();
        let local = self.metadata.local().clone();
        let peers: Vec<Endpoint> = self
            .metadata
            .bootstrap()
            .filter(|n| n.id() != local.id())
            .map(|n| n.endpoint().clone())
            .collect();
        tasks.spawn_periodic(
            "membership-heartbeat",
            self.config.heartbeat_interval,
            move |_tick| {
                let messaging = messaging.clone();
                let peers = peers.clone();
                let beat = Heartbeat {
                    from: local.id().clone(),
                };
                async move {
                    let payload = match serde_json::to_vec(&beat) {
                        Ok(bytes) => Bytes::from(bytes),
                        Err(e) => {
                            warn!(error = %e, "Failed to encode heartbeat");
                            return;
                        }
                    };
                    for peer in &peers {
                        if let Err(e) = messaging
                            .send(peer, HEARTBEAT_SUBJECT, payload.clone())
                            .await
                        {
                            debug!(peer = %peer, error = %e, "Heartbeat not delivered");
                        }
                    }
                }
            },
        );

        // Detect missed heartbeats at half the heartbeat interval.
        let weak = self.weak_self.clone();
        let check_interval = (self.config.heartbeat_interval / 2).max(Duration::from_millis(1));
        tasks.spawn_periodic("membership-detector", check_interval, move |_tick| {
            let weak = weak.clone();
            async move {
                if let Some(this) = weak.upgrade() {
                    this.check_liveness();
                }
            }
        });

        self.open.store(true, Ordering::SeqCst);
        info!(node = %self.metadata.local().id(), "Membership opened");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.tasks.lock().await.shutdown_all().await;
        self.messaging.unsubscribe(HEARTBEAT_SUBJECT);
        self.open.store(false, Ordering::SeqCst);
        info!(node = %self.metadata.local().id(), "Membership closed");
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}
