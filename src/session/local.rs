//! Embedded in-process partition participant.
//!
//! `LocalParticipant` hosts the session registry and the primitive state
//! machines for one partition replica. Replication itself is behind the
//! participant seam; within the replica set, the lowest node id stands
//! in for the elected leader, and the other replicas answer every call
//! with a `NotLeader` hint so clients exercise the same retargeting path
//! they would against a real consensus group.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::{Notify, broadcast};
use tracing::{debug, info};

use crate::error::Result;
use crate::primitives::registry::{OperationContext, PrimitiveStateMachine, PrimitiveTypeRegistry};
use crate::session::participant::{
    CloseSessionRequest, CommandRequest, KeepAliveRequest, ListPrimitivesRequest,
    OpenSessionRequest, Operation, ParticipantEvent, QueryRequest, RaftParticipant, SessionReply,
};
use crate::tasks::TaskRegistry;
use crate::types::{NodeId, PartitionId, SessionId};

/// How often the participant sweeps for expired sessions.
const EXPIRY_SWEEP_INTERVAL: Duration = Duration::from_millis(250);

/// Capacity of the participant event channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

struct SessionInner {
    timeout: Duration,
    last_keepalive: Instant,
    expired: bool,
    /// Next command sequence this session expects to apply.
    next_sequence: u64,
    /// Outputs of applied commands, kept for duplicate acknowledgement.
    applied: BTreeMap<u64, Value>,
}

struct SessionEntry {
    inner: tokio::sync::Mutex<SessionInner>,
    /// Signalled whenever a command applies, releasing parked successors.
    applied_notify: Notify,
}

type MachineKey = (String, String);

/// In-process partition replica hosting sessions and state machines.
pub struct LocalParticipant {
    partition: PartitionId,
    node: NodeId,
    members: BTreeSet<NodeId>,
    registry: Arc<PrimitiveTypeRegistry>,
    machines: Mutex<HashMap<MachineKey, Box<dyn PrimitiveStateMachine>>>,
    sessions: dashmap::DashMap<SessionId, Arc<SessionEntry>>,
    next_session: AtomicU64,
    events: broadcast::Sender<ParticipantEvent>,
    sweeper: tokio::sync::Mutex<TaskRegistry>,
    open: AtomicBool,
}

impl LocalParticipant {
    /// Create a participant for one partition replica.
    pub fn new(
        partition: PartitionId,
        node: NodeId,
        members: BTreeSet<NodeId>,
        registry: Arc<PrimitiveTypeRegistry>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            partition,
            node,
            members,
            registry,
            machines: Mutex::new(HashMap::new()),
            sessions: dashmap::DashMap::new(),
            next_session: AtomicU64::new(0),
            events,
            sweeper: tokio::sync::Mutex::new(TaskRegistry::new()),
            open: AtomicBool::new(false),
        })
    }

    /// The node standing in for the partition leader: the lowest id in
    /// the replica set.
    pub fn leader(&self) -> &NodeId {
        self.members.iter().next().unwrap_or(&self.node)
    }

    fn is_leader(&self) -> bool {
        self.leader() == &self.node
    }

    fn not_leader(&self) -> SessionReply {
        SessionReply::NotLeader {
            hint: Some(self.leader().clone()),
        }
    }

    /// Bring the participant up: join or bootstrap the replica group and
    /// start the expiry sweeper.
    pub async fn open(self: &Arc<Self>) -> Result<()> {
        let weak = Arc::downgrade(self);
        self.sweeper.lock().await.spawn_periodic(
            "session-expiry-sweep",
            EXPIRY_SWEEP_INTERVAL,
            move |_tick| {
                let weak = weak.clone();
                async move {
                    if let Some(this) = weak.upgrade() {
                        this.sweep_expired().await;
                    }
                }
            },
        );
        self.open.store(true, Ordering::SeqCst);
        info!(partition = %self.partition, node = %self.node, "Participant opened");
        Ok(())
    }

    /// Tear the participant down.
    pub async fn close(&self) -> Result<()> {
        self.sweeper.lock().await.shutdown_all().await;
        self.open.store(false, Ordering::SeqCst);
        info!(partition = %self.partition, node = %self.node, "Participant closed");
        Ok(())
    }

    /// Whether the participant is open.
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Declare a session expired immediately.
    ///
    /// Used by fault-injection tests; the sweeper produces the same
    /// transition for sessions whose keepalives stop.
    pub async fn expire_session(&self, session: SessionId) {
        if let Some(entry) = self.sessions.get(&session).map(|e| e.clone()) {
            let mut inner = entry.inner.lock().await;
            if !inner.expired {
                inner.expired = true;
                drop(inner);
                entry.applied_notify.notify_waiters();
                let _ = self
                    .events
                    .send(ParticipantEvent::SessionExpired { session });
                debug!(partition = %self.partition, %session, "Session expired");
            }
        }
    }

    /// Declare every session on this replica expired. Fault injection
    /// for tests exercising the recovery path.
    pub async fn expire_all_sessions(&self) {
        let ids: Vec<SessionId> = self.sessions.iter().map(|e| *e.key()).collect();
        for id in ids {
            self.expire_session(id).await;
        }
    }

    async fn sweep_expired(&self) {
        let candidates: Vec<(SessionId, Arc<SessionEntry>)> = self
            .sessions
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        for (id, entry) in candidates {
            let timed_out = {
                let inner = entry.inner.lock().await;
                !inner.expired && inner.last_keepalive.elapsed() > inner.timeout
            };
            if timed_out {
                self.expire_session(id).await;
            }
        }
    }

    fn ensure_machine(&self, primitive_type: &str, primitive: &str) -> Result<()> {
        let descriptor = self.registry.get(primitive_type)?;
        let mut machines = self.machines.lock().expect("machine table poisoned");
        machines
            .entry((primitive_type.to_string(), primitive.to_string()))
            .or_insert_with(|| descriptor.new_state_machine());
        Ok(())
    }

    fn apply_operation(&self, session: SessionId, operation: &Operation) -> Result<Value> {
        self.ensure_machine(&operation.primitive_type, &operation.primitive)?;

        let mut context = OperationContext::new(session);
        let output = {
            let mut machines = self.machines.lock().expect("machine table poisoned");
            let machine = machines
                .get_mut(&(
                    operation.primitive_type.clone(),
                    operation.primitive.clone(),
                ))
                .expect("machine created above");
            machine.apply(&mut context, &operation.name, &operation.input)
        };

        for payload in context.into_events() {
            let _ = self.events.send(ParticipantEvent::Primitive {
                primitive: operation.primitive.clone(),
                payload,
            });
        }
        output
    }

    /// Map an application-level failure into a protocol reply; propagate
    /// everything else.
    fn into_reply(result: Result<Value>) -> Result<SessionReply> {
        match result {
            Ok(output) => Ok(SessionReply::Output(output)),
            Err(crate::error::ConclaveError::Application(message)) => {
                Ok(SessionReply::Failure { message })
            }
            Err(other) => Err(other),
        }
    }
}

#[async_trait]
impl RaftParticipant for LocalParticipant {
    fn partition_id(&self) -> PartitionId {
        self.partition
    }

    fn node(&self) -> &NodeId {
        &self.node
    }

    async fn open_session(&self, request: OpenSessionRequest) -> Result<SessionReply> {
        if !self.is_leader() {
            return Ok(self.not_leader());
        }

        // Creating the primitive's state machine eagerly makes a freshly
        // built primitive visible to listings before its first operation.
        self.ensure_machine(&request.primitive_type, &request.primitive)?;

        let id = SessionId::new(self.next_session.fetch_add(1, Ordering::SeqCst) + 1);
        self.sessions.insert(
            id,
            Arc::new(SessionEntry {
                inner: tokio::sync::Mutex::new(SessionInner {
                    timeout: request.timeout,
                    last_keepalive: Instant::now(),
                    expired: false,
                    next_sequence: 1,
                    applied: BTreeMap::new(),
                }),
                applied_notify: Notify::new(),
            }),
        );
        debug!(
            partition = %self.partition,
            session = %id,
            client = %request.client_id,
            primitive = %request.primitive,
            "Session opened"
        );
        Ok(SessionReply::Output(json!(id.value())))
    }

    async fn keep_alive(&self, request: KeepAliveRequest) -> Result<SessionReply> {
        if !self.is_leader() {
            return Ok(self.not_leader());
        }
        let Some(entry) = self.sessions.get(&request.session).map(|e| e.clone()) else {
            return Ok(SessionReply::Expired {
                session: request.session,
            });
        };
        let mut inner = entry.inner.lock().await;
        if inner.expired || inner.last_keepalive.elapsed() > inner.timeout {
            inner.expired = true;
            return Ok(SessionReply::Expired {
                session: request.session,
            });
        }
        inner.last_keepalive = Instant::now();
        Ok(SessionReply::Output(Value::Null))
    }

    async fn close_session(&self, request: CloseSessionRequest) -> Result<SessionReply> {
        if !self.is_leader() {
            return Ok(self.not_leader());
        }
        self.sessions.remove(&request.session);
        debug!(partition = %self.partition, session = %request.session, "Session closed");
        Ok(SessionReply::Output(Value::Null))
    }

    async fn submit(&self, request: CommandRequest) -> Result<SessionReply> {
        if !self.is_leader() {
            return Ok(self.not_leader());
        }
        let Some(entry) = self.sessions.get(&request.session).map(|e| e.clone()) else {
            return Ok(SessionReply::Expired {
                session: request.session,
            });
        };

        loop {
            let mut inner = entry.inner.lock().await;
            if inner.expired {
                return Ok(SessionReply::Expired {
                    session: request.session,
                });
            }

            // Duplicate of an applied command: acknowledge with the
            // original output, without re-applying.
            if request.sequence < inner.next_sequence {
                let output = inner
                    .applied
                    .get(&request.sequence)
                    .cloned()
                    .unwrap_or(Value::Null);
                return Ok(SessionReply::Output(output));
            }

            if request.sequence == inner.next_sequence {
                let reply = Self::into_reply(self.apply_operation(request.session, &request.operation))?;
                inner.next_sequence += 1;
                if let SessionReply::Output(output) = &reply {
                    inner.applied.insert(request.sequence, output.clone());
                } else {
                    inner.applied.insert(request.sequence, Value::Null);
                }
                drop(inner);
                entry.applied_notify.notify_waiters();
                return Ok(reply);
            }

            // A lower-sequenced command from this session has not applied
            // yet; park until it does.
            let notified = entry.applied_notify.notified();
            drop(inner);
            notified.await;
        }
    }

    async fn query(&self, request: QueryRequest) -> Result<SessionReply> {
        if !self.is_leader() {
            return Ok(self.not_leader());
        }
        let Some(entry) = self.sessions.get(&request.session).map(|e| e.clone()) else {
            return Ok(SessionReply::Expired {
                session: request.session,
            });
        };
        {
            let inner = entry.inner.lock().await;
            if inner.expired {
                return Ok(SessionReply::Expired {
                    session: request.session,
                });
            }
        }
        Self::into_reply(self.apply_operation(request.session, &request.operation))
    }

    async fn primitive_names(&self, request: ListPrimitivesRequest) -> Result<SessionReply> {
        if !self.is_leader() {
            return Ok(self.not_leader());
        }
        let machines = self.machines.lock().expect("machine table poisoned");
        let names: Vec<&str> = machines
            .keys()
            .filter(|(type_id, _)| type_id == &request.type_id)
            .map(|(_, name)| name.as_str())
            .collect();
        Ok(SessionReply::Output(json!(names)))
    }

    fn subscribe_events(&self) -> broadcast::Receiver<ParticipantEvent> {
        self.events.subscribe()
    }
}
