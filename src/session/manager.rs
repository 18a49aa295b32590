//! Per-client session multiplexing and leader selection.
//!
//! The manager keeps a route table per partition (the embedded replica
//! for the local node, fabric-forwarding views for the rest), caches the
//! suspected leader, and retargets on `NotLeader` hints with a bounded
//! round-robin fallback. One keepalive loop services every open session
//! at an interval of half the session timeout.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::cluster::communication::ClusterCommunicator;
use crate::constants::KEEPALIVE_DIVISOR;
use crate::error::{ConclaveError, Result};
use crate::lifecycle::Managed;
use crate::metrics;
use crate::partition::{PartitionService, RaftPartition};
use crate::session::forward::ForwardingParticipant;
use crate::session::participant::{
    CloseSessionRequest, CommandRequest, KeepAliveRequest, ListPrimitivesRequest,
    OpenSessionRequest, Operation, QueryRequest, RaftParticipant, SessionReply,
};
use crate::session::session::{RaftSession, SessionState};
use crate::tasks::TaskRegistry;
use crate::types::{NodeId, PartitionId, ReadConsistency, SessionId};

/// Client-side session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Client identity carried in session-open requests.
    pub client_id: String,
    /// Server-side session timeout requested for new sessions.
    pub session_timeout: Duration,
    /// Lower bound for per-operation deadlines.
    pub min_timeout: Duration,
    /// Upper bound for per-operation deadlines.
    pub max_timeout: Duration,
}

impl SessionConfig {
    /// Deadline for one operation, drawn from `[min_timeout, max_timeout]`.
    ///
    /// Spreading deadlines across the configured band keeps a burst of
    /// simultaneous callers from all expiring in the same instant
    /// during an outage, the same desynchronization the keepalive
    /// interval gets from its jitter.
    fn operation_deadline(&self) -> Duration {
        let span = self.max_timeout.saturating_sub(self.min_timeout);
        self.min_timeout + span.mul_f64(fastrand::f64())
    }
}

struct RouteTable {
    members: Vec<NodeId>,
    participants: HashMap<NodeId, Arc<dyn RaftParticipant>>,
}

type SessionKey = (PartitionId, SessionId);

type CallFuture = Pin<Box<dyn Future<Output = Result<SessionReply>> + Send + 'static>>;

/// Session manager: one per runtime, shared by every proxy.
pub struct SessionManager {
    config: SessionConfig,
    local: NodeId,
    partitions: Arc<PartitionService>,
    communicator: Arc<ClusterCommunicator>,
    routes: DashMap<PartitionId, Arc<RouteTable>>,
    sessions: DashMap<SessionKey, Arc<RaftSession>>,
    leader_cache: DashMap<PartitionId, NodeId>,
    tasks: tokio::sync::Mutex<TaskRegistry>,
    open: AtomicBool,
    weak_self: Weak<SessionManager>,
}

impl SessionManager {
    /// Create the session manager.
    pub fn new(
        config: SessionConfig,
        local: NodeId,
        partitions: Arc<PartitionService>,
        communicator: Arc<ClusterCommunicator>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            config,
            local,
            partitions,
            communicator,
            routes: DashMap::new(),
            sessions: DashMap::new(),
            leader_cache: DashMap::new(),
            tasks: tokio::sync::Mutex::new(TaskRegistry::new()),
            open: AtomicBool::new(false),
            weak_self: weak.clone(),
        })
    }

    /// The client id this manager opens sessions under.
    pub fn client_id(&self) -> &str {
        &self.config.client_id
    }

    /// The suspected leader of a partition, if one is cached.
    pub fn suspected_leader(&self, partition: PartitionId) -> Option<NodeId> {
        self.leader_cache.get(&partition).map(|e| e.clone())
    }

    fn routes_for(&self, partition: &Arc<RaftPartition>) -> Arc<RouteTable> {
        self.routes
            .entry(partition.id())
            .or_insert_with(|| {
                let members: Vec<NodeId> =
                    partition.metadata().members().iter().cloned().collect();
                let mut participants: HashMap<NodeId, Arc<dyn RaftParticipant>> = HashMap::new();
                for member in &members {
                    let participant: Arc<dyn RaftParticipant> = match partition.replica() {
                        Some(replica) if member == &self.local => replica.clone(),
                        _ => ForwardingParticipant::new(
                            partition.id(),
                            member.clone(),
                            self.communicator.clone(),
                        ),
                    };
                    participants.insert(member.clone(), participant);
                }
                Arc::new(RouteTable {
                    members,
                    participants,
                })
            })
            .clone()
    }

    fn next_target(routes: &RouteTable, current: &NodeId) -> NodeId {
        let position = routes
            .members
            .iter()
            .position(|m| m == current)
            .unwrap_or(0);
        routes.members[(position + 1) % routes.members.len()].clone()
    }

    /// Run a participant call against the partition's suspected leader,
    /// retargeting on `NotLeader` hints. The probe is bounded by the
    /// replica set size plus one hint redirect.
    async fn call_leader<F>(&self, partition: PartitionId, call: F) -> Result<SessionReply>
    where
        F: Fn(Arc<dyn RaftParticipant>) -> CallFuture,
    {
        let handle = self.partitions.partition(partition).ok_or(
            ConclaveError::LeaderUnknown { partition },
        )?;
        let routes = self.routes_for(&handle);

        let mut target = self
            .leader_cache
            .get(&partition)
            .map(|e| e.clone())
            .filter(|t| routes.participants.contains_key(t))
            .unwrap_or_else(|| routes.members[0].clone());

        let mut last_error: Option<ConclaveError> = None;
        for _ in 0..=routes.members.len() {
            let participant = routes
                .participants
                .get(&target)
                .expect("route table covers replica set")
                .clone();

            match call(participant).await {
                Ok(SessionReply::NotLeader { hint }) => {
                    let next = hint
                        .filter(|h| routes.participants.contains_key(h))
                        .unwrap_or_else(|| Self::next_target(&routes, &target));
                    debug!(partition = %partition, from = %target, to = %next, "Retargeting to leader");
                    target = next;
                    self.leader_cache.insert(partition, target.clone());
                }
                Ok(reply) => {
                    self.leader_cache.insert(partition, target);
                    return Ok(reply);
                }
                Err(e) => {
                    debug!(partition = %partition, replica = %target, error = %e, "Replica unreachable");
                    last_error = Some(e);
                    target = Self::next_target(&routes, &target);
                }
            }
        }

        Err(ConclaveError::Unavailable {
            partition,
            detail: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no leader found within bounded probe".into()),
        })
    }

    /// Open a session on a partition, bound to one primitive.
    pub async fn open_session(
        &self,
        partition: PartitionId,
        primitive: &str,
        primitive_type: &str,
        consistency: ReadConsistency,
    ) -> Result<Arc<RaftSession>> {
        let request = OpenSessionRequest {
            client_id: self.config.client_id.clone(),
            primitive: primitive.to_string(),
            primitive_type: primitive_type.to_string(),
            timeout: self.config.session_timeout,
        };
        let reply = self
            .call_leader(partition, move |p| {
                let request = request.clone();
                Box::pin(async move { p.open_session(request).await })
            })
            .await?;

        let id = match reply {
            SessionReply::Output(value) => value
                .as_u64()
                .map(SessionId::new)
                .ok_or_else(|| {
                    ConclaveError::Transport("malformed session id in open reply".into())
                })?,
            SessionReply::Failure { message } => {
                return Err(ConclaveError::Application(message));
            }
            other => {
                return Err(ConclaveError::Unavailable {
                    partition,
                    detail: format!("unexpected open-session reply: {:?}", other),
                });
            }
        };

        let handle = self
            .partitions
            .partition(partition)
            .ok_or(ConclaveError::LeaderUnknown { partition })?;
        let session = RaftSession::new(
            id,
            handle,
            primitive.to_string(),
            primitive_type.to_string(),
            consistency,
            self.weak_self.clone(),
        );
        self.sessions.insert((partition, id), session.clone());
        debug!(partition = %partition, session = %id, primitive, "Session established");
        Ok(session)
    }

    pub(crate) async fn invoke_command(
        &self,
        session: &RaftSession,
        sequence: u64,
        operation: Operation,
    ) -> Result<Value> {
        let request = CommandRequest {
            session: session.id(),
            sequence,
            operation,
        };
        let deadline = self.config.operation_deadline();
        let reply = match tokio::time::timeout(
            deadline,
            self.call_leader(session.partition_id(), move |p| {
                let request = request.clone();
                Box::pin(async move { p.submit(request).await })
            }),
        )
        .await
        {
            Err(_) => return Err(ConclaveError::Timeout { elapsed: deadline }),
            Ok(Err(e)) => return Err(self.unreachable_error(session, e)),
            Ok(Ok(reply)) => reply,
        };
        self.handle_reply(session, reply)
    }

    pub(crate) async fn invoke_query(
        &self,
        session: &RaftSession,
        operation: Operation,
    ) -> Result<Value> {
        let request = QueryRequest {
            session: session.id(),
            consistency: session.consistency(),
            operation,
        };
        let deadline = self.config.operation_deadline();
        let reply = match tokio::time::timeout(
            deadline,
            self.call_leader(session.partition_id(), move |p| {
                let request = request.clone();
                Box::pin(async move { p.query(request).await })
            }),
        )
        .await
        {
            Err(_) => return Err(ConclaveError::Timeout { elapsed: deadline }),
            Ok(Err(e)) => return Err(self.unreachable_error(session, e)),
            Ok(Ok(reply)) => reply,
        };
        self.handle_reply(session, reply)
    }

    /// Translate a bounded-probe failure into the session-level error
    /// the caller is promised: once the leader has been unreachable for
    /// longer than the session timeout, the session transitions to
    /// suspended and the operation surfaces `SessionSuspended`.
    fn unreachable_error(&self, session: &RaftSession, error: ConclaveError) -> ConclaveError {
        if matches!(error, ConclaveError::Unavailable { .. })
            && session.since_contact() > self.config.session_timeout
        {
            if session.state() == SessionState::Open {
                warn!(session = %session.id(), "Session suspended: leader unreachable");
            }
            session.set_state(SessionState::Suspended);
            metrics::ERRORS
                .with_label_values(&["session_suspended"])
                .inc();
            return ConclaveError::SessionSuspended {
                session: session.id(),
            };
        }
        error
    }

    fn handle_reply(&self, session: &RaftSession, reply: SessionReply) -> Result<Value> {
        match reply {
            SessionReply::Output(value) => {
                session.mark_contact();
                if session.state() == SessionState::Suspended {
                    session.set_state(SessionState::Open);
                }
                Ok(value)
            }
            SessionReply::Expired { session: id } => {
                session.set_state(SessionState::Expired);
                metrics::ERRORS.with_label_values(&["session_expired"]).inc();
                Err(ConclaveError::SessionExpired { session: id })
            }
            SessionReply::Failure { message } => Err(ConclaveError::Application(message)),
            SessionReply::NotLeader { .. } => Err(ConclaveError::LeaderUnknown {
                partition: session.partition_id(),
            }),
        }
    }

    pub(crate) async fn close_session(&self, session: &RaftSession) -> Result<()> {
        let request = CloseSessionRequest {
            session: session.id(),
        };
        let result = self
            .call_leader(session.partition_id(), move |p| {
                let request = request.clone();
                Box::pin(async move { p.close_session(request).await })
            })
            .await;
        session.set_state(SessionState::Closed);
        self.sessions
            .remove(&(session.partition_id(), session.id()));
        result.map(|_| ())
    }

    /// Fan a primitive listing out over every partition and union the
    /// names.
    pub async fn list_primitives(&self, type_id: &str) -> Result<std::collections::BTreeSet<String>> {
        let mut names = std::collections::BTreeSet::new();
        for partition in self.partitions.partitions() {
            let request = ListPrimitivesRequest {
                type_id: type_id.to_string(),
            };
            let reply = self
                .call_leader(partition.id(), move |p| {
                    let request = request.clone();
                    Box::pin(async move { p.primitive_names(request).await })
                })
                .await?;
            if let SessionReply::Output(Value::Array(values)) = reply {
                for value in values {
                    if let Some(name) = value.as_str() {
                        names.insert(name.to_string());
                    }
                }
            }
        }
        Ok(names)
    }

    async fn keepalive_tick(&self) {
        let sessions: Vec<Arc<RaftSession>> = self
            .sessions
            .iter()
            .map(|e| e.value().clone())
            .collect();

        for session in sessions {
            match session.state() {
                SessionState::Expired | SessionState::Closed => continue,
                _ => {}
            }
            let request = KeepAliveRequest {
                session: session.id(),
            };
            let result = self
                .call_leader(session.partition_id(), move |p| {
                    let request = request.clone();
                    Box::pin(async move { p.keep_alive(request).await })
                })
                .await;

            match result {
                Ok(SessionReply::Output(_)) => {
                    metrics::KEEPALIVES.with_label_values(&["ok"]).inc();
                    session.mark_contact();
                    if session.state() == SessionState::Suspended {
                        debug!(session = %session.id(), "Session resumed after leader rediscovery");
                        session.set_state(SessionState::Open);
                    }
                }
                Ok(SessionReply::Expired { .. }) => {
                    metrics::KEEPALIVES.with_label_values(&["failed"]).inc();
                    session.set_state(SessionState::Expired);
                }
                Ok(_) | Err(_) => {
                    metrics::KEEPALIVES.with_label_values(&["failed"]).inc();
                    // The server is authoritative for expiry; locally we
                    // only suspend once the timeout has elapsed without
                    // contact.
                    if session.since_contact() > self.config.session_timeout
                        && session.state() == SessionState::Open
                    {
                        warn!(session = %session.id(), "Session suspended: leader unreachable");
                        session.set_state(SessionState::Suspended);
                    }
                }
            }
        }
    }
}

#[async_trait]
impl Managed for SessionManager {
    fn name(&self) -> &'static str {
        "sessions"
    }

    async fn open(&self) -> Result<()> {
        let base = self.config.session_timeout / KEEPALIVE_DIVISOR;
        // Jitter the keepalive cadence so a fleet of clients does not
        // synchronize against the same leader. Jitter only shortens the
        // interval: it must never exceed half the session timeout.
        let interval = base
            .mul_f64(0.85 + fastrand::f64() * 0.15)
            .max(Duration::from_millis(10));
        let weak = self.weak_self.clone();
        self.tasks
            .lock()
            .await
            .spawn_periodic("session-keepalive", interval, move |_tick| {
                let weak = weak.clone();
                async move {
                    if let Some(manager) = weak.upgrade() {
                        manager.keepalive_tick().await;
                    }
                }
            });
        self.open.store(true, Ordering::SeqCst);
        info!(client = %self.config.client_id, "Session manager opened");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.tasks.lock().await.shutdown_all().await;

        let sessions: Vec<Arc<RaftSession>> = self
            .sessions
            .iter()
            .map(|e| e.value().clone())
            .collect();
        for session in sessions {
            if let Err(e) = self.close_session(&session).await {
                debug!(session = %session.id(), error = %e, "Session close failed during teardown");
            }
        }
        self.sessions.clear();
        self.routes.clear();
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}
