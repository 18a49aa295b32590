//! The raw session-bound proxy at the bottom of the stack.

use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;
use crate::proxy::{EventListener, PrimitiveProxy, ProxyEvent, ProxyOperation};
use crate::session::participant::{OperationKind, ParticipantEvent};
use crate::session::session::{RaftSession, SessionState};

/// Proxy bound directly to one session.
///
/// Event relay runs on a dedicated task fed by the partition's
/// participant; listeners registered here are invoked inline on that
/// task, which is exactly why the blocking-aware adapter exists above.
pub struct SessionProxy {
    session: Arc<RaftSession>,
    listeners: Arc<Mutex<Vec<EventListener>>>,
}

impl SessionProxy {
    /// Create the proxy and start its event relay.
    pub fn new(session: Arc<RaftSession>) -> Arc<Self> {
        let proxy = Arc::new(Self {
            session: session.clone(),
            listeners: Arc::new(Mutex::new(Vec::new())),
        });

        if let Some(mut events) = session.subscribe_events() {
            let weak: Weak<SessionProxy> = Arc::downgrade(&proxy);
            let primitive = session.primitive().to_string();
            tokio::spawn(async move {
                while let Ok(event) = events.recv().await {
                    let Some(proxy) = weak.upgrade() else { break };
                    if let ParticipantEvent::Primitive { primitive: name, payload } = event {
                        if name == primitive {
                            let listeners = proxy.listeners.lock().expect("listeners poisoned");
                            for listener in listeners.iter() {
                                listener(ProxyEvent {
                                    primitive: name.clone(),
                                    payload: payload.clone(),
                                });
                            }
                        }
                    }
                }
            });
        }

        proxy
    }

    /// The backing session.
    pub fn session(&self) -> &Arc<RaftSession> {
        &self.session
    }
}

#[async_trait]
impl PrimitiveProxy for SessionProxy {
    fn name(&self) -> &str {
        self.session.primitive()
    }

    fn type_id(&self) -> &str {
        self.session.primitive_type()
    }

    fn session_state(&self) -> SessionState {
        self.session.state()
    }

    async fn execute(&self, operation: ProxyOperation) -> Result<Value> {
        match operation.kind {
            OperationKind::Command => self.session.submit(&operation.name, operation.input).await,
            OperationKind::Query => self.session.query(&operation.name, operation.input).await,
        }
    }

    fn on_event(&self, listener: EventListener) {
        self.listeners.lock().expect("listeners poisoned").push(listener);
    }

    async fn close(&self) -> Result<()> {
        self.session.close().await
    }
}
