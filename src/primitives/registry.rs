//! Primitive type registry.
//!
//! Primitive types are registered by string id; each entry supplies the
//! factory for the server-side state machine hosted by a partition
//! replica. The registry is an explicit map, not a discovery mechanism:
//! types must be registered before the runtime is built.

use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;

use crate::error::{ConclaveError, Result};
use crate::types::SessionId;

/// Type id of the built-in distributed counter.
pub const COUNTER_TYPE: &str = "counter";

/// Type id of the built-in distributed map.
pub const MAP_TYPE: &str = "map";

/// Context passed to a state machine for each applied operation.
pub struct OperationContext {
    session: SessionId,
    events: Vec<Value>,
}

impl OperationContext {
    pub(crate) fn new(session: SessionId) -> Self {
        Self {
            session,
            events: Vec::new(),
        }
    }

    /// The session that issued the operation.
    pub fn session(&self) -> SessionId {
        self.session
    }

    /// Publish an event to sessions listening on this primitive.
    pub fn publish(&mut self, event: Value) {
        self.events.push(event);
    }

    pub(crate) fn into_events(self) -> Vec<Value> {
        self.events
    }
}

/// Server-side state machine backing one named primitive.
///
/// Commands and queries both arrive through `apply`; queries are
/// expected not to mutate state.
pub trait PrimitiveStateMachine: Send {
    /// Apply an operation and produce its output.
    fn apply(&mut self, ctx: &mut OperationContext, op: &str, input: &Value) -> Result<Value>;
}

type StateMachineFactory = Arc<dyn Fn() -> Box<dyn PrimitiveStateMachine> + Send + Sync>;

/// Descriptor for a registered primitive type.
#[derive(Clone)]
pub struct PrimitiveTypeDescriptor {
    id: String,
    factory: StateMachineFactory,
}

impl PrimitiveTypeDescriptor {
    /// Create a descriptor from a type id and a state machine factory.
    pub fn new<F>(id: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> Box<dyn PrimitiveStateMachine> + Send + Sync + 'static,
    {
        Self {
            id: id.into(),
            factory: Arc::new(factory),
        }
    }

    /// The type id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Instantiate a fresh state machine for one named primitive.
    pub fn new_state_machine(&self) -> Box<dyn PrimitiveStateMachine> {
        (self.factory)()
    }
}

/// Registry mapping type ids to primitive type descriptors.
pub struct PrimitiveTypeRegistry {
    types: DashMap<String, PrimitiveTypeDescriptor>,
}

impl PrimitiveTypeRegistry {
    /// Create a registry with the built-in types pre-registered.
    pub fn with_builtins() -> Arc<Self> {
        let registry = Self {
            types: DashMap::new(),
        };
        registry.register(PrimitiveTypeDescriptor::new(COUNTER_TYPE, || {
            Box::new(super::kinds::CounterStateMachine::default())
        }));
        registry.register(PrimitiveTypeDescriptor::new(MAP_TYPE, || {
            Box::new(super::kinds::MapStateMachine::default())
        }));
        Arc::new(registry)
    }

    /// Create an empty registry.
    pub fn empty() -> Arc<Self> {
        Arc::new(Self {
            types: DashMap::new(),
        })
    }

    /// Register a type descriptor, replacing any previous entry with the
    /// same id.
    pub fn register(&self, descriptor: PrimitiveTypeDescriptor) {
        self.types.insert(descriptor.id().to_string(), descriptor);
    }

    /// Look up a descriptor by type id.
    pub fn get(&self, id: &str) -> Result<PrimitiveTypeDescriptor> {
        self.types
            .get(id)
            .map(|entry| entry.clone())
            .ok_or_else(|| {
                ConclaveError::ConfigurationInvalid(format!("unknown primitive type '{}'", id))
            })
    }

    /// All registered type ids.
    pub fn ids(&self) -> Vec<String> {
        self.types.iter().map(|e| e.key().clone()).collect()
    }
}
