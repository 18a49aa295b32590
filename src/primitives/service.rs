//! The primitive service: name-to-primitive factory routed by hash.
//!
//! A primitive name always resolves to the same partition:
//! `partition_of(name) = xxhash64(name) mod N + 1` with a fixed seed, so
//! routing is stable across nodes and process restarts for as long as
//! the partition count is.

use std::collections::BTreeSet;
use std::hash::Hasher;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::{Value, json};
use tracing::debug;
use twox_hash::XxHash64;

use crate::constants::ROUTING_HASH_SEED;
use crate::error::{ConclaveError, Result};
use crate::partition::PartitionService;
use crate::proxy::{
    self, EventListener, PrimitiveProxy, ProxyFactory, ProxyOperation, ProxyOptions, SessionProxy,
};
use crate::primitives::registry::{COUNTER_TYPE, MAP_TYPE, PrimitiveTypeRegistry};
use crate::session::SessionManager;
use crate::types::PartitionId;

/// Route a primitive name onto a partition.
pub fn partition_of(name: &str, num_partitions: usize) -> PartitionId {
    let mut hasher = XxHash64::with_seed(ROUTING_HASH_SEED);
    hasher.write(name.as_bytes());
    PartitionId::new((hasher.finish() % num_partitions.max(1) as u64) as u32 + 1)
}

/// Factory for named distributed primitives.
pub struct PrimitiveService {
    partitions: Arc<PartitionService>,
    sessions: Arc<SessionManager>,
    registry: Arc<PrimitiveTypeRegistry>,
    defaults: ProxyOptions,
    runtime_open: Arc<AtomicBool>,
}

impl PrimitiveService {
    /// Create the service. `runtime_open` is the composition root's open
    /// flag; primitive calls are rejected with `NotOpen` while it is
    /// false.
    pub fn new(
        partitions: Arc<PartitionService>,
        sessions: Arc<SessionManager>,
        registry: Arc<PrimitiveTypeRegistry>,
        defaults: ProxyOptions,
        runtime_open: Arc<AtomicBool>,
    ) -> Arc<Self> {
        Arc::new(Self {
            partitions,
            sessions,
            registry,
            defaults,
            runtime_open,
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.runtime_open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ConclaveError::NotOpen)
        }
    }

    /// The partition a name routes to.
    pub fn partition_of(&self, name: &str) -> PartitionId {
        partition_of(name, self.partitions.len())
    }

    /// Build a primitive with the service's default proxy options.
    pub async fn primitive(&self, name: &str, type_id: &str) -> Result<Primitive> {
        self.primitive_with(name, type_id, self.defaults.clone())
            .await
    }

    /// Build a primitive with explicit proxy options.
    pub async fn primitive_with(
        &self,
        name: &str,
        type_id: &str,
        options: ProxyOptions,
    ) -> Result<Primitive> {
        self.ensure_open()?;
        // Fail fast on unregistered types.
        self.registry.get(type_id)?;

        let partition = self.partition_of(name);
        debug!(primitive = name, type_id, partition = %partition, "Building primitive");

        let factory: ProxyFactory = {
            let sessions = self.sessions.clone();
            let name = name.to_string();
            let type_id = type_id.to_string();
            let consistency = options.consistency;
            Arc::new(move || {
                let sessions = sessions.clone();
                let name = name.clone();
                let type_id = type_id.clone();
                Box::pin(async move {
                    let session = sessions
                        .open_session(partition, &name, &type_id, consistency)
                        .await?;
                    Ok(SessionProxy::new(session) as Arc<dyn PrimitiveProxy>)
                })
            })
        };

        let proxy = proxy::assemble(factory, options).await?;
        Ok(match type_id {
            COUNTER_TYPE => Primitive::Counter(DistributedCounter { proxy }),
            MAP_TYPE => Primitive::Map(DistributedMap { proxy }),
            _ => Primitive::Generic(proxy),
        })
    }

    /// List the names of all primitives of a type, cluster-wide.
    pub async fn list(&self, type_id: &str) -> Result<BTreeSet<String>> {
        self.ensure_open()?;
        self.sessions.list_primitives(type_id).await
    }

    /// Registered primitive type ids.
    pub fn type_ids(&self) -> Vec<String> {
        self.registry.ids()
    }
}

/// A built primitive, tagged by kind.
pub enum Primitive {
    /// Distributed counter.
    Counter(DistributedCounter),
    /// Distributed map.
    Map(DistributedMap),
    /// A primitive of a user-registered type, exposed as its proxy.
    Generic(Arc<dyn PrimitiveProxy>),
}

impl Primitive {
    /// The primitive's name.
    pub fn name(&self) -> &str {
        match self {
            Primitive::Counter(c) => c.proxy.name(),
            Primitive::Map(m) => m.proxy.name(),
            Primitive::Generic(p) => p.name(),
        }
    }

    /// Unwrap as a counter.
    pub fn into_counter(self) -> Option<DistributedCounter> {
        match self {
            Primitive::Counter(c) => Some(c),
            _ => None,
        }
    }

    /// Unwrap as a map.
    pub fn into_map(self) -> Option<DistributedMap> {
        match self {
            Primitive::Map(m) => Some(m),
            _ => None,
        }
    }
}

fn expect_i64(value: Value) -> Result<i64> {
    value
        .as_i64()
        .ok_or_else(|| ConclaveError::Application(format!("unexpected output {}", value)))
}

/// Typed client for the built-in counter.
pub struct DistributedCounter {
    proxy: Arc<dyn PrimitiveProxy>,
}

impl DistributedCounter {
    /// Current value.
    pub async fn get(&self) -> Result<i64> {
        expect_i64(
            self.proxy
                .execute(ProxyOperation::query("get", json!({})))
                .await?,
        )
    }

    /// Add `delta` and return the new value.
    pub async fn add(&self, delta: i64) -> Result<i64> {
        expect_i64(
            self.proxy
                .execute(ProxyOperation::command("increment", json!({"delta": delta})))
                .await?,
        )
    }

    /// Increment by one and return the new value.
    pub async fn increment(&self) -> Result<i64> {
        self.add(1).await
    }

    /// Set the value.
    pub async fn set(&self, value: i64) -> Result<()> {
        self.proxy
            .execute(ProxyOperation::command("set", json!({"value": value})))
            .await?;
        Ok(())
    }

    /// Close the counter's proxy stack.
    pub async fn close(&self) -> Result<()> {
        self.proxy.close().await
    }
}

/// Typed client for the built-in map.
pub struct DistributedMap {
    proxy: Arc<dyn PrimitiveProxy>,
}

impl DistributedMap {
    /// Insert or replace a value, returning the previous one.
    pub async fn put(&self, key: &str, value: Value) -> Result<Option<Value>> {
        let previous = self
            .proxy
            .execute(ProxyOperation::command(
                "put",
                json!({"key": key, "value": value}),
            ))
            .await?;
        Ok((!previous.is_null()).then_some(previous))
    }

    /// Get a value.
    pub async fn get(&self, key: &str) -> Result<Option<Value>> {
        let value = self
            .proxy
            .execute(ProxyOperation::query("get", json!({"key": key})))
            .await?;
        Ok((!value.is_null()).then_some(value))
    }

    /// Remove a key, returning the removed value.
    pub async fn remove(&self, key: &str) -> Result<Option<Value>> {
        let previous = self
            .proxy
            .execute(ProxyOperation::command("remove", json!({"key": key})))
            .await?;
        Ok((!previous.is_null()).then_some(previous))
    }

    /// Number of entries.
    pub async fn size(&self) -> Result<usize> {
        Ok(expect_i64(
            self.proxy
                .execute(ProxyOperation::query("size", json!({})))
                .await?,
        )? as usize)
    }

    /// Register a listener for update/remove events on this map.
    pub fn on_event(&self, listener: EventListener) {
        self.proxy.on_event(listener);
    }

    /// Close the map's proxy stack.
    pub async fn close(&self) -> Result<()> {
        self.proxy.close().await
    }
}
