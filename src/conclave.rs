//! The composition root: wires the layered runtime together and drives
//! its lifecycle.
//!
//! Open order (each step awaited, serialized on the orchestration
//! context): transport → membership → communication → events →
//! partitions → sessions → REST. A failure mid-open closes the already
//! opened components in reverse order before surfacing. Close is the
//! exact reverse, idempotent, and tolerant of a runtime that never
//! opened; the orchestration context is released last.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::info;

use crate::cluster::communication::ClusterCommunicator;
use crate::cluster::events::ClusterEventBus;
use crate::cluster::membership::{ClusterMembership, MembershipConfig};
use crate::cluster::node::{ClusterMetadata, Node};
use crate::constants::{
    DEFAULT_CLUSTER_NAME, DEFAULT_MAX_TIMEOUT, DEFAULT_MIN_TIMEOUT, DEFAULT_SESSION_TIMEOUT,
};
use crate::error::{ConclaveError, Result};
use crate::lifecycle::{self, Managed, SerialContext};
use crate::partition::service::{PartitionService, RaftPartition};
use crate::partition::topology::{PartitionMetadata, plan_partitions, validate_partitions};
use crate::primitives::registry::{PrimitiveTypeDescriptor, PrimitiveTypeRegistry};
use crate::primitives::service::PrimitiveService;
use crate::proxy::ProxyOptions;
use crate::rest::StatusServer;
use crate::session::manager::{SessionConfig, SessionManager};
use crate::transport::LoopbackHub;

/// The assembled coordination runtime.
pub struct Conclave {
    cluster_name: String,
    components: Vec<Arc<dyn Managed>>,
    context: SerialContext,
    open: Arc<AtomicBool>,
    membership: Arc<ClusterMembership>,
    communicator: Arc<ClusterCommunicator>,
    events: Arc<ClusterEventBus>,
    partitions: Arc<PartitionService>,
    sessions: Arc<SessionManager>,
    primitives: Arc<PrimitiveService>,
}

impl Conclave {
    /// Start configuring a runtime.
    pub fn builder() -> ConclaveBuilder {
        ConclaveBuilder::default()
    }

    /// The configured cluster name.
    pub fn cluster_name(&self) -> &str {
        &self.cluster_name
    }

    /// Bring the runtime up in dependency order.
    ///
    /// If any component fails to open, everything opened so far is
    /// closed in reverse order before the error surfaces. The `open`
    /// flag is set only after the last component reports completion.
    pub async fn open(&self) -> Result<()> {
        if self.open.load(Ordering::SeqCst) {
            return Ok(());
        }
        lifecycle::open_all(&self.context, &self.components).await?;
        self.open.store(true, Ordering::SeqCst);
        info!(cluster = %self.cluster_name, "Started");
        Ok(())
    }

    /// Tear the runtime down in reverse order.
    ///
    /// Idempotent, tolerant of a runtime that never opened, and always
    /// resolves: component close errors are logged, not propagated. The
    /// orchestration context is released last.
    pub async fn close(&self) -> Result<()> {
        self.open.store(false, Ordering::SeqCst);
        lifecycle::close_all(&self.context, &self.components).await;
        self.context.release();
        info!(cluster = %self.cluster_name, "Stopped");
        Ok(())
    }

    /// Whether the runtime is open.
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Whether the runtime is closed.
    pub fn is_closed(&self) -> bool {
        !self.is_open()
    }

    /// The cluster membership service.
    pub fn membership(&self) -> &Arc<ClusterMembership> {
        &self.membership
    }

    /// The typed request-reply fabric.
    pub fn communication(&self) -> &Arc<ClusterCommunicator> {
        &self.communicator
    }

    /// The cluster-wide event fabric.
    pub fn events(&self) -> &Arc<ClusterEventBus> {
        &self.events
    }

    /// The partition service.
    pub fn partitions(&self) -> &Arc<PartitionService> {
        &self.partitions
    }

    /// The session manager.
    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// The primitive factory surface.
    pub fn primitives(&self) -> &Arc<PrimitiveService> {
        &self.primitives
    }
}

/// Builder deriving the partition topology from bootstrap membership and
/// assembling the runtime.
pub struct ConclaveBuilder {
    cluster_name: String,
    http_port: u16,
    local_node: Option<Node>,
    bootstrap_nodes: Vec<Node>,
    num_partitions: usize,
    partition_size: usize,
    partitions: Option<Vec<PartitionMetadata>>,
    primitive_types: Vec<PrimitiveTypeDescriptor>,
    data_dir: PathBuf,
    session_timeout: Duration,
    min_timeout: Duration,
    max_timeout: Duration,
    proxy_defaults: ProxyOptions,
    membership_config: MembershipConfig,
    hub: Option<Arc<LoopbackHub>>,
}

impl Default for ConclaveBuilder {
    fn default() -> Self {
        Self {
            cluster_name: DEFAULT_CLUSTER_NAME.to_string(),
            http_port: 0,
            local_node: None,
            bootstrap_nodes: Vec::new(),
            num_partitions: 0,
            partition_size: 0,
            partitions: None,
            primitive_types: Vec::new(),
            data_dir: PathBuf::from("data"),
            session_timeout: DEFAULT_SESSION_TIMEOUT,
            min_timeout: DEFAULT_MIN_TIMEOUT,
            max_timeout: DEFAULT_MAX_TIMEOUT,
            proxy_defaults: ProxyOptions::default(),
            membership_config: MembershipConfig::default(),
            hub: None,
        }
    }
}

impl ConclaveBuilder {
    /// Set the cluster name.
    pub fn with_cluster_name(mut self, name: impl Into<String>) -> Self {
        self.cluster_name = name.into();
        self
    }

    /// Set the HTTP status port. Zero disables the endpoint.
    pub fn with_http_port(mut self, port: u16) -> Self {
        self.http_port = port;
        self
    }

    /// Set the local node. Mandatory.
    pub fn with_local_node(mut self, node: Node) -> Self {
        self.local_node = Some(node);
        self
    }

    /// Set the bootstrap nodes. Mandatory, non-empty.
    pub fn with_bootstrap_nodes(mut self, nodes: impl IntoIterator<Item = Node>) -> Self {
        self.bootstrap_nodes = nodes.into_iter().collect();
        self
    }

    /// Set the partition count. Zero derives `|bootstrap_nodes|`.
    pub fn with_num_partitions(mut self, num_partitions: usize) -> Self {
        self.num_partitions = num_partitions;
        self
    }

    /// Set the replication factor. Zero derives `min(|bootstrap|, 3)`.
    pub fn with_partition_size(mut self, partition_size: usize) -> Self {
        self.partition_size = partition_size;
        self
    }

    /// Supply an explicit topology, overriding the derived one.
    pub fn with_partitions(
        mut self,
        partitions: impl IntoIterator<Item = PartitionMetadata>,
    ) -> Self {
        self.partitions = Some(partitions.into_iter().collect());
        self
    }

    /// Register an additional primitive type.
    pub fn with_primitive_type(mut self, descriptor: PrimitiveTypeDescriptor) -> Self {
        self.primitive_types.push(descriptor);
        self
    }

    /// Set the data directory; partition state lives under
    /// `<data_dir>/partitions/<id>/`.
    pub fn with_data_dir(mut self, data_dir: impl Into<PathBuf>) -> Self {
        self.data_dir = data_dir.into();
        self
    }

    /// Set the server-side session timeout requested for sessions.
    pub fn with_session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = timeout;
        self
    }

    /// Set the per-operation deadline bounds.
    pub fn with_operation_timeouts(mut self, min: Duration, max: Duration) -> Self {
        self.min_timeout = min;
        self.max_timeout = max;
        self
    }

    /// Set the default proxy stack options for built primitives.
    pub fn with_proxy_defaults(mut self, options: ProxyOptions) -> Self {
        self.proxy_defaults = options;
        self
    }

    /// Tune membership liveness detection.
    pub fn with_membership_config(mut self, config: MembershipConfig) -> Self {
        self.membership_config = config;
        self
    }

    /// Share a loopback hub with other runtimes in this process,
    /// forming an in-process cluster.
    pub fn with_transport_hub(mut self, hub: Arc<LoopbackHub>) -> Self {
        self.hub = Some(hub);
        self
    }

    /// Assemble the runtime. Fails with `ConfigurationInvalid` on an
    /// inconsistent configuration; no component is opened yet.
    pub fn build(self) -> Result<Conclave> {
        let local = self.local_node.ok_or_else(|| {
            ConclaveError::ConfigurationInvalid("local node is required".into())
        })?;
        if self.bootstrap_nodes.is_empty() {
            return Err(ConclaveError::ConfigurationInvalid(
                "bootstrap nodes are required".into(),
            ));
        }
        if self.min_timeout > self.max_timeout {
            return Err(ConclaveError::ConfigurationInvalid(format!(
                "min timeout {:?} exceeds max timeout {:?}",
                self.min_timeout, self.max_timeout
            )));
        }

        let topology = match self.partitions {
            Some(partitions) => {
                validate_partitions(&self.bootstrap_nodes, &partitions)?;
                partitions
            }
            None => plan_partitions(
                &self.bootstrap_nodes,
                self.num_partitions,
                self.partition_size,
            )?,
        };

        let hub = self.hub.unwrap_or_else(LoopbackHub::new);
        let transport = hub.transport(local.endpoint().clone());

        let metadata = ClusterMetadata::new(local.clone(), self.bootstrap_nodes)?;
        let membership = ClusterMembership::new(
            metadata,
            transport.clone(),
            self.membership_config,
        );
        let communicator = ClusterCommunicator::new(membership.clone(), transport.clone());
        let events = ClusterEventBus::new(communicator.clone());

        let registry = PrimitiveTypeRegistry::with_builtins();
        for descriptor in self.primitive_types {
            registry.register(descriptor);
        }

        let partitions = PartitionService::new(
            topology
                .into_iter()
                .map(|p| {
                    RaftPartition::new(
                        p,
                        &self.data_dir,
                        local.id(),
                        registry.clone(),
                        communicator.clone(),
                    )
                })
                .collect(),
        );

        let sessions = SessionManager::new(
            SessionConfig {
                client_id: format!("{}-{}", self.cluster_name, local.id()),
                session_timeout: self.session_timeout,
                min_timeout: self.min_timeout,
                max_timeout: self.max_timeout,
            },
            local.id().clone(),
            partitions.clone(),
            communicator.clone(),
        );

        let open = Arc::new(AtomicBool::new(false));
        let primitives = PrimitiveService::new(
            partitions.clone(),
            sessions.clone(),
            registry,
            self.proxy_defaults,
            open.clone(),
        );

        let mut components: Vec<Arc<dyn Managed>> = vec![
            transport,
            membership.clone(),
            communicator.clone(),
            events.clone(),
            partitions.clone(),
            sessions.clone(),
        ];
        if self.http_port > 0 {
            components.push(StatusServer::new(
                local.endpoint().host().to_string(),
                self.http_port,
                open.clone(),
            ));
        }

        Ok(Conclave {
            cluster_name: self.cluster_name,
            components,
            context: SerialContext::new(),
            open,
            membership,
            communicator,
            events,
            partitions,
            sessions,
            primitives,
        })
    }
}
