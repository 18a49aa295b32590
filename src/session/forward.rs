//! Fabric-forwarding participant view.
//!
//! Nodes outside a partition's replica set (and replicas retargeting to
//! the leader) reach the partition through `ForwardingParticipant`,
//! which relays every call over the communication fabric to a replica's
//! registered handlers.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::cluster::communication::ClusterCommunicator;
use crate::error::Result;
use crate::session::local::LocalParticipant;
use crate::session::participant::{
    CloseSessionRequest, CommandRequest, KeepAliveRequest, ListPrimitivesRequest,
    OpenSessionRequest, ParticipantEvent, QueryRequest, RaftParticipant, SessionReply,
};
use crate::types::{NodeId, PartitionId};

const OPEN_SESSION: &str = "open-session";
const KEEP_ALIVE: &str = "keep-alive";
const CLOSE_SESSION: &str = "close-session";
const SUBMIT: &str = "submit";
const QUERY: &str = "query";
const LIST: &str = "list-primitives";

const ALL_OPS: [&str; 6] = [OPEN_SESSION, KEEP_ALIVE, CLOSE_SESSION, SUBMIT, QUERY, LIST];

fn subject(partition: PartitionId, op: &str) -> String {
    format!("raft/{}/{}", partition, op)
}

/// Register fabric handlers that expose a local replica to the cluster.
pub fn register_replica_handlers(
    communicator: &ClusterCommunicator,
    replica: &Arc<LocalParticipant>,
) {
    let partition = replica.partition_id();

    let r = replica.clone();
    communicator.subscribe(
        &subject(partition, OPEN_SESSION),
        move |_from: NodeId, request: OpenSessionRequest| {
            let r = r.clone();
            async move { r.open_session(request).await }
        },
    );

    let r = replica.clone();
    communicator.subscribe(
        &subject(partition, KEEP_ALIVE),
        move |_from: NodeId, request: KeepAliveRequest| {
            let r = r.clone();
            async move { r.keep_alive(request).await }
        },
    );

    let r = replica.clone();
    communicator.subscribe(
        &subject(partition, CLOSE_SESSION),
        move |_from: NodeId, request: CloseSessionRequest| {
            let r = r.clone();
            async move { r.close_session(request).await }
        },
    );

    let r = replica.clone();
    communicator.subscribe(
        &subject(partition, SUBMIT),
        move |_from: NodeId, request: CommandRequest| {
            let r = r.clone();
            async move { r.submit(request).await }
        },
    );

    let r = replica.clone();
    communicator.subscribe(
        &subject(partition, QUERY),
        move |_from: NodeId, request: QueryRequest| {
            let r = r.clone();
            async move { r.query(request).await }
        },
    );

    let r = replica.clone();
    communicator.subscribe(
        &subject(partition, LIST),
        move |_from: NodeId, request: ListPrimitivesRequest| {
            let r = r.clone();
            async move { r.primitive_names(request).await }
        },
    );
}

/// Remove the fabric handlers for a partition replica.
pub fn unregister_replica_handlers(communicator: &ClusterCommunicator, partition: PartitionId) {
    for op in ALL_OPS {
        communicator.unsubscribe(&subject(partition, op));
    }
}

/// Participant view that relays calls to a remote replica over the
/// communication fabric.
pub struct ForwardingParticipant {
    partition: PartitionId,
    target: NodeId,
    communicator: Arc<ClusterCommunicator>,
    // Remote event push is not wired through the fabric; subscribers of
    // a forwarding view observe no events.
    events: broadcast::Sender<ParticipantEvent>,
}

impl ForwardingParticipant {
    /// Create a forwarding view of `partition` addressed at `target`.
    pub fn new(
        partition: PartitionId,
        target: NodeId,
        communicator: Arc<ClusterCommunicator>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(1);
        Arc::new(Self {
            partition,
            target,
            communicator,
            events,
        })
    }
}

#[async_trait]
impl RaftParticipant for ForwardingParticipant {
    fn partition_id(&self) -> PartitionId {
        self.partition
    }

    fn node(&self) -> &NodeId {
        &self.target
    }

    async fn open_session(&self, request: OpenSessionRequest) -> Result<SessionReply> {
        self.communicator
            .request(&self.target, &subject(self.partition, OPEN_SESSION), &request)
            .await
    }

    async fn keep_alive(&self, request: KeepAliveRequest) -> Result<SessionReply> {
        self.communicator
            .request(&self.target, &subject(self.partition, KEEP_ALIVE), &request)
            .await
    }

    async fn close_session(&self, request: CloseSessionRequest) -> Result<SessionReply> {
        self.communicator
            .request(&self.target, &subject(self.partition, CLOSE_SESSION), &request)
            .await
    }

    async fn submit(&self, request: CommandRequest) -> Result<SessionReply> {
        self.communicator
            .request(&self.target, &subject(self.partition, SUBMIT), &request)
            .await
    }

    async fn query(&self, request: QueryRequest) -> Result<SessionReply> {
        self.communicator
            .request(&self.target, &subject(self.partition, QUERY), &request)
            .await
    }

    async fn primitive_names(&self, request: ListPrimitivesRequest) -> Result<SessionReply> {
        self.communicator
            .request(&self.target, &subject(self.partition, LIST), &request)
            .await
    }

    fn subscribe_events(&self) -> broadcast::Receiver<ParticipantEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::membership::{ClusterMembership, MembershipConfig};
    use crate::cluster::node::{ClusterMetadata, Node};
    use crate::lifecycle::Managed;
    use crate::primitives::registry::PrimitiveTypeRegistry;
    use crate::transport::{Endpoint, LoopbackHub};
    use serde_json::json;
    use std::collections::BTreeSet;
    use std::time::Duration;

    async fn fabric_for(
        hub: &Arc<LoopbackHub>,
        local: &Node,
        nodes: &[Node],
    ) -> Arc<ClusterCommunicator> {
        let transport = hub.transport(local.endpoint().clone());
        transport.open().await.unwrap();
        let metadata = ClusterMetadata::new(local.clone(), nodes.to_vec()).unwrap();
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
        communicator
    }

    #[tokio::test]
    async fn forwarded_session_reaches_remote_replica() {
        let hub = LoopbackHub::new();
        let nodes = [
            Node::core("n1", Endpoint::new("127.0.0.1", 1111)),
            Node::core("n2", Endpoint::new("127.0.0.1", 2222)),
        ];

        // n1 hosts the replica; n2 forwards to it.
        let leader_fabric = fabric_for(&hub, &nodes[0], &nodes).await;
        let client_fabric = fabric_for(&hub, &nodes[1], &nodes).await;

        let replica = LocalParticipant::new(
            PartitionId::new(1),
            NodeId::from("n1"),
            BTreeSet::from([NodeId::from("n1")]),
            PrimitiveTypeRegistry::with_builtins(),
        );
        register_replica_handlers(&leader_fabric, &replica);

        let forwarding =
            ForwardingParticipant::new(PartitionId::new(1), NodeId::from("n1"), client_fabric);

        let reply = forwarding
            .open_session(OpenSessionRequest {
                client_id: "n2-client".into(),
                primitive: "hits".into(),
                primitive_type: "counter".into(),
                timeout: Duration::from_secs(30),
            })
            .await
            .unwrap();
        let session = match reply {
            SessionReply::Output(value) => {
                crate::types::SessionId::new(value.as_u64().unwrap())
            }
            other => panic!("unexpected reply {:?}", other),
        };

        let reply = forwarding
            .submit(CommandRequest {
                session,
                sequence: 1,
                operation: crate::session::participant::Operation::command(
                    "hits",
                    "counter",
                    "increment",
                    json!({"delta": 4}),
                ),
            })
            .await
            .unwrap();
        assert!(matches!(reply, SessionReply::Output(ref v) if v == &json!(4)));

        unregister_replica_handlers(&leader_fabric, PartitionId::new(1));
        let result = forwarding
            .keep_alive(KeepAliveRequest { session })
            .await;
        assert!(result.is_err());
    }
}
