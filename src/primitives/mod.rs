//! Distributed primitives: registry, built-in kinds, and the factory
//! service routing names onto partitions.

pub mod kinds;
pub mod registry;
pub mod service;

pub use registry::{
    COUNTER_TYPE, MAP_TYPE, OperationContext, PrimitiveStateMachine, PrimitiveTypeDescriptor,
    PrimitiveTypeRegistry,
};
pub use service::{
    DistributedCounter, DistributedMap, Primitive, PrimitiveService, partition_of,
};
