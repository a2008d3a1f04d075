//! Server-authoritative replication.
//!
//! Variables are declared on [`NetworkEntity`]s, written only by the
//! authority, mirrored to peers through the [`ReplicationHub`], and mutated
//! by peers only through the [`AuthorityRpcChannel`].

pub mod entity;
pub mod hub;
pub mod rpc;
pub mod variable;

pub use entity::NetworkEntity;
pub use hub::{ReplicationConfig, ReplicationHub, RpcPolicy};
pub use rpc::{AuthorityRpcChannel, RpcError};
pub use variable::{
    EntityId, ListenerHandle, ReadPermission, Replicable, ReplicatedVariable, ReplicationError,
    VariableId, Version, WritePermission,
};
