//! Networked Entities
//!
//! A [`NetworkEntity`] owns the replicated variables declared on it. Slots are
//! numbered in declaration order, so every participant that spawns the same
//! entity with the same declarations addresses the same variables. Dropping
//! the entity releases every listener registered on its variables and
//! removes them from the hub.

use std::fmt;
use std::sync::Arc;
use tracing::debug;

use crate::core::role::ParticipantId;
use crate::replication::hub::{ReplicationHub, RpcPolicy};
use crate::replication::rpc::{AuthorityRpcChannel, RpcError};
use crate::replication::variable::{
    EntityId, Replicable, ReplicatedSlot, ReplicatedVariable, ReplicationError, VariableId,
};

/// An entity carrying replicated variables.
pub struct NetworkEntity {
    id: EntityId,
    owner: ParticipantId,
    hub: Arc<ReplicationHub>,
    slots: Vec<Arc<dyn ReplicatedSlot>>,
}

impl NetworkEntity {
    /// Spawn an entity owned by `owner`.
    pub fn spawn(hub: Arc<ReplicationHub>, id: EntityId, owner: ParticipantId) -> Self {
        debug!("Spawned entity {} owned by {}", id.0, owner);
        Self {
            id,
            owner,
            hub,
            slots: Vec::new(),
        }
    }

    /// Entity id.
    pub fn id(&self) -> EntityId {
        self.id
    }

    /// Owning participant.
    pub fn owner(&self) -> ParticipantId {
        self.owner
    }

    /// Whether the local participant owns this entity.
    pub fn is_owner(&self) -> bool {
        self.hub.context().participant_id == self.owner
    }

    /// Declare the next variable, using the hub's default RPC policy.
    pub fn variable<T: Replicable>(
        &mut self,
        initial: T,
    ) -> Result<ReplicatedVariable<T>, ReplicationError> {
        let policy = self.hub.config().rpc_policy;
        self.variable_with_policy(initial, policy)
    }

    /// Declare the next variable with an explicit RPC policy.
    ///
    /// Fails with [`ReplicationError::SlotsExhausted`] once every `u16` slot
    /// index of the entity is taken.
    pub fn variable_with_policy<T: Replicable>(
        &mut self,
        initial: T,
        policy: RpcPolicy,
    ) -> Result<ReplicatedVariable<T>, ReplicationError> {
        let slot = u16::try_from(self.slots.len())
            .map_err(|_| ReplicationError::SlotsExhausted(self.id))?;
        let id = VariableId::new(self.id, slot);
        let variable = ReplicatedVariable::create(id, initial, self.hub.context().role);
        self.hub.register(&variable, self.owner, policy);
        self.slots.push(Arc::new(variable.clone()));
        Ok(variable)
    }

    /// Push a locally held starting value to the authority.
    ///
    /// Only the owner pushes, and only when `meaningful` accepts the value.
    /// Returns whether a request was issued.
    pub fn push_initial<T: Replicable>(
        &self,
        rpc: &AuthorityRpcChannel,
        variable: &ReplicatedVariable<T>,
        local: T,
        meaningful: impl FnOnce(&T) -> bool,
    ) -> Result<bool, RpcError> {
        if !self.is_owner() || !meaningful(&local) {
            return Ok(false);
        }
        rpc.request(variable, local)?;
        Ok(true)
    }

    /// Destroy the entity.
    pub fn despawn(self) {}
}

impl Drop for NetworkEntity {
    fn drop(&mut self) {
        for slot in self.slots.drain(..) {
            slot.release();
            self.hub.unregister(slot.id());
        }
        debug!("Despawned entity {}", self.id.0);
    }
}

impl fmt::Debug for NetworkEntity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetworkEntity")
            .field("id", &self.id)
            .field("owner", &self.owner)
            .field("variables", &self.slots.len())
            .finish()
    }
}
