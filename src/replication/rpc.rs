//! Authority RPC
//!
//! Peers may not write replicated variables; they ask the authority to do
//! it. A request is fire-and-forget: there is no acknowledgement beyond the
//! replicated change itself, and a request the authority never applies is
//! simply lost.

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

use crate::core::role::ConnectionContext;
use crate::network::protocol::{Outbound, ReplicationMessage, Route};
use crate::replication::variable::{Replicable, ReplicatedVariable, ReplicationError};

/// RPC errors. All of them are local; remote rejection is silent.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RpcError {
    /// The request could not be built or applied locally.
    #[error(transparent)]
    Replication(#[from] ReplicationError),

    /// The replication stream has shut down.
    #[error("replication stream closed")]
    Closed,
}

/// Channel for mutation requests toward the authority.
#[derive(Clone)]
pub struct AuthorityRpcChannel {
    context: ConnectionContext,
    outbound: mpsc::UnboundedSender<Outbound>,
}

impl AuthorityRpcChannel {
    pub(crate) fn new(
        context: ConnectionContext,
        outbound: mpsc::UnboundedSender<Outbound>,
    ) -> Self {
        Self { context, outbound }
    }

    /// Ask the authority to set `variable` to `proposed`.
    ///
    /// On the authority the request is applied in place. Elsewhere it is
    /// queued for the authority and `Ok` only means it was queued.
    pub fn request<T: Replicable>(
        &self,
        variable: &ReplicatedVariable<T>,
        proposed: T,
    ) -> Result<(), RpcError> {
        let id = variable.id();
        if variable.is_released() {
            return Err(ReplicationError::Released(id).into());
        }

        if self.context.is_authority() {
            variable.set_if_authority(proposed)?;
            return Ok(());
        }

        let payload = bincode::serialize(&proposed).map_err(|e| ReplicationError::Encode {
            variable: id,
            detail: e.to_string(),
        })?;

        debug!("Requesting change of {} from {}", id, self.context.participant_id);
        self.outbound
            .send(Outbound {
                route: Route::Authority,
                message: ReplicationMessage::MutationRequest {
                    variable: id,
                    requester: self.context.participant_id,
                    payload,
                },
            })
            .map_err(|_| RpcError::Closed)
    }
}
