//! Replication Hub
//!
//! One hub per participant. It keeps the registry of live variables, pumps
//! outbound replication messages onto the transport in the order they were
//! produced, and applies inbound messages:
//!
//! - on the authority: mutation requests (subject to each variable's
//!   [`RpcPolicy`]) and snapshot requests from late joiners
//! - on peers: authoritative value changes
//!
//! Rejected or unroutable messages are logged and dropped; nothing is sent
//! back to the requester.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, instrument, warn};

use crate::core::role::{ConnectionContext, ParticipantId};
use crate::network::protocol::{Envelope, Outbound, ReplicationMessage, Route};
use crate::network::transport::{Datagram, Transport, TransportError};
use crate::replication::rpc::{AuthorityRpcChannel, RpcError};
use crate::replication::variable::{
    Replicable, ReplicatedSlot, ReplicatedVariable, ReplicationError, VariableId,
};

/// Who may request a mutation of a variable through RPC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RpcPolicy {
    /// Any connected participant.
    #[default]
    AnyPeer,
    /// Only the participant that owns the variable's entity.
    OwnerOnly,
}

impl FromStr for RpcPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "any_peer" | "any" => Ok(RpcPolicy::AnyPeer),
            "owner_only" | "owner" => Ok(RpcPolicy::OwnerOnly),
            other => Err(format!("unknown rpc policy: {}", other)),
        }
    }
}

/// Replication configuration.
#[derive(Debug, Clone, Default)]
pub struct ReplicationConfig {
    /// Policy for variables that do not set their own.
    pub rpc_policy: RpcPolicy,
}

impl ReplicationConfig {
    /// Load from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let rpc_policy = match std::env::var("REPLICATION_RPC_POLICY") {
            Ok(raw) => raw.parse().unwrap_or_else(|e| {
                warn!("{}; using any_peer", e);
                RpcPolicy::AnyPeer
            }),
            Err(_) => RpcPolicy::AnyPeer,
        };
        Self { rpc_policy }
    }
}

struct Registered {
    slot: Arc<dyn ReplicatedSlot>,
    owner: ParticipantId,
    policy: RpcPolicy,
}

/// Per-participant replication router.
pub struct ReplicationHub {
    context: ConnectionContext,
    config: ReplicationConfig,
    outbound: mpsc::UnboundedSender<Outbound>,
    registry: RwLock<BTreeMap<VariableId, Registered>>,
}

impl ReplicationHub {
    /// Create a hub. The receiver is drained by [`ReplicationHub::run`].
    pub fn new(
        context: ConnectionContext,
        config: ReplicationConfig,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Outbound>) {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let hub = Arc::new(Self {
            context,
            config,
            outbound,
            registry: RwLock::new(BTreeMap::new()),
        });
        (hub, outbound_rx)
    }

    /// Local connection context.
    pub fn context(&self) -> &ConnectionContext {
        &self.context
    }

    /// Replication configuration.
    pub fn config(&self) -> &ReplicationConfig {
        &self.config
    }

    /// RPC channel bound to this hub.
    pub fn rpc(&self) -> AuthorityRpcChannel {
        AuthorityRpcChannel::new(self.context.clone(), self.outbound.clone())
    }

    /// Number of registered variables.
    pub fn variable_count(&self) -> usize {
        self.registry.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether a variable is registered.
    pub fn is_registered(&self, id: VariableId) -> bool {
        self.registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&id)
    }

    /// Ask the authority for the current value of every variable. Peers only.
    ///
    /// Variables already ask for their own value when they are registered;
    /// this resends everything, e.g. after the transport reconnects.
    pub fn request_snapshot(&self) -> Result<(), RpcError> {
        self.send_snapshot_request(None)
    }

    fn send_snapshot_request(&self, variable: Option<VariableId>) -> Result<(), RpcError> {
        if self.context.is_authority() {
            return Ok(());
        }
        self.outbound
            .send(Outbound {
                route: Route::Authority,
                message: ReplicationMessage::SnapshotRequest { variable },
            })
            .map_err(|_| RpcError::Closed)
    }

    pub(crate) fn register<T: Replicable>(
        &self,
        variable: &ReplicatedVariable<T>,
        owner: ParticipantId,
        policy: RpcPolicy,
    ) {
        if self.context.is_authority() {
            variable.attach_sink(self.outbound.clone());
        }
        let previous = self
            .registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                variable.id(),
                Registered {
                    slot: Arc::new(variable.clone()),
                    owner,
                    policy,
                },
            );
        if let Some(previous) = previous {
            warn!("Variable {} registered twice; releasing the old one", variable.id());
            previous.slot.release();
        }

        // Updates broadcast before this point never reached the peer.
        if self.send_snapshot_request(Some(variable.id())).is_err() {
            debug!("Replication stream closed; {} will not catch up", variable.id());
        }
    }

    pub(crate) fn unregister(&self, id: VariableId) {
        self.registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }

    fn lookup(
        &self,
        id: VariableId,
    ) -> Option<(Arc<dyn ReplicatedSlot>, ParticipantId, RpcPolicy)> {
        self.registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .map(|r| (r.slot.clone(), r.owner, r.policy))
    }

    /// Apply one inbound message.
    pub fn handle_envelope(&self, envelope: Envelope) -> Result<(), ReplicationError> {
        let from = envelope.from;
        match envelope.message {
            ReplicationMessage::ValueChanged { variable, version, payload } => {
                if from != ParticipantId::AUTHORITY {
                    warn!("Ignoring value change for {} from non-authority {}", variable, from);
                    return Ok(());
                }
                let (slot, _, _) = self
                    .lookup(variable)
                    .ok_or(ReplicationError::UnknownVariable(variable))?;
                slot.apply_encoded(version, &payload)?;
                Ok(())
            }

            ReplicationMessage::MutationRequest { variable, requester, payload } => {
                if !self.context.is_authority() {
                    warn!("Peer received a mutation request for {}; dropping", variable);
                    return Ok(());
                }
                if requester != from {
                    warn!(
                        "Mutation request for {} claims requester {} but came from {}",
                        variable, requester, from
                    );
                }
                let (slot, owner, policy) = self
                    .lookup(variable)
                    .ok_or(ReplicationError::UnknownVariable(variable))?;

                if policy == RpcPolicy::OwnerOnly && from != owner {
                    return Err(ReplicationError::NotOwner {
                        variable,
                        requester: from,
                    });
                }

                let version = slot.apply_request(&payload)?;
                debug!("Applied request from {} to {} (version {})", from, variable, version);
                Ok(())
            }

            ReplicationMessage::SnapshotRequest { variable } => {
                if !self.context.is_authority() {
                    warn!("Peer received a snapshot request from {}; dropping", from);
                    return Ok(());
                }
                self.send_snapshot(from, variable)
            }
        }
    }

    fn send_snapshot(
        &self,
        to: ParticipantId,
        only: Option<VariableId>,
    ) -> Result<(), ReplicationError> {
        let slots: Vec<Arc<dyn ReplicatedSlot>> = match only {
            Some(id) => {
                let (slot, _, _) = self.lookup(id).ok_or(ReplicationError::UnknownVariable(id))?;
                vec![slot]
            }
            None => self
                .registry
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .values()
                .map(|r| r.slot.clone())
                .collect(),
        };

        debug!("Sending snapshot of {} variables to {}", slots.len(), to);
        for slot in slots {
            let (version, payload) = slot.snapshot()?;
            let outbound = Outbound {
                route: Route::Participant(to),
                message: ReplicationMessage::ValueChanged {
                    variable: slot.id(),
                    version,
                    payload,
                },
            };
            if self.outbound.send(outbound).is_err() {
                debug!("Replication stream closed during snapshot");
                break;
            }
        }
        Ok(())
    }

    /// Pump messages between the hub and the transport until the transport
    /// closes, the outbound stream ends or `shutdown` fires.
    #[instrument(skip_all, fields(participant = %self.context.participant_id))]
    pub async fn run<T: Transport + ?Sized>(
        self: Arc<Self>,
        transport: Arc<T>,
        mut outbound_rx: mpsc::UnboundedReceiver<Outbound>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        info!("Replication hub running as {}", self.context.role);

        loop {
            tokio::select! {
                outbound = outbound_rx.recv() => {
                    let Some(outbound) = outbound else {
                        debug!("Outbound stream ended");
                        break;
                    };
                    if let Err(TransportError::Closed) = self.send(&*transport, outbound).await {
                        info!("Transport closed while sending");
                        break;
                    }
                }
                datagram = transport.recv() => {
                    match datagram {
                        Some(datagram) => self.receive(datagram),
                        None => {
                            info!("Transport closed");
                            break;
                        }
                    }
                }
                _ = shutdown.recv() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }
    }

    async fn send<T: Transport + ?Sized>(
        &self,
        transport: &T,
        outbound: Outbound,
    ) -> Result<(), TransportError> {
        let kind = outbound.message.kind();
        let envelope = Envelope {
            from: self.context.participant_id,
            message: outbound.message,
        };
        let bytes = match envelope.to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Failed to encode {}: {}", kind, e);
                return Ok(());
            }
        };
        transport.send(outbound.route, bytes).await.map_err(|e| {
            warn!("Failed to send {}: {}", kind, e);
            e
        })
    }

    fn receive(&self, datagram: Datagram) {
        let envelope = match Envelope::from_bytes(&datagram.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!("Invalid datagram from {}: {}", datagram.from, e);
                return;
            }
        };
        if envelope.from != datagram.from {
            warn!(
                "Envelope claims sender {} but arrived from {}; dropping",
                envelope.from, datagram.from
            );
            return;
        }

        let kind = envelope.message.kind();
        match self.handle_envelope(envelope) {
            Ok(()) => {}
            Err(e @ ReplicationError::UnknownVariable(_)) => {
                debug!("Dropping {}: {}", kind, e);
            }
            Err(e) => warn!("Rejected {} from {}: {}", kind, datagram.from, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::role::Role;
    use crate::replication::variable::EntityId;

    fn var_id(slot: u16) -> VariableId {
        VariableId::new(EntityId(1), slot)
    }

    fn authority_hub() -> (Arc<ReplicationHub>, mpsc::UnboundedReceiver<Outbound>) {
        ReplicationHub::new(ConnectionContext::authority(), ReplicationConfig::default())
    }

    fn peer_hub(id: u64) -> (Arc<ReplicationHub>, mpsc::UnboundedReceiver<Outbound>) {
        ReplicationHub::new(
            ConnectionContext::peer(ParticipantId::new(id)),
            ReplicationConfig::default(),
        )
    }

    fn request(variable: VariableId, from: ParticipantId, value: &str) -> Envelope {
        Envelope {
            from,
            message: ReplicationMessage::MutationRequest {
                variable,
                requester: from,
                payload: bincode::serialize(&value.to_string()).unwrap(),
            },
        }
    }

    #[test]
    fn test_policy_parsing() {
        assert_eq!("any_peer".parse::<RpcPolicy>(), Ok(RpcPolicy::AnyPeer));
        assert_eq!(" OWNER_ONLY ".parse::<RpcPolicy>(), Ok(RpcPolicy::OwnerOnly));
        assert!("everyone".parse::<RpcPolicy>().is_err());
        assert_eq!(ReplicationConfig::default().rpc_policy, RpcPolicy::AnyPeer);
    }

    #[test]
    fn test_authority_registration_attaches_sink() {
        let (hub, mut rx) = authority_hub();
        let var = ReplicatedVariable::create(var_id(0), 0u32, Role::Authority);
        hub.register(&var, ParticipantId::AUTHORITY, RpcPolicy::AnyPeer);

        var.set_if_authority(5).unwrap();
        let outbound = rx.try_recv().unwrap();
        assert_eq!(outbound.route, Route::Broadcast);
        assert_eq!(hub.variable_count(), 1);
    }

    #[test]
    fn test_any_peer_request_applied() {
        let (hub, _rx) = authority_hub();
        let name = ReplicatedVariable::create(var_id(0), String::new(), Role::Authority);
        hub.register(&name, ParticipantId::new(1), RpcPolicy::AnyPeer);

        hub.handle_envelope(request(var_id(0), ParticipantId::new(2), "Mallory"))
            .unwrap();
        assert_eq!(name.get(), "Mallory");
    }

    #[test]
    fn test_owner_only_rejects_other_peers() {
        let (hub, _rx) = authority_hub();
        let name = ReplicatedVariable::create(var_id(0), String::new(), Role::Authority);
        hub.register(&name, ParticipantId::new(1), RpcPolicy::OwnerOnly);

        let err = hub
            .handle_envelope(request(var_id(0), ParticipantId::new(2), "Mallory"))
            .unwrap_err();
        assert_eq!(
            err,
            ReplicationError::NotOwner {
                variable: var_id(0),
                requester: ParticipantId::new(2),
            }
        );
        assert_eq!(name.get(), "");
        assert_eq!(name.version(), 0);

        hub.handle_envelope(request(var_id(0), ParticipantId::new(1), "Ada"))
            .unwrap();
        assert_eq!(name.get(), "Ada");
    }

    #[test]
    fn test_duplicate_request_only_bumps_version() {
        let (hub, _rx) = authority_hub();
        let name = ReplicatedVariable::create(var_id(0), String::new(), Role::Authority);
        hub.register(&name, ParticipantId::new(1), RpcPolicy::AnyPeer);

        hub.handle_envelope(request(var_id(0), ParticipantId::new(1), "Ada")).unwrap();
        hub.handle_envelope(request(var_id(0), ParticipantId::new(1), "Ada")).unwrap();
        assert_eq!(name.get(), "Ada");
        assert_eq!(name.version(), 2);
    }

    #[test]
    fn test_unknown_variable_reported() {
        let (hub, _rx) = authority_hub();
        let err = hub
            .handle_envelope(request(var_id(7), ParticipantId::new(1), "x"))
            .unwrap_err();
        assert_eq!(err, ReplicationError::UnknownVariable(var_id(7)));
    }

    #[test]
    fn test_snapshot_routed_to_requester() {
        let (hub, mut rx) = authority_hub();
        let steps = ReplicatedVariable::create(var_id(0), 0u32, Role::Authority);
        let name = ReplicatedVariable::create(var_id(1), "Host".to_string(), Role::Authority);
        hub.register(&steps, ParticipantId::AUTHORITY, RpcPolicy::AnyPeer);
        hub.register(&name, ParticipantId::AUTHORITY, RpcPolicy::OwnerOnly);
        steps.set_if_authority(3).unwrap();
        let _broadcast = rx.try_recv().unwrap();

        hub.handle_envelope(Envelope {
            from: ParticipantId::new(4),
            message: ReplicationMessage::SnapshotRequest { variable: None },
        })
        .unwrap();

        let first = rx.try_recv().unwrap();
        let second = rx.try_recv().unwrap();
        assert_eq!(first.route, Route::Participant(ParticipantId::new(4)));
        assert_eq!(second.route, Route::Participant(ParticipantId::new(4)));
        match first.message {
            ReplicationMessage::ValueChanged { variable, version, .. } => {
                assert_eq!(variable, var_id(0));
                assert_eq!(version, 1);
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn test_peer_applies_authority_updates_only() {
        let (hub, _rx) = peer_hub(1);
        let steps = ReplicatedVariable::create(var_id(0), 0u32, Role::Peer);
        hub.register(&steps, ParticipantId::AUTHORITY, RpcPolicy::AnyPeer);

        let update = |from: ParticipantId, value: u32| Envelope {
            from,
            message: ReplicationMessage::ValueChanged {
                variable: var_id(0),
                version: 1,
                payload: bincode::serialize(&value).unwrap(),
            },
        };

        hub.handle_envelope(update(ParticipantId::new(2), 99)).unwrap();
        assert_eq!(steps.get(), 0);

        hub.handle_envelope(update(ParticipantId::AUTHORITY, 42)).unwrap();
        assert_eq!(steps.get(), 42);
    }

    #[test]
    fn test_peer_snapshot_request_routed_to_authority() {
        let (hub, mut rx) = peer_hub(1);
        hub.request_snapshot().unwrap();
        let outbound = rx.try_recv().unwrap();
        assert_eq!(outbound.route, Route::Authority);
        assert_eq!(outbound.message, ReplicationMessage::SnapshotRequest { variable: None });
    }

    #[test]
    fn test_peer_registration_asks_for_current_value() {
        let (hub, mut rx) = peer_hub(2);
        let steps = ReplicatedVariable::create(var_id(3), 0u32, Role::Peer);
        hub.register(&steps, ParticipantId::AUTHORITY, RpcPolicy::AnyPeer);

        let outbound = rx.try_recv().unwrap();
        assert_eq!(outbound.route, Route::Authority);
        assert_eq!(
            outbound.message,
            ReplicationMessage::SnapshotRequest {
                variable: Some(var_id(3)),
            }
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_authority_registration_sends_no_request() {
        let (hub, mut rx) = authority_hub();
        let steps = ReplicatedVariable::create(var_id(0), 0u32, Role::Authority);
        hub.register(&steps, ParticipantId::AUTHORITY, RpcPolicy::AnyPeer);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_single_variable_snapshot_answered() {
        let (hub, mut rx) = authority_hub();
        let steps = ReplicatedVariable::create(var_id(0), 0u32, Role::Authority);
        let name = ReplicatedVariable::create(var_id(1), "Host".to_string(), Role::Authority);
        hub.register(&steps, ParticipantId::AUTHORITY, RpcPolicy::AnyPeer);
        hub.register(&name, ParticipantId::AUTHORITY, RpcPolicy::OwnerOnly);
        steps.set_if_authority(42).unwrap();
        let _broadcast = rx.try_recv().unwrap();

        hub.handle_envelope(Envelope {
            from: ParticipantId::new(2),
            message: ReplicationMessage::SnapshotRequest {
                variable: Some(var_id(0)),
            },
        })
        .unwrap();

        let reply = rx.try_recv().unwrap();
        assert_eq!(reply.route, Route::Participant(ParticipantId::new(2)));
        match reply.message {
            ReplicationMessage::ValueChanged { variable, version, payload } => {
                assert_eq!(variable, var_id(0));
                assert_eq!(version, 1);
                assert_eq!(bincode::deserialize::<u32>(&payload).unwrap(), 42);
            }
            other => panic!("unexpected message {:?}", other),
        }
        assert!(rx.try_recv().is_err());

        let err = hub
            .handle_envelope(Envelope {
                from: ParticipantId::new(2),
                message: ReplicationMessage::SnapshotRequest {
                    variable: Some(var_id(9)),
                },
            })
            .unwrap_err();
        assert_eq!(err, ReplicationError::UnknownVariable(var_id(9)));
    }
}
