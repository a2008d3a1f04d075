//! Transport Abstraction
//!
//! The relay transport is an external collaborator: it is configured once
//! per connection attempt with the relay parameters, then either listens
//! (host) or connects (joiner). After that it moves opaque datagrams between
//! participants, in order per sender, and reports connection-level problems
//! asynchronously through [`TransportEvent`]s.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::core::role::ParticipantId;
use crate::network::protocol::Route;
use crate::network::rendezvous::{Allocation, JoinAllocation, RelayEndpoint};

/// Relay parameters handed to the transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelayServerData {
    /// Relay server to reach.
    pub endpoint: RelayEndpoint,
    /// Allocation identity bytes.
    pub allocation_id_bytes: Vec<u8>,
    /// Local authentication blob.
    pub connection_data: Vec<u8>,
    /// Counterpart (host) authentication blob.
    pub host_connection_data: Vec<u8>,
    /// Shared session key.
    pub key: Vec<u8>,
    /// Stream mode instead of datagrams.
    pub use_stream_mode: bool,
}

impl RelayServerData {
    /// Parameters for the host. The host is its own counterpart.
    pub fn from_allocation(allocation: &Allocation, use_stream_mode: bool) -> Self {
        Self {
            endpoint: allocation.endpoint.clone(),
            allocation_id_bytes: allocation.allocation_id_bytes.clone(),
            connection_data: allocation.connection_data.clone(),
            host_connection_data: allocation.connection_data.clone(),
            key: allocation.key.clone(),
            use_stream_mode,
        }
    }

    /// Parameters for a joiner.
    pub fn from_join_allocation(allocation: &JoinAllocation, use_stream_mode: bool) -> Self {
        Self {
            endpoint: allocation.endpoint.clone(),
            allocation_id_bytes: allocation.allocation_id_bytes.clone(),
            connection_data: allocation.connection_data.clone(),
            host_connection_data: allocation.host_connection_data.clone(),
            key: allocation.key.clone(),
            use_stream_mode,
        }
    }
}

/// A payload received from another participant.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Datagram {
    /// Sender.
    pub from: ParticipantId,
    /// Encoded envelope.
    pub payload: Vec<u8>,
}

/// Asynchronous transport notifications.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportEvent {
    /// The local transport is up with this participant id.
    Connected(ParticipantId),
    /// Another participant joined.
    PeerConnected(ParticipantId),
    /// Another participant left.
    PeerDisconnected(ParticipantId),
    /// The transport failed. The reason is optional; the notification is not.
    Failure {
        /// Detail, when the transport has one.
        reason: Option<String>,
    },
}

/// Transport errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// `listen`/`connect` called before `configure_relay`.
    #[error("transport has not been configured")]
    NotConfigured,

    /// Reconfiguration attempted while listening or connected.
    #[error("transport is active and cannot be reconfigured")]
    Active,

    /// The relay refused the connection.
    #[error("relay refused connection: {0}")]
    Refused(String),

    /// The transport has shut down.
    #[error("transport closed")]
    Closed,
}

/// A relay-backed message transport.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Store relay parameters. No network effect. Rejected while active.
    fn configure_relay(&self, data: RelayServerData) -> Result<(), TransportError>;

    /// Whether the transport is listening or connected.
    fn is_active(&self) -> bool;

    /// Start as host. Returns the local participant id.
    async fn listen(&self) -> Result<ParticipantId, TransportError>;

    /// Start as joiner. Returns the local participant id.
    async fn connect(&self) -> Result<ParticipantId, TransportError>;

    /// Local participant id once started.
    fn local_participant(&self) -> Option<ParticipantId>;

    /// Queue a payload for delivery.
    async fn send(&self, route: Route, payload: Vec<u8>) -> Result<(), TransportError>;

    /// Next payload addressed to this participant; `None` once closed.
    async fn recv(&self) -> Option<Datagram>;

    /// Subscribe to transport events.
    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::rendezvous::AllocationId;

    fn endpoint() -> RelayEndpoint {
        RelayEndpoint {
            host: "relay.local".to_string(),
            port: 7777,
        }
    }

    #[test]
    fn test_host_is_own_counterpart() {
        let id = AllocationId::new_v4();
        let allocation = Allocation {
            allocation_id: id,
            endpoint: endpoint(),
            allocation_id_bytes: id.as_bytes().to_vec(),
            connection_data: vec![1, 2, 3],
            key: vec![9; 4],
        };

        let data = RelayServerData::from_allocation(&allocation, false);
        assert_eq!(data.connection_data, data.host_connection_data);
        assert_eq!(data.key, vec![9; 4]);
        assert!(!data.use_stream_mode);
    }

    #[test]
    fn test_joiner_keeps_host_blob() {
        let id = AllocationId::new_v4();
        let allocation = JoinAllocation {
            allocation_id: id,
            endpoint: endpoint(),
            allocation_id_bytes: id.as_bytes().to_vec(),
            connection_data: vec![4, 5],
            host_connection_data: vec![1, 2, 3],
            key: vec![9; 4],
        };

        let data = RelayServerData::from_join_allocation(&allocation, true);
        assert_eq!(data.connection_data, vec![4, 5]);
        assert_eq!(data.host_connection_data, vec![1, 2, 3]);
        assert!(data.use_stream_mode);
    }
}
