//! Rendezvous Service
//!
//! The rendezvous (relay allocation) service is an external collaborator.
//! The host asks it for an allocation and a join code; joiners trade the
//! code for the connection parameters of that allocation. None of its calls
//! carry a timeout, so callers wrap them with
//! [`with_deadline`](crate::core::deadline::with_deadline).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

use crate::core::join_code::JoinCode;

/// Identity of a relay allocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AllocationId(pub Uuid);

impl AllocationId {
    /// Generate a fresh random id.
    pub fn new_v4() -> Self {
        Self(Uuid::new_v4())
    }

    /// Raw 16-byte form, as handed to the transport.
    pub fn as_bytes(&self) -> [u8; 16] {
        *self.0.as_bytes()
    }

    /// Parse the raw form back. `None` unless exactly 16 bytes.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        Uuid::from_slice(bytes).ok().map(Self)
    }
}

impl fmt::Display for AllocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Network endpoint of a relay server.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RelayEndpoint {
    /// Host name or address.
    pub host: String,
    /// Port.
    pub port: u16,
}

impl fmt::Display for RelayEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Result of a host-side allocation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    /// Allocation identity.
    pub allocation_id: AllocationId,
    /// Relay server to use.
    pub endpoint: RelayEndpoint,
    /// Allocation identity as sent on the wire.
    pub allocation_id_bytes: Vec<u8>,
    /// Per-connection authentication blob for the host.
    pub connection_data: Vec<u8>,
    /// Per-session key material.
    pub key: Vec<u8>,
}

/// Result of resolving a join code.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinAllocation {
    /// Allocation identity.
    pub allocation_id: AllocationId,
    /// Relay server to use.
    pub endpoint: RelayEndpoint,
    /// Allocation identity as sent on the wire.
    pub allocation_id_bytes: Vec<u8>,
    /// Per-connection authentication blob for this joiner.
    pub connection_data: Vec<u8>,
    /// The host's authentication blob.
    pub host_connection_data: Vec<u8>,
    /// Per-session key material.
    pub key: Vec<u8>,
}

/// Failure reported by the rendezvous service.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}{}", .reason.as_ref().map(|r| format!(" ({})", r)).unwrap_or_default())]
pub struct ServiceError {
    /// Human-readable message.
    pub message: String,
    /// Machine-readable reason, when the service provides one.
    pub reason: Option<String>,
}

impl ServiceError {
    /// Error with a message only.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            reason: None,
        }
    }

    /// Attach a machine-readable reason.
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// Rendezvous / relay allocation service.
///
/// The caller is assumed to be authenticated with the service already.
#[async_trait]
pub trait RendezvousService: Send + Sync {
    /// Reserve a relay allocation for up to `max_participants` joiners.
    async fn allocate(&self, max_participants: usize) -> Result<Allocation, ServiceError>;

    /// Get the shareable join code for an allocation.
    async fn get_code(&self, allocation_id: AllocationId) -> Result<String, ServiceError>;

    /// Trade a normalized join code for connection parameters.
    async fn resolve(&self, code: &JoinCode) -> Result<JoinAllocation, ServiceError>;
}
