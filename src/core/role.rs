//! Participant Roles
//!
//! Every participant in a live session is either the authority (the host,
//! which owns the canonical value of every replicated variable) or a peer.
//! The role is a capability carried by the connection context, not by type:
//! components that behave differently on each side branch on
//! [`ConnectionContext::is_authority`].

use serde::{Deserialize, Serialize};
use std::fmt;

use super::name::PlayerName;

/// Participant identifier assigned by the relay when a transport starts.
///
/// The authority is always [`ParticipantId::AUTHORITY`]; joiners are numbered
/// from 1 in connection order.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ParticipantId(pub u64);

impl ParticipantId {
    /// Identifier of the authoritative participant (the host).
    pub const AUTHORITY: ParticipantId = ParticipantId(0);

    /// Create from a raw value.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Get the raw value.
    pub const fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Role of the local participant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Holds the single source of truth; the only writer.
    Authority,
    /// Mirrors authoritative values; mutates only through RPC.
    Peer,
}

impl Role {
    /// Whether this role may write replicated variables directly.
    pub fn is_authority(&self) -> bool {
        matches!(self, Role::Authority)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Authority => f.write_str("authority"),
            Role::Peer => f.write_str("peer"),
        }
    }
}

/// Per-participant connection context.
///
/// Produced by the session establisher once the transport is live, then
/// handed to every component that needs to know who it runs as. The local
/// user name lives here instead of in process-wide state; the context is
/// owned by the application and is the single writer of that name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionContext {
    /// Identifier assigned by the relay.
    pub participant_id: ParticipantId,
    /// Local role.
    pub role: Role,
    /// Name the local user entered before connecting (if any).
    pub local_user_name: Option<PlayerName>,
}

impl ConnectionContext {
    /// Context for the host.
    pub fn authority() -> Self {
        Self {
            participant_id: ParticipantId::AUTHORITY,
            role: Role::Authority,
            local_user_name: None,
        }
    }

    /// Context for a joiner with the id the relay assigned.
    pub fn peer(participant_id: ParticipantId) -> Self {
        Self {
            participant_id,
            role: Role::Peer,
            local_user_name: None,
        }
    }

    /// Attach the local user name.
    pub fn with_user_name(mut self, name: PlayerName) -> Self {
        self.local_user_name = Some(name);
        self
    }

    /// Capability check used by every authority/peer branch.
    pub fn is_authority(&self) -> bool {
        self.role.is_authority()
    }
}
