//! Protocol Messages
//!
//! Wire format for replication traffic between the authority and its peers.
//! Values travel as opaque bincode payloads inside a [`ReplicationMessage`];
//! the message itself is wrapped in an [`Envelope`] naming the sender.
//!
//! Messages are externally tagged so the same types serialize both as JSON
//! (for logs and debugging) and as bincode (on the transport).

use serde::{Deserialize, Serialize};

use crate::core::role::ParticipantId;
use crate::replication::variable::{Version, VariableId};

// =============================================================================
// ROUTING
// =============================================================================

/// Where a datagram should be delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Route {
    /// To the authoritative participant only.
    Authority,
    /// To every participant except the sender.
    Broadcast,
    /// To one participant.
    Participant(ParticipantId),
}

// =============================================================================
// REPLICATION MESSAGES
// =============================================================================

/// Replication traffic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicationMessage {
    /// Authority -> peers: a variable took a new value.
    ValueChanged {
        /// Target variable.
        variable: VariableId,
        /// Version assigned by the authority.
        version: Version,
        /// Encoded value.
        payload: Vec<u8>,
    },

    /// Peer -> authority: please apply this value.
    MutationRequest {
        /// Target variable.
        variable: VariableId,
        /// Participant asking for the change.
        requester: ParticipantId,
        /// Encoded proposed value.
        payload: Vec<u8>,
    },

    /// Peer -> authority: send me the current value of one variable, or of
    /// every variable when `variable` is `None`.
    SnapshotRequest {
        /// Variable to resend, or `None` for all of them.
        variable: Option<VariableId>,
    },
}

/// A message queued for the transport by a variable or RPC channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    /// Destination.
    pub route: Route,
    /// Message to deliver.
    pub message: ReplicationMessage,
}

/// A message as it travels on the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Sending participant.
    pub from: ParticipantId,
    /// Message body.
    pub message: ReplicationMessage,
}

// =============================================================================
// SERIALIZATION HELPERS
// =============================================================================

impl ReplicationMessage {
    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            ReplicationMessage::ValueChanged { .. } => "value_changed",
            ReplicationMessage::MutationRequest { .. } => "mutation_request",
            ReplicationMessage::SnapshotRequest { .. } => "snapshot_request",
        }
    }

    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

impl Envelope {
    /// Serialize to binary.
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize from binary.
    pub fn from_bytes(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::variable::EntityId;

    fn variable() -> VariableId {
        VariableId::new(EntityId(9), 1)
    }

    #[test]
    fn test_value_changed_json_shape() {
        let msg = ReplicationMessage::ValueChanged {
            variable: variable(),
            version: 3,
            payload: vec![42, 0, 0, 0],
        };

        let json = msg.to_json().unwrap();
        assert!(json.contains("value_changed"));
        assert_eq!(ReplicationMessage::from_json(&json).unwrap(), msg);
    }

    #[test]
    fn test_envelope_binary_roundtrip() {
        let envelope = Envelope {
            from: ParticipantId::new(2),
            message: ReplicationMessage::MutationRequest {
                variable: variable(),
                requester: ParticipantId::new(2),
                payload: bincode::serialize(&"Ada").unwrap(),
            },
        };

        let bytes = envelope.to_bytes().unwrap();
        let parsed = Envelope::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, envelope);
    }

    #[test]
    fn test_snapshot_request_kind() {
        let everything = ReplicationMessage::SnapshotRequest { variable: None };
        assert_eq!(everything.kind(), "snapshot_request");
        let json = everything.to_json().unwrap();
        assert!(json.contains("snapshot_request"));

        let one = ReplicationMessage::SnapshotRequest {
            variable: Some(variable()),
        };
        let bytes = Envelope {
            from: ParticipantId::new(3),
            message: one.clone(),
        }
        .to_bytes()
        .unwrap();
        assert_eq!(Envelope::from_bytes(&bytes).unwrap().message, one);
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(Envelope::from_bytes(&[0xff, 0xff, 0xff]).is_err());
    }
}
