//! # Relay NetVar
//!
//! Server-authoritative replicated variables and relay-mediated session
//! establishment for small multiplayer sessions.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       RELAY NETVAR                           │
//! ├─────────────────────────────────────────────────────────────┤
//! │  core/             - Session primitives                      │
//! │  ├── role.rs       - Participant ids, roles, context         │
//! │  ├── join_code.rs  - Join code normalization                 │
//! │  ├── name.rs       - Bounded player names                    │
//! │  └── deadline.rs   - Deadline-wrapped requests               │
//! │                                                              │
//! │  replication/      - Authority-owned state                   │
//! │  ├── variable.rs   - Replicated variables and listeners      │
//! │  ├── entity.rs     - Variable ownership and lifecycle        │
//! │  ├── hub.rs        - Routing, RPC policy, snapshots          │
//! │  └── rpc.rs        - Peer-to-authority mutation requests     │
//! │                                                              │
//! │  network/          - Session establishment                   │
//! │  ├── rendezvous.rs - Relay allocation service seam           │
//! │  ├── transport.rs  - Relay transport seam                    │
//! │  ├── establisher.rs- Host/join handshake state machine       │
//! │  ├── protocol.rs   - Wire messages                           │
//! │  └── loopback.rs   - In-process relay and transport          │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Flow
//!
//! 1. The host allocates a relay session, fetches a join code and listens.
//! 2. Joiners resolve the code, configure their transport and connect.
//! 3. Each side runs a [`ReplicationHub`] over its transport.
//! 4. The authority writes variables; peers observe them in version order
//!    and ask for changes through the [`AuthorityRpcChannel`].

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod core;
pub mod network;
pub mod replication;

// Re-export commonly used types
pub use core::join_code::JoinCode;
pub use core::name::PlayerName;
pub use core::role::{ConnectionContext, ParticipantId, Role};
pub use network::establisher::{
    EstablishError, EstablishState, EstablisherConfig, SessionEstablisher,
};
pub use network::loopback::InMemoryRelay;
pub use replication::{
    AuthorityRpcChannel, NetworkEntity, ReplicatedVariable, ReplicationConfig, ReplicationHub,
    RpcPolicy,
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
