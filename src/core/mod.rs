//! Core session primitives.
//!
//! Small value types shared by the replication and network layers: who a
//! participant is, what a join code looks like, how names are bounded and
//! how outbound calls are raced against a deadline.

pub mod deadline;
pub mod join_code;
pub mod name;
pub mod role;

// Re-export core types
pub use deadline::{with_deadline, DeadlineError, PendingRequest};
pub use join_code::{InvalidCode, JoinCode};
pub use name::{PlayerName, MAX_NAME_BYTES};
pub use role::{ConnectionContext, ParticipantId, Role};
