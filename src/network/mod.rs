//! Network Layer
//!
//! Rendezvous, transport and session establishment. The rendezvous service
//! and the transport are external collaborators behind traits; `loopback`
//! provides an in-process implementation of both.

pub mod establisher;
pub mod loopback;
pub mod protocol;
pub mod rendezvous;
pub mod transport;

pub use establisher::{
    EstablishError, EstablishState, EstablisherConfig, SessionDescriptor, SessionEstablisher,
    SessionRole,
};
pub use loopback::{InMemoryRelay, LoopbackConfig, LoopbackTransport};
pub use protocol::{Envelope, Outbound, ReplicationMessage, Route};
pub use rendezvous::{
    Allocation, AllocationId, JoinAllocation, RelayEndpoint, RendezvousService, ServiceError,
};
pub use transport::{Datagram, RelayServerData, Transport, TransportError, TransportEvent};
