//! Session Establishment
//!
//! Drives the relay handshake for both sides of a session:
//!
//! ```text
//! Host:   Idle -> AllocatingSession -> SessionAllocated -> RetrievingCode
//!              -> CodeReady -> ConfiguringTransport -> Listening
//!
//! Joiner: Idle -> ResolvingCode -> ConnectionDataReady
//!              -> ConfiguringTransport -> Connecting -> Connected
//! ```
//!
//! Every rendezvous call is raced against one fixed deadline. A timeout or
//! service error moves the machine to `Failed` and it stays there until
//! [`SessionEstablisher::reset`]; nothing is retried automatically. When the
//! deadline wins, the in-flight call is dropped, so a late success can never
//! move the machine out of `Failed`.
//!
//! Every state check and the transition it guards happen in one step, so
//! concurrent callers sharing an establisher cannot both start the same
//! rendezvous call.
//!
//! Once the transport is up, asynchronous transport failures are published
//! on [`SessionEstablisher::on_transport_failure`] and the most recent one is
//! kept in [`SessionEstablisher::last_transport_failure`]. The establisher
//! never tears the session down on its own; that decision belongs to the
//! caller.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, instrument, warn};

use crate::core::deadline::{with_deadline, DeadlineError};
use crate::core::join_code::{InvalidCode, JoinCode};
use crate::core::name::PlayerName;
use crate::core::role::ConnectionContext;
use crate::network::rendezvous::{
    Allocation, AllocationId, JoinAllocation, RendezvousService, ServiceError,
};
use crate::network::transport::{RelayServerData, Transport, TransportError, TransportEvent};

/// Capacity of the transport-failure channel.
const FAILURE_CAPACITY: usize = 16;

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Establisher configuration.
#[derive(Debug, Clone)]
pub struct EstablisherConfig {
    /// Deadline for every rendezvous call.
    pub timeout: Duration,
    /// Joiners to allocate room for in [`SessionEstablisher::host`].
    pub max_participants: usize,
    /// Ask the transport for stream mode instead of datagrams.
    pub use_stream_mode: bool,
}

impl Default for EstablisherConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            max_participants: 5,
            use_stream_mode: false,
        }
    }
}

impl EstablisherConfig {
    /// Load from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            timeout: std::env::var("RELAY_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.timeout),
            max_participants: std::env::var("RELAY_MAX_PARTICIPANTS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_participants),
            use_stream_mode: std::env::var("RELAY_USE_STREAM_MODE")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(defaults.use_stream_mode),
        }
    }
}

// =============================================================================
// ERRORS AND STATE
// =============================================================================

/// Session establishment errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EstablishError {
    /// The join code was empty after normalization. No call was made.
    #[error("invalid join code: {0}")]
    InvalidCode(#[from] InvalidCode),

    /// The rendezvous call did not resolve before the deadline.
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        /// Abandoned operation.
        operation: &'static str,
        /// Configured deadline.
        after: Duration,
    },

    /// The rendezvous service reported a failure.
    #[error("{operation} failed: {error}")]
    Rendezvous {
        /// Failed operation.
        operation: &'static str,
        /// Service detail.
        error: ServiceError,
    },

    /// The transport reported a failure after starting.
    #[error("transport failure: {}", .reason.as_deref().unwrap_or("no reason given"))]
    TransportFailure {
        /// Detail, when the transport has one.
        reason: Option<String>,
    },

    /// Reconfiguration attempted while listening or connected.
    #[error("transport is active; reset the session before reconfiguring")]
    TransportActive,

    /// The allocation or descriptor was not produced by this session.
    #[error("allocation {0} does not belong to this session")]
    ForeignAllocation(AllocationId),

    /// Operation called in the wrong state.
    #[error("{operation} is not allowed in state {state}")]
    InvalidState {
        /// Rejected operation.
        operation: &'static str,
        /// State at the time.
        state: String,
    },

    /// The transport refused to configure or start.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

impl EstablishError {
    fn from_deadline(error: DeadlineError<ServiceError>, operation: &'static str) -> Self {
        match error {
            DeadlineError::Elapsed { operation, after } => {
                EstablishError::Timeout { operation, after }
            }
            DeadlineError::Failed(error) => EstablishError::Rendezvous { operation, error },
        }
    }
}

/// State of the establishment flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EstablishState {
    /// Nothing in progress.
    Idle,
    /// Host: waiting for the allocation.
    AllocatingSession,
    /// Host: allocation held, no code yet.
    SessionAllocated,
    /// Host: waiting for the join code.
    RetrievingCode,
    /// Host: code ready to share.
    CodeReady,
    /// Joiner: waiting for the code to resolve.
    ResolvingCode,
    /// Joiner: connection parameters ready.
    ConnectionDataReady,
    /// Transport configured, not started.
    ConfiguringTransport,
    /// Host: transport listening.
    Listening,
    /// Joiner: transport connecting.
    Connecting,
    /// Joiner: transport connected.
    Connected,
    /// Halted until reset.
    Failed(EstablishError),
}

impl EstablishState {
    /// Whether the transport is started.
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            EstablishState::Listening | EstablishState::Connecting | EstablishState::Connected
        )
    }

    fn name(&self) -> &'static str {
        match self {
            EstablishState::Idle => "idle",
            EstablishState::AllocatingSession => "allocating_session",
            EstablishState::SessionAllocated => "session_allocated",
            EstablishState::RetrievingCode => "retrieving_code",
            EstablishState::CodeReady => "code_ready",
            EstablishState::ResolvingCode => "resolving_code",
            EstablishState::ConnectionDataReady => "connection_data_ready",
            EstablishState::ConfiguringTransport => "configuring_transport",
            EstablishState::Listening => "listening",
            EstablishState::Connecting => "connecting",
            EstablishState::Connected => "connected",
            EstablishState::Failed(_) => "failed",
        }
    }
}

impl fmt::Display for EstablishState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EstablishState::Failed(reason) => write!(f, "failed ({})", reason),
            other => f.write_str(other.name()),
        }
    }
}

/// Which side of the session a descriptor is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    /// Will listen and become the authority.
    Host,
    /// Will connect and become a peer.
    Joiner,
}

/// Everything needed to configure the transport for one attempt.
///
/// Produced once per attempt by [`SessionEstablisher::descriptor`] and
/// consumed by [`SessionEstablisher::configure_transport`]. Only the
/// establisher can build one, and it only accepts the one it issued.
#[derive(Debug, PartialEq, Eq)]
pub struct SessionDescriptor {
    role: SessionRole,
    allocation_id: AllocationId,
    code: JoinCode,
    server_data: RelayServerData,
}

impl SessionDescriptor {
    /// Side of the session.
    pub fn role(&self) -> SessionRole {
        self.role
    }

    /// Allocation the parameters belong to.
    pub fn allocation_id(&self) -> AllocationId {
        self.allocation_id
    }

    /// Join code of the session.
    pub fn code(&self) -> &JoinCode {
        &self.code
    }

    /// Relay parameters.
    pub fn server_data(&self) -> &RelayServerData {
        &self.server_data
    }
}

#[derive(Default)]
struct Progress {
    allocation: Option<Allocation>,
    join: Option<JoinAllocation>,
    code: Option<JoinCode>,
    /// Allocation of the descriptor handed out for this attempt.
    issued: Option<AllocationId>,
    configured: Option<SessionRole>,
    context: Option<ConnectionContext>,
}

fn lock<G>(mutex: &Mutex<G>) -> MutexGuard<'_, G> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// =============================================================================
// ESTABLISHER
// =============================================================================

/// Relay session establisher.
pub struct SessionEstablisher<R: ?Sized, T: ?Sized> {
    config: EstablisherConfig,
    rendezvous: Arc<R>,
    transport: Arc<T>,
    user_name: Option<PlayerName>,
    state: watch::Sender<EstablishState>,
    progress: Mutex<Progress>,
    failures: broadcast::Sender<EstablishError>,
    last_failure: Arc<watch::Sender<Option<EstablishError>>>,
}

impl<R, T> SessionEstablisher<R, T>
where
    R: RendezvousService + ?Sized,
    T: Transport + ?Sized,
{
    /// Create an idle establisher.
    pub fn new(config: EstablisherConfig, rendezvous: Arc<R>, transport: Arc<T>) -> Self {
        let (state, _) = watch::channel(EstablishState::Idle);
        let (failures, _) = broadcast::channel(FAILURE_CAPACITY);
        let (last_failure, _) = watch::channel(None);
        Self {
            config,
            rendezvous,
            transport,
            user_name: None,
            state,
            progress: Mutex::new(Progress::default()),
            failures,
            last_failure: Arc::new(last_failure),
        }
    }

    /// Name of the local user, carried into the connection context.
    pub fn with_user_name(mut self, name: PlayerName) -> Self {
        self.user_name = Some(name);
        self
    }

    /// Current state.
    pub fn state(&self) -> EstablishState {
        self.state.borrow().clone()
    }

    /// Observe state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<EstablishState> {
        self.state.subscribe()
    }

    /// Observe transport failures reported after start.
    ///
    /// Only failures raised after subscribing are delivered; use
    /// [`last_transport_failure`](Self::last_transport_failure) to learn
    /// about an earlier one.
    pub fn on_transport_failure(&self) -> broadcast::Receiver<EstablishError> {
        self.failures.subscribe()
    }

    /// Most recent transport failure since the session started, if any.
    pub fn last_transport_failure(&self) -> Option<EstablishError> {
        self.last_failure.borrow().clone()
    }

    /// Watch the most recent transport failure. The current value is
    /// visible immediately, however late the receiver was created.
    pub fn watch_transport_failure(&self) -> watch::Receiver<Option<EstablishError>> {
        self.last_failure.subscribe()
    }

    /// Connection context, once started.
    pub fn context(&self) -> Option<ConnectionContext> {
        lock(&self.progress).context.clone()
    }

    /// Transport in use.
    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    /// Reserve a relay allocation (host).
    #[instrument(skip(self))]
    pub async fn allocate_session(
        &self,
        max_participants: usize,
    ) -> Result<Allocation, EstablishError> {
        self.begin(
            "allocate_session",
            |s| *s == EstablishState::Idle,
            EstablishState::AllocatingSession,
        )?;

        let result = with_deadline(
            "allocate",
            self.config.timeout,
            self.rendezvous.allocate(max_participants),
        )
        .await;

        let allocation = match result {
            Ok(allocation) => allocation,
            Err(e) => return Err(self.fail(EstablishError::from_deadline(e, "allocate"))),
        };

        info!(
            "Allocated session {} on {}",
            allocation.allocation_id, allocation.endpoint
        );
        lock(&self.progress).allocation = Some(allocation.clone());
        self.transition(EstablishState::SessionAllocated);
        Ok(allocation)
    }

    /// Fetch the shareable join code for the held allocation (host).
    ///
    /// `allocation_id` must be the allocation returned by
    /// [`allocate_session`](Self::allocate_session) on this establisher.
    #[instrument(skip(self))]
    pub async fn retrieve_join_code(
        &self,
        allocation_id: AllocationId,
    ) -> Result<JoinCode, EstablishError> {
        let held = lock(&self.progress).allocation.as_ref().map(|a| a.allocation_id);
        if held.is_some() && held != Some(allocation_id) {
            warn!("Refusing join code for foreign allocation {}", allocation_id);
            return Err(EstablishError::ForeignAllocation(allocation_id));
        }
        self.begin(
            "retrieve_join_code",
            |s| *s == EstablishState::SessionAllocated,
            EstablishState::RetrievingCode,
        )?;

        let result = with_deadline(
            "get_code",
            self.config.timeout,
            self.rendezvous.get_code(allocation_id),
        )
        .await;

        let raw = match result {
            Ok(raw) => raw,
            Err(e) => return Err(self.fail(EstablishError::from_deadline(e, "get_code"))),
        };
        let code = match JoinCode::parse(&raw) {
            Ok(code) => code,
            Err(_) => {
                return Err(self.fail(EstablishError::Rendezvous {
                    operation: "get_code",
                    error: ServiceError::new("service returned an unusable join code"),
                }))
            }
        };

        info!("Join code ready: {}", code);
        lock(&self.progress).code = Some(code.clone());
        self.transition(EstablishState::CodeReady);
        Ok(code)
    }

    /// Trade a join code for connection parameters (joiner).
    ///
    /// The code is normalized before anything else; an empty code fails with
    /// [`EstablishError::InvalidCode`] without touching the network or the
    /// state machine.
    #[instrument(skip(self))]
    pub async fn resolve_code(&self, raw: &str) -> Result<JoinAllocation, EstablishError> {
        let code = JoinCode::parse(raw).map_err(|e| {
            warn!("Rejected join code: {}", e);
            EstablishError::InvalidCode(e)
        })?;
        self.begin(
            "resolve_code",
            |s| *s == EstablishState::Idle,
            EstablishState::ResolvingCode,
        )?;

        debug!("Resolving join code {}", code);
        let result =
            with_deadline("resolve", self.config.timeout, self.rendezvous.resolve(&code)).await;

        let join = match result {
            Ok(join) => join,
            Err(e) => return Err(self.fail(EstablishError::from_deadline(e, "resolve"))),
        };

        info!("Join code {} resolved to {}", code, join.endpoint);
        {
            let mut progress = lock(&self.progress);
            progress.join = Some(join.clone());
            progress.code = Some(code);
        }
        self.transition(EstablishState::ConnectionDataReady);
        Ok(join)
    }

    /// Take the descriptor for the current attempt. Yields it once.
    pub fn descriptor(&self) -> Result<SessionDescriptor, EstablishError> {
        let state = self.state();
        let mut progress = lock(&self.progress);

        let stream = self.config.use_stream_mode;
        let descriptor = match (&state, progress.issued, progress.code.clone()) {
            (EstablishState::CodeReady, None, Some(code)) => {
                progress.allocation.as_ref().map(|allocation| SessionDescriptor {
                    role: SessionRole::Host,
                    allocation_id: allocation.allocation_id,
                    code,
                    server_data: RelayServerData::from_allocation(allocation, stream),
                })
            }
            (EstablishState::ConnectionDataReady, None, Some(code)) => {
                progress.join.as_ref().map(|join| SessionDescriptor {
                    role: SessionRole::Joiner,
                    allocation_id: join.allocation_id,
                    code,
                    server_data: RelayServerData::from_join_allocation(join, stream),
                })
            }
            _ => None,
        };

        match descriptor {
            Some(descriptor) => {
                progress.issued = Some(descriptor.allocation_id);
                Ok(descriptor)
            }
            None => Err(EstablishError::InvalidState {
                operation: "descriptor",
                state: state.to_string(),
            }),
        }
    }

    /// Hand the relay parameters to the transport. No network effect.
    #[instrument(skip(self, descriptor), fields(role = ?descriptor.role))]
    pub fn configure_transport(&self, descriptor: SessionDescriptor) -> Result<(), EstablishError> {
        let state = self.state();
        if state.is_live() || self.transport.is_active() {
            warn!("Refusing to reconfigure an active transport");
            return Err(EstablishError::TransportActive);
        }

        if lock(&self.progress).issued != Some(descriptor.allocation_id) {
            warn!("Refusing descriptor for allocation {}", descriptor.allocation_id);
            return Err(EstablishError::ForeignAllocation(descriptor.allocation_id));
        }

        let expected = match descriptor.role {
            SessionRole::Host => EstablishState::CodeReady,
            SessionRole::Joiner => EstablishState::ConnectionDataReady,
        };
        self.begin(
            "configure_transport",
            |s| *s == expected,
            EstablishState::ConfiguringTransport,
        )?;
        debug!(
            "Configuring relay {} (allocation {})",
            descriptor.server_data.endpoint,
            hex::encode(&descriptor.server_data.allocation_id_bytes)
        );
        if let Err(e) = self.transport.configure_relay(descriptor.server_data) {
            return Err(self.fail(e.into()));
        }

        lock(&self.progress).configured = Some(descriptor.role);
        Ok(())
    }

    /// Start listening (host) or connecting (joiner).
    #[instrument(skip(self))]
    pub async fn start(&self) -> Result<ConnectionContext, EstablishError> {
        // Taking the role claims the start; a concurrent caller sees `None`.
        let role = lock(&self.progress).configured.take();
        let role = match (self.state(), role) {
            (EstablishState::ConfiguringTransport, Some(role)) => role,
            (state, _) => {
                return Err(EstablishError::InvalidState {
                    operation: "start",
                    state: state.to_string(),
                })
            }
        };

        let started = match role {
            SessionRole::Host => self.transport.listen().await,
            SessionRole::Joiner => {
                self.transition(EstablishState::Connecting);
                self.transport.connect().await
            }
        };
        let participant = match started {
            Ok(participant) => participant,
            Err(e) => return Err(self.fail(e.into())),
        };

        let mut context = match role {
            SessionRole::Host => ConnectionContext::authority(),
            SessionRole::Joiner => ConnectionContext::peer(participant),
        };
        if let Some(name) = &self.user_name {
            context = context.with_user_name(name.clone());
        }

        self.watch_transport();
        lock(&self.progress).context = Some(context.clone());
        self.transition(match role {
            SessionRole::Host => EstablishState::Listening,
            SessionRole::Joiner => EstablishState::Connected,
        });

        info!("Session started as {} ({})", context.role, context.participant_id);
        Ok(context)
    }

    /// Allocate, publish a code, configure and listen. Returns the join code
    /// to share with joiners.
    pub async fn host(
        &self,
        max_participants: usize,
    ) -> Result<(JoinCode, ConnectionContext), EstablishError> {
        let allocation = self.allocate_session(max_participants).await?;
        let code = self.retrieve_join_code(allocation.allocation_id).await?;
        let descriptor = self.descriptor()?;
        self.configure_transport(descriptor)?;
        let context = self.start().await?;
        Ok((code, context))
    }

    /// Resolve a code, configure and connect.
    pub async fn join(&self, raw_code: &str) -> Result<ConnectionContext, EstablishError> {
        self.resolve_code(raw_code).await?;
        let descriptor = self.descriptor()?;
        self.configure_transport(descriptor)?;
        self.start().await
    }

    /// Return to `Idle` so the whole flow can be restarted.
    ///
    /// Rejected while the transport is live.
    pub fn reset(&self) -> Result<(), EstablishError> {
        if self.state().is_live() || self.transport.is_active() {
            return Err(EstablishError::TransportActive);
        }
        *lock(&self.progress) = Progress::default();
        self.last_failure.send_replace(None);
        self.transition(EstablishState::Idle);
        Ok(())
    }

    /// Check the current state and move to `next` in one step.
    fn begin(
        &self,
        operation: &'static str,
        allowed: impl FnOnce(&EstablishState) -> bool,
        next: EstablishState,
    ) -> Result<(), EstablishError> {
        let mut rejected = None;
        self.state.send_if_modified(|state| {
            if allowed(state) {
                debug!("Session state: {} -> {}", state, next);
                *state = next;
                true
            } else {
                rejected = Some(state.to_string());
                false
            }
        });

        match rejected {
            None => Ok(()),
            Some(state) => {
                warn!("{} rejected in state {}", operation, state);
                Err(EstablishError::InvalidState { operation, state })
            }
        }
    }

    fn transition(&self, next: EstablishState) {
        let previous = self.state.send_replace(next.clone());
        debug!("Session state: {} -> {}", previous, next);
    }

    fn fail(&self, reason: EstablishError) -> EstablishError {
        error!("Session establishment failed: {}", reason);
        self.transition(EstablishState::Failed(reason.clone()));
        reason
    }

    /// Forward transport failures to subscribers for as long as the
    /// transport's event channel is open.
    fn watch_transport(&self) {
        let mut events = self.transport.subscribe();
        let failures = self.failures.clone();
        let last_failure = self.last_failure.clone();

        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(TransportEvent::Failure { reason }) => {
                        let failure = EstablishError::TransportFailure { reason };
                        error!("{}", failure);
                        last_failure.send_replace(Some(failure.clone()));
                        if failures.send(failure).is_err() {
                            debug!("No live failure subscribers; kept as last failure");
                        }
                    }
                    Ok(TransportEvent::PeerConnected(id)) => {
                        info!("Participant {} connected", id)
                    }
                    Ok(TransportEvent::PeerDisconnected(id)) => {
                        info!("Participant {} disconnected", id)
                    }
                    Ok(TransportEvent::Connected(_)) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Transport event watcher lagged by {} events", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::role::{ParticipantId, Role};
    use crate::network::loopback::{InMemoryRelay, LoopbackConfig, LoopbackTransport};

    type Loopback = SessionEstablisher<InMemoryRelay, LoopbackTransport>;

    fn establisher(relay: &Arc<InMemoryRelay>) -> Loopback {
        SessionEstablisher::new(EstablisherConfig::default(), relay.clone(), relay.transport())
    }

    #[test]
    fn test_config_defaults() {
        let config = EstablisherConfig::default();
        assert_eq!(config.timeout, Duration::from_secs(10));
        assert_eq!(config.max_participants, 5);
        assert!(!config.use_stream_mode);
    }

    #[tokio::test]
    async fn test_host_walks_every_state() {
        let relay = InMemoryRelay::new(LoopbackConfig::default());
        let host = establisher(&relay);
        let mut states = host.subscribe_state();

        let allocation = host.allocate_session(5).await.unwrap();
        assert_eq!(host.state(), EstablishState::SessionAllocated);

        host.retrieve_join_code(allocation.allocation_id).await.unwrap();
        assert_eq!(host.state(), EstablishState::CodeReady);

        let descriptor = host.descriptor().unwrap();
        assert_eq!(descriptor.role(), SessionRole::Host);
        assert_eq!(descriptor.allocation_id(), allocation.allocation_id);

        host.configure_transport(descriptor).unwrap();
        assert_eq!(host.state(), EstablishState::ConfiguringTransport);

        let context = host.start().await.unwrap();
        assert_eq!(context.role, Role::Authority);
        assert_eq!(host.state(), EstablishState::Listening);
        assert!(states.has_changed().unwrap());
        assert_eq!(*states.borrow_and_update(), EstablishState::Listening);
    }

    #[tokio::test]
    async fn test_descriptor_yields_once() {
        let relay = InMemoryRelay::new(LoopbackConfig::default());
        let host = establisher(&relay);
        let allocation = host.allocate_session(2).await.unwrap();
        host.retrieve_join_code(allocation.allocation_id).await.unwrap();

        assert!(host.descriptor().is_ok());
        assert!(matches!(
            host.descriptor(),
            Err(EstablishError::InvalidState { operation: "descriptor", .. })
        ));
    }

    #[tokio::test]
    async fn test_code_for_foreign_allocation_refused() {
        let relay = InMemoryRelay::new(LoopbackConfig::default());
        let host = establisher(&relay);
        let other = establisher(&relay);
        let mine = host.allocate_session(2).await.unwrap();
        let theirs = other.allocate_session(2).await.unwrap();
        let calls = relay.call_count();

        let err = host.retrieve_join_code(theirs.allocation_id).await.unwrap_err();
        assert_eq!(err, EstablishError::ForeignAllocation(theirs.allocation_id));
        assert_eq!(host.state(), EstablishState::SessionAllocated);
        assert_eq!(relay.call_count(), calls);

        host.retrieve_join_code(mine.allocation_id).await.unwrap();
        let descriptor = host.descriptor().unwrap();
        assert_eq!(descriptor.allocation_id(), mine.allocation_id);
    }

    #[tokio::test]
    async fn test_foreign_descriptor_refused_and_own_still_available() {
        let relay = InMemoryRelay::new(LoopbackConfig::default());
        let host = establisher(&relay);
        let allocation = host.allocate_session(2).await.unwrap();
        host.retrieve_join_code(allocation.allocation_id).await.unwrap();

        let other = establisher(&relay);
        let other_allocation = other.allocate_session(2).await.unwrap();
        other.retrieve_join_code(other_allocation.allocation_id).await.unwrap();
        let foreign = other.descriptor().unwrap();

        assert_eq!(
            host.configure_transport(foreign),
            Err(EstablishError::ForeignAllocation(other_allocation.allocation_id))
        );
        assert_eq!(host.state(), EstablishState::CodeReady);

        let own = host.descriptor().unwrap();
        host.configure_transport(own).unwrap();
        assert_eq!(host.state(), EstablishState::ConfiguringTransport);
        assert!(host.descriptor().is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_allocations_reach_service_once() {
        let relay = InMemoryRelay::new(LoopbackConfig::default());
        relay.set_latency(Duration::from_millis(50));
        let host = Arc::new(establisher(&relay));

        let attempts: Vec<_> = (0..8)
            .map(|_| {
                let host = host.clone();
                tokio::spawn(async move { host.allocate_session(2).await })
            })
            .collect();

        let mut allocated = 0;
        let mut rejected = 0;
        for attempt in attempts {
            match attempt.await.unwrap() {
                Ok(_) => allocated += 1,
                Err(EstablishError::InvalidState { operation, .. }) => {
                    assert_eq!(operation, "allocate_session");
                    rejected += 1;
                }
                Err(other) => panic!("unexpected error {:?}", other),
            }
        }
        assert_eq!((allocated, rejected), (1, 7));
        assert_eq!(relay.call_count(), 1);
        assert_eq!(host.state(), EstablishState::SessionAllocated);
    }

    #[tokio::test]
    async fn test_empty_code_fails_fast() {
        let relay = InMemoryRelay::new(LoopbackConfig::default());
        let joiner = establisher(&relay);

        let err = joiner.resolve_code("  ?! ").await.unwrap_err();
        assert!(matches!(err, EstablishError::InvalidCode(_)));
        assert_eq!(joiner.state(), EstablishState::Idle);
        assert_eq!(relay.call_count(), 0);
    }

    #[tokio::test]
    async fn test_code_is_normalized_before_resolve() {
        let relay = InMemoryRelay::new(LoopbackConfig::default());
        relay.set_next_code("C86DGQ");
        let host = establisher(&relay);
        host.host(5).await.unwrap();

        let joiner = establisher(&relay);
        joiner.resolve_code("  c86dgq!! ").await.unwrap();
        assert_eq!(relay.last_resolved_code().as_deref(), Some("C86DGQ"));
        assert_eq!(joiner.state(), EstablishState::ConnectionDataReady);
    }

    #[tokio::test]
    async fn test_service_error_fails_session() {
        let relay = InMemoryRelay::new(LoopbackConfig::default());
        relay.fail_next(ServiceError::new("quota exceeded").with_reason("Quota"));
        let host = establisher(&relay);

        let err = host.allocate_session(5).await.unwrap_err();
        assert!(matches!(err, EstablishError::Rendezvous { operation: "allocate", .. }));
        assert_eq!(host.state(), EstablishState::Failed(err.clone()));

        // Halted: no automatic progress, and no second call until reset.
        assert!(host.allocate_session(5).await.is_err());
        assert_eq!(relay.call_count(), 1);

        host.reset().unwrap();
        assert!(host.allocate_session(5).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_allocate_times_out_and_late_success_ignored() {
        let relay = InMemoryRelay::new(LoopbackConfig::default());
        relay.set_latency(Duration::from_secs(11));
        let host = establisher(&relay);

        let err = host.allocate_session(5).await.unwrap_err();
        assert_eq!(
            err,
            EstablishError::Timeout {
                operation: "allocate",
                after: Duration::from_secs(10),
            }
        );

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(host.state(), EstablishState::Failed(err));
        assert_eq!(relay.call_count(), 0);
    }

    #[tokio::test]
    async fn test_reconfigure_while_listening_rejected() {
        let relay = InMemoryRelay::new(LoopbackConfig::default());
        let host = establisher(&relay);
        let (code, _) = host.host(5).await.unwrap();

        let other = establisher(&relay);
        other.resolve_code(code.as_str()).await.unwrap();
        let descriptor = other.descriptor().unwrap();

        assert_eq!(host.configure_transport(descriptor), Err(EstablishError::TransportActive));
        assert_eq!(host.state(), EstablishState::Listening);
        assert_eq!(host.reset(), Err(EstablishError::TransportActive));
    }

    #[tokio::test]
    async fn test_start_requires_configuration() {
        let relay = InMemoryRelay::new(LoopbackConfig::default());
        let host = establisher(&relay);
        assert!(matches!(
            host.start().await,
            Err(EstablishError::InvalidState { operation: "start", .. })
        ));
    }

    #[tokio::test]
    async fn test_join_assigns_peer_context() {
        let relay = InMemoryRelay::new(LoopbackConfig::default());
        let host = establisher(&relay);
        let (code, _) = host.host(5).await.unwrap();

        let joiner = establisher(&relay).with_user_name(PlayerName::new("Ada"));
        let context = joiner.join(code.as_str()).await.unwrap();

        assert_eq!(context.role, Role::Peer);
        assert_eq!(context.participant_id, ParticipantId::new(1));
        assert_eq!(context.local_user_name, Some(PlayerName::new("Ada")));
        assert_eq!(joiner.state(), EstablishState::Connected);
        assert_eq!(joiner.context(), Some(context));
    }

    #[tokio::test]
    async fn test_full_allocation_fails_joiner() {
        let relay = InMemoryRelay::new(LoopbackConfig::default());
        let host = establisher(&relay);
        let (code, _) = host.host(1).await.unwrap();

        let first = establisher(&relay);
        first.join(code.as_str()).await.unwrap();

        let second = establisher(&relay);
        let err = second.join(code.as_str()).await.unwrap_err();
        assert!(matches!(err, EstablishError::Transport(TransportError::Refused(_))));
        assert!(matches!(second.state(), EstablishState::Failed(_)));
    }

    #[tokio::test]
    async fn test_transport_failure_is_surfaced_without_teardown() {
        let relay = InMemoryRelay::new(LoopbackConfig::default());
        let host = establisher(&relay);
        let (code, _) = host.host(5).await.unwrap();

        let joiner = establisher(&relay);
        let mut failures = joiner.on_transport_failure();
        joiner.join(code.as_str()).await.unwrap();

        let allocation = joiner.transport().allocation_id().unwrap();
        relay.sever(allocation, "relay lost");

        let failure = failures.recv().await.unwrap();
        assert_eq!(
            failure,
            EstablishError::TransportFailure {
                reason: Some("relay lost".to_string())
            }
        );
        assert_eq!(joiner.state(), EstablishState::Connected);
    }

    #[tokio::test]
    async fn test_late_observer_sees_last_transport_failure() {
        let relay = InMemoryRelay::new(LoopbackConfig::default());
        let host = establisher(&relay);
        let (code, _) = host.host(5).await.unwrap();

        let joiner = establisher(&relay);
        joiner.join(code.as_str()).await.unwrap();
        assert_eq!(joiner.last_transport_failure(), None);

        let mut early = joiner.watch_transport_failure();
        host.transport().disconnect();
        tokio::time::timeout(Duration::from_secs(2), early.changed())
            .await
            .unwrap()
            .unwrap();

        // Subscribed only after the failure happened.
        let late = joiner.watch_transport_failure();
        let expected = EstablishError::TransportFailure {
            reason: Some("host disconnected".to_string()),
        };
        assert_eq!(*late.borrow(), Some(expected.clone()));
        assert_eq!(joiner.last_transport_failure(), Some(expected));
        assert_eq!(joiner.state(), EstablishState::Connected);
    }

    #[test]
    fn test_error_messages_are_distinct() {
        let messages = [
            EstablishError::InvalidCode(InvalidCode { raw: String::new() }).to_string(),
            EstablishError::Timeout {
                operation: "allocate",
                after: Duration::from_secs(10),
            }
            .to_string(),
            EstablishError::Rendezvous {
                operation: "allocate",
                error: ServiceError::new("nope"),
            }
            .to_string(),
            EstablishError::TransportFailure { reason: None }.to_string(),
            EstablishError::TransportActive.to_string(),
            EstablishError::ForeignAllocation(AllocationId::new_v4()).to_string(),
        ];
        for (i, a) in messages.iter().enumerate() {
            for b in &messages[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }
}
