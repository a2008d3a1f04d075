//! In-Memory Relay
//!
//! An in-process stand-in for a hosted relay: [`InMemoryRelay`] implements
//! [`RendezvousService`] and routes datagrams between the
//! [`LoopbackTransport`]s it hands out. It behaves like the real thing where
//! it matters to session establishment:
//!
//! - allocations carry derived key material and connection blobs, and a
//!   transport presenting the wrong ones is refused
//! - join codes exist only once the host has asked for one
//! - an allocation admits at most `max_participants` joiners
//! - delivery is in order per sender
//!
//! Rendezvous latency and one-shot service failures can be injected for
//! tests, and [`InMemoryRelay::sever`] simulates the relay dropping a session.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::core::join_code::JoinCode;
use crate::core::role::ParticipantId;
use crate::network::protocol::Route;
use crate::network::rendezvous::{
    Allocation, AllocationId, JoinAllocation, RelayEndpoint, RendezvousService, ServiceError,
};
use crate::network::transport::{
    Datagram, RelayServerData, Transport, TransportError, TransportEvent,
};

/// Characters used in generated join codes.
const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Length of generated join codes.
const CODE_LENGTH: usize = 6;

/// Capacity of each transport's event channel.
const EVENT_CAPACITY: usize = 64;

/// In-memory relay configuration.
#[derive(Debug, Clone)]
pub struct LoopbackConfig {
    /// Delay applied to every rendezvous call.
    pub latency: Duration,
    /// Host name reported in relay endpoints.
    pub region_host: String,
    /// Port of the first allocation; later ones count up.
    pub base_port: u16,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            latency: Duration::ZERO,
            region_host: "relay.loopback".to_string(),
            base_port: 7777,
        }
    }
}

impl LoopbackConfig {
    /// Load from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            latency: std::env::var("LOOPBACK_LATENCY_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.latency),
            region_host: std::env::var("LOOPBACK_RELAY_HOST").unwrap_or(defaults.region_host),
            base_port: std::env::var("LOOPBACK_RELAY_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.base_port),
        }
    }
}

/// A participant attached to an allocation.
struct Member {
    inbox: mpsc::UnboundedSender<Datagram>,
    events: broadcast::Sender<TransportEvent>,
}

/// Relay-side state of one allocation.
struct RelaySession {
    endpoint: RelayEndpoint,
    key: Vec<u8>,
    host_connection_data: Vec<u8>,
    max_participants: usize,
    code: Option<String>,
    host: Option<Member>,
    peers: BTreeMap<ParticipantId, Member>,
    next_participant: u64,
    issued_joins: u64,
}

impl RelaySession {
    fn members(&self) -> impl Iterator<Item = (ParticipantId, &Member)> {
        self.host
            .iter()
            .map(|m| (ParticipantId::AUTHORITY, m))
            .chain(self.peers.iter().map(|(id, m)| (*id, m)))
    }

    fn member(&self, id: ParticipantId) -> Option<&Member> {
        if id == ParticipantId::AUTHORITY {
            self.host.as_ref()
        } else {
            self.peers.get(&id)
        }
    }
}

#[derive(Default)]
struct RelayState {
    sessions: BTreeMap<AllocationId, RelaySession>,
    codes: BTreeMap<String, AllocationId>,
    next_code: Option<String>,
    fail_next: Option<ServiceError>,
    last_resolved: Option<String>,
}

fn lock<G>(mutex: &Mutex<G>) -> MutexGuard<'_, G> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn derive(domain: &[u8], allocation_id: AllocationId, nonce: u64) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(domain);
    hasher.update(allocation_id.as_bytes());
    hasher.update(nonce.to_le_bytes());
    hasher.finalize().into()
}

/// In-process rendezvous service and relay router.
pub struct InMemoryRelay {
    config: LoopbackConfig,
    latency: Mutex<Duration>,
    state: Mutex<RelayState>,
    calls: AtomicUsize,
}

impl InMemoryRelay {
    /// Create a relay.
    pub fn new(config: LoopbackConfig) -> Arc<Self> {
        Arc::new(Self {
            latency: Mutex::new(config.latency),
            config,
            state: Mutex::new(RelayState::default()),
            calls: AtomicUsize::new(0),
        })
    }

    /// Change the delay applied to rendezvous calls.
    pub fn set_latency(&self, latency: Duration) {
        *lock(&self.latency) = latency;
    }

    /// Make the next rendezvous call fail with `error`.
    pub fn fail_next(&self, error: ServiceError) {
        lock(&self.state).fail_next = Some(error);
    }

    /// Use `code` for the next join code instead of generating one.
    pub fn set_next_code(&self, code: &str) {
        lock(&self.state).next_code = Some(code.to_string());
    }

    /// Number of rendezvous calls received so far.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Code text of the most recent `resolve` call, as received.
    pub fn last_resolved_code(&self) -> Option<String> {
        lock(&self.state).last_resolved.clone()
    }

    /// Number of joiners attached to an allocation.
    pub fn peer_count(&self, allocation_id: AllocationId) -> usize {
        lock(&self.state)
            .sessions
            .get(&allocation_id)
            .map(|s| s.peers.len())
            .unwrap_or(0)
    }

    /// Create a transport bound to this relay.
    pub fn transport(self: &Arc<Self>) -> Arc<LoopbackTransport> {
        Arc::new(LoopbackTransport::new(self.clone()))
    }

    /// Drop an allocation and report a transport failure to everyone on it.
    pub fn sever(&self, allocation_id: AllocationId, reason: &str) {
        let mut state = lock(&self.state);
        let Some(session) = state.sessions.remove(&allocation_id) else {
            debug!("Sever requested for unknown allocation {}", allocation_id);
            return;
        };
        if let Some(code) = &session.code {
            state.codes.remove(code);
        }
        drop(state);

        warn!("Relay severed allocation {}: {}", allocation_id, reason);
        for (_, member) in session.members() {
            let _ = member.events.send(TransportEvent::Failure {
                reason: Some(reason.to_string()),
            });
        }
    }

    /// Sleep for the configured latency, count the call and consume any
    /// injected failure.
    async fn begin_call(&self, operation: &str) -> Result<(), ServiceError> {
        let latency = *lock(&self.latency);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        self.calls.fetch_add(1, Ordering::SeqCst);

        match lock(&self.state).fail_next.take() {
            Some(error) => {
                debug!("Injected failure for {}: {}", operation, error);
                Err(error)
            }
            None => Ok(()),
        }
    }

    fn generate_code(state: &RelayState, allocation_id: AllocationId) -> String {
        let mut nonce = 0u64;
        loop {
            let digest = derive(b"join-code", allocation_id, nonce);
            let code: String = digest[..CODE_LENGTH]
                .iter()
                .map(|b| CODE_ALPHABET[*b as usize % CODE_ALPHABET.len()] as char)
                .collect();
            if !state.codes.contains_key(&code) {
                return code;
            }
            nonce += 1;
        }
    }

    fn session_for<'a>(
        state: &'a mut RelayState,
        data: &RelayServerData,
    ) -> Result<(AllocationId, &'a mut RelaySession), TransportError> {
        let allocation_id = AllocationId::from_slice(&data.allocation_id_bytes)
            .ok_or_else(|| TransportError::Refused("malformed allocation id".to_string()))?;
        let session = state
            .sessions
            .get_mut(&allocation_id)
            .ok_or_else(|| TransportError::Refused("unknown allocation".to_string()))?;

        if session.key != data.key {
            return Err(TransportError::Refused("key mismatch".to_string()));
        }
        if session.host_connection_data != data.host_connection_data {
            return Err(TransportError::Refused("host connection data mismatch".to_string()));
        }
        if session.endpoint != data.endpoint {
            return Err(TransportError::Refused(format!("wrong relay endpoint {}", data.endpoint)));
        }
        Ok((allocation_id, session))
    }

    fn attach_host(
        &self,
        data: &RelayServerData,
        member: Member,
    ) -> Result<AllocationId, TransportError> {
        let mut state = lock(&self.state);
        let (allocation_id, session) = Self::session_for(&mut state, data)?;
        if session.host.is_some() {
            return Err(TransportError::Refused("allocation already has a host".to_string()));
        }
        session.host = Some(member);
        info!("Host listening on allocation {}", allocation_id);
        Ok(allocation_id)
    }

    fn attach_peer(
        &self,
        data: &RelayServerData,
        member: Member,
    ) -> Result<(AllocationId, ParticipantId), TransportError> {
        let mut state = lock(&self.state);
        let (allocation_id, session) = Self::session_for(&mut state, data)?;

        if session.host.is_none() {
            return Err(TransportError::Refused("host is not listening".to_string()));
        }
        if session.peers.len() >= session.max_participants {
            return Err(TransportError::Refused(format!(
                "allocation is full ({} participants)",
                session.max_participants
            )));
        }

        let participant = ParticipantId::new(session.next_participant);
        session.next_participant += 1;
        for (_, existing) in session.members() {
            let _ = existing.events.send(TransportEvent::PeerConnected(participant));
        }
        session.peers.insert(participant, member);

        info!("Participant {} joined allocation {}", participant, allocation_id);
        Ok((allocation_id, participant))
    }

    fn detach(&self, allocation_id: AllocationId, participant: ParticipantId) {
        let mut state = lock(&self.state);
        if participant == ParticipantId::AUTHORITY {
            let Some(session) = state.sessions.remove(&allocation_id) else {
                return;
            };
            if let Some(code) = &session.code {
                state.codes.remove(code);
            }
            drop(state);

            info!("Host left allocation {}", allocation_id);
            for (_, member) in session.peers.iter() {
                let _ = member.events.send(TransportEvent::Failure {
                    reason: Some("host disconnected".to_string()),
                });
            }
            return;
        }

        if let Some(session) = state.sessions.get_mut(&allocation_id) {
            if session.peers.remove(&participant).is_some() {
                debug!("Participant {} left allocation {}", participant, allocation_id);
                for (_, member) in session.members() {
                    let _ = member.events.send(TransportEvent::PeerDisconnected(participant));
                }
            }
        }
    }

    fn route(
        &self,
        allocation_id: AllocationId,
        from: ParticipantId,
        route: Route,
        payload: Vec<u8>,
    ) -> Result<(), TransportError> {
        let state = lock(&self.state);
        let session = state
            .sessions
            .get(&allocation_id)
            .ok_or(TransportError::Closed)?;

        let deliver = |to: ParticipantId, member: &Member, payload: Vec<u8>| {
            if member.inbox.send(Datagram { from, payload }).is_err() {
                debug!("Inbox of {} is closed", to);
            }
        };

        match route {
            Route::Authority => match session.host.as_ref() {
                Some(host) => deliver(ParticipantId::AUTHORITY, host, payload),
                None => debug!("No host attached to {}", allocation_id),
            },
            Route::Participant(to) => match session.member(to) {
                Some(member) => deliver(to, member, payload),
                None => debug!("Dropping datagram for unknown participant {}", to),
            },
            Route::Broadcast => {
                for (to, member) in session.members().filter(|(id, _)| *id != from) {
                    deliver(to, member, payload.clone());
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl RendezvousService for InMemoryRelay {
    async fn allocate(&self, max_participants: usize) -> Result<Allocation, ServiceError> {
        self.begin_call("allocate").await?;

        let allocation_id = AllocationId::new_v4();
        let key = derive(b"session-key", allocation_id, 0).to_vec();
        let connection_data = derive(b"host-connection", allocation_id, 0).to_vec();

        let mut state = lock(&self.state);
        let endpoint = RelayEndpoint {
            host: self.config.region_host.clone(),
            port: self
                .config
                .base_port
                .wrapping_add(state.sessions.len() as u16),
        };
        state.sessions.insert(
            allocation_id,
            RelaySession {
                endpoint: endpoint.clone(),
                key: key.clone(),
                host_connection_data: connection_data.clone(),
                max_participants,
                code: None,
                host: None,
                peers: BTreeMap::new(),
                next_participant: 1,
                issued_joins: 0,
            },
        );

        info!(
            "Allocated {} on {} for {} participants (key {})",
            allocation_id,
            endpoint,
            max_participants,
            hex::encode(&key[..4])
        );

        Ok(Allocation {
            allocation_id,
            endpoint,
            allocation_id_bytes: allocation_id.as_bytes().to_vec(),
            connection_data,
            key,
        })
    }

    async fn get_code(&self, allocation_id: AllocationId) -> Result<String, ServiceError> {
        self.begin_call("get_code").await?;

        let mut state = lock(&self.state);
        if !state.sessions.contains_key(&allocation_id) {
            return Err(ServiceError::new("allocation not found").with_reason("NotFound"));
        }

        let code = match state.next_code.take() {
            Some(code) => code,
            None => Self::generate_code(&state, allocation_id),
        };
        let previous = state
            .sessions
            .get_mut(&allocation_id)
            .and_then(|session| session.code.replace(code.clone()));
        if let Some(previous) = previous {
            state.codes.remove(&previous);
        }
        state.codes.insert(code.clone(), allocation_id);

        debug!("Join code {} issued for {}", code, allocation_id);
        Ok(code)
    }

    async fn resolve(&self, code: &JoinCode) -> Result<JoinAllocation, ServiceError> {
        self.begin_call("resolve").await?;

        let mut state = lock(&self.state);
        state.last_resolved = Some(code.as_str().to_string());

        let allocation_id = *state
            .codes
            .get(code.as_str())
            .ok_or_else(|| ServiceError::new("join code not found").with_reason("NotFound"))?;
        let session = state
            .sessions
            .get_mut(&allocation_id)
            .ok_or_else(|| ServiceError::new("allocation not found").with_reason("NotFound"))?;

        session.issued_joins += 1;
        let connection_data =
            derive(b"peer-connection", allocation_id, session.issued_joins).to_vec();

        Ok(JoinAllocation {
            allocation_id,
            endpoint: session.endpoint.clone(),
            allocation_id_bytes: allocation_id.as_bytes().to_vec(),
            connection_data,
            host_connection_data: session.host_connection_data.clone(),
            key: session.key.clone(),
        })
    }
}

// =============================================================================
// TRANSPORT
// =============================================================================

/// Where a started transport is attached.
#[derive(Clone, Copy, Debug)]
struct Link {
    allocation_id: AllocationId,
    participant: ParticipantId,
}

/// A transport whose relay is an [`InMemoryRelay`].
pub struct LoopbackTransport {
    relay: Arc<InMemoryRelay>,
    server_data: Mutex<Option<RelayServerData>>,
    link: Mutex<Option<Link>>,
    /// Handed to the relay on start; the inbox closes when the relay drops it.
    inbox_tx: Mutex<Option<mpsc::UnboundedSender<Datagram>>>,
    inbox: tokio::sync::Mutex<mpsc::UnboundedReceiver<Datagram>>,
    events: broadcast::Sender<TransportEvent>,
}

impl LoopbackTransport {
    fn new(relay: Arc<InMemoryRelay>) -> Self {
        let (inbox_tx, inbox) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            relay,
            server_data: Mutex::new(None),
            link: Mutex::new(None),
            inbox_tx: Mutex::new(Some(inbox_tx)),
            inbox: tokio::sync::Mutex::new(inbox),
            events,
        }
    }

    /// Allocation this transport is attached to, once started.
    pub fn allocation_id(&self) -> Option<AllocationId> {
        lock(&self.link).map(|link| link.allocation_id)
    }

    /// Leave the relay. Peers see a disconnect; if this is the host, every
    /// peer sees a transport failure.
    pub fn disconnect(&self) {
        if let Some(link) = lock(&self.link).take() {
            self.relay.detach(link.allocation_id, link.participant);
        }
    }

    fn start_member(&self) -> Result<(RelayServerData, Member), TransportError> {
        if lock(&self.link).is_some() {
            return Err(TransportError::Active);
        }
        let data = lock(&self.server_data)
            .clone()
            .ok_or(TransportError::NotConfigured)?;
        let inbox = lock(&self.inbox_tx).clone().ok_or(TransportError::Closed)?;
        Ok((
            data,
            Member {
                inbox,
                events: self.events.clone(),
            },
        ))
    }

    fn finish_start(
        &self,
        result: Result<Link, TransportError>,
    ) -> Result<ParticipantId, TransportError> {
        match result {
            Ok(link) => {
                // The relay holds the only sender from here on.
                lock(&self.inbox_tx).take();
                *lock(&self.link) = Some(link);
                let _ = self.events.send(TransportEvent::Connected(link.participant));
                Ok(link.participant)
            }
            Err(e) => {
                warn!("Loopback transport failed to start: {}", e);
                let _ = self.events.send(TransportEvent::Failure {
                    reason: Some(e.to_string()),
                });
                Err(e)
            }
        }
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    fn configure_relay(&self, data: RelayServerData) -> Result<(), TransportError> {
        if self.is_active() {
            return Err(TransportError::Active);
        }
        if data.use_stream_mode {
            debug!("Stream mode requested; the in-memory relay ignores it");
        }
        *lock(&self.server_data) = Some(data);
        Ok(())
    }

    fn is_active(&self) -> bool {
        lock(&self.link).is_some()
    }

    async fn listen(&self) -> Result<ParticipantId, TransportError> {
        let (data, member) = self.start_member()?;
        let result = self.relay.attach_host(&data, member).map(|allocation_id| Link {
            allocation_id,
            participant: ParticipantId::AUTHORITY,
        });
        self.finish_start(result)
    }

    async fn connect(&self) -> Result<ParticipantId, TransportError> {
        let (data, member) = self.start_member()?;
        let result = self
            .relay
            .attach_peer(&data, member)
            .map(|(allocation_id, participant)| Link {
                allocation_id,
                participant,
            });
        self.finish_start(result)
    }

    fn local_participant(&self) -> Option<ParticipantId> {
        lock(&self.link).map(|link| link.participant)
    }

    async fn send(&self, route: Route, payload: Vec<u8>) -> Result<(), TransportError> {
        let link = (*lock(&self.link)).ok_or(TransportError::Closed)?;
        self.relay.route(link.allocation_id, link.participant, route, payload)
    }

    async fn recv(&self) -> Option<Datagram> {
        self.inbox.lock().await.recv().await
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }
}

impl Drop for LoopbackTransport {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn hosted(
        relay: &Arc<InMemoryRelay>,
        max: usize,
    ) -> (Allocation, String, Arc<LoopbackTransport>) {
        let allocation = relay.allocate(max).await.unwrap();
        let code = relay.get_code(allocation.allocation_id).await.unwrap();
        let host = relay.transport();
        host.configure_relay(RelayServerData::from_allocation(&allocation, false))
            .unwrap();
        host.listen().await.unwrap();
        (allocation, code, host)
    }

    async fn joined(
        relay: &Arc<InMemoryRelay>,
        code: &str,
    ) -> Result<Arc<LoopbackTransport>, TransportError> {
        let join = relay.resolve(&JoinCode::parse(code).unwrap()).await.unwrap();
        let peer = relay.transport();
        peer.configure_relay(RelayServerData::from_join_allocation(&join, false))?;
        peer.connect().await?;
        Ok(peer)
    }

    #[tokio::test]
    async fn test_generated_code_is_normalized() {
        let relay = InMemoryRelay::new(LoopbackConfig::default());
        let allocation = relay.allocate(2).await.unwrap();
        let code = relay.get_code(allocation.allocation_id).await.unwrap();

        assert_eq!(code.len(), CODE_LENGTH);
        assert_eq!(JoinCode::parse(&code).unwrap().as_str(), code);
    }

    #[tokio::test]
    async fn test_resolve_unknown_code() {
        let relay = InMemoryRelay::new(LoopbackConfig::default());
        let err = relay
            .resolve(&JoinCode::parse("NOPE42").unwrap())
            .await
            .unwrap_err();
        assert_eq!(err.reason.as_deref(), Some("NotFound"));
        assert_eq!(relay.last_resolved_code().as_deref(), Some("NOPE42"));
    }

    #[tokio::test]
    async fn test_host_and_peer_exchange_datagrams() {
        let relay = InMemoryRelay::new(LoopbackConfig::default());
        let (_, code, host) = hosted(&relay, 4).await;
        let peer = joined(&relay, &code).await.unwrap();

        assert_eq!(host.local_participant(), Some(ParticipantId::AUTHORITY));
        assert_eq!(peer.local_participant(), Some(ParticipantId::new(1)));

        host.send(Route::Broadcast, vec![1, 2]).await.unwrap();
        let datagram = peer.recv().await.unwrap();
        assert_eq!(datagram.from, ParticipantId::AUTHORITY);
        assert_eq!(datagram.payload, vec![1, 2]);

        peer.send(Route::Authority, vec![3]).await.unwrap();
        let datagram = host.recv().await.unwrap();
        assert_eq!(datagram.from, ParticipantId::new(1));
    }

    #[tokio::test]
    async fn test_capacity_enforced() {
        let relay = InMemoryRelay::new(LoopbackConfig::default());
        let (allocation, code, _host) = hosted(&relay, 1).await;
        let _first = joined(&relay, &code).await.unwrap();

        let second = joined(&relay, &code).await;
        assert!(matches!(second, Err(TransportError::Refused(_))));
        assert_eq!(relay.peer_count(allocation.allocation_id), 1);
    }

    #[tokio::test]
    async fn test_wrong_key_refused() {
        let relay = InMemoryRelay::new(LoopbackConfig::default());
        let (_, code, _host) = hosted(&relay, 2).await;
        let mut join = relay.resolve(&JoinCode::parse(&code).unwrap()).await.unwrap();
        join.key = vec![0; 32];

        let peer = relay.transport();
        let mut events = peer.subscribe();
        peer.configure_relay(RelayServerData::from_join_allocation(&join, false))
            .unwrap();

        assert!(matches!(peer.connect().await, Err(TransportError::Refused(_))));
        assert!(matches!(events.recv().await, Ok(TransportEvent::Failure { .. })));
    }

    #[tokio::test]
    async fn test_reconfigure_while_active_rejected() {
        let relay = InMemoryRelay::new(LoopbackConfig::default());
        let (allocation, _, host) = hosted(&relay, 2).await;
        let again = host.configure_relay(RelayServerData::from_allocation(&allocation, false));
        assert_eq!(again, Err(TransportError::Active));
    }

    #[tokio::test]
    async fn test_sever_reports_failure() {
        let relay = InMemoryRelay::new(LoopbackConfig::default());
        let (allocation, code, _host) = hosted(&relay, 2).await;
        let peer = joined(&relay, &code).await.unwrap();
        let mut events = peer.subscribe();

        relay.sever(allocation.allocation_id, "relay maintenance");

        assert_eq!(
            events.recv().await.unwrap(),
            TransportEvent::Failure {
                reason: Some("relay maintenance".to_string())
            }
        );
        assert!(peer.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_injected_failure_is_one_shot() {
        let relay = InMemoryRelay::new(LoopbackConfig::default());
        relay.fail_next(ServiceError::new("quota exceeded"));

        assert!(relay.allocate(2).await.is_err());
        assert!(relay.allocate(2).await.is_ok());
        assert_eq!(relay.call_count(), 2);
    }
}
