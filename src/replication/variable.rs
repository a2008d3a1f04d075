//! Replicated Variables
//!
//! A [`ReplicatedVariable`] is a single-writer, everyone-readable value with
//! change notification. The authority owns the canonical value; every other
//! participant holds a cache that only moves forward when an
//! authority-originated update arrives.
//!
//! ## Versioning
//!
//! Every accepted write increments the variable's version, including writes
//! of a value identical to the current one (those are re-broadcast and
//! re-notified). Peers apply an update only if its version is newer than the
//! one they hold, so a listener never sees a value go backwards.
//!
//! ## Ordering
//!
//! Writes, remote applies and listener dispatch for one variable are
//! serialized by a per-variable order lock. Listeners therefore run one at a
//! time, in version order, exactly once per accepted version. Listeners run
//! on the writer's thread while the order lock is held, so a listener may
//! only read the variable it observes or release its own [`ListenerHandle`].
//! Writes and registrations from inside a listener must be deferred to a
//! spawned task.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::core::role::{ParticipantId, Role};
use crate::network::protocol::{Outbound, ReplicationMessage, Route};

/// Values that can be replicated: cloneable, serializable and shareable.
pub trait Replicable:
    Clone + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

impl<T> Replicable for T where
    T: Clone + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

/// Monotonic per-variable version counter.
pub type Version = u64;

/// Identifier of a networked entity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityId(pub u64);

/// Identifier of a replicated variable: owning entity plus slot index.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VariableId {
    /// Owning entity.
    pub entity: EntityId,
    /// Slot within the entity, in declaration order.
    pub slot: u16,
}

impl VariableId {
    /// Create a variable id.
    pub const fn new(entity: EntityId, slot: u16) -> Self {
        Self { entity, slot }
    }
}

impl fmt::Display for VariableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.entity.0, self.slot)
    }
}

/// Who may read a variable. Fixed: everyone.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadPermission {
    /// Every participant observes every value.
    Everyone,
}

/// Who may write a variable directly. Fixed: the authority.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WritePermission {
    /// Only the authoritative participant.
    Authority,
}

/// Replication errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReplicationError {
    /// A non-authority participant tried to write directly.
    #[error("variable {0} is writable by the authority only")]
    NotAuthority(VariableId),

    /// The variable was released with its owning entity.
    #[error("variable {0} has been released")]
    Released(VariableId),

    /// The authority received an update it should have produced itself.
    #[error("authority received a remote update for variable {0}")]
    UnexpectedUpdate(VariableId),

    /// Value could not be encoded.
    #[error("failed to encode value for {variable}: {detail}")]
    Encode {
        /// Variable being written.
        variable: VariableId,
        /// Encoder message.
        detail: String,
    },

    /// Payload could not be decoded into the variable's type.
    #[error("failed to decode value for {variable}: {detail}")]
    Decode {
        /// Variable being updated.
        variable: VariableId,
        /// Decoder message.
        detail: String,
    },

    /// Every slot index of the entity is taken.
    #[error("entity {0:?} has no free variable slots")]
    SlotsExhausted(EntityId),

    /// No variable is registered under this id.
    #[error("unknown variable {0}")]
    UnknownVariable(VariableId),

    /// The requester does not own the entity and the policy requires it.
    #[error("participant {requester} does not own variable {variable}")]
    NotOwner {
        /// Target variable.
        variable: VariableId,
        /// Participant that sent the request.
        requester: ParticipantId,
    },
}

type ChangeCallback<T> = Arc<dyn Fn(&T, &T) + Send + Sync>;

struct ListenerEntry<T> {
    id: u64,
    active: Arc<AtomicBool>,
    callback: ChangeCallback<T>,
}

struct VersionedValue<T> {
    value: T,
    version: Version,
}

/// Lets a listener handle prune its entry without knowing the value type.
trait ListenerRegistry: Send + Sync {
    fn prune(&self);
}

struct VariableShared<T> {
    id: VariableId,
    role: Role,
    state: Mutex<VersionedValue<T>>,
    listeners: Mutex<Vec<ListenerEntry<T>>>,
    next_listener: AtomicU64,
    /// Serializes write + propagate + notify.
    order: Mutex<()>,
    sink: Mutex<Option<mpsc::UnboundedSender<Outbound>>>,
    released: AtomicBool,
}

impl<T: Replicable> ListenerRegistry for VariableShared<T> {
    fn prune(&self) {
        lock(&self.listeners).retain(|entry| entry.active.load(Ordering::Acquire));
    }
}

fn lock<G>(mutex: &Mutex<G>) -> MutexGuard<'_, G> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Registration of a change listener.
///
/// Releasing the handle (explicitly or by dropping it) is the only way to
/// unregister the listener, so a registration can never outlive its owner.
#[must_use = "dropping the handle unregisters the listener"]
pub struct ListenerHandle {
    variable: VariableId,
    listener: u64,
    active: Arc<AtomicBool>,
    registry: Weak<dyn ListenerRegistry>,
}

impl ListenerHandle {
    /// Variable this listener observes.
    pub fn variable(&self) -> VariableId {
        self.variable
    }

    /// Whether the listener will still be invoked.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Unregister the listener.
    pub fn release(self) {
        // Drop does the work.
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        if self.active.swap(false, Ordering::AcqRel) {
            debug!("Listener {} on {} released", self.listener, self.variable);
        }
        if let Some(registry) = self.registry.upgrade() {
            registry.prune();
        }
    }
}

impl fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerHandle")
            .field("variable", &self.variable)
            .field("listener", &self.listener)
            .field("active", &self.is_active())
            .finish()
    }
}

/// A server-authoritative replicated value.
///
/// Cloning yields another handle to the same variable.
///
/// # Example
///
/// ```
/// use relay_netvar::core::role::Role;
/// use relay_netvar::replication::{EntityId, ReplicatedVariable, VariableId};
///
/// let id = VariableId::new(EntityId(1), 0);
/// let steps = ReplicatedVariable::create(id, 0u32, Role::Authority);
/// steps.set_if_authority(1).unwrap();
/// assert_eq!(steps.get(), 1);
/// assert_eq!(steps.version(), 1);
/// ```
pub struct ReplicatedVariable<T: Replicable> {
    shared: Arc<VariableShared<T>>,
}

impl<T: Replicable> Clone for ReplicatedVariable<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: Replicable> fmt::Debug for ReplicatedVariable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.shared.state);
        f.debug_struct("ReplicatedVariable")
            .field("id", &self.shared.id)
            .field("role", &self.shared.role)
            .field("value", &state.value)
            .field("version", &state.version)
            .finish()
    }
}

impl<T: Replicable> ReplicatedVariable<T> {
    /// Create a variable with read = everyone, write = authority.
    ///
    /// `role` is the local participant's role; it decides whether
    /// [`set_if_authority`](Self::set_if_authority) is allowed here.
    pub fn create(id: VariableId, initial: T, role: Role) -> Self {
        Self {
            shared: Arc::new(VariableShared {
                id,
                role,
                state: Mutex::new(VersionedValue {
                    value: initial,
                    version: 0,
                }),
                listeners: Mutex::new(Vec::new()),
                next_listener: AtomicU64::new(1),
                order: Mutex::new(()),
                sink: Mutex::new(None),
                released: AtomicBool::new(false),
            }),
        }
    }

    /// Variable identifier.
    pub fn id(&self) -> VariableId {
        self.shared.id
    }

    /// Local role this variable was created under.
    pub fn role(&self) -> Role {
        self.shared.role
    }

    /// Read policy.
    pub fn read_permission(&self) -> ReadPermission {
        ReadPermission::Everyone
    }

    /// Write policy.
    pub fn write_permission(&self) -> WritePermission {
        WritePermission::Authority
    }

    /// Most recent value observed locally. Never blocks on the network.
    pub fn get(&self) -> T {
        lock(&self.shared.state).value.clone()
    }

    /// Most recent version observed locally.
    pub fn version(&self) -> Version {
        lock(&self.shared.state).version
    }

    /// Borrow the current value without cloning it.
    pub fn with_value<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&lock(&self.shared.state).value)
    }

    /// Whether the owning entity has released this variable.
    pub fn is_released(&self) -> bool {
        self.shared.released.load(Ordering::Acquire)
    }

    /// Write a new value. Authority only.
    ///
    /// Bumps the version even when `value` equals the current value, sends
    /// the update to every peer and notifies local listeners. Returns the
    /// new version.
    pub fn set_if_authority(&self, value: T) -> Result<Version, ReplicationError> {
        let id = self.shared.id;

        if !self.shared.role.is_authority() {
            warn!("Rejected direct write to {} from a non-authority participant", id);
            return Err(ReplicationError::NotAuthority(id));
        }
        let payload = encode_value(id, &value)?;

        let _order = lock(&self.shared.order);
        if self.is_released() {
            return Err(ReplicationError::Released(id));
        }
        let (previous, version) = {
            let mut state = lock(&self.shared.state);
            let previous = std::mem::replace(&mut state.value, value.clone());
            state.version += 1;
            (previous, state.version)
        };

        debug!("Variable {} -> version {}", id, version);
        self.propagate(ReplicationMessage::ValueChanged {
            variable: id,
            version,
            payload,
        });
        self.notify(&previous, &value);

        Ok(version)
    }

    /// Register a change listener receiving `(previous, new)`.
    pub fn on_change<F>(&self, listener: F) -> ListenerHandle
    where
        F: Fn(&T, &T) + Send + Sync + 'static,
    {
        let _order = lock(&self.shared.order);
        self.register(Arc::new(listener))
    }

    /// Register a listener and immediately invoke it with
    /// `(current, current)` so a display is correct from spawn onwards.
    pub fn on_change_with_current<F>(&self, listener: F) -> ListenerHandle
    where
        F: Fn(&T, &T) + Send + Sync + 'static,
    {
        let _order = lock(&self.shared.order);
        let current = self.get();
        listener(&current, &current);
        self.register(Arc::new(listener))
    }

    /// Number of listeners that will be invoked on the next change.
    pub fn listener_count(&self) -> usize {
        lock(&self.shared.listeners)
            .iter()
            .filter(|entry| entry.active.load(Ordering::Acquire))
            .count()
    }

    /// Release every listener and detach from the network.
    ///
    /// Called when the owning entity is destroyed. Idempotent.
    pub fn release(&self) {
        if self.shared.released.swap(true, Ordering::AcqRel) {
            return;
        }

        let _order = lock(&self.shared.order);
        let mut listeners = lock(&self.shared.listeners);
        for entry in listeners.iter() {
            entry.active.store(false, Ordering::Release);
        }
        let count = listeners.len();
        listeners.clear();
        drop(listeners);

        lock(&self.shared.sink).take();
        debug!("Variable {} released ({} listeners)", self.shared.id, count);
    }

    /// Connect the variable to the outbound replication stream.
    pub(crate) fn attach_sink(&self, sink: mpsc::UnboundedSender<Outbound>) {
        *lock(&self.shared.sink) = Some(sink);
    }

    /// Apply an authority-originated update on a peer.
    ///
    /// Returns `Ok(false)` for stale or duplicate versions, which are
    /// dropped without notifying anyone.
    pub(crate) fn apply_remote(
        &self,
        version: Version,
        value: T,
    ) -> Result<bool, ReplicationError> {
        let id = self.shared.id;

        if self.shared.role.is_authority() {
            return Err(ReplicationError::UnexpectedUpdate(id));
        }

        let _order = lock(&self.shared.order);
        if self.is_released() {
            return Err(ReplicationError::Released(id));
        }
        let previous = {
            let mut state = lock(&self.shared.state);
            if version <= state.version {
                debug!(
                    "Dropping stale update for {} (have {}, got {})",
                    id, state.version, version
                );
                return Ok(false);
            }
            state.version = version;
            std::mem::replace(&mut state.value, value.clone())
        };

        self.notify(&previous, &value);
        Ok(true)
    }

    fn register(&self, callback: ChangeCallback<T>) -> ListenerHandle {
        let listener = self.shared.next_listener.fetch_add(1, Ordering::Relaxed);
        let active = Arc::new(AtomicBool::new(!self.is_released()));

        if active.load(Ordering::Acquire) {
            lock(&self.shared.listeners).push(ListenerEntry {
                id: listener,
                active: active.clone(),
                callback,
            });
        }

        let registry: Arc<dyn ListenerRegistry> = self.shared.clone();
        ListenerHandle {
            variable: self.shared.id,
            listener,
            active,
            registry: Arc::downgrade(&registry),
        }
    }

    fn propagate(&self, message: ReplicationMessage) {
        let sink = lock(&self.shared.sink);
        if let Some(sink) = sink.as_ref() {
            let outbound = Outbound {
                route: Route::Broadcast,
                message,
            };
            if sink.send(outbound).is_err() {
                debug!("Replication stream closed; {} updated locally only", self.shared.id);
            }
        }
    }

    fn notify(&self, previous: &T, new: &T) {
        let callbacks: Vec<(u64, ChangeCallback<T>)> = {
            let mut listeners = lock(&self.shared.listeners);
            listeners.retain(|entry| entry.active.load(Ordering::Acquire));
            listeners
                .iter()
                .map(|entry| (entry.id, entry.callback.clone()))
                .collect()
        };

        for (listener, callback) in callbacks {
            // A listener released by an earlier callback in this round is skipped.
            let still_active = lock(&self.shared.listeners)
                .iter()
                .any(|entry| entry.id == listener);
            if still_active {
                callback(previous, new);
            }
        }
    }
}

fn encode_value<T: Serialize>(
    variable: VariableId,
    value: &T,
) -> Result<Vec<u8>, ReplicationError> {
    bincode::serialize(value).map_err(|e| ReplicationError::Encode {
        variable,
        detail: e.to_string(),
    })
}

fn decode_value<T: DeserializeOwned>(
    variable: VariableId,
    payload: &[u8],
) -> Result<T, ReplicationError> {
    bincode::deserialize(payload).map_err(|e| ReplicationError::Decode {
        variable,
        detail: e.to_string(),
    })
}

// =============================================================================
// TYPE-ERASED ACCESS
// =============================================================================

/// Type-erased view of a variable, used by the replication hub to route
/// encoded payloads without knowing `T`.
pub(crate) trait ReplicatedSlot: Send + Sync {
    /// Variable identifier.
    fn id(&self) -> VariableId;

    /// Current version and encoded value.
    fn snapshot(&self) -> Result<(Version, Vec<u8>), ReplicationError>;

    /// Apply an authority update received from the wire.
    fn apply_encoded(&self, version: Version, payload: &[u8]) -> Result<bool, ReplicationError>;

    /// Apply a mutation request on the authority.
    fn apply_request(&self, payload: &[u8]) -> Result<Version, ReplicationError>;

    /// Release listeners and detach from the network.
    fn release(&self);
}

impl<T: Replicable> ReplicatedSlot for ReplicatedVariable<T> {
    fn id(&self) -> VariableId {
        self.shared.id
    }

    fn snapshot(&self) -> Result<(Version, Vec<u8>), ReplicationError> {
        let state = lock(&self.shared.state);
        let payload = encode_value(self.shared.id, &state.value)?;
        Ok((state.version, payload))
    }

    fn apply_encoded(&self, version: Version, payload: &[u8]) -> Result<bool, ReplicationError> {
        let value = decode_value(self.shared.id, payload)?;
        self.apply_remote(version, value)
    }

    fn apply_request(&self, payload: &[u8]) -> Result<Version, ReplicationError> {
        let value = decode_value(self.shared.id, payload)?;
        self.set_if_authority(value)
    }

    fn release(&self) {
        ReplicatedVariable::release(self)
    }
}
