//! # Session Registry
//!
//! Holds, per restaurant, the set of notification sessions that are currently
//! live. The registry never owns a session: it keeps a cloned handle purely so
//! the broadcaster can find it, and it never closes one. Closing is the job
//! of the session's own lifecycle handler. A session found dead is evicted
//! through its handle, which is how that handler learns about it.
//!
//! ## Invariants
//!
//! - A restaurant key is present if and only if its bucket is non-empty. The
//!   bucket is dropped the moment its last session leaves.
//! - `register` and `deregister` are idempotent and never fail.
//! - `sessions_for` returns a copy. Callers iterate the copy, never live state,
//!   and the lock is released before they do any I/O.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use crate::core::channel::NotificationChannel;

/// Opaque restaurant identifier (UUID-formatted on the wire).
pub type RestaurantId = String;

/// Process-unique session identifier.
pub type SessionId = u64;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// # Session Handle
///
/// A cheap, cloneable reference to one live channel. Equality is identity:
/// two handles are equal only if they came from the same `SessionHandle::new`.
///
/// Clones share one eviction token. Whoever finds the session dead calls
/// `evict`; the lifecycle handler that owns the session watches `evicted`
/// and tears the session down.
#[derive(Clone)]
pub struct SessionHandle {
    id: SessionId,
    channel: Arc<dyn NotificationChannel>,
    eviction: CancellationToken,
}

impl SessionHandle {
    /// Wraps an accepted channel and assigns it a fresh id.
    pub fn new(channel: Arc<dyn NotificationChannel>) -> Self {
        Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            channel,
            eviction: CancellationToken::new(),
        }
    }

    /// Marks the session dead. Idempotent.
    pub fn evict(&self) {
        self.eviction.cancel();
    }

    pub fn is_evicted(&self) -> bool {
        self.eviction.is_cancelled()
    }

    /// Completes once `evict` has been called on any clone.
    pub fn evicted(&self) -> WaitForCancellationFuture<'_> {
        self.eviction.cancelled()
    }

    /// The session id.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// The underlying channel.
    pub fn channel(&self) -> &Arc<dyn NotificationChannel> {
        &self.channel
    }
}

impl PartialEq for SessionHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for SessionHandle {}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle").field("id", &self.id).finish()
    }
}

type Buckets = HashMap<RestaurantId, HashMap<SessionId, SessionHandle>>;

/// # Session Registry
///
/// One instance per process, constructed in `main` and shared through `Arc`
/// with the lifecycle handlers and the broadcaster.
pub struct SessionRegistry {
    buckets: Mutex<Buckets>,
    max_sessions_per_restaurant: Option<usize>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    /// Creates a registry with no per-restaurant session limit.
    pub fn new() -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            max_sessions_per_restaurant: None,
        }
    }

    /// Creates a registry that admits at most `limit` sessions per restaurant.
    pub fn with_session_limit(limit: usize) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            max_sessions_per_restaurant: Some(limit),
        }
    }

    /// The configured per-restaurant limit, if any.
    pub fn session_limit(&self) -> Option<usize> {
        self.max_sessions_per_restaurant
    }

    // A panic while holding the lock cannot leave a bucket half-written (every
    // mutation is a single map call), so a poisoned lock is still usable.
    fn lock(&self) -> MutexGuard<'_, Buckets> {
        self.buckets.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// # Register
    ///
    /// Adds `session` to the restaurant's bucket, creating the bucket if it is
    /// absent. Registering a session that is already present is a no-op.
    ///
    /// # Returns
    /// `true` when the session is registered after the call. `false` only when
    /// the restaurant is already at its session limit; the registry is left
    /// unchanged in that case.
    pub fn register(&self, restaurant_id: &str, session: &SessionHandle) -> bool {
        let mut buckets = self.lock();

        if let Some(limit) = self.max_sessions_per_restaurant {
            let bucket = buckets.get(restaurant_id);
            let present = bucket.is_some_and(|b| b.contains_key(&session.id));
            if !present && bucket.map_or(0, HashMap::len) >= limit {
                tracing::warn!(
                    restaurant_id,
                    session_id = session.id,
                    limit,
                    "session limit reached, refusing registration"
                );
                return false;
            }
        }

        let bucket = buckets.entry(restaurant_id.to_string()).or_default();
        if bucket.insert(session.id, session.clone()).is_none() {
            tracing::debug!(
                restaurant_id,
                session_id = session.id,
                sessions = bucket.len(),
                "session registered"
            );
        }
        true
    }

    /// # Deregister
    ///
    /// Removes the session if present and drops the bucket when it becomes
    /// empty. Unknown restaurants or sessions are ignored.
    ///
    /// # Returns
    /// `true` if this call removed the session.
    pub fn deregister(&self, restaurant_id: &str, session_id: SessionId) -> bool {
        let mut buckets = self.lock();

        let Some(bucket) = buckets.get_mut(restaurant_id) else {
            return false;
        };
        let removed = bucket.remove(&session_id).is_some();
        if bucket.is_empty() {
            buckets.remove(restaurant_id);
        }
        if removed {
            tracing::debug!(restaurant_id, session_id, "session deregistered");
        }
        removed
    }

    /// Snapshot of the restaurant's sessions; empty if none.
    pub fn sessions_for(&self, restaurant_id: &str) -> Vec<SessionHandle> {
        self.lock()
            .get(restaurant_id)
            .map(|bucket| bucket.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Whether `session_id` is registered under `restaurant_id`.
    pub fn contains(&self, restaurant_id: &str, session_id: SessionId) -> bool {
        self.lock()
            .get(restaurant_id)
            .is_some_and(|bucket| bucket.contains_key(&session_id))
    }

    /// Number of live sessions for one restaurant.
    pub fn session_count(&self, restaurant_id: &str) -> usize {
        self.lock().get(restaurant_id).map_or(0, HashMap::len)
    }

    /// Number of restaurants with at least one live session.
    pub fn restaurant_count(&self) -> usize {
        self.lock().len()
    }

    /// Number of live sessions across all restaurants.
    pub fn total_sessions(&self) -> usize {
        self.lock().values().map(HashMap::len).sum()
    }
}
