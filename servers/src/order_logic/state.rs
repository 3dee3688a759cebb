use std::sync::Arc;
use std::time::Duration;

use lib_common::core::{Broadcaster, DispatchQueue, SessionLifecycle, SessionRegistry};
use lib_common::orders::{OrderService, OrderStore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::order_logic::auth::JwtAuth;
use crate::order_logic::config::ServerConfig;

/// Tunables for the notification side of the server.
#[derive(Debug, Clone, Copy)]
pub struct NotifyOptions {
    pub idle_timeout: Duration,
    pub send_timeout: Duration,
    /// `0` means unlimited.
    pub max_sessions_per_restaurant: usize,
}

impl From<&ServerConfig> for NotifyOptions {
    fn from(config: &ServerConfig) -> Self {
        Self {
            idle_timeout: config.idle_timeout,
            send_timeout: config.send_timeout,
            max_sessions_per_restaurant: config.max_sessions_per_restaurant,
        }
    }
}

/// Shared handles every request handler sees. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub lifecycle: SessionLifecycle,
    pub orders: Arc<OrderService>,
    pub auth: JwtAuth,
    pub shutdown: CancellationToken,
}

impl AppState {
    /// # Build Application State
    ///
    /// Wires the registry, the broadcaster and its dispatch worker, the order
    /// service and the session lifecycle together.
    ///
    /// # Returns
    /// The state and the dispatch worker's handle. The worker stops when
    /// `shutdown` is cancelled.
    pub fn build(
        store: Arc<dyn OrderStore>,
        auth: JwtAuth,
        options: NotifyOptions,
        shutdown: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let registry = Arc::new(match options.max_sessions_per_restaurant {
            0 => SessionRegistry::new(),
            limit => SessionRegistry::with_session_limit(limit),
        });
        let broadcaster = Arc::new(Broadcaster::with_send_timeout(Arc::clone(&registry), options.send_timeout));
        let (queue, worker) = DispatchQueue::spawn(broadcaster, shutdown.clone());
        let orders = Arc::new(OrderService::new(store, Arc::new(queue)));
        let lifecycle =
            SessionLifecycle::new(Arc::clone(&registry), options.idle_timeout).with_send_timeout(options.send_timeout);

        let state = Self {
            registry,
            lifecycle,
            orders,
            auth,
            shutdown,
        };
        (state, worker)
    }

    /// Whether another dashboard may connect for `restaurant_id` right now.
    /// Advisory only: registration remains the authoritative check.
    pub fn has_capacity(&self, restaurant_id: &str) -> bool {
        self.registry
            .session_limit()
            .is_none_or(|limit| self.registry.session_count(restaurant_id) < limit)
    }
}
