//! # Fan-out Broadcaster
//!
//! The `Broadcaster` takes one event for one restaurant and pushes it to every
//! session that restaurant has open.
//!
//! ## Core Design Principles:
//!
//! 1.  **Snapshot, then send**: the registry lock is held only long enough to
//!     copy the restaurant's handles. All network I/O happens on the copy, so a
//!     slow dashboard never blocks registration for anyone else.
//!
//! 2.  **Serialize once**: the event is encoded a single time and the text is
//!     shared through an `Arc<str>` across all sends.
//!
//! 3.  **Independent delivery**: every session gets its own send, run
//!     concurrently and bounded by a send timeout. One failure never stops
//!     delivery to the rest.
//!
//! 4.  **Prune what fails**: a session whose send fails (closed, transport
//!     error or timeout) is deregistered and evicted before `broadcast`
//!     returns. Eviction wakes the session's lifecycle handler, which closes
//!     the channel; the broadcaster never closes it itself.
//!
//! 5.  **Never fails**: `broadcast` returns a `BroadcastReport`, not a
//!     `Result`. Producers use the `Notifier` seam, whose `DispatchQueue`
//!     implementation queues the event and returns at once, so an order
//!     commit can never be affected by notification delivery.
//!
//! 6.  **Per-restaurant lanes**: the queue keeps issue order within a
//!     restaurant and runs different restaurants concurrently.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::channel::ChannelError;
use crate::core::event::NotificationEvent;
use crate::core::registry::{RestaurantId, SessionId, SessionRegistry};

/// Default upper bound for a single send.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// Outcome of one `broadcast` call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Sessions in the snapshot.
    pub attempted: usize,
    /// Sessions that accepted the event.
    pub delivered: usize,
    /// Sessions removed from the registry because their send failed.
    pub pruned: Vec<SessionId>,
}

/// # Broadcaster
///
/// Pushes events to every session of a restaurant and prunes the dead ones.
pub struct Broadcaster {
    registry: Arc<SessionRegistry>,
    send_timeout: Duration,
}

impl Broadcaster {
    /// Creates a broadcaster over `registry` with the default send timeout.
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self::with_send_timeout(registry, DEFAULT_SEND_TIMEOUT)
    }

    /// Creates a broadcaster whose individual sends give up after `send_timeout`.
    pub fn with_send_timeout(registry: Arc<SessionRegistry>, send_timeout: Duration) -> Self {
        Self {
            registry,
            send_timeout,
        }
    }

    /// The registry this broadcaster reads from.
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// # Broadcast
    ///
    /// ## Logic:
    /// 1.  Snapshot the restaurant's sessions. None → return immediately.
    /// 2.  Serialize the event once.
    /// 3.  Send to every session concurrently, each bounded by the send timeout.
    /// 4.  Deregister and evict every session whose send failed.
    pub async fn broadcast(&self, restaurant_id: &str, event: &NotificationEvent) -> BroadcastReport {
        let sessions = self.registry.sessions_for(restaurant_id);
        if sessions.is_empty() {
            tracing::debug!(restaurant_id, kind = event.kind(), "no live sessions, nothing to broadcast");
            return BroadcastReport::default();
        }

        let text: Arc<str> = match event.to_text() {
            Ok(text) => text.into(),
            Err(e) => {
                tracing::error!(restaurant_id, kind = event.kind(), error = %e, "failed to encode event");
                return BroadcastReport {
                    attempted: sessions.len(),
                    ..BroadcastReport::default()
                };
            }
        };

        let send_timeout = self.send_timeout;
        let sends = sessions.iter().map(|session| {
            let text = Arc::clone(&text);
            async move {
                let result = match tokio::time::timeout(send_timeout, session.channel().send_text(&text)).await {
                    Ok(result) => result,
                    Err(_) => Err(ChannelError::SendTimeout(send_timeout)),
                };
                (session, result)
            }
        });
        let results = join_all(sends).await;

        let mut report = BroadcastReport {
            attempted: sessions.len(),
            ..BroadcastReport::default()
        };
        for (session, result) in results {
            let session_id = session.id();
            match result {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    tracing::warn!(
                        restaurant_id,
                        session_id,
                        kind = event.kind(),
                        disconnect = e.is_disconnect(),
                        error = %e,
                        "send failed, pruning session"
                    );
                    self.registry.deregister(restaurant_id, session_id);
                    session.evict();
                    report.pruned.push(session_id);
                }
            }
        }

        tracing::info!(
            restaurant_id,
            kind = event.kind(),
            attempted = report.attempted,
            delivered = report.delivered,
            pruned = report.pruned.len(),
            "broadcast complete"
        );
        report
    }
}

/// Producer-side seam: hand an event over and move on.
pub trait Notifier: Send + Sync {
    /// Schedules `event` for every session of `restaurant_id`. Never fails.
    fn notify(&self, restaurant_id: &str, event: NotificationEvent);
}

struct Dispatch {
    restaurant_id: RestaurantId,
    event: NotificationEvent,
}

/// # Dispatch Queue
///
/// A `Notifier` backed by an unbounded queue and a router task. The router
/// gives every restaurant its own delivery lane: each dispatch runs in a task
/// that first waits for the restaurant's previous dispatch, then broadcasts.
/// Sessions of one restaurant see events in issue order, and a restaurant
/// whose sends are stalled never holds up another restaurant's events.
#[derive(Clone)]
pub struct DispatchQueue {
    sender: mpsc::UnboundedSender<Dispatch>,
}

impl DispatchQueue {
    /// Spawns the router. It stops when `shutdown` is cancelled or every
    /// `DispatchQueue` clone has been dropped, and returns once every lane
    /// has finished.
    pub fn spawn(broadcaster: Arc<Broadcaster>, shutdown: CancellationToken) -> (Self, JoinHandle<()>) {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Dispatch>();

        let handle = tokio::spawn(async move {
            let mut lanes: HashMap<RestaurantId, JoinHandle<()>> = HashMap::new();
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        let mut dropped = 0usize;
                        while receiver.try_recv().is_ok() {
                            dropped += 1;
                        }
                        tracing::info!(dropped, lanes = lanes.len(), "dispatch worker shutting down");
                        break;
                    }
                    next = receiver.recv() => {
                        match next {
                            Some(dispatch) => {
                                lanes.retain(|_, lane| !lane.is_finished());
                                let restaurant_id = dispatch.restaurant_id.clone();
                                let previous = lanes.remove(&restaurant_id);
                                let lane = spawn_lane(Arc::clone(&broadcaster), shutdown.clone(), previous, dispatch);
                                lanes.insert(restaurant_id, lane);
                            }
                            None => {
                                tracing::info!("dispatch queue closed");
                                break;
                            }
                        }
                    }
                }
            }
            join_all(lanes.into_values()).await;
        });

        (Self { sender }, handle)
    }
}

fn spawn_lane(
    broadcaster: Arc<Broadcaster>,
    shutdown: CancellationToken,
    previous: Option<JoinHandle<()>>,
    dispatch: Dispatch,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                tracing::debug!(
                    restaurant_id = %dispatch.restaurant_id,
                    kind = dispatch.event.kind(),
                    "dispatch abandoned at shutdown"
                );
            }
            _ = deliver_after(&broadcaster, previous, &dispatch) => {}
        }
    })
}

async fn deliver_after(broadcaster: &Broadcaster, previous: Option<JoinHandle<()>>, dispatch: &Dispatch) {
    if let Some(previous) = previous {
        if let Err(e) = previous.await {
            tracing::error!(restaurant_id = %dispatch.restaurant_id, error = %e, "previous dispatch ended abnormally");
        }
    }
    broadcaster.broadcast(&dispatch.restaurant_id, &dispatch.event).await;
}

impl Notifier for DispatchQueue {
    fn notify(&self, restaurant_id: &str, event: NotificationEvent) {
        let dispatch = Dispatch {
            restaurant_id: restaurant_id.to_string(),
            event,
        };
        if self.sender.send(dispatch).is_err() {
            tracing::warn!(restaurant_id, "dispatch worker is gone, event dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::channel::memory::{MemoryAcceptor, MemoryPeer};
    use crate::core::channel::{ChannelAcceptor, Inbound, NotificationChannel};
    use crate::core::registry::SessionHandle;
    use async_trait::async_trait;

    async fn connect(registry: &SessionRegistry, restaurant_id: &str) -> (SessionHandle, MemoryPeer) {
        let (acceptor, peer) = MemoryAcceptor::pair();
        let channel = acceptor.accept().await.unwrap();
        let handle = SessionHandle::new(Arc::new(channel));
        assert!(registry.register(restaurant_id, &handle));
        (handle, peer)
    }

    fn pong() -> NotificationEvent {
        NotificationEvent::Pong
    }

    #[tokio::test]
    async fn empty_restaurant_is_a_no_op() {
        let registry = Arc::new(SessionRegistry::new());
        let broadcaster = Broadcaster::new(Arc::clone(&registry));

        let report = broadcaster.broadcast("nobody", &pong()).await;
        assert_eq!(report, BroadcastReport::default());
        assert_eq!(registry.restaurant_count(), 0);
    }

    #[tokio::test]
    async fn failed_session_is_pruned_and_others_still_receive() {
        let registry = Arc::new(SessionRegistry::new());
        let broadcaster = Broadcaster::new(Arc::clone(&registry));

        let mut peers = Vec::new();
        for _ in 0..4 {
            peers.push(connect(&registry, "r1").await);
        }
        let (bad_handle, bad_peer) = &peers[2];
        bad_peer.break_sends();
        let bad_id = bad_handle.id();

        let report = broadcaster.broadcast("r1", &pong()).await;

        assert_eq!(report.attempted, 4);
        assert_eq!(report.delivered, 3);
        assert_eq!(report.pruned, vec![bad_id]);
        assert!(!registry.contains("r1", bad_id));
        assert_eq!(registry.session_count("r1"), 3);

        for (handle, peer) in peers.iter_mut() {
            let frames = peer.drain_outbound();
            if handle.id() == bad_id {
                assert!(frames.is_empty());
                // The broadcaster prunes and evicts; it never closes.
                assert_eq!(peer.close_calls(), 0);
                assert!(handle.is_evicted());
            } else {
                assert_eq!(frames, vec![r#"{"type":"pong"}"#.to_string()]);
                assert!(!handle.is_evicted());
            }
        }
    }

    #[tokio::test]
    async fn other_restaurants_are_untouched() {
        let registry = Arc::new(SessionRegistry::new());
        let broadcaster = Broadcaster::new(Arc::clone(&registry));

        let (_a, mut peer_a) = connect(&registry, "r1").await;
        let (_b, mut peer_b) = connect(&registry, "r2").await;

        broadcaster.broadcast("r1", &pong()).await;
        assert_eq!(peer_a.drain_outbound().len(), 1);
        assert!(peer_b.drain_outbound().is_empty());
    }

    #[tokio::test]
    async fn last_failed_session_removes_bucket() {
        let registry = Arc::new(SessionRegistry::new());
        let broadcaster = Broadcaster::new(Arc::clone(&registry));

        let (_handle, peer) = connect(&registry, "r1").await;
        peer.close();
        drop(peer);

        let report = broadcaster.broadcast("r1", &pong()).await;
        assert_eq!(report.delivered, 0);
        assert_eq!(report.pruned.len(), 1);
        assert_eq!(registry.restaurant_count(), 0);
    }

    struct StalledChannel;

    #[async_trait]
    impl NotificationChannel for StalledChannel {
        async fn send_text(&self, _text: &str) -> Result<(), ChannelError> {
            std::future::pending().await
        }

        async fn receive_or_timeout(&self, _timeout: Duration) -> Result<Inbound, ChannelError> {
            Ok(Inbound::Timeout)
        }

        async fn close(&self) {}
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_send_times_out_and_is_pruned() {
        let registry = Arc::new(SessionRegistry::new());
        let broadcaster = Broadcaster::with_send_timeout(Arc::clone(&registry), Duration::from_secs(2));

        let stalled = SessionHandle::new(Arc::new(StalledChannel));
        registry.register("r1", &stalled);
        let (_ok, mut peer) = connect(&registry, "r1").await;

        let report = broadcaster.broadcast("r1", &pong()).await;
        assert_eq!(report.delivered, 1);
        assert_eq!(report.pruned, vec![stalled.id()]);
        assert_eq!(peer.drain_outbound().len(), 1);
    }

    #[tokio::test]
    async fn dispatch_queue_preserves_issue_order() {
        let registry = Arc::new(SessionRegistry::new());
        let broadcaster = Arc::new(Broadcaster::new(Arc::clone(&registry)));
        let shutdown = CancellationToken::new();
        let (queue, worker) = DispatchQueue::spawn(broadcaster, shutdown.clone());

        let (_handle, mut peer) = connect(&registry, "r1").await;
        for n in 0..5 {
            queue.notify(
                "r1",
                NotificationEvent::PedidoAtualizado {
                    pedido_id: format!("p{n}"),
                    status: "Em preparo".to_string(),
                },
            );
        }

        for n in 0..5 {
            let frame = peer.next_outbound().await.unwrap();
            let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
            assert_eq!(value["pedido_id"], format!("p{n}"));
        }

        shutdown.cancel();
        worker.await.unwrap();
        // After shutdown the queue swallows events silently.
        queue.notify("r1", pong());
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_restaurant_does_not_delay_others() {
        let registry = Arc::new(SessionRegistry::new());
        let broadcaster = Arc::new(Broadcaster::with_send_timeout(Arc::clone(&registry), Duration::from_secs(10)));
        let shutdown = CancellationToken::new();
        let (queue, worker) = DispatchQueue::spawn(broadcaster, shutdown.clone());

        let stalled = SessionHandle::new(Arc::new(StalledChannel));
        registry.register("slow", &stalled);
        let (_fast, mut peer) = connect(&registry, "fast").await;

        queue.notify("slow", pong());
        queue.notify("fast", pong());

        let frame = tokio::time::timeout(Duration::from_secs(1), peer.next_outbound())
            .await
            .expect("fast restaurant served while the slow one is stalled");
        assert_eq!(frame.as_deref(), Some(r#"{"type":"pong"}"#));
        assert!(registry.contains("slow", stalled.id()));

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(stalled.is_evicted());
        assert!(!registry.contains("slow", stalled.id()));

        shutdown.cancel();
        worker.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_abandons_stalled_deliveries() {
        let registry = Arc::new(SessionRegistry::new());
        let broadcaster = Arc::new(Broadcaster::with_send_timeout(Arc::clone(&registry), Duration::from_secs(60)));
        let shutdown = CancellationToken::new();
        let (queue, worker) = DispatchQueue::spawn(broadcaster, shutdown.clone());

        let stalled = SessionHandle::new(Arc::new(StalledChannel));
        registry.register("slow", &stalled);
        for _ in 0..3 {
            queue.notify("slow", pong());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), worker)
            .await
            .expect("worker stops without waiting for the send timeout")
            .unwrap();
    }
}
