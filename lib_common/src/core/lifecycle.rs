//! # Session Lifecycle
//!
//! Drives one dashboard connection from handshake to teardown:
//!
//! ```text
//! Connecting ──accept + register──▶ Active ──closed / disconnect / fault / eviction / shutdown──▶ Closing ──▶ Closed
//!                                    │  ▲
//!                                    └──┘ timeout, ping → pong, other payloads ignored
//! ```
//!
//! The idle timeout is not an expiry. It only bounds how long the loop sleeps
//! before checking the shutdown token again.
//!
//! A session the broadcaster pruned is evicted through its `SessionHandle`;
//! the loop wakes on that and tears the session down like any other exit.
//! Pong replies are bounded by the send timeout and raced against shutdown
//! and eviction, so a stalled peer cannot pin the handler.
//!
//! Leaving `Active` always goes through a `SessionGuard`, which deregisters
//! the session and then closes its channel, exactly once, on every exit path.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::core::channel::{ChannelAcceptor, ChannelError, Inbound, NotificationChannel};
use crate::core::dispatcher::DEFAULT_SEND_TIMEOUT;
use crate::core::event::{is_ping, NotificationEvent};
use crate::core::registry::{SessionHandle, SessionId, SessionRegistry};

/// Default idle poll interval.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// States a session moves through. Only ever advances.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Active,
    Closing,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Connecting => "connecting",
            SessionState::Active => "active",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Why a session ended normally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// The remote closed the connection.
    RemoteClosed,
    /// The transport reported a failure that only means the remote is gone.
    Disconnected,
    /// A failed delivery pruned the session from the registry.
    Evicted,
    /// The server is shutting down.
    Shutdown,
}

/// Why a session ended abnormally. Affects that session only.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("handshake failed: {0}")]
    Handshake(#[source] ChannelError),

    #[error("restaurant {restaurant_id} already has {limit} live sessions")]
    Capacity { restaurant_id: String, limit: usize },

    #[error("session {session_id} failed: {source}")]
    Transport {
        session_id: SessionId,
        #[source]
        source: ChannelError,
    },
}

/// Deregisters and closes a session exactly once.
///
/// `release` is the normal path. `Drop` covers a cancelled or panicking
/// handler task: it deregisters synchronously and hands the close to the
/// runtime, if one is still there.
struct SessionGuard {
    registry: Arc<SessionRegistry>,
    restaurant_id: String,
    handle: Option<SessionHandle>,
}

impl SessionGuard {
    fn new(registry: Arc<SessionRegistry>, restaurant_id: &str, handle: SessionHandle) -> Self {
        Self {
            registry,
            restaurant_id: restaurant_id.to_string(),
            handle: Some(handle),
        }
    }

    async fn release(mut self) {
        if let Some(handle) = self.handle.take() {
            self.registry.deregister(&self.restaurant_id, handle.id());
            handle.channel().close().await;
        }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        self.registry.deregister(&self.restaurant_id, handle.id());
        tracing::warn!(
            restaurant_id = %self.restaurant_id,
            session_id = handle.id(),
            "session handler dropped before cleanup finished"
        );
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let channel = Arc::clone(handle.channel());
            runtime.spawn(async move { channel.close().await });
        }
    }
}

/// # Session Lifecycle Handler
///
/// Shared by every connection handler of the process. Holds the registry,
/// the idle poll interval and the pong send timeout; all per-session state
/// lives on the stack of `run`.
#[derive(Clone)]
pub struct SessionLifecycle {
    registry: Arc<SessionRegistry>,
    idle_timeout: Duration,
    send_timeout: Duration,
}

impl SessionLifecycle {
    pub fn new(registry: Arc<SessionRegistry>, idle_timeout: Duration) -> Self {
        Self {
            registry,
            idle_timeout,
            send_timeout: DEFAULT_SEND_TIMEOUT,
        }
    }

    /// Bounds how long a pong reply may take before the session is failed.
    pub fn with_send_timeout(mut self, send_timeout: Duration) -> Self {
        self.send_timeout = send_timeout;
        self
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    pub fn send_timeout(&self) -> Duration {
        self.send_timeout
    }

    /// # Run Session
    ///
    /// Accepts the connection, registers it under `restaurant_id` and serves it
    /// until it ends.
    ///
    /// ## Logic:
    /// 1.  **Connecting**: complete the handshake. A rejected handshake returns
    ///     `SessionError::Handshake` and never touches the registry.
    /// 2.  Register. A full restaurant closes the channel and returns
    ///     `SessionError::Capacity`.
    /// 3.  **Active**: wait for inbound traffic up to the idle timeout, for
    ///     `shutdown`, or for the session's eviction.
    ///     - `Timeout`: loop.
    ///     - `{"type":"ping"}`: reply `{"type":"pong"}` within the send
    ///       timeout. Expiry ends with `SessionError::Transport`.
    ///     - Any other payload: ignored.
    ///     - `Closed` or a disconnect-class error: end normally.
    ///     - Any other error: end with `SessionError::Transport`.
    /// 4.  **Closing → Closed**: deregister, then close. Runs on every exit
    ///     from `Active`.
    pub async fn run<A>(
        &self,
        restaurant_id: &str,
        acceptor: A,
        shutdown: &CancellationToken,
    ) -> Result<SessionOutcome, SessionError>
    where
        A: ChannelAcceptor,
    {
        tracing::debug!(restaurant_id, state = %SessionState::Connecting, "session opening");

        let channel: Arc<dyn NotificationChannel> = match acceptor.accept().await {
            Ok(channel) => Arc::new(channel),
            Err(e) => {
                tracing::warn!(restaurant_id, error = %e, "handshake failed");
                return Err(SessionError::Handshake(e));
            }
        };

        let handle = SessionHandle::new(channel);
        let session_id = handle.id();
        if !self.registry.register(restaurant_id, &handle) {
            handle.channel().close().await;
            return Err(SessionError::Capacity {
                restaurant_id: restaurant_id.to_string(),
                limit: self.registry.session_limit().unwrap_or_default(),
            });
        }
        let guard = SessionGuard::new(Arc::clone(&self.registry), restaurant_id, handle.clone());
        tracing::info!(restaurant_id, session_id, state = %SessionState::Active, "session active");

        let result = self.serve(restaurant_id, &handle, shutdown).await;

        tracing::debug!(restaurant_id, session_id, state = %SessionState::Closing, "session closing");
        guard.release().await;

        match &result {
            Ok(outcome) => {
                tracing::info!(restaurant_id, session_id, state = %SessionState::Closed, ?outcome, "session closed")
            }
            Err(e) => {
                tracing::error!(restaurant_id, session_id, state = %SessionState::Closed, error = %e, "session failed")
            }
        }
        result
    }

    async fn serve(
        &self,
        restaurant_id: &str,
        handle: &SessionHandle,
        shutdown: &CancellationToken,
    ) -> Result<SessionOutcome, SessionError> {
        let session_id = handle.id();
        let channel = handle.channel();

        loop {
            let inbound = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return Ok(SessionOutcome::Shutdown),
                _ = handle.evicted() => return Ok(SessionOutcome::Evicted),
                inbound = channel.receive_or_timeout(self.idle_timeout) => inbound,
            };

            match inbound {
                Ok(Inbound::Timeout) => {
                    tracing::trace!(restaurant_id, session_id, "idle timeout, still active");
                }
                Ok(Inbound::Message(text)) if is_ping(&text) => {
                    let pong = tokio::time::timeout(self.send_timeout, channel.send_event(&NotificationEvent::Pong));
                    let sent = tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => return Ok(SessionOutcome::Shutdown),
                        _ = handle.evicted() => return Ok(SessionOutcome::Evicted),
                        sent = pong => sent.unwrap_or(Err(ChannelError::SendTimeout(self.send_timeout))),
                    };
                    if let Err(e) = sent {
                        return classify(session_id, e);
                    }
                }
                Ok(Inbound::Message(_)) => {
                    tracing::debug!(restaurant_id, session_id, "ignoring inbound payload");
                }
                Ok(Inbound::Closed) => return Ok(SessionOutcome::RemoteClosed),
                Err(e) => return classify(session_id, e),
            }
        }
    }
}

fn classify(session_id: SessionId, error: ChannelError) -> Result<SessionOutcome, SessionError> {
    if error.is_disconnect() {
        tracing::debug!(session_id, error = %error, "treating transport error as disconnect");
        Ok(SessionOutcome::Disconnected)
    } else {
        Err(SessionError::Transport {
            session_id,
            source: error,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use super::*;
    use crate::core::channel::memory::MemoryAcceptor;
    use crate::core::dispatcher::Broadcaster;

    const IDLE: Duration = Duration::from_secs(60);

    fn lifecycle() -> (SessionLifecycle, Arc<SessionRegistry>) {
        let registry = Arc::new(SessionRegistry::new());
        (SessionLifecycle::new(Arc::clone(&registry), IDLE), registry)
    }

    #[tokio::test(start_paused = true)]
    async fn idle_timeouts_keep_session_registered() {
        let (lifecycle, registry) = lifecycle();
        let (acceptor, peer) = MemoryAcceptor::pair();
        let shutdown = CancellationToken::new();

        let task = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { lifecycle.run("r1", acceptor, &shutdown).await })
        };

        // Three full idle periods and a bit.
        tokio::time::sleep(IDLE * 3 + Duration::from_secs(5)).await;
        assert_eq!(registry.session_count("r1"), 1);
        assert_eq!(peer.close_calls(), 0);

        peer.close();
        let outcome = task.await.unwrap().unwrap();
        assert_eq!(outcome, SessionOutcome::RemoteClosed);
        assert_eq!(registry.restaurant_count(), 0);
        assert_eq!(peer.close_calls(), 1);
    }

    #[tokio::test]
    async fn ping_gets_exactly_one_pong() {
        let (lifecycle, registry) = lifecycle();
        let (acceptor, mut peer) = MemoryAcceptor::pair();
        let shutdown = CancellationToken::new();

        peer.send_text(r#"{"type":"ping"}"#);
        peer.send_text(r#"{"type":"hello"}"#);
        peer.send_text("not json");
        peer.close();

        let outcome = lifecycle.run("r1", acceptor, &shutdown).await.unwrap();
        assert_eq!(outcome, SessionOutcome::RemoteClosed);
        assert_eq!(peer.drain_outbound(), vec![r#"{"type":"pong"}"#.to_string()]);
        assert_eq!(registry.restaurant_count(), 0);
    }

    #[tokio::test]
    async fn remote_close_deregisters_and_closes_once() {
        let (lifecycle, registry) = lifecycle();
        let (acceptor, peer) = MemoryAcceptor::pair();
        peer.close();

        let outcome = lifecycle.run("r1", acceptor, &CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, SessionOutcome::RemoteClosed);
        assert_eq!(peer.close_calls(), 1);
        assert!(registry.sessions_for("r1").is_empty());
    }

    #[tokio::test]
    async fn reset_is_a_normal_disconnect() {
        let (lifecycle, registry) = lifecycle();
        let (acceptor, peer) = MemoryAcceptor::pair();
        peer.inject_fault(io::ErrorKind::ConnectionReset);

        let outcome = lifecycle.run("r1", acceptor, &CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, SessionOutcome::Disconnected);
        assert_eq!(peer.close_calls(), 1);
        assert_eq!(registry.restaurant_count(), 0);
    }

    #[tokio::test]
    async fn unrecognized_fault_propagates_after_cleanup() {
        let (lifecycle, registry) = lifecycle();
        let (acceptor, peer) = MemoryAcceptor::pair();
        peer.inject_fault(io::ErrorKind::InvalidData);

        let err = lifecycle
            .run("r1", acceptor, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Transport { .. }));
        assert_eq!(peer.close_calls(), 1);
        assert_eq!(registry.restaurant_count(), 0);
    }

    #[tokio::test]
    async fn rejected_handshake_never_registers() {
        let (lifecycle, registry) = lifecycle();
        let (acceptor, peer) = MemoryAcceptor::rejecting("bad upgrade");

        let err = lifecycle
            .run("r1", acceptor, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Handshake(ChannelError::Handshake(_))));
        assert_eq!(registry.restaurant_count(), 0);
        assert_eq!(peer.close_calls(), 0);
    }

    #[tokio::test]
    async fn full_restaurant_refuses_and_closes() {
        let registry = Arc::new(SessionRegistry::with_session_limit(1));
        let lifecycle = SessionLifecycle::new(Arc::clone(&registry), IDLE);
        let shutdown = CancellationToken::new();

        let (first, first_peer) = MemoryAcceptor::pair();
        let running = {
            let lifecycle = lifecycle.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { lifecycle.run("r1", first, &shutdown).await })
        };
        while registry.session_count("r1") == 0 {
            tokio::task::yield_now().await;
        }

        let (second, second_peer) = MemoryAcceptor::pair();
        let err = lifecycle.run("r1", second, &shutdown).await.unwrap_err();
        assert!(matches!(err, SessionError::Capacity { limit: 1, .. }));
        assert_eq!(second_peer.close_calls(), 1);
        assert_eq!(registry.session_count("r1"), 1);

        first_peer.close();
        running.await.unwrap().unwrap();
        assert_eq!(registry.restaurant_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_ends_idle_session() {
        let (lifecycle, registry) = lifecycle();
        let (acceptor, peer) = MemoryAcceptor::pair();
        let shutdown = CancellationToken::new();

        let task = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { lifecycle.run("r1", acceptor, &shutdown).await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(registry.session_count("r1"), 1);

        shutdown.cancel();
        assert_eq!(task.await.unwrap().unwrap(), SessionOutcome::Shutdown);
        assert_eq!(registry.restaurant_count(), 0);
        assert_eq!(peer.close_calls(), 1);
    }

    #[tokio::test]
    async fn aborted_handler_still_deregisters() {
        let (lifecycle, registry) = lifecycle();
        let (acceptor, _peer) = MemoryAcceptor::pair();

        let task = tokio::spawn(async move {
            let shutdown = CancellationToken::new();
            lifecycle.run("r1", acceptor, &shutdown).await
        });
        while registry.session_count("r1") == 0 {
            tokio::task::yield_now().await;
        }

        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());
        assert_eq!(registry.restaurant_count(), 0);
    }

    async fn wait_registered(registry: &SessionRegistry, restaurant_id: &str) {
        while registry.session_count(restaurant_id) == 0 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn broken_session_pruned_by_broadcast_is_closed_by_its_handler() {
        let (lifecycle, registry) = lifecycle();
        let (acceptor, peer) = MemoryAcceptor::pair();
        let shutdown = CancellationToken::new();

        let task = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { lifecycle.run("r1", acceptor, &shutdown).await })
        };
        wait_registered(&registry, "r1").await;

        peer.break_sends();
        let report = Broadcaster::new(Arc::clone(&registry))
            .broadcast("r1", &NotificationEvent::Pong)
            .await;
        assert_eq!(report.pruned.len(), 1);

        assert_eq!(task.await.unwrap().unwrap(), SessionOutcome::Evicted);
        assert_eq!(peer.close_calls(), 1);
        assert_eq!(registry.restaurant_count(), 0);
        assert!(!shutdown.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_session_pruned_by_broadcast_is_closed_by_its_handler() {
        let (lifecycle, registry) = lifecycle();
        let (acceptor, peer) = MemoryAcceptor::pair();
        let shutdown = CancellationToken::new();

        let task = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { lifecycle.run("r1", acceptor, &shutdown).await })
        };
        wait_registered(&registry, "r1").await;

        peer.stall_sends();
        let report = Broadcaster::with_send_timeout(Arc::clone(&registry), Duration::from_secs(2))
            .broadcast("r1", &NotificationEvent::Pong)
            .await;
        assert_eq!(report.delivered, 0);
        assert_eq!(report.pruned.len(), 1);

        assert_eq!(task.await.unwrap().unwrap(), SessionOutcome::Evicted);
        assert_eq!(peer.close_calls(), 1);
        assert_eq!(registry.restaurant_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_pong_fails_after_send_timeout() {
        let (lifecycle, registry) = lifecycle();
        let lifecycle = lifecycle.with_send_timeout(Duration::from_secs(2));
        let (acceptor, peer) = MemoryAcceptor::pair();
        peer.stall_sends();
        peer.send_text(r#"{"type":"ping"}"#);

        let err = lifecycle
            .run("r1", acceptor, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SessionError::Transport {
                source: ChannelError::SendTimeout(_),
                ..
            }
        ));
        assert_eq!(peer.close_calls(), 1);
        assert_eq!(registry.restaurant_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_interrupts_stalled_pong() {
        let (lifecycle, registry) = lifecycle();
        let lifecycle = lifecycle.with_send_timeout(Duration::from_secs(600));
        let (acceptor, peer) = MemoryAcceptor::pair();
        let shutdown = CancellationToken::new();
        peer.stall_sends();
        peer.send_text(r#"{"type":"ping"}"#);

        let task = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { lifecycle.run("r1", acceptor, &shutdown).await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(registry.session_count("r1"), 1);

        shutdown.cancel();
        let outcome = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("handler ends at shutdown")
            .unwrap()
            .unwrap();
        assert_eq!(outcome, SessionOutcome::Shutdown);
        assert_eq!(registry.restaurant_count(), 0);
        assert_eq!(peer.close_calls(), 1);
    }
}
