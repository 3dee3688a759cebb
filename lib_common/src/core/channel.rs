//! # Notification Channel Abstraction
//!
//! A notification channel wraps one bidirectional, message-oriented connection
//! (in production an axum WebSocket, in tests the in-process `memory`
//! transport). The send half and the receive half are used concurrently: the
//! broadcaster pushes events while the session's own lifecycle loop waits for
//! inbound keepalive traffic, so every method takes `&self`.
//!
//! ## Error Taxonomy
//!
//! - `Handshake`: the transport rejected the connection before it was usable.
//! - `Closed`: the remote end is gone; a normal outcome during teardown.
//! - `Transport`: anything the transport reported. `disconnect_kind()` decides
//!   whether it is really just a disconnect (reset, broken pipe, EOF) or a
//!   fault worth surfacing.
//! - `SendTimeout`: the remote did not accept a frame in time.
//!
//! A receive timeout is not an error at all; it is `Inbound::Timeout`.

use std::error::Error as StdError;
use std::io;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::core::event::NotificationEvent;

/// Result of waiting for inbound traffic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// A text payload from the remote.
    Message(String),
    /// Nothing arrived within the requested duration.
    Timeout,
    /// The remote ended the session.
    Closed,
}

/// How a channel failure should be treated by the session loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectKind {
    /// The remote went away; teardown is the normal response.
    Disconnect,
    /// Something went wrong that is not explained by the remote leaving.
    Fault,
}

/// Errors raised by a notification channel.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The transport rejected the handshake.
    #[error("handshake rejected: {0}")]
    Handshake(String),
    /// The remote end is gone.
    #[error("channel closed")]
    Closed,
    /// The transport reported an error.
    #[error("transport error: {0}")]
    Transport(#[source] Box<dyn StdError + Send + Sync>),
    /// The remote did not accept a frame within the send deadline.
    #[error("send timed out after {0:?}")]
    SendTimeout(Duration),
    /// The event could not be serialized.
    #[error("failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),
}

/// I/O error kinds that only ever mean "the peer is gone".
const DISCONNECT_IO_KINDS: [io::ErrorKind; 5] = [
    io::ErrorKind::ConnectionReset,
    io::ErrorKind::ConnectionAborted,
    io::ErrorKind::BrokenPipe,
    io::ErrorKind::UnexpectedEof,
    io::ErrorKind::NotConnected,
];

/// Closure messages emitted by the WebSocket protocol layer for which no
/// structured signal reaches us through axum's opaque error type. Matched
/// case-insensitively against each error in the source chain.
const PROTOCOL_CLOSURE_MESSAGES: [&str; 3] = [
    "connection closed normally",
    "trying to work with closed connection",
    "connection reset without closing handshake",
];

impl ChannelError {
    /// Wraps any transport error.
    pub fn transport<E>(err: E) -> Self
    where
        E: Into<Box<dyn StdError + Send + Sync>>,
    {
        ChannelError::Transport(err.into())
    }

    /// Classifies the failure.
    ///
    /// Structured signals come first: `Closed`, then any `std::io::Error` in
    /// the source chain whose kind is a disconnect. Only if neither matches
    /// are the protocol closure messages consulted.
    pub fn disconnect_kind(&self) -> DisconnectKind {
        match self {
            ChannelError::Closed => DisconnectKind::Disconnect,
            ChannelError::Transport(source) => classify_transport(source.as_ref()),
            ChannelError::Handshake(_) | ChannelError::SendTimeout(_) | ChannelError::Encode(_) => {
                DisconnectKind::Fault
            }
        }
    }

    /// Shorthand for `disconnect_kind() == DisconnectKind::Disconnect`.
    pub fn is_disconnect(&self) -> bool {
        self.disconnect_kind() == DisconnectKind::Disconnect
    }
}

fn classify_transport(err: &(dyn StdError + 'static)) -> DisconnectKind {
    let mut current: Option<&(dyn StdError + 'static)> = Some(err);
    while let Some(e) = current {
        if let Some(io_err) = e.downcast_ref::<io::Error>() {
            if DISCONNECT_IO_KINDS.contains(&io_err.kind()) {
                return DisconnectKind::Disconnect;
            }
        }
        current = e.source();
    }

    let mut current: Option<&(dyn StdError + 'static)> = Some(err);
    while let Some(e) = current {
        let text = e.to_string().to_lowercase();
        if PROTOCOL_CLOSURE_MESSAGES.iter().any(|m| text.contains(m)) {
            return DisconnectKind::Disconnect;
        }
        current = e.source();
    }

    DisconnectKind::Fault
}

/// # Notification Channel
///
/// One accepted connection. Implementations must tolerate `send_text` and
/// `receive_or_timeout` running at the same time from different tasks.
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    /// Transmits one text frame. No retry.
    async fn send_text(&self, text: &str) -> Result<(), ChannelError>;

    /// Serializes `event` and transmits it.
    async fn send_event(&self, event: &NotificationEvent) -> Result<(), ChannelError> {
        let text = event.to_text()?;
        self.send_text(&text).await
    }

    /// Waits up to `timeout` for inbound traffic.
    async fn receive_or_timeout(&self, timeout: Duration) -> Result<Inbound, ChannelError>;

    /// Releases transport resources. Idempotent; failures are logged, never returned.
    async fn close(&self);
}

/// A connection whose handshake has not completed yet.
#[async_trait]
pub trait ChannelAcceptor: Send {
    /// The channel produced by a successful handshake.
    type Channel: NotificationChannel + 'static;

    /// Completes the handshake.
    async fn accept(self) -> Result<Self::Channel, ChannelError>;
}

/// # In-process Transport
///
/// A channel backed by tokio MPSC queues. The `MemoryPeer` plays the remote
/// dashboard: it can push text, close the session, inject transport faults
/// and read everything the server sent.
pub mod memory {
    use std::io;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::{mpsc, Mutex};

    use super::{ChannelAcceptor, ChannelError, Inbound, NotificationChannel};

    enum PeerFrame {
        Text(String),
        Close,
        Fault(io::ErrorKind),
    }

    #[derive(Default)]
    struct Shared {
        closed: AtomicBool,
        sends_broken: AtomicBool,
        sends_stalled: AtomicBool,
        close_calls: AtomicUsize,
    }

    /// Server side of an in-process connection.
    pub struct MemoryChannel {
        outbound: mpsc::UnboundedSender<String>,
        inbound: Mutex<mpsc::UnboundedReceiver<PeerFrame>>,
        shared: Arc<Shared>,
    }

    /// Remote side of an in-process connection.
    pub struct MemoryPeer {
        inbound: mpsc::UnboundedSender<PeerFrame>,
        outbound: mpsc::UnboundedReceiver<String>,
        shared: Arc<Shared>,
    }

    /// Pending in-process connection.
    pub struct MemoryAcceptor {
        channel: MemoryChannel,
        reject: Option<String>,
    }

    impl MemoryAcceptor {
        /// Creates a connected acceptor/peer pair.
        pub fn pair() -> (MemoryAcceptor, MemoryPeer) {
            let (out_tx, out_rx) = mpsc::unbounded_channel();
            let (in_tx, in_rx) = mpsc::unbounded_channel();
            let shared = Arc::new(Shared::default());

            let channel = MemoryChannel {
                outbound: out_tx,
                inbound: Mutex::new(in_rx),
                shared: Arc::clone(&shared),
            };
            let peer = MemoryPeer {
                inbound: in_tx,
                outbound: out_rx,
                shared,
            };
            (MemoryAcceptor { channel, reject: None }, peer)
        }

        /// Creates a pair whose handshake fails with `reason`.
        pub fn rejecting(reason: &str) -> (MemoryAcceptor, MemoryPeer) {
            let (mut acceptor, peer) = Self::pair();
            acceptor.reject = Some(reason.to_string());
            (acceptor, peer)
        }

        /// Skips the handshake, for driving a channel directly.
        pub fn into_channel(self) -> MemoryChannel {
            self.channel
        }
    }

    #[async_trait]
    impl ChannelAcceptor for MemoryAcceptor {
        type Channel = MemoryChannel;

        async fn accept(self) -> Result<MemoryChannel, ChannelError> {
            match self.reject {
                Some(reason) => Err(ChannelError::Handshake(reason)),
                None => Ok(self.channel),
            }
        }
    }

    #[async_trait]
    impl NotificationChannel for MemoryChannel {
        async fn send_text(&self, text: &str) -> Result<(), ChannelError> {
            if self.shared.closed.load(Ordering::Acquire) {
                return Err(ChannelError::Closed);
            }
            if self.shared.sends_broken.load(Ordering::Acquire) {
                return Err(ChannelError::transport(io::Error::from(io::ErrorKind::BrokenPipe)));
            }
            if self.shared.sends_stalled.load(Ordering::Acquire) {
                std::future::pending::<()>().await;
            }
            self.outbound
                .send(text.to_string())
                .map_err(|_| ChannelError::Closed)
        }

        async fn receive_or_timeout(&self, timeout: Duration) -> Result<Inbound, ChannelError> {
            let mut inbound = self.inbound.lock().await;
            match tokio::time::timeout(timeout, inbound.recv()).await {
                Err(_) => Ok(Inbound::Timeout),
                Ok(None) | Ok(Some(PeerFrame::Close)) => Ok(Inbound::Closed),
                Ok(Some(PeerFrame::Text(text))) => Ok(Inbound::Message(text)),
                Ok(Some(PeerFrame::Fault(kind))) => {
                    Err(ChannelError::transport(io::Error::new(kind, "injected transport fault")))
                }
            }
        }

        async fn close(&self) {
            self.shared.close_calls.fetch_add(1, Ordering::AcqRel);
            self.shared.closed.store(true, Ordering::Release);
        }
    }

    impl MemoryPeer {
        /// Pushes a text frame towards the server.
        pub fn send_text(&self, text: &str) {
            let _ = self.inbound.send(PeerFrame::Text(text.to_string()));
        }

        /// Ends the session from the remote side.
        pub fn close(&self) {
            let _ = self.inbound.send(PeerFrame::Close);
        }

        /// Makes the next receive fail with an I/O error of `kind`.
        pub fn inject_fault(&self, kind: io::ErrorKind) {
            let _ = self.inbound.send(PeerFrame::Fault(kind));
        }

        /// Makes every subsequent server-side send fail.
        pub fn break_sends(&self) {
            self.shared.sends_broken.store(true, Ordering::Release);
        }

        /// Makes every subsequent server-side send hang, like a peer that
        /// stopped reading.
        pub fn stall_sends(&self) {
            self.shared.sends_stalled.store(true, Ordering::Release);
        }

        /// Waits for the next frame the server sent.
        pub async fn next_outbound(&mut self) -> Option<String> {
            self.outbound.recv().await
        }

        /// Returns every frame the server sent so far.
        pub fn drain_outbound(&mut self) -> Vec<String> {
            let mut frames = Vec::new();
            while let Ok(frame) = self.outbound.try_recv() {
                frames.push(frame);
            }
            frames
        }

        /// How many times the server called `close()`.
        pub fn close_calls(&self) -> usize {
            self.shared.close_calls.load(Ordering::Acquire)
        }

        /// Whether the server closed the channel.
        pub fn is_closed(&self) -> bool {
            self.shared.closed.load(Ordering::Acquire)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::memory::MemoryAcceptor;
    use super::*;

    #[derive(Debug, Error)]
    #[error("outer: {0}")]
    struct Wrapper(#[source] io::Error);

    #[derive(Debug, Error)]
    #[error("Connection closed normally")]
    struct ProtocolClosed;

    #[test]
    fn closed_is_a_disconnect() {
        assert_eq!(ChannelError::Closed.disconnect_kind(), DisconnectKind::Disconnect);
    }

    #[test]
    fn io_kinds_in_source_chain_are_disconnects() {
        let err = ChannelError::transport(Wrapper(io::Error::from(io::ErrorKind::ConnectionReset)));
        assert!(err.is_disconnect());

        let err = ChannelError::transport(Wrapper(io::Error::from(io::ErrorKind::PermissionDenied)));
        assert_eq!(err.disconnect_kind(), DisconnectKind::Fault);
    }

    #[test]
    fn protocol_closure_message_is_a_disconnect() {
        assert!(ChannelError::transport(ProtocolClosed).is_disconnect());
    }

    #[test]
    fn unrelated_text_is_a_fault() {
        let err = ChannelError::transport("frame too large".to_string());
        assert_eq!(err.disconnect_kind(), DisconnectKind::Fault);
        assert!(!ChannelError::SendTimeout(Duration::from_secs(1)).is_disconnect());
        assert!(!ChannelError::Handshake("nope".into()).is_disconnect());
    }

    #[tokio::test]
    async fn memory_channel_round_trip() {
        let (acceptor, mut peer) = MemoryAcceptor::pair();
        let channel = acceptor.accept().await.unwrap();

        channel.send_event(&NotificationEvent::Pong).await.unwrap();
        assert_eq!(peer.next_outbound().await.as_deref(), Some(r#"{"type":"pong"}"#));

        peer.send_text("hello");
        assert_eq!(
            channel.receive_or_timeout(Duration::from_secs(1)).await.unwrap(),
            Inbound::Message("hello".to_string())
        );

        peer.close();
        assert_eq!(
            channel.receive_or_timeout(Duration::from_secs(1)).await.unwrap(),
            Inbound::Closed
        );
    }

    #[tokio::test(start_paused = true)]
    async fn memory_channel_times_out() {
        let (acceptor, _peer) = MemoryAcceptor::pair();
        let channel = acceptor.accept().await.unwrap();
        assert_eq!(
            channel.receive_or_timeout(Duration::from_secs(60)).await.unwrap(),
            Inbound::Timeout
        );
    }

    #[tokio::test]
    async fn rejected_handshake() {
        let (acceptor, _peer) = MemoryAcceptor::rejecting("bad upgrade");
        match acceptor.accept().await {
            Err(ChannelError::Handshake(reason)) => assert_eq!(reason, "bad upgrade"),
            other => panic!("unexpected: {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn broken_sends_and_close() {
        let (acceptor, peer) = MemoryAcceptor::pair();
        let channel = acceptor.accept().await.unwrap();

        peer.break_sends();
        let err = channel.send_text("x").await.unwrap_err();
        assert!(err.is_disconnect());

        channel.close().await;
        channel.close().await;
        assert!(peer.is_closed());
        assert_eq!(peer.close_calls(), 2);
        assert!(matches!(channel.send_text("x").await, Err(ChannelError::Closed)));
    }
}
