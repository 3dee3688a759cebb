//! # Downstream WebSocket
//!
//! Restaurant dashboards connect to `GET /ws/restaurante/{restaurante_id}?token=…`.
//! The token is checked before the upgrade, so a rejected client never
//! reaches the registry. After the upgrade the socket is handed to the
//! shared `SessionLifecycle`.
//!
//! ## Core Components:
//!
//! - **`WsChannel`**: an axum `WebSocket` split into sink and stream halves,
//!   each behind its own lock, so the broadcaster can send while the session
//!   loop is waiting for inbound frames.
//! - **`WsAcceptor`**: the upgraded socket, not yet wrapped.
//! - **`ws_handler`**: authentication, capacity pre-check and upgrade.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::{IntoResponse, Response};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use lib_common::core::{ChannelAcceptor, ChannelError, Inbound, NotificationChannel};
use serde::Deserialize;
use tokio::sync::Mutex;
use tokio::time::{Instant, timeout_at};
use uuid::Uuid;

use crate::order_logic::api::ApiError;
use crate::order_logic::auth::{AuthError, PrincipalKind};
use crate::order_logic::state::AppState;

pub struct WsChannel {
    sink: Mutex<SplitSink<WebSocket, Message>>,
    stream: Mutex<SplitStream<WebSocket>>,
    closed: AtomicBool,
}

impl WsChannel {
    pub fn new(socket: WebSocket) -> Self {
        let (sink, stream) = socket.split();
        Self {
            sink: Mutex::new(sink),
            stream: Mutex::new(stream),
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl NotificationChannel for WsChannel {
    async fn send_text(&self, text: &str) -> Result<(), ChannelError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ChannelError::Closed);
        }
        self.sink
            .lock()
            .await
            .send(Message::Text(text.to_owned().into()))
            .await
            .map_err(ChannelError::transport)
    }

    async fn receive_or_timeout(&self, timeout: Duration) -> Result<Inbound, ChannelError> {
        let deadline = Instant::now() + timeout;
        let mut stream = self.stream.lock().await;
        loop {
            let frame = match timeout_at(deadline, stream.next()).await {
                Err(_) => return Ok(Inbound::Timeout),
                Ok(None) => return Ok(Inbound::Closed),
                Ok(Some(frame)) => frame.map_err(ChannelError::transport)?,
            };
            match frame {
                Message::Text(text) => return Ok(Inbound::Message(text.as_str().to_owned())),
                Message::Close(_) => return Ok(Inbound::Closed),
                // Control frames are answered by the protocol layer; binary
                // frames carry nothing for us.
                Message::Ping(_) | Message::Pong(_) | Message::Binary(_) => continue,
            }
        }
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut sink = self.sink.lock().await;
        if let Err(e) = sink.send(Message::Close(None)).await {
            tracing::debug!(error = %e, "close frame not sent");
        }
        if let Err(e) = sink.close().await {
            tracing::debug!(error = %e, "socket close failed");
        }
    }
}

/// An upgraded socket waiting to become a `WsChannel`.
pub struct WsAcceptor {
    socket: WebSocket,
}

impl WsAcceptor {
    pub fn new(socket: WebSocket) -> Self {
        Self { socket }
    }
}

#[async_trait]
impl ChannelAcceptor for WsAcceptor {
    type Channel = WsChannel;

    async fn accept(self) -> Result<WsChannel, ChannelError> {
        Ok(WsChannel::new(self.socket))
    }
}

#[derive(Debug, Deserialize)]
pub struct WsParams {
    pub token: Option<String>,
}

/// # WebSocket Handler
///
/// ## Logic:
/// 1.  Verify the query token; it must be a `restaurante` token.
/// 2.  The token subject must equal the path id (403 otherwise).
/// 3.  Refuse with 503 when the restaurant already has its maximum number of
///     dashboards. The registry re-checks after the upgrade.
/// 4.  Upgrade and run the session until it ends.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(restaurante_id): Path<String>,
    Query(params): Query<WsParams>,
    State(state): State<AppState>,
) -> Result<Response, ApiError> {
    let token = params.token.as_deref().ok_or(AuthError::MissingToken)?;
    let principal = state.auth.verify_kind(token, PrincipalKind::Restaurante)?;
    let requested = Uuid::parse_str(&restaurante_id).map_err(|_| AuthError::Forbidden)?;
    if requested != principal.id {
        return Err(AuthError::Forbidden.into());
    }

    let key = principal.id.to_string();
    if !state.has_capacity(&key) {
        return Err(ApiError::TooManySessions {
            limit: state.registry.session_limit().unwrap_or_default(),
            restaurant_id: key,
        });
    }

    let failed_key = key.clone();
    let lifecycle = state.lifecycle.clone();
    let shutdown = state.shutdown.clone();
    let response = ws
        .on_failed_upgrade(move |e| {
            tracing::warn!(restaurant_id = %failed_key, error = %e, "websocket upgrade failed");
        })
        .on_upgrade(move |socket| async move {
            match lifecycle.run(&key, WsAcceptor::new(socket), &shutdown).await {
                Ok(outcome) => tracing::info!(restaurant_id = %key, ?outcome, "dashboard session ended"),
                Err(e) => tracing::warn!(restaurant_id = %key, error = %e, "dashboard session failed"),
            }
        });
    Ok(response.into_response())
}
