//! # Notification Core
//!
//! This module forms the heart of the real-time side of the backend. It fans
//! order events out to every dashboard a restaurant has open, and keeps the
//! set of open dashboards accurate while connections come and go.
//!
//! ## Core Components:
//!
//! - **`registry`**: the `SessionRegistry`, a per-restaurant set of live
//!   sessions with snapshot reads. Registration and removal never fail.
//!
//! - **`channel`**: the `NotificationChannel` / `ChannelAcceptor` traits that
//!   abstract one bidirectional message connection, plus the error taxonomy
//!   used to tell a normal disconnect from a genuine fault.
//!
//! - **`dispatcher`**: the `Broadcaster`, which pushes one event to every
//!   session of one restaurant and prunes the sessions it finds dead, and the
//!   `DispatchQueue` that lets producers fire and forget.
//!
//! - **`lifecycle`**: the per-connection state machine
//!   (`Connecting → Active → Closing → Closed`) with guaranteed cleanup.
//!
//! - **`event`**: the immutable notification payloads and their wire format.

/// Per-restaurant registry of live notification sessions.
pub mod registry;
/// Abstraction over one bidirectional, message-oriented connection.
pub mod channel;
/// Fan-out of events to every session of a restaurant.
pub mod dispatcher;
/// Per-connection session state machine.
pub mod lifecycle;
/// Notification payloads exchanged with dashboards.
pub mod event;

// --- Public API Re-exports ---
pub use channel::{ChannelAcceptor, ChannelError, DisconnectKind, Inbound, NotificationChannel};
pub use dispatcher::{BroadcastReport, Broadcaster, DispatchQueue, Notifier};
pub use event::NotificationEvent;
pub use lifecycle::{SessionError, SessionLifecycle, SessionOutcome, SessionState};
pub use registry::{RestaurantId, SessionHandle, SessionId, SessionRegistry};
