//! # Notification Events
//!
//! Immutable payloads pushed to restaurant dashboards. Every event carries a
//! `type` discriminator on the wire; the remaining fields depend on the kind.
//!
//! ```json
//! {"type":"novo_pedido","pedido_id":"…","total":23.5,"status":"Recebido","data_pedido":"2026-01-01T12:00:00Z"}
//! {"type":"pong"}
//! ```

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// # Notification Event
///
/// Constructed once by a producer and never mutated afterwards. The
/// broadcaster serializes it a single time and shares the text across every
/// session of the restaurant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NotificationEvent {
    /// A new order was committed for the restaurant.
    NovoPedido {
        /// Order identifier.
        pedido_id: String,
        /// Order total, transmitted as a JSON number.
        #[serde(with = "rust_decimal::serde::float")]
        total: Decimal,
        /// Status at creation time.
        status: String,
        /// Creation timestamp (RFC 3339).
        data_pedido: DateTime<Utc>,
    },
    /// The status of an existing order changed.
    PedidoAtualizado {
        /// Order identifier.
        pedido_id: String,
        /// The new status.
        status: String,
    },
    /// Reply to an application-level ping.
    Pong,
}

impl NotificationEvent {
    /// Serializes the event to its wire text.
    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Wire name of the event kind, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            NotificationEvent::NovoPedido { .. } => "novo_pedido",
            NotificationEvent::PedidoAtualizado { .. } => "pedido_atualizado",
            NotificationEvent::Pong => "pong",
        }
    }
}

/// Returns `true` when `payload` is structurally `{"type":"ping"}`.
///
/// Key order and whitespace do not matter; extra keys do.
pub fn is_ping(payload: &str) -> bool {
    match serde_json::from_str::<Value>(payload) {
        Ok(Value::Object(map)) => {
            map.len() == 1 && map.get("type").and_then(Value::as_str) == Some("ping")
        }
        _ => false,
    }
}
