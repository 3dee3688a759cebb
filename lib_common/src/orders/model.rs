//! Order domain types and their JSON shape.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::event::NotificationEvent;

/// How many dishes `RestaurantStats` ranks.
pub const TOP_DISHES: usize = 5;

/// Days `media_pedidos_dia` averages over.
pub const AVERAGE_WINDOW_DAYS: i64 = 30;

/// # Order Status
///
/// The closed set of statuses an order can be in. The wire form is the
/// Portuguese label shown on the dashboard.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum OrderStatus {
    #[default]
    #[serde(rename = "Recebido")]
    Recebido,
    #[serde(rename = "Em preparo")]
    EmPreparo,
    #[serde(rename = "Saiu para entrega")]
    SaiuParaEntrega,
    #[serde(rename = "Entregue")]
    Entregue,
    #[serde(rename = "Cancelado")]
    Cancelado,
}

impl OrderStatus {
    pub const ALL: [OrderStatus; 5] = [
        OrderStatus::Recebido,
        OrderStatus::EmPreparo,
        OrderStatus::SaiuParaEntrega,
        OrderStatus::Entregue,
        OrderStatus::Cancelado,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Recebido => "Recebido",
            OrderStatus::EmPreparo => "Em preparo",
            OrderStatus::SaiuParaEntrega => "Saiu para entrega",
            OrderStatus::Entregue => "Entregue",
            OrderStatus::Cancelado => "Cancelado",
        }
    }

    /// Whether orders in this status count towards revenue.
    pub fn counts_as_revenue(&self) -> bool {
        *self != OrderStatus::Cancelado
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a string is not one of the five status labels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownStatus(pub String);

impl fmt::Display for UnknownStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown order status '{}'", self.0)
    }
}

impl std::error::Error for UnknownStatus {}

impl FromStr for OrderStatus {
    type Err = UnknownStatus;

    /// Exact, case-sensitive match on the label.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OrderStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| UnknownStatus(s.to_string()))
    }
}

/// A dish on a restaurant's menu, as the order service sees it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MenuItem {
    pub prato_id: Uuid,
    pub restaurante_id: Uuid,
    pub nome: String,
    #[serde(with = "rust_decimal::serde::float")]
    pub preco: Decimal,
    #[serde(default = "default_disponivel")]
    pub disponivel: bool,
}

fn default_disponivel() -> bool {
    true
}

/// One persisted line of an order. `nome_prato` and `preco_unitario` are
/// copied from the menu at order time and never change afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderItem {
    pub item_id: Uuid,
    pub pedido_id: Uuid,
    pub prato_id: Uuid,
    pub nome_prato: String,
    pub quantidade: i32,
    #[serde(with = "rust_decimal::serde::float")]
    pub preco_unitario: Decimal,
}

impl OrderItem {
    pub fn subtotal(&self) -> Decimal {
        self.preco_unitario * Decimal::from(self.quantidade)
    }
}

/// An order header with its line items.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub pedido_id: Uuid,
    pub usuario_id: Uuid,
    pub restaurante_id: Uuid,
    pub data_pedido: DateTime<Utc>,
    pub status: OrderStatus,
    #[serde(with = "rust_decimal::serde::float")]
    pub total: Decimal,
    pub itens: Vec<OrderItem>,
}

/// One requested line: which dish and how many.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineItemRequest {
    pub prato_id: Uuid,
    pub quantidade: i32,
}

/// Body of an order placement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewOrder {
    pub restaurante_id: Uuid,
    pub itens: Vec<LineItemRequest>,
}

impl From<&Order> for NotificationEvent {
    fn from(order: &Order) -> Self {
        NotificationEvent::NovoPedido {
            pedido_id: order.pedido_id.to_string(),
            total: order.total,
            status: order.status.to_string(),
            data_pedido: order.data_pedido,
        }
    }
}

/// A dish and how many units of it were sold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DishSales {
    pub prato_id: Uuid,
    pub nome: String,
    pub total_vendido: i64,
}

/// # Restaurant Statistics
///
/// Dashboard summary computed from a restaurant's orders. Cancelled orders
/// count in `total_pedidos`, `pedidos_por_status` and `media_pedidos_dia`,
/// but not in revenue or dish rankings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestaurantStats {
    pub total_pedidos: u64,
    #[serde(with = "rust_decimal::serde::float")]
    pub receita_total: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub receita_mes: Decimal,
    /// Orders placed per day over the last `AVERAGE_WINDOW_DAYS` days, two decimals.
    #[serde(with = "rust_decimal::serde::float")]
    pub media_pedidos_dia: Decimal,
    pub pedidos_por_status: BTreeMap<String, u64>,
    pub pratos_mais_vendidos: Vec<DishSales>,
}

impl RestaurantStats {
    /// Builds the summary. `now` selects the calendar month for `receita_mes`
    /// and ends the window for `media_pedidos_dia`.
    pub fn from_orders(orders: &[Order], now: DateTime<Utc>) -> Self {
        let mut pedidos_por_status: BTreeMap<String, u64> = OrderStatus::ALL
            .iter()
            .map(|status| (status.to_string(), 0))
            .collect();
        let mut receita_total = Decimal::ZERO;
        let mut receita_mes = Decimal::ZERO;
        let mut sales: HashMap<Uuid, DishSales> = HashMap::new();
        let window_start = now - Duration::days(AVERAGE_WINDOW_DAYS);
        let mut in_window = 0u64;

        for order in orders {
            *pedidos_por_status.entry(order.status.to_string()).or_default() += 1;
            if order.data_pedido > window_start && order.data_pedido <= now {
                in_window += 1;
            }
            if !order.status.counts_as_revenue() {
                continue;
            }

            receita_total += order.total;
            if order.data_pedido.year() == now.year() && order.data_pedido.month() == now.month() {
                receita_mes += order.total;
            }
            for item in &order.itens {
                let entry = sales.entry(item.prato_id).or_insert_with(|| DishSales {
                    prato_id: item.prato_id,
                    nome: item.nome_prato.clone(),
                    total_vendido: 0,
                });
                entry.total_vendido += i64::from(item.quantidade);
            }
        }

        let mut pratos_mais_vendidos: Vec<DishSales> = sales.into_values().collect();
        pratos_mais_vendidos.sort_by(|a, b| {
            b.total_vendido
                .cmp(&a.total_vendido)
                .then_with(|| a.nome.cmp(&b.nome))
        });
        pratos_mais_vendidos.truncate(TOP_DISHES);

        Self {
            total_pedidos: orders.len() as u64,
            receita_total,
            receita_mes,
            media_pedidos_dia: (Decimal::from(in_window) / Decimal::from(AVERAGE_WINDOW_DAYS)).round_dp(2),
            pedidos_por_status,
            pratos_mais_vendidos,
        }
    }
}
