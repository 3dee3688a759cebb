//! # Order Service
//!
//! Prices and persists orders, validates status changes and hands the
//! resulting events to the notification core.
//!
//! ## Core Design Principles:
//!
//! 1.  **Price at order time**: each line copies the menu item's current name
//!     and price. The total is the sum of `preco_unitario × quantidade` and
//!     later menu changes never touch a placed order.
//!
//! 2.  **Validate, then commit, then notify**: nothing is written unless every
//!     line is valid, the header and lines are committed in one store call,
//!     and only a committed order produces a `novo_pedido` event.
//!
//! 3.  **Fire and forget**: events go through the `Notifier` seam, which
//!     cannot fail. Notification delivery never changes the outcome of a
//!     commit.

use std::sync::Arc;

use chrono::{SubsecRound, Utc};
use rust_decimal::Decimal;
use thiserror::Error;
use uuid::Uuid;

use crate::core::dispatcher::Notifier;
use crate::core::event::NotificationEvent;
use crate::orders::model::{LineItemRequest, NewOrder, Order, OrderItem, OrderStatus, RestaurantStats};
use crate::orders::store::{OrderStore, StoreError};

/// Errors surfaced to the caller of the order service.
#[derive(Debug, Error)]
pub enum OrderError {
    #[error("an order needs at least one item")]
    EmptyOrder,

    #[error("invalid quantity {quantidade} for menu item {prato_id}")]
    InvalidQuantity { prato_id: Uuid, quantidade: i32 },

    #[error("menu item {0} not found")]
    UnknownMenuItem(Uuid),

    #[error("menu item {prato_id} does not belong to restaurant {restaurante_id}")]
    ForeignMenuItem { prato_id: Uuid, restaurante_id: Uuid },

    #[error("menu item {0} is not available")]
    UnavailableMenuItem(Uuid),

    #[error("invalid status '{0}', expected one of: Recebido, Em preparo, Saiu para entrega, Entregue, Cancelado")]
    InvalidStatus(String),

    #[error("order {0} not found")]
    OrderNotFound(Uuid),

    #[error("order {0} belongs to another party")]
    NotOwner(Uuid),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl OrderError {
    /// Whether the caller's input was at fault.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            OrderError::EmptyOrder
                | OrderError::InvalidQuantity { .. }
                | OrderError::UnknownMenuItem(_)
                | OrderError::ForeignMenuItem { .. }
                | OrderError::UnavailableMenuItem(_)
                | OrderError::InvalidStatus(_)
        )
    }
}

/// Who is looking at an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Viewer {
    Restaurant(Uuid),
    User(Uuid),
}

impl Viewer {
    fn can_see(&self, order: &Order) -> bool {
        match self {
            Viewer::Restaurant(id) => order.restaurante_id == *id,
            Viewer::User(id) => order.usuario_id == *id,
        }
    }
}

/// # Order Service
pub struct OrderService {
    store: Arc<dyn OrderStore>,
    notifier: Arc<dyn Notifier>,
}

impl OrderService {
    pub fn new(store: Arc<dyn OrderStore>, notifier: Arc<dyn Notifier>) -> Self {
        Self { store, notifier }
    }

    pub fn store(&self) -> &Arc<dyn OrderStore> {
        &self.store
    }

    /// # Create Order
    ///
    /// ## Logic:
    /// 1.  Reject an empty order or any quantity below one.
    /// 2.  Resolve every line against the menu. The item must exist, belong to
    ///     `restaurante_id` and be available.
    /// 3.  Snapshot name and price into the line, sum the total.
    /// 4.  Commit header and lines in a single store call.
    /// 5.  Notify the restaurant with `novo_pedido`.
    pub async fn create_order(
        &self,
        restaurante_id: Uuid,
        usuario_id: Uuid,
        itens: &[LineItemRequest],
    ) -> Result<Order, OrderError> {
        if itens.is_empty() {
            return Err(OrderError::EmptyOrder);
        }
        if let Some(bad) = itens.iter().find(|line| line.quantidade < 1) {
            return Err(OrderError::InvalidQuantity {
                prato_id: bad.prato_id,
                quantidade: bad.quantidade,
            });
        }

        let pedido_id = Uuid::new_v4();
        let mut lines = Vec::with_capacity(itens.len());
        for line in itens {
            let prato = self
                .store
                .menu_item(line.prato_id)
                .await?
                .ok_or(OrderError::UnknownMenuItem(line.prato_id))?;
            if prato.restaurante_id != restaurante_id {
                return Err(OrderError::ForeignMenuItem {
                    prato_id: prato.prato_id,
                    restaurante_id,
                });
            }
            if !prato.disponivel {
                return Err(OrderError::UnavailableMenuItem(prato.prato_id));
            }
            lines.push(OrderItem {
                item_id: Uuid::new_v4(),
                pedido_id,
                prato_id: prato.prato_id,
                nome_prato: prato.nome,
                quantidade: line.quantidade,
                preco_unitario: prato.preco,
            });
        }

        let total: Decimal = lines.iter().map(OrderItem::subtotal).sum();
        let order = Order {
            pedido_id,
            usuario_id,
            restaurante_id,
            // Microseconds, the precision TIMESTAMPTZ keeps.
            data_pedido: Utc::now().trunc_subsecs(6),
            status: OrderStatus::Recebido,
            total,
            itens: lines,
        };

        self.store.insert_order(&order).await?;
        tracing::info!(
            pedido_id = %order.pedido_id,
            restaurante_id = %restaurante_id,
            total = %order.total,
            items = order.itens.len(),
            "order committed"
        );

        self.notifier
            .notify(&restaurante_id.to_string(), NotificationEvent::from(&order));
        Ok(order)
    }

    /// Convenience wrapper taking the request body as a whole.
    pub async fn place(&self, usuario_id: Uuid, new_order: &NewOrder) -> Result<Order, OrderError> {
        self.create_order(new_order.restaurante_id, usuario_id, &new_order.itens)
            .await
    }

    /// # Update Status
    ///
    /// Parses `status` before reading anything, so an invalid label never
    /// reaches the store. The acting restaurant must own the order. A
    /// successful change notifies the restaurant with `pedido_atualizado`.
    pub async fn update_status(
        &self,
        restaurante_id: Uuid,
        pedido_id: Uuid,
        status: &str,
    ) -> Result<Order, OrderError> {
        let status: OrderStatus = status
            .parse()
            .map_err(|_| OrderError::InvalidStatus(status.to_string()))?;

        let current = self
            .store
            .order(pedido_id)
            .await?
            .ok_or(OrderError::OrderNotFound(pedido_id))?;
        if current.restaurante_id != restaurante_id {
            tracing::warn!(
                pedido_id = %pedido_id,
                restaurante_id = %restaurante_id,
                "status change refused, restaurant does not own the order"
            );
            return Err(OrderError::NotOwner(pedido_id));
        }

        let updated = self
            .store
            .update_status(pedido_id, status)
            .await?
            .ok_or(OrderError::OrderNotFound(pedido_id))?;
        tracing::info!(pedido_id = %pedido_id, from = %current.status, to = %status, "order status updated");

        self.notifier.notify(
            &restaurante_id.to_string(),
            NotificationEvent::PedidoAtualizado {
                pedido_id: pedido_id.to_string(),
                status: status.to_string(),
            },
        );
        Ok(updated)
    }

    /// One order, if `viewer` placed it or owns the restaurant.
    pub async fn order_for(&self, viewer: Viewer, pedido_id: Uuid) -> Result<Order, OrderError> {
        let order = self
            .store
            .order(pedido_id)
            .await?
            .ok_or(OrderError::OrderNotFound(pedido_id))?;
        if !viewer.can_see(&order) {
            return Err(OrderError::NotOwner(pedido_id));
        }
        Ok(order)
    }

    pub async fn orders_for_restaurant(&self, restaurante_id: Uuid) -> Result<Vec<Order>, OrderError> {
        Ok(self.store.orders_for_restaurant(restaurante_id).await?)
    }

    pub async fn orders_for_user(&self, usuario_id: Uuid) -> Result<Vec<Order>, OrderError> {
        Ok(self.store.orders_for_user(usuario_id).await?)
    }

    pub async fn restaurant_stats(&self, restaurante_id: Uuid) -> Result<RestaurantStats, OrderError> {
        let orders = self.store.orders_for_restaurant(restaurante_id).await?;
        Ok(RestaurantStats::from_orders(&orders, Utc::now()))
    }
}
