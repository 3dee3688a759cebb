//! # Order Storage Seam
//!
//! `OrderStore` is the persistence collaborator of the order service: it reads
//! menu items and commits orders with their line items atomically. The
//! in-process `MemoryStore` backs tests and database-less runs; the Postgres
//! implementation lives in `connections::db_postgres`.

use std::collections::HashMap;
use std::error::Error as StdError;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::orders::model::{MenuItem, Order, OrderStatus};

/// Errors raised by an order store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backend could not be reached (pool exhausted, connection refused).
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// The backend rejected or failed the operation.
    #[error("storage backend error: {0}")]
    Backend(#[source] Box<dyn StdError + Send + Sync>),

    /// A stored row could not be mapped back to the domain model.
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

impl StoreError {
    pub fn backend<E>(err: E) -> Self
    where
        E: Into<Box<dyn StdError + Send + Sync>>,
    {
        StoreError::Backend(err.into())
    }
}

/// # Order Store
///
/// Listing methods return orders newest first.
#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Current state of one menu item, if it exists.
    async fn menu_item(&self, prato_id: Uuid) -> Result<Option<MenuItem>, StoreError>;

    /// Persists the order header and all its line items, or nothing.
    async fn insert_order(&self, order: &Order) -> Result<(), StoreError>;

    /// One order with its items.
    async fn order(&self, pedido_id: Uuid) -> Result<Option<Order>, StoreError>;

    /// Sets the status and returns the updated order, or `None` if it does not exist.
    async fn update_status(&self, pedido_id: Uuid, status: OrderStatus) -> Result<Option<Order>, StoreError>;

    async fn orders_for_restaurant(&self, restaurante_id: Uuid) -> Result<Vec<Order>, StoreError>;

    async fn orders_for_user(&self, usuario_id: Uuid) -> Result<Vec<Order>, StoreError>;
}

#[derive(Default)]
struct Tables {
    menu: HashMap<Uuid, MenuItem>,
    orders: HashMap<Uuid, Order>,
}

/// In-process `OrderStore`. Every write is a single critical section, which
/// makes `insert_order` atomic.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store pre-loaded with `menu`.
    pub fn with_menu<I>(menu: I) -> Self
    where
        I: IntoIterator<Item = MenuItem>,
    {
        let store = Self::new();
        for item in menu {
            store.put_menu_item(item);
        }
        store
    }

    /// Inserts or replaces a menu item.
    pub fn put_menu_item(&self, item: MenuItem) {
        self.write().menu.insert(item.prato_id, item);
    }

    pub fn menu_len(&self) -> usize {
        self.read().menu.len()
    }

    pub fn order_count(&self) -> usize {
        self.read().orders.len()
    }

    fn read(&self) -> RwLockReadGuard<'_, Tables> {
        self.tables.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Tables> {
        self.tables.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn collect_sorted<F>(&self, filter: F) -> Vec<Order>
    where
        F: Fn(&Order) -> bool,
    {
        let mut orders: Vec<Order> = self.read().orders.values().filter(|o| filter(*o)).cloned().collect();
        orders.sort_by(|a, b| b.data_pedido.cmp(&a.data_pedido));
        orders
    }
}

#[async_trait]
impl OrderStore for MemoryStore {
    async fn menu_item(&self, prato_id: Uuid) -> Result<Option<MenuItem>, StoreError> {
        Ok(self.read().menu.get(&prato_id).cloned())
    }

    async fn insert_order(&self, order: &Order) -> Result<(), StoreError> {
        self.write().orders.insert(order.pedido_id, order.clone());
        Ok(())
    }

    async fn order(&self, pedido_id: Uuid) -> Result<Option<Order>, StoreError> {
        Ok(self.read().orders.get(&pedido_id).cloned())
    }

    async fn update_status(&self, pedido_id: Uuid, status: OrderStatus) -> Result<Option<Order>, StoreError> {
        let mut tables = self.write();
        Ok(tables.orders.get_mut(&pedido_id).map(|order| {
            order.status = status;
            order.clone()
        }))
    }

    async fn orders_for_restaurant(&self, restaurante_id: Uuid) -> Result<Vec<Order>, StoreError> {
        Ok(self.collect_sorted(|o| o.restaurante_id == restaurante_id))
    }

    async fn orders_for_user(&self, usuario_id: Uuid) -> Result<Vec<Order>, StoreError> {
        Ok(self.collect_sorted(|o| o.usuario_id == usuario_id))
    }
}
