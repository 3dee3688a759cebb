//! # Order Domain
//!
//! Supporting logic that feeds the notification core: pricing, persistence
//! through the `OrderStore` seam, status validation and the events each
//! successful change emits.
//!
//! ## Core Components:
//!
//! - **`model`**: orders, line items, menu items, the status enum and the
//!   restaurant statistics summary.
//! - **`store`**: the `OrderStore` trait and the in-process `MemoryStore`.
//! - **`service`**: the `OrderService`, which validates, commits and notifies.

pub mod model;
pub mod service;
pub mod store;

// --- Public API Re-exports ---
pub use model::{
    DishSales, LineItemRequest, MenuItem, NewOrder, Order, OrderItem, OrderStatus, RestaurantStats, UnknownStatus,
};
pub use service::{OrderError, OrderService, Viewer};
pub use store::{MemoryStore, OrderStore, StoreError};
