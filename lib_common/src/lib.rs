//! # lib_common
//!
//! Shared building blocks for the food-ordering backend. Modules are gated by
//! folder-level features so a binary only compiles what it uses:
//!
//! - **`core`**: the real-time notification fan-out subsystem (session
//!   registry, channel abstraction, broadcaster, session lifecycle).
//! - **`orders`**: order pricing, status validation and the storage seam.
//! - **`connections`**: the PostgreSQL implementation of the order store.
//! - **`loggers`**: `tracing` subscriber setup with rotating file output.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

#[cfg(feature = "core")]
pub mod core;

#[cfg(feature = "orders")]
pub mod orders;

#[cfg(feature = "connections")]
pub mod connections;

#[cfg(feature = "loggers")]
pub mod loggers;
