//! # Connections Module
//!
//! Persistent connections to external services. Today that is the PostgreSQL
//! order store.

/// PostgreSQL connection pooling and the `OrderStore` built on it.
pub mod db_postgres;

pub use db_postgres::{DbError, PostgresStore};
