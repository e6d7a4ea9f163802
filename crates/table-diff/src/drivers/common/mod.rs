//! Utilities shared across database drivers.
//!
//! - [`tls`]: TLS setup for PostgreSQL connections
//! - [`rows`]: decoding of text result columns

pub mod rows;
pub mod tls;

pub use tls::{make_tls_connector, SslMode};
