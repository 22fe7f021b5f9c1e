//! High-level Database API and REPL interface.
//!
//! This module provides the connection-facing layer over the branch
//! machinery: a [`Database`] owning the explicit and inferred stores, the
//! [`Connection`]s that run transactions against it, and an interactive
//! command line.

mod api;
mod connection;
mod repl;

pub use api::{Database, DatabaseConfig, DatabaseError, DatabaseResult, DatabaseStats};
pub use connection::Connection;
pub use repl::{CommandOutcome, Repl, ReplConfig};
