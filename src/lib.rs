//! branchstore - a branchable transactional statement store
//!
//! This crate provides the transactional layer between a graph-database
//! connection and a statement backend. Every transaction works on a fork of
//! the shared state; writes pile up as copy-on-write changesets that are
//! layered over the parent for reads and replayed into it on commit.
//! Isolation levels decide whether reads are pinned to a snapshot and
//! whether read patterns are tracked for conflict detection.
//!
//! # Example
//!
//! ```no_run
//! use branchstore::db::Database;
//! use branchstore::model::{Pattern, Statement};
//! use branchstore::transaction::IsolationLevel;
//!
//! let db = Database::in_memory();
//! let mut conn = db.connect();
//!
//! conn.begin_with(IsolationLevel::Serializable).unwrap();
//! conn.add_statement(Statement::triple("ex:alice", "ex:knows", "ex:bob")).unwrap();
//! let found = conn.statements(&Pattern::any(), true).unwrap();
//! assert_eq!(found.len(), 1);
//! conn.commit().unwrap();
//! ```

pub mod branch;
pub mod db;
pub mod model;
pub mod storage;
pub mod transaction;
