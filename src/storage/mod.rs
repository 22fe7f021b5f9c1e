//! storage layer for branchstore
//!
//! This module defines the contracts every layer speaks and the in-memory
//! store at the bottom of the stack. Branches, unions and the connection
//! glue only ever see these traits.
//!
//! # Architecture
//!
//! ```text
//!        Connection
//!            │
//!            ▼
//!   ┌─────────────────┐
//!   │   UnionSource   │   explicit + inferred partitions
//!   └─────────────────┘
//!       │         │
//!       ▼         ▼
//!   ┌────────┐ ┌────────┐
//!   │ Branch │ │ Branch │   per-transaction forks
//!   └────────┘ └────────┘
//!       │         │
//!       ▼         ▼
//!   ┌────────┐ ┌────────┐
//!   │ Branch │ │ Branch │   shared, auto-flushing
//!   └────────┘ └────────┘
//!       │         │
//!       ▼         ▼
//!  MemoryStore  MemoryStore
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use branchstore::storage::{MemoryStore, Source};
//! use branchstore::transaction::IsolationLevel;
//!
//! let store = MemoryStore::new();
//! let branch = store.fork();
//!
//! let sink = branch.sink(IsolationLevel::Snapshot)?;
//! sink.approve(Statement::triple("ex:a", "ex:knows", "ex:b"))?;
//! sink.flush()?;
//! sink.close()?;
//!
//! branch.flush()?;
//! ```

mod error;
mod memory;
mod source;

pub(crate) use error::first_failure;
pub use error::{StoreError, StoreResult};
pub use memory::MemoryStore;
pub use source::{ContextIter, Dataset, NamespaceIter, Sink, Source, StatementIter};
