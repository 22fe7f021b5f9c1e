//! The narrow read/write contracts between layers.
//!
//! A [`Source`] hands out read views ([`Dataset`]) and write handles
//! ([`Sink`]). Branches implement `Source` on top of another `Source`, so
//! the same three traits describe both the backing store and every layer
//! stacked over it.
//!
//! All methods take `&self`: implementations guard their own state, which
//! lets a branch share one sink between its datasets and its commit path.

use std::sync::Arc;

use crate::model::{Namespace, Pattern, Statement, Term};
use crate::storage::error::StoreResult;
use crate::transaction::IsolationLevel;

/// Iterator over matching statements.
pub type StatementIter<'a> = Box<dyn Iterator<Item = StoreResult<Statement>> + 'a>;

/// Iterator over namespace bindings.
pub type NamespaceIter<'a> = Box<dyn Iterator<Item = StoreResult<Namespace>> + 'a>;

/// Iterator over named context identifiers.
pub type ContextIter<'a> = Box<dyn Iterator<Item = StoreResult<Term>> + 'a>;

/// A closable, consistent read view.
pub trait Dataset: Send + Sync {
    /// All namespace bindings visible in this view.
    fn namespaces(&self) -> StoreResult<NamespaceIter<'_>>;

    /// The namespace bound to `prefix`, if any.
    fn namespace(&self, prefix: &str) -> StoreResult<Option<String>>;

    /// Identifiers of the named contexts that hold statements.
    fn context_ids(&self) -> StoreResult<ContextIter<'_>>;

    /// Statements matching `pattern`, without duplicates.
    fn statements(&self, pattern: &Pattern) -> StoreResult<StatementIter<'_>>;

    /// Release this view. Idempotent.
    fn close(&self) -> StoreResult<()>;

    /// Check whether at least one statement matches `pattern`.
    fn has_statement(&self, pattern: &Pattern) -> StoreResult<bool> {
        match self.statements(pattern)?.next() {
            Some(result) => result.map(|_| true),
            None => Ok(false),
        }
    }
}

/// A closable write handle for one transaction.
pub trait Sink: Send + Sync {
    /// Add a statement.
    fn approve(&self, statement: Statement) -> StoreResult<()>;

    /// Remove a statement.
    fn deprecate(&self, statement: Statement) -> StoreResult<()>;

    /// Remove every statement in the given contexts, or everything if
    /// `contexts` is empty.
    fn clear(&self, contexts: &[Option<Term>]) -> StoreResult<()>;

    fn set_namespace(&self, prefix: &str, name: &str) -> StoreResult<()>;

    fn remove_namespace(&self, prefix: &str) -> StoreResult<()>;

    fn clear_namespaces(&self) -> StoreResult<()>;

    /// Record a read pattern for conflict detection.
    ///
    /// No-op unless the sink was opened at `Serializable`.
    fn observe(&self, pattern: &Pattern) -> StoreResult<()>;

    /// Check that this sink can be flushed without conflicts.
    fn prepare(&self) -> StoreResult<()>;

    /// Apply the buffered writes to the source this sink came from.
    fn flush(&self) -> StoreResult<()>;

    /// Release this sink, discarding anything not flushed. Idempotent.
    fn close(&self) -> StoreResult<()>;
}

/// A branchable container of statements.
pub trait Source: Send + Sync {
    /// Create a branch whose state starts identical to this source.
    fn fork(&self) -> Arc<dyn Source>;

    /// Open a write handle.
    fn sink(&self, level: IsolationLevel) -> StoreResult<Box<dyn Sink>>;

    /// Open a read view.
    fn dataset(&self, level: IsolationLevel) -> StoreResult<Box<dyn Dataset>>;

    /// Validate pending state against the parent.
    fn prepare(&self) -> StoreResult<()>;

    /// Apply pending state to the parent.
    fn flush(&self) -> StoreResult<()>;

    /// Release handles this source opened. Never closes the parent.
    fn close(&self) -> StoreResult<()>;
}
