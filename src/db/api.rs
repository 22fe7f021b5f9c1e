//! Database API - high-level interface for branchstore.

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::branch::{Branch, HistoryEntry};
use crate::db::connection::Connection;
use crate::storage::{first_failure, MemoryStore, Source, StoreError};
use crate::transaction::IsolationLevel;

/// Result type for database operations.
pub type DatabaseResult<T> = Result<T, DatabaseError>;

/// Database errors.
#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("no active transaction")]
    NoActiveTransaction,

    #[error("a transaction is already active")]
    TransactionAlreadyActive,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl DatabaseError {
    /// Check if the transaction can be retried from the start.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DatabaseError::Store(e) if e.is_retryable())
    }
}

/// Database configuration options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Name shown in the REPL prompt.
    pub name: String,
    /// Isolation level for `begin()` and auto-committed operations.
    pub default_isolation: IsolationLevel,
    /// Flush the shared branches to the stores whenever they go idle.
    pub auto_flush: bool,
    /// Enable verbose logging.
    pub verbose: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            name: "branchstore".into(),
            default_isolation: IsolationLevel::default(),
            auto_flush: true,
            verbose: false,
        }
    }
}

impl DatabaseConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a configuration from a JSON file. Missing keys keep their
    /// defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> DatabaseResult<Self> {
        let text = fs::read_to_string(path)?;
        let config: DatabaseConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn name(mut self, value: impl Into<String>) -> Self {
        self.name = value.into();
        self
    }

    pub fn default_isolation(mut self, value: IsolationLevel) -> Self {
        self.default_isolation = value;
        self
    }

    pub fn auto_flush(mut self, value: bool) -> Self {
        self.auto_flush = value;
        self
    }

    pub fn verbose(mut self, value: bool) -> Self {
        self.verbose = value;
        self
    }

    /// Reject configurations that cannot be opened.
    pub fn validate(&self) -> DatabaseResult<()> {
        if self.name.trim().is_empty() {
            return Err(DatabaseError::InvalidConfig("name must not be empty".into()));
        }
        if self.name.chars().any(char::is_whitespace) {
            return Err(DatabaseError::InvalidConfig(format!(
                "name must not contain whitespace: {:?}",
                self.name
            )));
        }
        Ok(())
    }
}

/// The main database handle.
///
/// Thread-safe: can be shared across threads via Clone (uses Arc internally).
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

struct DatabaseInner {
    config: DatabaseConfig,
    explicit_store: MemoryStore,
    inferred_store: MemoryStore,
    /// Shared branches every transaction forks from.
    explicit: Branch,
    inferred: Branch,
    active_transactions: AtomicUsize,
}

impl Database {
    /// Open an empty database with the given configuration.
    pub fn open(config: DatabaseConfig) -> DatabaseResult<Self> {
        config.validate()?;
        Ok(Self::assemble(config))
    }

    /// Open an empty database with the default configuration.
    pub fn in_memory() -> Self {
        Self::assemble(DatabaseConfig::default())
    }

    fn assemble(config: DatabaseConfig) -> Self {
        let explicit_store = MemoryStore::new();
        let inferred_store = MemoryStore::new();
        let shared = |store: &MemoryStore| -> Branch {
            let parent: Arc<dyn Source> = Arc::new(store.clone());
            if config.auto_flush {
                Branch::with_auto_flush(parent)
            } else {
                Branch::new(parent)
            }
        };
        let explicit = shared(&explicit_store);
        let inferred = shared(&inferred_store);
        debug!(name = %config.name, isolation = %config.default_isolation, auto_flush = config.auto_flush, "opened database");

        Self {
            inner: Arc::new(DatabaseInner {
                config,
                explicit_store,
                inferred_store,
                explicit,
                inferred,
                active_transactions: AtomicUsize::new(0),
            }),
        }
    }

    /// Open a new connection.
    pub fn connect(&self) -> Connection {
        Connection::new(self.clone())
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.inner.config
    }

    pub(crate) fn explicit_branch(&self) -> &Branch {
        &self.inner.explicit
    }

    pub(crate) fn inferred_branch(&self) -> &Branch {
        &self.inner.inferred
    }

    pub(crate) fn transaction_started(&self) {
        self.inner.active_transactions.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn transaction_ended(&self) {
        let _ = self
            .inner
            .active_transactions
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    /// Flushed-but-not-persisted changes of the shared explicit branch.
    pub fn history(&self) -> Vec<HistoryEntry> {
        self.inner.explicit.history()
    }

    /// Push everything the shared branches hold down to the stores.
    ///
    /// Only legal while no transaction is running.
    pub fn flush(&self) -> DatabaseResult<()> {
        let active = self.inner.active_transactions.load(Ordering::SeqCst);
        if active > 0 {
            return Err(StoreError::InvalidOperation(format!(
                "cannot flush with {} active transaction(s)",
                active
            ))
            .into());
        }
        first_failure([self.inner.explicit.flush(), self.inner.inferred.flush()])?;
        Ok(())
    }

    /// Flush and release the shared branches.
    pub fn close(&self) -> DatabaseResult<()> {
        self.flush()?;
        first_failure([self.inner.explicit.close(), self.inner.inferred.close()])?;
        debug!(name = %self.inner.config.name, "closed database");
        Ok(())
    }

    /// Get database statistics.
    pub fn stats(&self) -> DatabaseStats {
        DatabaseStats {
            explicit_statements: self.inner.explicit_store.len(),
            inferred_statements: self.inner.inferred_store.len(),
            namespaces: self.inner.explicit_store.namespace_count(),
            unflushed_changesets: self.inner.explicit.history().len()
                + self.inner.inferred.history().len(),
            active_transactions: self.inner.active_transactions.load(Ordering::SeqCst),
        }
    }
}

/// Database statistics.
///
/// Statement and namespace counts cover the stores only; changes still
/// buffered in the shared branches are counted in `unflushed_changesets`.
#[derive(Debug, Clone, Serialize)]
pub struct DatabaseStats {
    pub explicit_statements: usize,
    pub inferred_statements: usize,
    pub namespaces: usize,
    pub unflushed_changesets: usize,
    pub active_transactions: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Statement;
    use std::io::Write;

    #[test]
    fn test_config_builder() {
        let config = DatabaseConfig::new()
            .name("test")
            .default_isolation(IsolationLevel::Serializable)
            .auto_flush(false)
            .verbose(true);
        assert_eq!(config.default_isolation, IsolationLevel::Serializable);
        assert!(!config.auto_flush);
        assert!(config.validate().is_ok());
        assert!(DatabaseConfig::new().name("bad name").validate().is_err());
    }

    #[test]
    fn test_config_from_json_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"name": "graphs", "default_isolation": "SNAPSHOT"}}"#).unwrap();

        let config = DatabaseConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.name, "graphs");
        assert_eq!(config.default_isolation, IsolationLevel::Snapshot);
        assert!(config.auto_flush);
    }

    #[test]
    fn test_config_rejects_bad_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"default_isolation": "EVENTUAL"}}"#).unwrap();
        assert!(matches!(
            DatabaseConfig::from_json_file(file.path()),
            Err(DatabaseError::Serialization(_))
        ));

        let missing = DatabaseConfig::from_json_file("/nonexistent/branchstore.json");
        assert!(matches!(missing, Err(DatabaseError::Io(_))));
    }

    #[test]
    fn test_auto_commit_reaches_store() {
        let db = Database::in_memory();
        let mut conn = db.connect();
        conn.add_statement(Statement::triple("ex:a", "ex:p", "ex:b")).unwrap();

        let stats = db.stats();
        assert_eq!(stats.explicit_statements, 1);
        assert_eq!(stats.active_transactions, 0);
        assert_eq!(stats.unflushed_changesets, 0);
    }

    #[test]
    fn test_manual_flush() {
        let db = Database::open(DatabaseConfig::new().auto_flush(false)).unwrap();
        let mut conn = db.connect();
        conn.add_statement(Statement::triple("ex:a", "ex:p", "ex:b")).unwrap();
        assert_eq!(db.stats().explicit_statements, 0);
        assert_eq!(db.history().len(), 1);
        assert_eq!(conn.size(&[]).unwrap(), 1);

        db.flush().unwrap();
        assert_eq!(db.stats().explicit_statements, 1);
        assert!(db.history().is_empty());
    }

    #[test]
    fn test_flush_refused_during_transaction() {
        let db = Database::open(DatabaseConfig::new().auto_flush(false)).unwrap();
        let mut conn = db.connect();
        conn.begin().unwrap();
        assert!(db.flush().is_err());
        conn.rollback().unwrap();
        assert!(db.close().is_ok());
    }
}
