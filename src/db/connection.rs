//! Connections - transactions over the explicit and inferred partitions.
//!
//! Every isolated transaction forks both shared branches and reads through
//! a [`UnionSource`] of the two forks. Writes are buffered in one open sink
//! per partition and pushed into the forks before each read, so the
//! transaction always sees its own writes. Commit replays the forks into
//! the shared branches.
//!
//! Operations called outside a transaction run in their own short
//! transaction at the configured default isolation level.

use std::sync::Arc;

use tracing::{debug, warn};
use ulid::Ulid;

use crate::branch::UnionSource;
use crate::db::api::{Database, DatabaseError, DatabaseResult};
use crate::model::{Namespace, Pattern, Statement, Term};
use crate::storage::{first_failure, Dataset, Sink, Source, StoreError, StoreResult};
use crate::transaction::IsolationLevel;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Partition {
    Explicit,
    Inferred,
}

/// What a read looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum View {
    Explicit,
    Inferred,
    Both,
}

impl View {
    fn including_inferred(include_inferred: bool) -> Self {
        if include_inferred {
            View::Both
        } else {
            View::Explicit
        }
    }
}

/// Open state of one transaction.
struct ActiveTransaction {
    id: Ulid,
    level: IsolationLevel,
    /// Forks of the shared branches, or the shared branches themselves at
    /// `NONE`.
    sources: UnionSource,
    explicit_sink: Option<Box<dyn Sink>>,
    inferred_sink: Option<Box<dyn Sink>>,
}

impl ActiveTransaction {
    fn open(db: &Database, level: IsolationLevel) -> Self {
        let explicit = db.explicit_branch();
        let inferred = db.inferred_branch();
        let sources = if level.is_isolated() {
            UnionSource::new(explicit.fork(), inferred.fork())
        } else {
            UnionSource::new(Arc::new(explicit.clone()), Arc::new(inferred.clone()))
        };
        Self {
            id: Ulid::new(),
            level,
            sources,
            explicit_sink: None,
            inferred_sink: None,
        }
    }

    fn source(&self, partition: Partition) -> &Arc<dyn Source> {
        match partition {
            Partition::Explicit => self.sources.primary(),
            Partition::Inferred => self.sources.secondary(),
        }
    }

    /// The open sink of a partition, opened on first use.
    fn sink(&mut self, partition: Partition) -> StoreResult<&dyn Sink> {
        let (slot, source) = match partition {
            Partition::Explicit => (&mut self.explicit_sink, self.sources.primary()),
            Partition::Inferred => (&mut self.inferred_sink, self.sources.secondary()),
        };
        if slot.is_none() {
            *slot = Some(source.sink(self.level)?);
        }
        slot.as_deref().ok_or_else(|| StoreError::closed("sink"))
    }

    /// Push buffered writes into the transaction's branches.
    fn flush_updates(&mut self) -> StoreResult<()> {
        let sinks = [self.explicit_sink.take(), self.inferred_sink.take()];
        let mut results = Vec::new();
        for sink in sinks.into_iter().flatten() {
            let flushed = sink.flush();
            let closed = sink.close();
            results.push(flushed.and(closed));
        }
        first_failure(results)
    }

    fn prepare(&mut self) -> StoreResult<()> {
        self.flush_updates()?;
        if self.level.is_isolated() {
            self.sources.prepare()?;
        }
        Ok(())
    }

    /// Replay the branches into the shared state. The forks' history is
    /// gone afterwards, whether or not this succeeds.
    fn flush(&mut self) -> StoreResult<()> {
        if self.level.is_isolated() {
            self.sources.flush()?;
        }
        Ok(())
    }

    /// Release every handle, discarding unflushed writes.
    fn close(mut self) -> StoreResult<()> {
        let explicit = self.explicit_sink.take();
        let inferred = self.inferred_sink.take();
        let released = first_failure([
            explicit.map_or(Ok(()), |sink| sink.close()),
            inferred.map_or(Ok(()), |sink| sink.close()),
        ]);
        // the shared branches are not ours to close
        let closed = if self.level.is_isolated() {
            self.sources.close()
        } else {
            Ok(())
        };
        released.and(closed)
    }

    fn read<T>(&mut self, view: View, f: impl FnOnce(&dyn Dataset) -> StoreResult<T>) -> StoreResult<T> {
        self.flush_updates()?;
        let dataset = match view {
            View::Both => self.sources.dataset(self.level)?,
            View::Explicit => self.source(Partition::Explicit).dataset(self.level)?,
            View::Inferred => self.source(Partition::Inferred).dataset(self.level)?,
        };
        let outcome = f(dataset.as_ref());
        let closed = dataset.close();
        let value = outcome?;
        closed?;
        Ok(value)
    }
}

/// A session against a [`Database`].
pub struct Connection {
    id: Ulid,
    db: Database,
    tx: Option<ActiveTransaction>,
}

impl Connection {
    pub(crate) fn new(db: Database) -> Self {
        Self {
            id: Ulid::new(),
            db,
            tx: None,
        }
    }

    pub fn id(&self) -> Ulid {
        self.id
    }

    pub fn is_active(&self) -> bool {
        self.tx.is_some()
    }

    /// Isolation level of the running transaction.
    pub fn isolation(&self) -> Option<IsolationLevel> {
        self.tx.as_ref().map(|tx| tx.level)
    }

    // ==================== Transaction lifecycle ====================

    /// Begin a transaction at the configured default isolation level.
    pub fn begin(&mut self) -> DatabaseResult<()> {
        self.begin_with(self.db.config().default_isolation)
    }

    pub fn begin_with(&mut self, level: IsolationLevel) -> DatabaseResult<()> {
        if self.tx.is_some() {
            return Err(DatabaseError::TransactionAlreadyActive);
        }
        let tx = ActiveTransaction::open(&self.db, level);
        debug!(connection = %self.id, tx = %tx.id, %level, "begin");
        self.db.transaction_started();
        self.tx = Some(tx);
        Ok(())
    }

    /// Validate the transaction without committing it.
    ///
    /// Surfaces serializable conflicts early; the transaction stays open.
    pub fn prepare(&mut self) -> DatabaseResult<()> {
        let tx = self.tx.as_mut().ok_or(DatabaseError::NoActiveTransaction)?;
        tx.prepare()?;
        Ok(())
    }

    /// Commit the running transaction.
    ///
    /// If the prepare stage fails the transaction stays active and must be
    /// rolled back. A failure while flushing ends the transaction.
    pub fn commit(&mut self) -> DatabaseResult<()> {
        let tx = self.tx.as_mut().ok_or(DatabaseError::NoActiveTransaction)?;
        if let Err(e) = tx.prepare() {
            warn!(connection = %self.id, tx = %tx.id, error = %e, "commit failed");
            return Err(e.into());
        }
        self.flush_prepared()
    }

    fn flush_prepared(&mut self) -> DatabaseResult<()> {
        let tx = self.tx.as_mut().ok_or(DatabaseError::NoActiveTransaction)?;
        let flushed = tx.flush();
        if let Err(e) = &flushed {
            warn!(connection = %self.id, tx = %tx.id, error = %e, "flush failed, transaction discarded");
        }
        let finished = self.finish();
        flushed?;
        finished?;
        Ok(())
    }

    /// Abandon the running transaction.
    pub fn rollback(&mut self) -> DatabaseResult<()> {
        if self.tx.is_none() {
            return Err(DatabaseError::NoActiveTransaction);
        }
        self.finish()?;
        Ok(())
    }

    fn finish(&mut self) -> StoreResult<()> {
        let Some(tx) = self.tx.take() else {
            return Ok(());
        };
        let tx_id = tx.id;
        let result = tx.close();
        self.db.transaction_ended();
        debug!(connection = %self.id, tx = %tx_id, ok = result.is_ok(), "end");
        result
    }

    /// Run `f` in a transaction, committing on success and rolling back on
    /// error.
    pub fn with_transaction<T>(
        &mut self,
        level: IsolationLevel,
        f: impl FnOnce(&mut Connection) -> DatabaseResult<T>,
    ) -> DatabaseResult<T> {
        self.begin_with(level)?;
        let outcome = f(self).and_then(|value| {
            self.commit()?;
            Ok(value)
        });
        if outcome.is_err() && self.tx.is_some() {
            if let Err(e) = self.finish() {
                warn!(connection = %self.id, error = %e, "rollback failed");
            }
        }
        outcome
    }

    fn write<T>(
        &mut self,
        partition: Partition,
        f: impl FnOnce(&dyn Sink) -> StoreResult<T>,
    ) -> DatabaseResult<T> {
        match self.tx.as_mut() {
            Some(tx) => Ok(f(tx.sink(partition)?)?),
            None => {
                let level = self.db.config().default_isolation;
                self.with_transaction(level, |conn| conn.write(partition, f))
            }
        }
    }

    fn read<T>(&mut self, view: View, f: impl FnOnce(&dyn Dataset) -> StoreResult<T>) -> DatabaseResult<T> {
        match self.tx.as_mut() {
            Some(tx) => Ok(tx.read(view, f)?),
            None => {
                let level = self.db.config().default_isolation;
                self.with_transaction(level, |conn| conn.read(view, f))
            }
        }
    }

    // ==================== Explicit statements ====================

    pub fn add_statement(&mut self, statement: Statement) -> DatabaseResult<()> {
        self.write(Partition::Explicit, |sink| sink.approve(statement))
    }

    /// Remove every explicit statement matching `pattern`.
    ///
    /// Returns the number of statements removed.
    pub fn remove_statements(&mut self, pattern: &Pattern) -> DatabaseResult<usize> {
        if self.tx.is_none() {
            let level = self.db.config().default_isolation;
            return self.with_transaction(level, |conn| conn.remove_statements(pattern));
        }
        let matches = self.statements(pattern, false)?;
        let removed = matches.len();
        self.write(Partition::Explicit, |sink| {
            for statement in matches {
                sink.deprecate(statement)?;
            }
            Ok(())
        })?;
        Ok(removed)
    }

    /// Remove the explicit statements in `contexts`, or all of them.
    pub fn clear(&mut self, contexts: &[Option<Term>]) -> DatabaseResult<()> {
        self.write(Partition::Explicit, |sink| sink.clear(contexts))
    }

    // ==================== Inferred statements ====================

    /// Add a derived statement.
    ///
    /// Returns `false` if the statement is already present, explicitly or
    /// as an inference.
    pub fn add_inferred_statement(&mut self, statement: Statement) -> DatabaseResult<bool> {
        if self.tx.is_none() {
            let level = self.db.config().default_isolation;
            return self.with_transaction(level, |conn| conn.add_inferred_statement(statement));
        }
        if self.has_statement(&Pattern::exact(&statement), true)? {
            return Ok(false);
        }
        self.write(Partition::Inferred, |sink| sink.approve(statement))?;
        Ok(true)
    }

    /// Remove every inferred statement matching `pattern`.
    pub fn remove_inferred_statements(&mut self, pattern: &Pattern) -> DatabaseResult<usize> {
        if self.tx.is_none() {
            let level = self.db.config().default_isolation;
            return self.with_transaction(level, |conn| conn.remove_inferred_statements(pattern));
        }
        let matches: Vec<Statement> =
            self.read(View::Inferred, |dataset| dataset.statements(pattern)?.collect())?;
        let removed = matches.len();
        self.write(Partition::Inferred, |sink| {
            for statement in matches {
                sink.deprecate(statement)?;
            }
            Ok(())
        })?;
        Ok(removed)
    }

    pub fn clear_inferred(&mut self, contexts: &[Option<Term>]) -> DatabaseResult<()> {
        self.write(Partition::Inferred, |sink| sink.clear(contexts))
    }

    // ==================== Namespaces ====================

    pub fn set_namespace(&mut self, prefix: &str, name: &str) -> DatabaseResult<()> {
        self.write(Partition::Explicit, |sink| sink.set_namespace(prefix, name))
    }

    pub fn remove_namespace(&mut self, prefix: &str) -> DatabaseResult<()> {
        self.write(Partition::Explicit, |sink| sink.remove_namespace(prefix))
    }

    pub fn clear_namespaces(&mut self) -> DatabaseResult<()> {
        self.write(Partition::Explicit, |sink| sink.clear_namespaces())
    }

    pub fn namespaces(&mut self) -> DatabaseResult<Vec<Namespace>> {
        self.read(View::Explicit, |dataset| dataset.namespaces()?.collect())
    }

    pub fn namespace(&mut self, prefix: &str) -> DatabaseResult<Option<String>> {
        self.read(View::Explicit, |dataset| dataset.namespace(prefix))
    }

    // ==================== Reads ====================

    pub fn statements(
        &mut self,
        pattern: &Pattern,
        include_inferred: bool,
    ) -> DatabaseResult<Vec<Statement>> {
        self.read(View::including_inferred(include_inferred), |dataset| {
            dataset.statements(pattern)?.collect()
        })
    }

    pub fn has_statement(&mut self, pattern: &Pattern, include_inferred: bool) -> DatabaseResult<bool> {
        self.read(View::including_inferred(include_inferred), |dataset| {
            dataset.has_statement(pattern)
        })
    }

    /// Named contexts holding explicit or inferred statements.
    pub fn context_ids(&mut self) -> DatabaseResult<Vec<Term>> {
        self.read(View::Both, |dataset| dataset.context_ids()?.collect())
    }

    /// Number of explicit statements in `contexts`, or in total.
    pub fn size(&mut self, contexts: &[Option<Term>]) -> DatabaseResult<usize> {
        let pattern = Pattern::any().in_contexts(contexts.iter().cloned());
        self.read(View::Explicit, |dataset| {
            let mut count = 0;
            for item in dataset.statements(&pattern)? {
                item?;
                count += 1;
            }
            Ok(count)
        })
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if self.tx.is_some() {
            if let Err(e) = self.finish() {
                warn!(connection = %self.id, error = %e, "failed to roll back on drop");
            }
        }
    }
}
