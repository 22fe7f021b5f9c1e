//! In-memory backing store.
//!
//! Holds the committed statements and namespaces behind a single lock.
//! Readers clone the `Arc` of the current state, so every dataset is a
//! snapshot for free; writers build a new state with `Arc::make_mut`.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;
use ulid::Ulid;

use crate::branch::{Branch, Changeset, Delta};
use crate::model::{Namespace, Pattern, Statement, Term};
use crate::storage::error::{StoreError, StoreResult};
use crate::storage::source::{
    ContextIter, Dataset, NamespaceIter, Sink, Source, StatementIter,
};
use crate::transaction::IsolationLevel;

#[derive(Debug, Default, Clone)]
struct StoreState {
    statements: BTreeSet<Statement>,
    namespaces: BTreeMap<String, String>,
}

impl StoreState {
    fn apply(&mut self, delta: &Delta) {
        if delta.namespace_cleared {
            self.namespaces.clear();
        }
        for prefix in &delta.removed_prefixes {
            self.namespaces.remove(prefix);
        }
        for (prefix, name) in &delta.added_namespaces {
            self.namespaces.insert(prefix.clone(), name.clone());
        }
        if delta.statement_cleared {
            self.statements.clear();
        }
        if !delta.deprecated_contexts.is_empty() {
            self.statements
                .retain(|st| !delta.deprecated_contexts.contains(&st.context));
        }
        for statement in &delta.deprecated {
            self.statements.remove(statement);
        }
        for statement in &delta.approved {
            self.statements.insert(statement.clone());
        }
    }
}

struct MemoryInner {
    id: Ulid,
    state: RwLock<Arc<StoreState>>,
}

/// The true backing source: committed state lives here.
///
/// `prepare`, `flush` and `close` on the store itself do nothing; sinks
/// apply their writes atomically when flushed.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MemoryInner {
                id: Ulid::new(),
                state: RwLock::new(Arc::new(StoreState::default())),
            }),
        }
    }

    pub fn id(&self) -> Ulid {
        self.inner.id
    }

    /// Number of committed statements.
    pub fn len(&self) -> usize {
        self.inner.state.read().statements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of committed namespace bindings.
    pub fn namespace_count(&self) -> usize {
        self.inner.state.read().namespaces.len()
    }

    fn snapshot(&self) -> Arc<StoreState> {
        Arc::clone(&self.inner.state.read())
    }

    fn commit(&self, changes: &Changeset) {
        let mut guard = self.inner.state.write();
        changes.view(|delta| Arc::make_mut(&mut guard).apply(delta));
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Source for MemoryStore {
    fn fork(&self) -> Arc<dyn Source> {
        Arc::new(Branch::new(Arc::new(self.clone())))
    }

    fn sink(&self, level: IsolationLevel) -> StoreResult<Box<dyn Sink>> {
        let sink = MemorySink {
            id: Ulid::new(),
            store: self.clone(),
            changes: Changeset::new(),
            flushed: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        };
        debug!(store = %self.inner.id, sink = %sink.id, %level, "opened store sink");
        Ok(Box::new(sink))
    }

    fn dataset(&self, _level: IsolationLevel) -> StoreResult<Box<dyn Dataset>> {
        Ok(Box::new(MemoryDataset {
            state: self.snapshot(),
            closed: AtomicBool::new(false),
        }))
    }

    fn prepare(&self) -> StoreResult<()> {
        Ok(())
    }

    fn flush(&self) -> StoreResult<()> {
        Ok(())
    }

    fn close(&self) -> StoreResult<()> {
        Ok(())
    }
}

/// Read view over one committed state.
struct MemoryDataset {
    state: Arc<StoreState>,
    closed: AtomicBool,
}

impl MemoryDataset {
    fn check_open(&self) -> StoreResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::closed("dataset"));
        }
        Ok(())
    }
}

impl Dataset for MemoryDataset {
    fn namespaces(&self) -> StoreResult<NamespaceIter<'_>> {
        self.check_open()?;
        Ok(Box::new(
            self.state
                .namespaces
                .iter()
                .map(|(prefix, name)| Ok(Namespace::new(prefix.clone(), name.clone()))),
        ))
    }

    fn namespace(&self, prefix: &str) -> StoreResult<Option<String>> {
        self.check_open()?;
        Ok(self.state.namespaces.get(prefix).cloned())
    }

    fn context_ids(&self) -> StoreResult<ContextIter<'_>> {
        self.check_open()?;
        let contexts: BTreeSet<Term> = self
            .state
            .statements
            .iter()
            .filter_map(|st| st.context.clone())
            .collect();
        Ok(Box::new(contexts.into_iter().map(Ok)))
    }

    fn statements(&self, pattern: &Pattern) -> StoreResult<StatementIter<'_>> {
        self.check_open()?;
        let pattern = pattern.clone();
        match pattern.subject.clone() {
            // statements are ordered by subject first
            Some(subject) => {
                let start = Statement::new(subject.clone(), "", "", None);
                Ok(Box::new(
                    self.state
                        .statements
                        .range(start..)
                        .take_while(move |st| st.subject == subject)
                        .filter(move |st| pattern.matches(st))
                        .cloned()
                        .map(Ok),
                ))
            }
            None => Ok(Box::new(
                self.state
                    .statements
                    .iter()
                    .filter(move |st| pattern.matches(st))
                    .cloned()
                    .map(Ok),
            )),
        }
    }

    fn close(&self) -> StoreResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Buffers writes and applies them to the store in one step.
struct MemorySink {
    id: Ulid,
    store: MemoryStore,
    changes: Changeset,
    flushed: AtomicBool,
    closed: AtomicBool,
}

impl MemorySink {
    fn check_writable(&self) -> StoreResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::closed("sink"));
        }
        if self.flushed.load(Ordering::SeqCst) {
            return Err(StoreError::AlreadyFlushed {
                sink_id: self.id.to_string(),
            });
        }
        Ok(())
    }
}

impl Sink for MemorySink {
    fn approve(&self, statement: Statement) -> StoreResult<()> {
        self.check_writable()?;
        self.changes.approve(statement);
        Ok(())
    }

    fn deprecate(&self, statement: Statement) -> StoreResult<()> {
        self.check_writable()?;
        self.changes.deprecate(statement);
        Ok(())
    }

    fn clear(&self, contexts: &[Option<Term>]) -> StoreResult<()> {
        self.check_writable()?;
        self.changes.clear(contexts);
        Ok(())
    }

    fn set_namespace(&self, prefix: &str, name: &str) -> StoreResult<()> {
        self.check_writable()?;
        self.changes.set_namespace(prefix, name);
        Ok(())
    }

    fn remove_namespace(&self, prefix: &str) -> StoreResult<()> {
        self.check_writable()?;
        self.changes.remove_namespace(prefix);
        Ok(())
    }

    fn clear_namespaces(&self) -> StoreResult<()> {
        self.check_writable()?;
        self.changes.clear_namespaces();
        Ok(())
    }

    fn observe(&self, _pattern: &Pattern) -> StoreResult<()> {
        // committed state has no concurrent siblings to conflict with
        Ok(())
    }

    fn prepare(&self) -> StoreResult<()> {
        self.check_writable()
    }

    fn flush(&self) -> StoreResult<()> {
        self.check_writable()?;
        self.store.commit(&self.changes);
        self.flushed.store(true, Ordering::SeqCst);
        debug!(store = %self.store.id(), sink = %self.id, changes = %self.changes, "applied to store");
        self.changes.release();
        Ok(())
    }

    fn close(&self) -> StoreResult<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.changes.release();
        }
        Ok(())
    }
}
