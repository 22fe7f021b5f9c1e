//! Branch - a forkable layer over another source.
//!
//! A branch keeps an ordered history of flushed changesets on top of its
//! parent. It handles:
//! - Layering history over the parent for reads
//! - Merging flushed sinks into history
//! - Compressing history entries no dataset reads through
//! - Replaying history into the parent on prepare/flush
//!
//! Locks are always taken child before parent. A branch never closes its
//! own datasets or sinks while holding its own lock.

use std::collections::{HashSet, VecDeque};
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, trace, warn};
use ulid::Ulid;

use crate::branch::changeset::Changeset;
use crate::branch::decorators::{ObservingDataset, PinnedDataset};
use crate::branch::overlay::OverlayDataset;
use crate::model::{Pattern, Statement, Term};
use crate::storage::{
    first_failure, ContextIter, Dataset, NamespaceIter, Sink, Source, StatementIter,
    StoreError, StoreResult,
};
use crate::transaction::IsolationLevel;

/// A forkable layer of a source.
///
/// Thread-safe: can be shared across threads via Clone (uses Arc internally).
#[derive(Clone)]
pub struct Branch {
    inner: Arc<BranchInner>,
}

struct BranchInner {
    id: Ulid,
    parent: Arc<dyn Source>,
    /// Flush to the parent whenever the branch goes idle.
    auto_flush: bool,
    state: Mutex<BranchState>,
    next_dataset_id: AtomicU64,
}

#[derive(Default)]
struct BranchState {
    /// Flushed changesets, oldest first.
    history: VecDeque<Arc<Changeset>>,
    /// Changesets of sinks that are open and not yet flushed.
    pending: Vec<Arc<Changeset>>,
    open_datasets: HashSet<u64>,
    /// Parent dataset shared by every snapshot read.
    snapshot: Option<Arc<dyn Dataset>>,
    /// Parent sink recording what serializable reads observed.
    serializable: Option<Arc<dyn Sink>>,
    /// Parent sink that history is replayed into.
    prepared: Option<Arc<dyn Sink>>,
    prepared_is_serializable: bool,
    /// Handles detached by a flush while datasets still read through them.
    retired: Retired,
}

/// Parent handles waiting for the last open dataset to close.
#[derive(Default)]
struct Retired {
    snapshots: Vec<Arc<dyn Dataset>>,
    sinks: Vec<Arc<dyn Sink>>,
}

impl Retired {
    fn is_empty(&self) -> bool {
        self.snapshots.is_empty() && self.sinks.is_empty()
    }

    fn close(self) -> StoreResult<()> {
        let results: Vec<StoreResult<()>> = self
            .sinks
            .into_iter()
            .map(|sink| sink.close())
            .chain(self.snapshots.into_iter().map(|dataset| dataset.close()))
            .collect();
        first_failure(results)
    }
}

/// Read-only description of one history entry.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryEntry {
    pub flushed_at: Option<DateTime<Utc>>,
    pub summary: String,
    pub readers: usize,
}

impl Branch {
    /// Create a branch over `parent` that only flushes when asked to.
    pub fn new(parent: Arc<dyn Source>) -> Self {
        Self::build(parent, false)
    }

    /// Create a branch that flushes itself to `parent` whenever its last
    /// dataset or sink is closed.
    pub fn with_auto_flush(parent: Arc<dyn Source>) -> Self {
        Self::build(parent, true)
    }

    fn build(parent: Arc<dyn Source>, auto_flush: bool) -> Self {
        Self {
            inner: Arc::new(BranchInner {
                id: Ulid::new(),
                parent,
                auto_flush,
                state: Mutex::new(BranchState::default()),
                next_dataset_id: AtomicU64::new(0),
            }),
        }
    }

    pub fn id(&self) -> Ulid {
        self.inner.id
    }

    /// Fork this branch, keeping the concrete type.
    pub fn fork_branch(&self) -> Branch {
        let child = Branch::new(Arc::new(self.clone()));
        debug!(parent = %self.inner.id, branch = %child.inner.id, "forked branch");
        child
    }

    /// True if any flushed change is waiting to reach the parent.
    pub fn is_changed(&self) -> bool {
        self.inner
            .state
            .lock()
            .history
            .iter()
            .any(|changes| changes.is_changed())
    }

    pub fn history(&self) -> Vec<HistoryEntry> {
        self.inner
            .state
            .lock()
            .history
            .iter()
            .map(|changes| HistoryEntry {
                flushed_at: changes.flushed_at(),
                summary: changes.to_string(),
                readers: changes.reader_count(),
            })
            .collect()
    }

    pub fn pending_count(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    pub fn open_dataset_count(&self) -> usize {
        self.inner.state.lock().open_datasets.len()
    }

    // ==================== Merge & compression ====================

    /// Move a flushed sink's changeset into history.
    fn merge(&self, sink_id: Ulid, changes: &Arc<Changeset>, level: IsolationLevel) -> StoreResult<()> {
        let mut state = self.inner.state.lock();
        if level.tracks_observations() {
            // a sibling may have flushed since prepare()
            changes.check_conflicts()?;
        }
        state.pending.retain(|pending| !Arc::ptr_eq(pending, changes));

        let flushed = Arc::new(changes.take_flushed());
        if !flushed.is_changed() {
            trace!(branch = %self.inner.id, sink = %sink_id, "nothing to merge");
            return Ok(());
        }
        debug!(branch = %self.inner.id, sink = %sink_id, changes = %flushed, "merged sink");
        for sibling in &state.pending {
            sibling.prepend(Arc::clone(&flushed));
        }
        state.history.push_back(flushed);
        self.compress_locked(&mut state);
        Ok(())
    }

    /// Fold the newest history entry into the one below while nothing
    /// reads through the one below.
    fn compress_locked(&self, state: &mut BranchState) {
        loop {
            let len = state.history.len();
            if len < 2 || state.history[len - 2].has_readers() {
                break;
            }
            let Some(newest) = state.history.pop_back() else {
                break;
            };
            if let Some(below) = state.history.back() {
                below.absorb(&newest);
                trace!(branch = %self.inner.id, depth = len - 1, merged = %below, "compressed history");
            }
        }
    }

    fn dataset_closed(&self, id: u64) -> StoreResult<()> {
        let retired = {
            let mut state = self.inner.state.lock();
            state.open_datasets.remove(&id);
            self.compress_locked(&mut state);
            if state.open_datasets.is_empty() {
                mem::take(&mut state.retired)
            } else {
                Retired::default()
            }
        };
        if !retired.is_empty() {
            trace!(branch = %self.inner.id, "releasing retired parent handles");
        }
        let released = retired.close();
        self.auto_flush();
        released
    }

    fn sink_closed(&self, changes: &Arc<Changeset>) {
        {
            let mut state = self.inner.state.lock();
            state.pending.retain(|pending| !Arc::ptr_eq(pending, changes));
        }
        changes.release();
        self.auto_flush();
    }

    fn auto_flush(&self) {
        if !self.inner.auto_flush {
            return;
        }
        let Some(mut state) = self.inner.state.try_lock() else {
            return;
        };
        if !state.open_datasets.is_empty() {
            return;
        }
        if state.history.is_empty() && state.serializable.is_none() && state.snapshot.is_none() {
            return;
        }
        if let Err(e) = self.flush_locked(&mut state) {
            warn!(branch = %self.inner.id, error = %e, "auto flush failed");
        }
    }

    // ==================== Parent handles ====================

    fn serializable_locked(&self, state: &mut BranchState) -> StoreResult<Arc<dyn Sink>> {
        if let Some(sink) = &state.serializable {
            return Ok(Arc::clone(sink));
        }
        let sink: Arc<dyn Sink> = Arc::from(self.inner.parent.sink(IsolationLevel::Serializable)?);
        state.serializable = Some(Arc::clone(&sink));
        Ok(sink)
    }

    fn snapshot_locked(&self, state: &mut BranchState, level: IsolationLevel) -> StoreResult<Arc<dyn Dataset>> {
        if let Some(snapshot) = &state.snapshot {
            return Ok(Arc::clone(snapshot));
        }
        let snapshot: Arc<dyn Dataset> = Arc::from(self.inner.parent.dataset(level)?);
        trace!(branch = %self.inner.id, %level, "pinned snapshot");
        state.snapshot = Some(Arc::clone(&snapshot));
        Ok(snapshot)
    }

    fn prepared_locked(&self, state: &mut BranchState) -> StoreResult<Arc<dyn Sink>> {
        if let Some(prepared) = &state.prepared {
            return Ok(Arc::clone(prepared));
        }
        let prepared = match &state.serializable {
            Some(serializable) => {
                state.prepared_is_serializable = true;
                Arc::clone(serializable)
            }
            None => {
                state.prepared_is_serializable = false;
                Arc::from(self.inner.parent.sink(IsolationLevel::None)?)
            }
        };
        state.prepared = Some(Arc::clone(&prepared));
        Ok(prepared)
    }

    // ==================== Prepare & flush ====================

    fn prepare_locked(&self, state: &mut BranchState) -> StoreResult<()> {
        if state.history.is_empty() && state.serializable.is_none() {
            return Ok(());
        }
        let prepared = self.prepared_locked(state)?;
        for changes in &state.history {
            changes.replay_observations(prepared.as_ref())?;
        }
        prepared.prepare()
    }

    fn flush_locked(&self, state: &mut BranchState) -> StoreResult<()> {
        let outcome = self.replay_locked(state);
        let depth = state.history.len();
        state.history.clear();

        let prepared = state.prepared.take();
        let prepared_is_serializable = mem::take(&mut state.prepared_is_serializable);

        // open datasets keep reading through the old handles; later ones pin afresh
        if let Some(sink) = state.serializable.take() {
            state.retired.sinks.push(sink);
        }
        if let Some(snapshot) = state.snapshot.take() {
            state.retired.snapshots.push(snapshot);
        }
        let retired = if state.open_datasets.is_empty() {
            mem::take(&mut state.retired)
        } else {
            Retired::default()
        };
        let released = first_failure([
            match prepared {
                Some(sink) if !prepared_is_serializable => sink.close(),
                _ => Ok(()),
            },
            retired.close(),
        ]);

        match &outcome {
            Ok(()) => debug!(branch = %self.inner.id, depth, "flushed branch"),
            Err(e) => warn!(branch = %self.inner.id, depth, error = %e, "branch flush failed"),
        }
        outcome.and(released)
    }

    fn replay_locked(&self, state: &mut BranchState) -> StoreResult<()> {
        if state.history.is_empty() && state.serializable.is_none() {
            return Ok(());
        }
        self.prepare_locked(state)?;
        let prepared = self.prepared_locked(state)?;
        for changes in &state.history {
            changes.replay_into(prepared.as_ref())?;
        }
        prepared.flush()
    }
}

impl Source for Branch {
    fn fork(&self) -> Arc<dyn Source> {
        Arc::new(self.fork_branch())
    }

    fn sink(&self, level: IsolationLevel) -> StoreResult<Box<dyn Sink>> {
        let changes = Arc::new(Changeset::new());
        let id = Ulid::new();
        self.inner.state.lock().pending.push(Arc::clone(&changes));
        debug!(branch = %self.inner.id, sink = %id, %level, "opened sink");
        Ok(Box::new(BranchSink {
            id,
            branch: self.clone(),
            changes,
            level,
            flushed: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }))
    }

    fn dataset(&self, level: IsolationLevel) -> StoreResult<Box<dyn Dataset>> {
        let mut state = self.inner.state.lock();
        let observer = if level.tracks_observations() {
            Some(self.serializable_locked(&mut state)?)
        } else {
            None
        };
        let mut dataset: Box<dyn Dataset> = if level.uses_snapshot() {
            Box::new(PinnedDataset::new(self.snapshot_locked(&mut state, level)?))
        } else {
            self.inner.parent.dataset(level)?
        };
        for changes in &state.history {
            dataset = Box::new(OverlayDataset::new(dataset, Arc::clone(changes)));
        }
        if let Some(observer) = observer {
            dataset = Box::new(ObservingDataset::new(dataset, observer));
        }
        let id = self.inner.next_dataset_id.fetch_add(1, Ordering::SeqCst);
        state.open_datasets.insert(id);
        trace!(branch = %self.inner.id, dataset = id, %level, layers = state.history.len(), "opened dataset");
        drop(state);

        Ok(Box::new(BranchDataset {
            id,
            branch: self.clone(),
            inner: dataset,
            closed: AtomicBool::new(false),
        }))
    }

    fn prepare(&self) -> StoreResult<()> {
        let mut state = self.inner.state.lock();
        self.prepare_locked(&mut state)
    }

    fn flush(&self) -> StoreResult<()> {
        let mut state = self.inner.state.lock();
        self.flush_locked(&mut state)
    }

    fn close(&self) -> StoreResult<()> {
        let (snapshot, serializable, prepared, prepared_is_serializable, retired) = {
            let mut state = self.inner.state.lock();
            (
                state.snapshot.take(),
                state.serializable.take(),
                state.prepared.take(),
                mem::take(&mut state.prepared_is_serializable),
                mem::take(&mut state.retired),
            )
        };
        first_failure([
            snapshot.map_or(Ok(()), |dataset| dataset.close()),
            serializable.map_or(Ok(()), |sink| sink.close()),
            match prepared {
                Some(sink) if !prepared_is_serializable => sink.close(),
                _ => Ok(()),
            },
            retired.close(),
        ])
    }
}

/// Read view handed out by a branch.
struct BranchDataset {
    id: u64,
    branch: Branch,
    inner: Box<dyn Dataset>,
    closed: AtomicBool,
}

impl BranchDataset {
    fn check_open(&self) -> StoreResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::closed("dataset"));
        }
        Ok(())
    }
}

impl Dataset for BranchDataset {
    fn namespaces(&self) -> StoreResult<NamespaceIter<'_>> {
        self.check_open()?;
        self.inner.namespaces()
    }

    fn namespace(&self, prefix: &str) -> StoreResult<Option<String>> {
        self.check_open()?;
        self.inner.namespace(prefix)
    }

    fn context_ids(&self) -> StoreResult<ContextIter<'_>> {
        self.check_open()?;
        self.inner.context_ids()
    }

    fn statements(&self, pattern: &Pattern) -> StoreResult<StatementIter<'_>> {
        self.check_open()?;
        self.inner.statements(pattern)
    }

    fn close(&self) -> StoreResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let result = self.inner.close();
        let released = self.branch.dataset_closed(self.id);
        result.and(released)
    }
}

impl Drop for BranchDataset {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(branch = %self.branch.id(), dataset = self.id, error = %e, "failed to close dataset");
        }
    }
}

/// Write handle of one transaction on a branch.
struct BranchSink {
    id: Ulid,
    branch: Branch,
    changes: Arc<Changeset>,
    level: IsolationLevel,
    flushed: AtomicBool,
    closed: AtomicBool,
}

impl BranchSink {
    fn check_open(&self) -> StoreResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::closed("sink"));
        }
        Ok(())
    }

    fn check_writable(&self) -> StoreResult<()> {
        self.check_open()?;
        if self.flushed.load(Ordering::SeqCst) {
            return Err(StoreError::AlreadyFlushed {
                sink_id: self.id.to_string(),
            });
        }
        Ok(())
    }
}

impl Sink for BranchSink {
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

    fn observe(&self, pattern: &Pattern) -> StoreResult<()> {
        self.check_open()?;
        // reads after the flush can no longer conflict
        if self.flushed.load(Ordering::SeqCst) {
            return Ok(());
        }
        if self.level.tracks_observations() {
            self.changes.observe(pattern);
        }
        Ok(())
    }

    fn prepare(&self) -> StoreResult<()> {
        self.check_writable()?;
        if self.level.tracks_observations() {
            self.changes.check_conflicts()?;
        }
        Ok(())
    }

    fn flush(&self) -> StoreResult<()> {
        self.check_writable()?;
        self.branch.merge(self.id, &self.changes, self.level)?;
        self.flushed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self) -> StoreResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        trace!(branch = %self.branch.id(), sink = %self.id, "closed sink");
        self.branch.sink_closed(&self.changes);
        Ok(())
    }
}

impl Drop for BranchSink {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(sink = %self.id, error = %e, "failed to close sink");
        }
    }
}
