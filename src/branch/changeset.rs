//! Copy-on-write delta records.
//!
//! A [`Changeset`] starts life as the private buffer of one open sink. When
//! the sink flushes, its contents move into a fresh, timestamped changeset
//! appended to the branch history. From then on it only changes when a
//! newer neighbour is folded into it during compression, which the branch
//! allows only while no dataset reads through it.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tracing::warn;

use crate::model::{Pattern, Statement, Term};
use crate::storage::{Sink, StoreError, StoreResult};

/// The mutable contents of a changeset.
#[derive(Debug, Default, Clone)]
pub(crate) struct Delta {
    pub(crate) approved: BTreeSet<Statement>,
    pub(crate) deprecated: BTreeSet<Statement>,
    /// Contexts of the approved statements.
    pub(crate) approved_contexts: BTreeSet<Term>,
    /// Contexts passed to `clear`; everything in them is gone.
    pub(crate) deprecated_contexts: BTreeSet<Option<Term>>,
    pub(crate) added_namespaces: BTreeMap<String, String>,
    pub(crate) removed_prefixes: BTreeSet<String>,
    /// All namespaces other than `added_namespaces` were removed.
    pub(crate) namespace_cleared: bool,
    /// All statements other than `approved` were removed.
    pub(crate) statement_cleared: bool,
    pub(crate) observed: BTreeSet<Pattern>,
}

impl Delta {
    fn approve(&mut self, statement: Statement) {
        self.deprecated.remove(&statement);
        if let Some(ctx) = &statement.context {
            self.approved_contexts.insert(ctx.clone());
        }
        self.approved.insert(statement);
    }

    fn deprecate(&mut self, statement: Statement) {
        self.approved.remove(&statement);
        if let Some(ctx) = &statement.context {
            if self.approved_contexts.contains(ctx)
                && !self.approved.iter().any(|st| st.context.as_ref() == Some(ctx))
            {
                self.approved_contexts.remove(ctx);
            }
        }
        self.deprecated.insert(statement);
    }

    fn clear(&mut self, contexts: &[Option<Term>]) {
        if contexts.is_empty() {
            self.statement_cleared = true;
            self.approved.clear();
            self.approved_contexts.clear();
            return;
        }
        self.approved.retain(|st| !contexts.contains(&st.context));
        for ctx in contexts {
            if let Some(named) = ctx {
                self.approved_contexts.remove(named);
            }
            self.deprecated_contexts.insert(ctx.clone());
        }
    }

    fn set_namespace(&mut self, prefix: &str, name: &str) {
        self.removed_prefixes.insert(prefix.to_string());
        self.added_namespaces
            .insert(prefix.to_string(), name.to_string());
    }

    fn remove_namespace(&mut self, prefix: &str) {
        self.added_namespaces.remove(prefix);
        self.removed_prefixes.insert(prefix.to_string());
    }

    fn clear_namespaces(&mut self) {
        self.namespace_cleared = true;
        self.removed_prefixes.clear();
        self.added_namespaces.clear();
    }

    fn observe(&mut self, pattern: &Pattern) {
        self.observed.extend(pattern.per_context());
    }

    /// Replay a newer delta on top of this one.
    ///
    /// The order matches what a sink replay does: observations, namespace
    /// edits, clears, deprecations, then approvals.
    fn absorb(&mut self, newer: Delta) {
        self.observed.extend(newer.observed);
        if newer.namespace_cleared {
            self.clear_namespaces();
        }
        for prefix in &newer.removed_prefixes {
            self.remove_namespace(prefix);
        }
        for (prefix, name) in &newer.added_namespaces {
            self.set_namespace(prefix, name);
        }
        if newer.statement_cleared {
            self.clear(&[]);
        }
        if !newer.deprecated_contexts.is_empty() {
            let contexts: Vec<Option<Term>> = newer.deprecated_contexts.into_iter().collect();
            self.clear(&contexts);
        }
        for statement in newer.deprecated {
            self.deprecate(statement);
        }
        for statement in newer.approved {
            self.approve(statement);
        }
    }

    fn is_changed(&self) -> bool {
        !self.approved.is_empty()
            || !self.deprecated.is_empty()
            || !self.approved_contexts.is_empty()
            || !self.deprecated_contexts.is_empty()
            || !self.added_namespaces.is_empty()
            || !self.removed_prefixes.is_empty()
            || self.statement_cleared
            || self.namespace_cleared
            || !self.observed.is_empty()
    }

    /// Whether any write recorded here could change what `pattern` reads.
    fn touches(&self, pattern: &Pattern) -> bool {
        self.statement_cleared
            || self
                .deprecated_contexts
                .iter()
                .any(|ctx| pattern.matches_context(ctx.as_ref()))
            || self.approved.iter().any(|st| pattern.matches(st))
            || self.deprecated.iter().any(|st| pattern.matches(st))
    }
}

/// A delta of approved/deprecated statements and namespace edits.
#[derive(Default)]
pub struct Changeset {
    delta: RwLock<Delta>,
    /// Open datasets reading through this exact changeset.
    readers: AtomicUsize,
    /// Sibling changesets flushed while this one was still pending.
    prepend: Mutex<Vec<Arc<Changeset>>>,
    flushed_at: Option<DateTime<Utc>>,
}

impl Changeset {
    /// Create an empty, pending changeset.
    pub fn new() -> Self {
        Self::default()
    }

    fn flushed(delta: Delta) -> Self {
        Self {
            delta: RwLock::new(delta),
            readers: AtomicUsize::new(0),
            prepend: Mutex::new(Vec::new()),
            flushed_at: Some(Utc::now()),
        }
    }

    // ==================== Writes ====================

    pub fn approve(&self, statement: Statement) {
        self.delta.write().approve(statement);
    }

    pub fn deprecate(&self, statement: Statement) {
        self.delta.write().deprecate(statement);
    }

    /// Clear the given contexts, or every statement if none are given.
    pub fn clear(&self, contexts: &[Option<Term>]) {
        self.delta.write().clear(contexts);
    }

    pub fn set_namespace(&self, prefix: &str, name: &str) {
        self.delta.write().set_namespace(prefix, name);
    }

    pub fn remove_namespace(&self, prefix: &str) {
        self.delta.write().remove_namespace(prefix);
    }

    pub fn clear_namespaces(&self) {
        self.delta.write().clear_namespaces();
    }

    /// Record a read pattern, one entry per listed context.
    pub fn observe(&self, pattern: &Pattern) {
        self.delta.write().observe(pattern);
    }

    pub fn approve_all(&self, statements: impl IntoIterator<Item = Statement>) {
        let mut delta = self.delta.write();
        for statement in statements {
            delta.approve(statement);
        }
    }

    pub fn deprecate_all(&self, statements: impl IntoIterator<Item = Statement>) {
        let mut delta = self.delta.write();
        for statement in statements {
            delta.deprecate(statement);
        }
    }

    pub fn observe_all<'a>(&self, patterns: impl IntoIterator<Item = &'a Pattern>) {
        let mut delta = self.delta.write();
        for pattern in patterns {
            delta.observe(pattern);
        }
    }

    // ==================== Conflict detection ====================

    /// Register a sibling that flushed while this changeset was pending.
    pub(crate) fn prepend(&self, sibling: Arc<Changeset>) {
        self.prepend.lock().push(sibling);
    }

    /// Number of siblings registered for conflict checks.
    pub fn prepended(&self) -> usize {
        self.prepend.lock().len()
    }

    /// Fail if any observed pattern matches a write of a prepended sibling.
    ///
    /// Granularity is the whole pattern, not individual statements.
    pub fn check_conflicts(&self) -> StoreResult<()> {
        let observed: Vec<Pattern> = self.delta.read().observed.iter().cloned().collect();
        if observed.is_empty() {
            return Ok(());
        }
        let siblings: Vec<Arc<Changeset>> = self.prepend.lock().clone();
        for pattern in observed {
            if siblings.iter().any(|sibling| sibling.delta.read().touches(&pattern)) {
                warn!(%pattern, siblings = siblings.len(), "observed state has changed");
                return Err(StoreError::Conflict { pattern });
            }
        }
        Ok(())
    }

    // ==================== Readers ====================

    pub(crate) fn add_reader(&self) {
        self.readers.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn remove_reader(&self) {
        let _ = self
            .readers
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    /// Number of open datasets reading through this changeset.
    pub fn reader_count(&self) -> usize {
        self.readers.load(Ordering::SeqCst)
    }

    pub fn has_readers(&self) -> bool {
        self.reader_count() > 0
    }

    // ==================== Inspection ====================

    /// When this changeset was flushed into a branch history.
    pub fn flushed_at(&self) -> Option<DateTime<Utc>> {
        self.flushed_at
    }

    /// True if anything at all was recorded, observations included.
    pub fn is_changed(&self) -> bool {
        self.delta.read().is_changed()
    }

    pub fn approved_statements(&self) -> Vec<Statement> {
        self.delta.read().approved.iter().cloned().collect()
    }

    pub fn deprecated_statements(&self) -> Vec<Statement> {
        self.delta.read().deprecated.iter().cloned().collect()
    }

    pub fn approved_contexts(&self) -> Vec<Term> {
        self.delta.read().approved_contexts.iter().cloned().collect()
    }

    pub fn deprecated_contexts(&self) -> Vec<Option<Term>> {
        self.delta.read().deprecated_contexts.iter().cloned().collect()
    }

    pub fn added_namespaces(&self) -> BTreeMap<String, String> {
        self.delta.read().added_namespaces.clone()
    }

    pub fn removed_prefixes(&self) -> Vec<String> {
        self.delta.read().removed_prefixes.iter().cloned().collect()
    }

    pub fn is_statement_cleared(&self) -> bool {
        self.delta.read().statement_cleared
    }

    pub fn is_namespace_cleared(&self) -> bool {
        self.delta.read().namespace_cleared
    }

    pub fn observations(&self) -> Vec<Pattern> {
        self.delta.read().observed.iter().cloned().collect()
    }

    pub fn is_deprecated(&self, statement: &Statement) -> bool {
        self.delta.read().deprecated.contains(statement)
    }

    /// Run `f` against a consistent view of the whole delta.
    pub(crate) fn view<R>(&self, f: impl FnOnce(&Delta) -> R) -> R {
        f(&self.delta.read())
    }

    // ==================== Branch plumbing ====================

    /// Move the contents into a new flushed changeset, leaving this one empty.
    pub(crate) fn take_flushed(&self) -> Changeset {
        let delta = mem::take(&mut *self.delta.write());
        Changeset::flushed(delta)
    }

    /// Fold a newer flushed changeset into this one.
    pub(crate) fn absorb(&self, newer: &Changeset) {
        let newer = newer.delta.read().clone();
        self.delta.write().absorb(newer);
    }

    /// Forward only the recorded observations to `sink`.
    pub(crate) fn replay_observations(&self, sink: &dyn Sink) -> StoreResult<()> {
        let observed = self.observations();
        for pattern in &observed {
            sink.observe(pattern)?;
        }
        Ok(())
    }

    /// Forward every recorded change to `sink`, in application order.
    pub(crate) fn replay_into(&self, sink: &dyn Sink) -> StoreResult<()> {
        let delta = self.delta.read().clone();
        for pattern in &delta.observed {
            sink.observe(pattern)?;
        }
        if delta.namespace_cleared {
            sink.clear_namespaces()?;
        }
        for prefix in &delta.removed_prefixes {
            sink.remove_namespace(prefix)?;
        }
        for (prefix, name) in &delta.added_namespaces {
            sink.set_namespace(prefix, name)?;
        }
        if delta.statement_cleared {
            sink.clear(&[])?;
        }
        if !delta.deprecated_contexts.is_empty() {
            let contexts: Vec<Option<Term>> = delta.deprecated_contexts.into_iter().collect();
            sink.clear(&contexts)?;
        }
        for statement in delta.deprecated {
            sink.deprecate(statement)?;
        }
        for statement in delta.approved {
            sink.approve(statement)?;
        }
        Ok(())
    }

    /// Drop all recorded data and sibling references.
    pub(crate) fn release(&self) {
        *self.delta.write() = Delta::default();
        self.prepend.lock().clear();
    }
}

impl fmt::Display for Changeset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let delta = self.delta.read();
        let mut parts = Vec::new();
        if !delta.observed.is_empty() {
            parts.push(format!("{} observations", delta.observed.len()));
        }
        if delta.namespace_cleared {
            parts.push("namespaceCleared".to_string());
        }
        if !delta.removed_prefixes.is_empty() {
            parts.push(format!("{} removedPrefixes", delta.removed_prefixes.len()));
        }
        if !delta.added_namespaces.is_empty() {
            parts.push(format!("{} addedNamespaces", delta.added_namespaces.len()));
        }
        if delta.statement_cleared {
            parts.push("statementCleared".to_string());
        }
        if !delta.deprecated_contexts.is_empty() {
            parts.push(format!("{} deprecatedContexts", delta.deprecated_contexts.len()));
        }
        if !delta.deprecated.is_empty() {
            parts.push(format!("{} deprecated", delta.deprecated.len()));
        }
        if !delta.approved.is_empty() {
            parts.push(format!("{} approved", delta.approved.len()));
        }
        if parts.is_empty() {
            write!(f, "empty")
        } else {
            write!(f, "{}", parts.join(", "))
        }
    }
}

impl fmt::Debug for Changeset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Changeset")
            .field("summary", &self.to_string())
            .field("readers", &self.reader_count())
            .field("flushed_at", &self.flushed_at)
            .finish()
    }
}
