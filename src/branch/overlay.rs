//! A dataset that layers one changeset over a backing dataset.

use std::collections::BTreeSet;
use std::iter;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::warn;

use crate::branch::changeset::Changeset;
use crate::model::{Namespace, Pattern, Statement, Term};
use crate::storage::{
    ContextIter, Dataset, NamespaceIter, StatementIter, StoreError, StoreResult,
};

/// Backing statements, filtered by one changeset and extended with its
/// approved statements.
///
/// Registers itself as a reader of the changeset until closed, which keeps
/// the branch from compressing that changeset underneath it.
pub struct OverlayDataset {
    inner: Box<dyn Dataset>,
    changes: Arc<Changeset>,
    closed: AtomicBool,
}

impl OverlayDataset {
    pub fn new(inner: Box<dyn Dataset>, changes: Arc<Changeset>) -> Self {
        changes.add_reader();
        Self {
            inner,
            changes,
            closed: AtomicBool::new(false),
        }
    }

    fn check_open(&self) -> StoreResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::closed("dataset"));
        }
        Ok(())
    }
}

impl Dataset for OverlayDataset {
    fn namespaces(&self) -> StoreResult<NamespaceIter<'_>> {
        self.check_open()?;
        let (cleared, removed, added) = self.changes.view(|d| {
            (
                d.namespace_cleared,
                d.removed_prefixes.clone(),
                d.added_namespaces.clone(),
            )
        });
        let backing: NamespaceIter<'_> = if cleared {
            Box::new(iter::empty())
        } else {
            self.inner.namespaces()?
        };
        let kept = backing.filter(move |item| match item {
            Ok(ns) => !removed.contains(&ns.prefix),
            Err(_) => true,
        });
        let added = added
            .into_iter()
            .map(|(prefix, name)| Ok(Namespace::new(prefix, name)));
        Ok(Box::new(kept.chain(added)))
    }

    fn namespace(&self, prefix: &str) -> StoreResult<Option<String>> {
        self.check_open()?;
        let local = self.changes.view(|d| {
            if let Some(name) = d.added_namespaces.get(prefix) {
                Some(Some(name.clone()))
            } else if d.namespace_cleared || d.removed_prefixes.contains(prefix) {
                Some(None)
            } else {
                None
            }
        });
        match local {
            Some(answer) => Ok(answer),
            None => self.inner.namespace(prefix),
        }
    }

    fn context_ids(&self) -> StoreResult<ContextIter<'_>> {
        self.check_open()?;
        let (cleared, approved, deprecated) = self.changes.view(|d| {
            (
                d.statement_cleared,
                d.approved_contexts.clone(),
                d.deprecated_contexts.clone(),
            )
        });
        let backing: ContextIter<'_> = if cleared {
            Box::new(iter::empty())
        } else {
            self.inner.context_ids()?
        };
        let seen = approved.clone();
        let kept = backing.filter(move |item| match item {
            Ok(ctx) => !seen.contains(ctx) && !deprecated.contains(&Some(ctx.clone())),
            Err(_) => true,
        });
        Ok(Box::new(approved.into_iter().map(Ok).chain(kept)))
    }

    fn statements(&self, pattern: &Pattern) -> StoreResult<StatementIter<'_>> {
        self.check_open()?;
        let (backing_pattern, hidden_contexts, deprecated, approved) = self.changes.view(|d| {
            let backing_pattern = if d.statement_cleared {
                None
            } else {
                pattern.without_contexts(&d.deprecated_contexts)
            };
            let deprecated: BTreeSet<Statement> = d
                .deprecated
                .iter()
                .filter(|st| pattern.matches(st))
                .cloned()
                .collect();
            let approved: BTreeSet<Statement> = d
                .approved
                .iter()
                .filter(|st| pattern.matches(st))
                .cloned()
                .collect();
            (backing_pattern, d.deprecated_contexts.clone(), deprecated, approved)
        });
        let backing = match backing_pattern {
            Some(p) => Some(self.inner.statements(&p)?),
            None => None,
        };
        Ok(Box::new(OverlayIter {
            backing,
            hidden_contexts,
            deprecated,
            approved,
        }))
    }

    fn close(&self) -> StoreResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.changes.remove_reader();
        self.inner.close()
    }
}

impl Drop for OverlayDataset {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = %e, "failed to close overlay dataset");
        }
    }
}

/// Streams the backing statements first, then whatever approved
/// statements the backing did not already produce.
struct OverlayIter<'a> {
    backing: Option<StatementIter<'a>>,
    hidden_contexts: BTreeSet<Option<Term>>,
    deprecated: BTreeSet<Statement>,
    /// Working copy; shrinks as the backing yields duplicates.
    approved: BTreeSet<Statement>,
}

impl Iterator for OverlayIter<'_> {
    type Item = StoreResult<Statement>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(backing) = self.backing.as_mut() {
            for item in backing.by_ref() {
                let st = match item {
                    Ok(st) => st,
                    Err(e) => return Some(Err(e)),
                };
                if self.hidden_contexts.contains(&st.context) || self.deprecated.contains(&st) {
                    continue;
                }
                self.approved.remove(&st);
                return Some(Ok(st));
            }
            self.backing = None;
        }
        self.approved.pop_first().map(Ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryStore, Source};
    use crate::transaction::IsolationLevel;

    fn g(name: &str) -> Option<Term> {
        Some(Term::new(name))
    }

    /// Store with (a p b), (a p c g1), (d p e g2) and namespace ex.
    fn seeded() -> MemoryStore {
        let store = MemoryStore::new();
        let sink = store.sink(IsolationLevel::None).unwrap();
        sink.approve(Statement::triple("ex:a", "ex:p", "ex:b")).unwrap();
        sink.approve(Statement::new("ex:a", "ex:p", "ex:c", g("ex:g1"))).unwrap();
        sink.approve(Statement::new("ex:d", "ex:p", "ex:e", g("ex:g2"))).unwrap();
        sink.set_namespace("ex", "http://example.org/").unwrap();
        sink.flush().unwrap();
        store
    }

    fn overlay(store: &MemoryStore, changes: &Arc<Changeset>) -> OverlayDataset {
        let inner = store.dataset(IsolationLevel::None).unwrap();
        OverlayDataset::new(inner, Arc::clone(changes))
    }

    fn read(dataset: &dyn Dataset, pattern: &Pattern) -> Vec<Statement> {
        dataset
            .statements(pattern)
            .unwrap()
            .collect::<StoreResult<Vec<_>>>()
            .unwrap()
    }

    #[test]
    fn test_no_duplicates_with_backing() {
        let store = seeded();
        let changes = Arc::new(Changeset::new());
        changes.approve(Statement::triple("ex:a", "ex:p", "ex:b"));
        changes.approve(Statement::triple("ex:x", "ex:p", "ex:y"));

        let dataset = overlay(&store, &changes);
        let all = read(&dataset, &Pattern::any());
        assert_eq!(all.len(), 4);
        let distinct: BTreeSet<_> = all.iter().cloned().collect();
        assert_eq!(distinct.len(), 4);
    }

    #[test]
    fn test_deprecated_statements_hidden() {
        let store = seeded();
        let changes = Arc::new(Changeset::new());
        changes.deprecate(Statement::triple("ex:a", "ex:p", "ex:b"));

        let dataset = overlay(&store, &changes);
        let found = read(&dataset, &Pattern::new(Some(Term::new("ex:a")), None, None));
        assert_eq!(found, vec![Statement::new("ex:a", "ex:p", "ex:c", g("ex:g1"))]);
    }

    #[test]
    fn test_cleared_context_hidden_but_new_approvals_shown() {
        let store = seeded();
        let changes = Arc::new(Changeset::new());
        changes.clear(&[g("ex:g1")]);
        changes.approve(Statement::new("ex:z", "ex:p", "ex:z", g("ex:g1")));

        let dataset = overlay(&store, &changes);
        let all = read(&dataset, &Pattern::any());
        assert!(!all.contains(&Statement::new("ex:a", "ex:p", "ex:c", g("ex:g1"))));
        assert!(all.contains(&Statement::new("ex:z", "ex:p", "ex:z", g("ex:g1"))));
        assert_eq!(all.len(), 3);

        let only_g1 = read(&dataset, &Pattern::any().in_contexts([g("ex:g1")]));
        assert_eq!(only_g1, vec![Statement::new("ex:z", "ex:p", "ex:z", g("ex:g1"))]);
    }

    #[test]
    fn test_statement_cleared_skips_backing() {
        let store = seeded();
        let changes = Arc::new(Changeset::new());
        changes.clear(&[]);
        changes.approve(Statement::triple("ex:n", "ex:p", "ex:n"));

        let dataset = overlay(&store, &changes);
        assert_eq!(
            read(&dataset, &Pattern::any()),
            vec![Statement::triple("ex:n", "ex:p", "ex:n")]
        );
        assert_eq!(dataset.context_ids().unwrap().count(), 0);
    }

    #[test]
    fn test_namespace_overlay() {
        let store = seeded();
        let changes = Arc::new(Changeset::new());
        changes.set_namespace("ex", "http://example.com/");
        changes.set_namespace("foaf", "http://xmlns.com/foaf/0.1/");

        let dataset = overlay(&store, &changes);
        assert_eq!(dataset.namespace("ex").unwrap().as_deref(), Some("http://example.com/"));
        let all: Vec<Namespace> = dataset.namespaces().unwrap().map(|n| n.unwrap()).collect();
        assert_eq!(all.len(), 2);

        changes.remove_namespace("ex");
        assert_eq!(dataset.namespace("ex").unwrap(), None);

        changes.clear_namespaces();
        assert_eq!(dataset.namespaces().unwrap().count(), 0);
    }

    #[test]
    fn test_context_ids_overlay() {
        let store = seeded();
        let changes = Arc::new(Changeset::new());
        changes.clear(&[g("ex:g2")]);
        changes.approve(Statement::new("ex:a", "ex:p", "ex:b", g("ex:g1")));
        changes.approve(Statement::new("ex:a", "ex:p", "ex:b", g("ex:g3")));

        let dataset = overlay(&store, &changes);
        let ids: BTreeSet<Term> = dataset.context_ids().unwrap().map(|c| c.unwrap()).collect();
        let expected: BTreeSet<Term> = [Term::new("ex:g1"), Term::new("ex:g3")].into_iter().collect();
        assert_eq!(ids, expected);
    }

    #[test]
    fn test_reader_registration() {
        let store = seeded();
        let changes = Arc::new(Changeset::new());
        let first = overlay(&store, &changes);
        let second = overlay(&store, &changes);
        assert_eq!(changes.reader_count(), 2);

        first.close().unwrap();
        first.close().unwrap();
        assert_eq!(changes.reader_count(), 1);
        assert!(first.statements(&Pattern::any()).is_err());

        drop(second);
        assert_eq!(changes.reader_count(), 0);
    }
}
