//! Pass-through dataset variants used by the branch.

use std::sync::Arc;

use crate::model::Pattern;
use crate::storage::{ContextIter, Dataset, NamespaceIter, Sink, StatementIter, StoreResult};

/// A shared snapshot handed out to several datasets.
///
/// Closing it does nothing; the branch that pinned the snapshot closes it.
pub struct PinnedDataset {
    inner: Arc<dyn Dataset>,
}

impl PinnedDataset {
    pub fn new(inner: Arc<dyn Dataset>) -> Self {
        Self { inner }
    }
}

impl Dataset for PinnedDataset {
    fn namespaces(&self) -> StoreResult<NamespaceIter<'_>> {
        self.inner.namespaces()
    }

    fn namespace(&self, prefix: &str) -> StoreResult<Option<String>> {
        self.inner.namespace(prefix)
    }

    fn context_ids(&self) -> StoreResult<ContextIter<'_>> {
        self.inner.context_ids()
    }

    fn statements(&self, pattern: &Pattern) -> StoreResult<StatementIter<'_>> {
        self.inner.statements(pattern)
    }

    fn close(&self) -> StoreResult<()> {
        Ok(())
    }
}

/// Reports every statement read to a serializable sink.
///
/// Namespace reads are not tracked. Closing the dataset leaves the
/// observer open.
pub struct ObservingDataset {
    inner: Box<dyn Dataset>,
    observer: Arc<dyn Sink>,
}

impl ObservingDataset {
    pub fn new(inner: Box<dyn Dataset>, observer: Arc<dyn Sink>) -> Self {
        Self { inner, observer }
    }
}

impl Dataset for ObservingDataset {
    fn namespaces(&self) -> StoreResult<NamespaceIter<'_>> {
        self.inner.namespaces()
    }

    fn namespace(&self, prefix: &str) -> StoreResult<Option<String>> {
        self.inner.namespace(prefix)
    }

    fn context_ids(&self) -> StoreResult<ContextIter<'_>> {
        // listing contexts depends on every statement
        self.observer.observe(&Pattern::any())?;
        self.inner.context_ids()
    }

    fn statements(&self, pattern: &Pattern) -> StoreResult<StatementIter<'_>> {
        self.observer.observe(pattern)?;
        self.inner.statements(pattern)
    }

    fn close(&self) -> StoreResult<()> {
        self.inner.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    use crate::model::{Statement, Term};
    use crate::storage::{MemoryStore, Source, StoreError};
    use crate::transaction::IsolationLevel;

    /// Sink that only remembers what it observed.
    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<Pattern>>,
    }

    impl Sink for Recorder {
        fn approve(&self, _: Statement) -> StoreResult<()> {
            Ok(())
        }
        fn deprecate(&self, _: Statement) -> StoreResult<()> {
            Ok(())
        }
        fn clear(&self, _: &[Option<Term>]) -> StoreResult<()> {
            Ok(())
        }
        fn set_namespace(&self, _: &str, _: &str) -> StoreResult<()> {
            Ok(())
        }
        fn remove_namespace(&self, _: &str) -> StoreResult<()> {
            Ok(())
        }
        fn clear_namespaces(&self) -> StoreResult<()> {
            Ok(())
        }
        fn observe(&self, pattern: &Pattern) -> StoreResult<()> {
            self.seen.lock().push(pattern.clone());
            Ok(())
        }
        fn prepare(&self) -> StoreResult<()> {
            Ok(())
        }
        fn flush(&self) -> StoreResult<()> {
            Ok(())
        }
        fn close(&self) -> StoreResult<()> {
            Err(StoreError::InvalidOperation("observer closed by dataset".into()))
        }
    }

    #[test]
    fn test_pinned_close_is_noop() {
        let store = MemoryStore::new();
        let shared: Arc<dyn Dataset> = Arc::from(store.dataset(IsolationLevel::Snapshot).unwrap());
        let pinned = PinnedDataset::new(Arc::clone(&shared));
        pinned.close().unwrap();

        assert!(shared.statements(&Pattern::any()).is_ok());
        assert!(pinned.statements(&Pattern::any()).is_ok());
    }

    #[test]
    fn test_observing_records_reads() {
        let store = MemoryStore::new();
        let recorder = Arc::new(Recorder::default());
        let dataset = ObservingDataset::new(
            store.dataset(IsolationLevel::Serializable).unwrap(),
            recorder.clone(),
        );

        let pattern = Pattern::new(Some(Term::new("ex:a")), None, None);
        let _ = dataset.statements(&pattern).unwrap().count();
        let _ = dataset.namespace("ex").unwrap();
        let _ = dataset.context_ids().unwrap().count();

        assert_eq!(*recorder.seen.lock(), vec![pattern, Pattern::any()]);
        // the recorder errors on close, so this proves it was left alone
        dataset.close().unwrap();
    }
}
