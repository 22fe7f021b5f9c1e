//! Two sources presented as one.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::warn;

use crate::model::Pattern;
use crate::storage::{
    first_failure, ContextIter, Dataset, NamespaceIter, Sink, Source, StatementIter, StoreResult,
};
use crate::transaction::IsolationLevel;

/// Union of a primary and a secondary source.
///
/// Writes only ever reach the primary. The partitions are assumed to be
/// disjoint, so reads concatenate them without removing duplicates.
#[derive(Clone)]
pub struct UnionSource {
    primary: Arc<dyn Source>,
    secondary: Arc<dyn Source>,
}

impl UnionSource {
    pub fn new(primary: Arc<dyn Source>, secondary: Arc<dyn Source>) -> Self {
        Self { primary, secondary }
    }

    pub fn primary(&self) -> &Arc<dyn Source> {
        &self.primary
    }

    pub fn secondary(&self) -> &Arc<dyn Source> {
        &self.secondary
    }
}

impl Source for UnionSource {
    fn fork(&self) -> Arc<dyn Source> {
        Arc::new(UnionSource::new(self.primary.fork(), self.secondary.fork()))
    }

    fn sink(&self, level: IsolationLevel) -> StoreResult<Box<dyn Sink>> {
        self.primary.sink(level)
    }

    fn dataset(&self, level: IsolationLevel) -> StoreResult<Box<dyn Dataset>> {
        let primary = self.primary.dataset(level)?;
        let secondary = match self.secondary.dataset(level) {
            Ok(dataset) => dataset,
            Err(e) => {
                if let Err(close_err) = primary.close() {
                    warn!(error = %close_err, "failed to close primary dataset");
                }
                return Err(e);
            }
        };
        Ok(Box::new(UnionDataset { primary, secondary }))
    }

    fn prepare(&self) -> StoreResult<()> {
        self.primary.prepare()?;
        self.secondary.prepare()
    }

    fn flush(&self) -> StoreResult<()> {
        self.primary.flush()?;
        self.secondary.flush()
    }

    fn close(&self) -> StoreResult<()> {
        first_failure([self.primary.close(), self.secondary.close()])
    }
}

struct UnionDataset {
    primary: Box<dyn Dataset>,
    secondary: Box<dyn Dataset>,
}

impl Dataset for UnionDataset {
    fn namespaces(&self) -> StoreResult<NamespaceIter<'_>> {
        let mut seen = BTreeSet::new();
        let both = self.primary.namespaces()?.chain(self.secondary.namespaces()?);
        Ok(Box::new(both.filter(move |item| match item {
            Ok(ns) => seen.insert(ns.prefix.clone()),
            Err(_) => true,
        })))
    }

    fn namespace(&self, prefix: &str) -> StoreResult<Option<String>> {
        match self.primary.namespace(prefix)? {
            Some(name) => Ok(Some(name)),
            None => self.secondary.namespace(prefix),
        }
    }

    fn context_ids(&self) -> StoreResult<ContextIter<'_>> {
        let mut seen = BTreeSet::new();
        let both = self.primary.context_ids()?.chain(self.secondary.context_ids()?);
        Ok(Box::new(both.filter(move |item| match item {
            Ok(ctx) => seen.insert(ctx.clone()),
            Err(_) => true,
        })))
    }

    fn statements(&self, pattern: &Pattern) -> StoreResult<StatementIter<'_>> {
        Ok(Box::new(
            self.primary
                .statements(pattern)?
                .chain(self.secondary.statements(pattern)?),
        ))
    }

    fn close(&self) -> StoreResult<()> {
        first_failure([self.primary.close(), self.secondary.close()])
    }
}
