//! Storage layer error types
//!
//! All errors raised by sources, sinks and datasets are defined here.
//! We use `thiserror` for ergonomic error definition and better error messages

use thiserror::Error;

use crate::model::Pattern;

/// the main error type for source, sink and dataset operations
#[derive(Debug, Error)]
pub enum StoreError {
    /// a concurrent transaction wrote a statement matching an observed pattern
    #[error("observed state has changed: concurrent write matches {pattern}")]
    Conflict { pattern: Pattern },

    /// the handle was used after close
    #[error("{what} is closed")]
    Closed { what: &'static str },

    /// the sink was flushed twice, or written to after flush
    #[error("sink {sink_id} was already flushed")]
    AlreadyFlushed { sink_id: String },

    /// API called out of order
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// error reported by the backing persistence layer
    #[error("backing store error: {0}")]
    Backing(String),
}

impl StoreError {
    /// check if the whole transaction can be retried
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }

    /// check if this error is caused by calling the API out of order
    pub fn is_misuse(&self) -> bool {
        matches!(
            self,
            StoreError::Closed { .. }
                | StoreError::AlreadyFlushed { .. }
                | StoreError::InvalidOperation(_)
        )
    }

    pub(crate) fn closed(what: &'static str) -> Self {
        StoreError::Closed { what }
    }
}

/// result type alias for storage operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Return the first failure after every step has already run.
///
/// Used for multi-resource cleanup: callers evaluate all closes eagerly and
/// pass their results here, so one failing close never skips the rest.
pub(crate) fn first_failure<I>(results: I) -> StoreResult<()>
where
    I: IntoIterator<Item = StoreResult<()>>,
{
    let mut first = None;
    for result in results {
        if let Err(e) = result {
            first.get_or_insert(e);
        }
    }
    match first {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
