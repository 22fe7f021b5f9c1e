//! Wildcard statement patterns.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::model::types::{Statement, Term};

/// A statement template with wildcard (`None`) positions.
///
/// `contexts` lists the graphs the pattern is restricted to; an entry of
/// `None` selects the default graph. An empty list matches every context.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Pattern {
    pub subject: Option<Term>,
    pub predicate: Option<Term>,
    pub object: Option<Term>,
    #[serde(default)]
    pub contexts: Vec<Option<Term>>,
}

impl Pattern {
    /// Pattern matching every statement.
    pub fn any() -> Self {
        Self::default()
    }

    /// Pattern over all contexts.
    pub fn new(subject: Option<Term>, predicate: Option<Term>, object: Option<Term>) -> Self {
        Self {
            subject,
            predicate,
            object,
            contexts: Vec::new(),
        }
    }

    /// Pattern matching exactly one statement.
    pub fn exact(statement: &Statement) -> Self {
        Self {
            subject: Some(statement.subject.clone()),
            predicate: Some(statement.predicate.clone()),
            object: Some(statement.object.clone()),
            contexts: vec![statement.context.clone()],
        }
    }

    /// Restrict this pattern to the given contexts.
    pub fn in_contexts(mut self, contexts: impl IntoIterator<Item = Option<Term>>) -> Self {
        self.contexts = contexts.into_iter().collect();
        self
    }

    /// True when the pattern is not restricted to any context.
    pub fn is_all_contexts(&self) -> bool {
        self.contexts.is_empty()
    }

    /// Check whether a statement context is selected by this pattern.
    pub fn matches_context(&self, context: Option<&Term>) -> bool {
        self.contexts.is_empty() || self.contexts.iter().any(|c| c.as_ref() == context)
    }

    /// Check whether a statement matches this pattern.
    pub fn matches(&self, statement: &Statement) -> bool {
        position_matches(&self.subject, &statement.subject)
            && position_matches(&self.predicate, &statement.predicate)
            && position_matches(&self.object, &statement.object)
            && self.matches_context(statement.context.as_ref())
    }

    /// Split into one pattern per listed context, or a single all-contexts
    /// pattern if none are listed.
    pub fn per_context(&self) -> Vec<Pattern> {
        if self.contexts.is_empty() {
            return vec![self.clone()];
        }
        let distinct: BTreeSet<&Option<Term>> = self.contexts.iter().collect();
        distinct
            .into_iter()
            .map(|ctx| Pattern {
                contexts: vec![ctx.clone()],
                ..self.clone()
            })
            .collect()
    }

    /// Drop the given contexts from an explicit context list.
    ///
    /// Returns `None` when every listed context was removed. Patterns over
    /// all contexts are returned unchanged.
    pub fn without_contexts(&self, removed: &BTreeSet<Option<Term>>) -> Option<Pattern> {
        if self.contexts.is_empty() {
            return Some(self.clone());
        }
        let remaining: Vec<Option<Term>> = self
            .contexts
            .iter()
            .filter(|ctx| !removed.contains(*ctx))
            .cloned()
            .collect();
        if remaining.is_empty() {
            None
        } else {
            Some(self.clone().in_contexts(remaining))
        }
    }
}

fn position_matches(pattern: &Option<Term>, value: &Term) -> bool {
    pattern.as_ref().map_or(true, |p| p == value)
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let show = |t: &Option<Term>| t.as_ref().map_or("?".to_string(), |t| t.to_string());
        write!(
            f,
            "({} {} {}",
            show(&self.subject),
            show(&self.predicate),
            show(&self.object)
        )?;
        if !self.contexts.is_empty() {
            let contexts: Vec<String> = self
                .contexts
                .iter()
                .map(|c| c.as_ref().map_or("default".to_string(), |c| c.to_string()))
                .collect();
            write!(f, " [{}]", contexts.join(", "))?;
        }
        write!(f, ")")
    }
}
