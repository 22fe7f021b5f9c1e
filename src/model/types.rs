//! Core value types: terms, statements and namespaces.

use std::fmt;

use serde::{Deserialize, Serialize};

/// An opaque, comparable RDF term (IRI, blank node or literal).
///
/// The store never looks inside a term; it only compares, orders and
/// hashes them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Term(String);

impl Term {
    /// Create a term from its lexical form.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// get the string representation
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// convert to owned String
    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Term {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Term {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Term {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// A (subject, predicate, object, context) quad.
///
/// A `None` context denotes the default graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Statement {
    pub subject: Term,
    pub predicate: Term,
    pub object: Term,
    #[serde(default)]
    pub context: Option<Term>,
}

impl Statement {
    /// Create a new statement.
    pub fn new(
        subject: impl Into<Term>,
        predicate: impl Into<Term>,
        object: impl Into<Term>,
        context: Option<Term>,
    ) -> Self {
        Self {
            subject: subject.into(),
            predicate: predicate.into(),
            object: object.into(),
            context,
        }
    }

    /// Create a statement in the default graph.
    pub fn triple(
        subject: impl Into<Term>,
        predicate: impl Into<Term>,
        object: impl Into<Term>,
    ) -> Self {
        Self::new(subject, predicate, object, None)
    }

    /// Copy of this statement placed in another context.
    pub fn with_context(&self, context: Option<Term>) -> Self {
        Self {
            context,
            ..self.clone()
        }
    }

    /// Whether this statement lives in the given context.
    pub fn in_context(&self, context: Option<&Term>) -> bool {
        self.context.as_ref() == context
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({} {} {}", self.subject, self.predicate, self.object)?;
        if let Some(ctx) = &self.context {
            write!(f, " {}", ctx)?;
        }
        write!(f, ")")
    }
}

/// A namespace prefix binding.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Namespace {
    pub prefix: String,
    pub name: String,
}

impl Namespace {
    pub fn new(prefix: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: <{}>", self.prefix, self.name)
    }
}
