//! Statements (quads) and statement patterns.
//!
//! A [`Statement`] is a value object: two statements are equal iff subject,
//! predicate, object, and context are all equal. `context == None` denotes
//! the unnamed default graph.
//!
//! A [`StatementPattern`] leaves any position unbound; it is both the match
//! argument for reads and the record of an observation under serializable
//! isolation.

use crate::value::{Iri, Resource, Value};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A single RDF quad
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Statement {
    /// Subject (IRI or blank node)
    pub subject: Resource,
    /// Predicate
    pub predicate: Iri,
    /// Object value
    pub object: Value,
    /// Named graph; `None` is the unnamed default graph
    pub context: Option<Resource>,
}

impl Statement {
    /// Create a statement in the default graph
    pub fn new(subject: Resource, predicate: Iri, object: Value) -> Self {
        Statement {
            subject,
            predicate,
            object,
            context: None,
        }
    }

    /// Create a statement in an optional named graph
    pub fn with_context(
        subject: Resource,
        predicate: Iri,
        object: Value,
        context: Option<Resource>,
    ) -> Self {
        Statement {
            subject,
            predicate,
            object,
            context,
        }
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.subject, self.predicate, self.object)?;
        match &self.context {
            Some(c) => write!(f, " [{}]", c),
            None => write!(f, " []"),
        }
    }
}

/// True when `context` passes the variadic context selection.
///
/// An empty selection matches every graph; otherwise the statement's context
/// must equal one of the entries (`None` selects the default graph).
pub fn context_matches(contexts: &[Option<Resource>], context: &Option<Resource>) -> bool {
    contexts.is_empty() || contexts.contains(context)
}

/// A statement pattern with optional wildcards.
///
/// `None` in subject/predicate/object is a wildcard. The context is doubly
/// optional: the outer `None` is a wildcard, `Some(None)` matches only the
/// default graph, and `Some(Some(c))` matches only graph `c`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StatementPattern {
    pub subject: Option<Resource>,
    pub predicate: Option<Iri>,
    pub object: Option<Value>,
    pub context: Option<Option<Resource>>,
}

impl StatementPattern {
    /// The all-wildcard pattern
    pub fn wildcard() -> Self {
        StatementPattern {
            subject: None,
            predicate: None,
            object: None,
            context: None,
        }
    }

    /// Create a pattern from optional positions
    pub fn new(
        subject: Option<Resource>,
        predicate: Option<Iri>,
        object: Option<Value>,
        context: Option<Option<Resource>>,
    ) -> Self {
        StatementPattern {
            subject,
            predicate,
            object,
            context,
        }
    }

    /// Expand read arguments into patterns, one per selected context.
    ///
    /// An empty context selection yields a single pattern with a wildcard
    /// context.
    pub fn expand(
        subject: Option<&Resource>,
        predicate: Option<&Iri>,
        object: Option<&Value>,
        contexts: &[Option<Resource>],
    ) -> Vec<StatementPattern> {
        let base = StatementPattern {
            subject: subject.cloned(),
            predicate: predicate.cloned(),
            object: object.cloned(),
            context: None,
        };
        if contexts.is_empty() {
            vec![base]
        } else {
            contexts
                .iter()
                .map(|ctx| StatementPattern {
                    context: Some(ctx.clone()),
                    ..base.clone()
                })
                .collect()
        }
    }

    /// True when the statement matches this pattern
    pub fn matches(&self, st: &Statement) -> bool {
        if let Some(s) = &self.subject {
            if *s != st.subject {
                return false;
            }
        }
        if let Some(p) = &self.predicate {
            if *p != st.predicate {
                return false;
            }
        }
        if let Some(o) = &self.object {
            if *o != st.object {
                return false;
            }
        }
        if let Some(c) = &self.context {
            if *c != st.context {
                return false;
            }
        }
        true
    }
}

impl fmt::Display for StatementPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn wild<T: fmt::Display>(v: &Option<T>, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match v {
                Some(v) => write!(f, "{}", v),
                None => write!(f, "*"),
            }
        }
        write!(f, "(")?;
        wild(&self.subject, f)?;
        write!(f, ", ")?;
        wild(&self.predicate, f)?;
        write!(f, ", ")?;
        wild(&self.object, f)?;
        write!(f, ")")?;
        match &self.context {
            None => write!(f, " [*]"),
            Some(None) => write!(f, " []"),
            Some(Some(c)) => write!(f, " [{}]", c),
        }
    }
}
