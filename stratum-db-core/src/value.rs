//! RDF value types: IRIs, blank nodes, literals.
//!
//! All value types are cheap to clone (`Arc<str>` backed) because statements
//! are copied freely between change-sets, datasets, and notification
//! listeners.
//!
//! ## Equality
//!
//! - IRIs compare by string.
//! - Blank nodes compare by identifier; the [`ValueFactory`] mints
//!   process-unique identifiers so nodes from different factories never
//!   collide by accident.
//! - Literals compare by lexical form, language tag, and datatype.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// An IRI reference, compared by string
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Iri(Arc<str>);

impl Iri {
    /// Create a new IRI from a string
    pub fn new(iri: impl Into<Arc<str>>) -> Self {
        Iri(iri.into())
    }

    /// The IRI string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Iri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}>", self.0)
    }
}

impl From<&str> for Iri {
    fn from(s: &str) -> Self {
        Iri::new(s)
    }
}

/// A blank node, compared by identifier
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlankNode(Arc<str>);

impl BlankNode {
    /// Create a blank node with an explicit identifier
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        BlankNode(id.into())
    }

    /// The node identifier (without the `_:` prefix)
    pub fn id(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BlankNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "_:{}", self.0)
    }
}

/// A literal: lexical form plus optional language tag or datatype
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Literal {
    lexical: Arc<str>,
    language: Option<Arc<str>>,
    datatype: Option<Iri>,
}

impl Literal {
    /// Create a plain literal
    pub fn plain(lexical: impl Into<Arc<str>>) -> Self {
        Literal {
            lexical: lexical.into(),
            language: None,
            datatype: None,
        }
    }

    /// Create a language-tagged literal
    pub fn tagged(lexical: impl Into<Arc<str>>, language: impl Into<Arc<str>>) -> Self {
        Literal {
            lexical: lexical.into(),
            language: Some(language.into()),
            datatype: None,
        }
    }

    /// Create a typed literal
    pub fn typed(lexical: impl Into<Arc<str>>, datatype: Iri) -> Self {
        Literal {
            lexical: lexical.into(),
            language: None,
            datatype: Some(datatype),
        }
    }

    /// The lexical form
    pub fn lexical(&self) -> &str {
        &self.lexical
    }

    /// The language tag, if any
    pub fn language(&self) -> Option<&str> {
        self.language.as_deref()
    }

    /// The datatype IRI, if any
    pub fn datatype(&self) -> Option<&Iri> {
        self.datatype.as_ref()
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{}\"", self.lexical)?;
        if let Some(lang) = &self.language {
            write!(f, "@{}", lang)?;
        } else if let Some(dt) = &self.datatype {
            write!(f, "^^{}", dt)?;
        }
        Ok(())
    }
}

/// A value legal in subject or context position
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Resource {
    Iri(Iri),
    BlankNode(BlankNode),
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resource::Iri(iri) => iri.fmt(f),
            Resource::BlankNode(b) => b.fmt(f),
        }
    }
}

impl From<Iri> for Resource {
    fn from(iri: Iri) -> Self {
        Resource::Iri(iri)
    }
}

impl From<BlankNode> for Resource {
    fn from(b: BlankNode) -> Self {
        Resource::BlankNode(b)
    }
}

/// A value legal in object position
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Value {
    Iri(Iri),
    BlankNode(BlankNode),
    Literal(Literal),
}

impl Value {
    /// View this value as a resource, if it is one
    pub fn as_resource(&self) -> Option<Resource> {
        match self {
            Value::Iri(iri) => Some(Resource::Iri(iri.clone())),
            Value::BlankNode(b) => Some(Resource::BlankNode(b.clone())),
            Value::Literal(_) => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Iri(iri) => iri.fmt(f),
            Value::BlankNode(b) => b.fmt(f),
            Value::Literal(l) => l.fmt(f),
        }
    }
}

impl From<Iri> for Value {
    fn from(iri: Iri) -> Self {
        Value::Iri(iri)
    }
}

impl From<BlankNode> for Value {
    fn from(b: BlankNode) -> Self {
        Value::BlankNode(b)
    }
}

impl From<Literal> for Value {
    fn from(l: Literal) -> Self {
        Value::Literal(l)
    }
}

impl From<Resource> for Value {
    fn from(r: Resource) -> Self {
        match r {
            Resource::Iri(iri) => Value::Iri(iri),
            Resource::BlankNode(b) => Value::BlankNode(b),
        }
    }
}

/// Process-wide factory sequence, so every factory gets a distinct
/// blank-node namespace.
static FACTORY_SEQ: AtomicU64 = AtomicU64::new(0);

/// Constructs values and fresh blank nodes.
///
/// Blank node identifiers are `{factory}x{counter}` where `factory` is a
/// process-unique number, so nodes minted by different factories (different
/// document scopes) never compare equal.
#[derive(Debug)]
pub struct ValueFactory {
    prefix: u64,
    counter: AtomicU64,
}

impl ValueFactory {
    /// Create a factory with a fresh blank-node namespace
    pub fn new() -> Self {
        ValueFactory {
            prefix: FACTORY_SEQ.fetch_add(1, Ordering::Relaxed),
            counter: AtomicU64::new(0),
        }
    }

    /// Create an IRI
    pub fn iri(&self, iri: impl Into<Arc<str>>) -> Iri {
        Iri::new(iri)
    }

    /// Mint a fresh blank node
    pub fn bnode(&self) -> BlankNode {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        BlankNode::new(format!("{}x{}", self.prefix, n))
    }

    /// Create a blank node with a caller-chosen identifier
    pub fn bnode_with_id(&self, id: impl Into<Arc<str>>) -> BlankNode {
        BlankNode::new(id)
    }

    /// Create a plain literal
    pub fn literal(&self, lexical: impl Into<Arc<str>>) -> Literal {
        Literal::plain(lexical)
    }

    /// Create a language-tagged literal
    pub fn lang_literal(
        &self,
        lexical: impl Into<Arc<str>>,
        language: impl Into<Arc<str>>,
    ) -> Literal {
        Literal::tagged(lexical, language)
    }

    /// Create a typed literal
    pub fn typed_literal(&self, lexical: impl Into<Arc<str>>, datatype: Iri) -> Literal {
        Literal::typed(lexical, datatype)
    }
}

impl Default for ValueFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iri_equality_by_string() {
        assert_eq!(Iri::new("http://example.org/a"), Iri::from("http://example.org/a"));
        assert_ne!(Iri::new("http://example.org/a"), Iri::new("http://example.org/b"));
    }

    #[test]
    fn test_bnode_identity_scoped_to_factory() {
        let f1 = ValueFactory::new();
        let f2 = ValueFactory::new();
        assert_ne!(f1.bnode(), f2.bnode());
        assert_ne!(f1.bnode(), f1.bnode());
    }

    #[test]
    fn test_literal_display_forms() {
        assert_eq!(Literal::plain("hi").to_string(), "\"hi\"");
        assert_eq!(Literal::tagged("hi", "en").to_string(), "\"hi\"@en");
        assert_eq!(
            Literal::typed("1", Iri::new("http://www.w3.org/2001/XMLSchema#int")).to_string(),
            "\"1\"^^<http://www.w3.org/2001/XMLSchema#int>"
        );
    }

    #[test]
    fn test_literal_lang_distinguishes() {
        assert_ne!(Literal::tagged("chat", "en"), Literal::tagged("chat", "fr"));
        assert_ne!(Literal::plain("chat"), Literal::tagged("chat", "fr"));
    }

    #[test]
    fn test_value_as_resource() {
        let iri = Iri::new("http://example.org/a");
        assert_eq!(
            Value::Iri(iri.clone()).as_resource(),
            Some(Resource::Iri(iri))
        );
        assert_eq!(Value::Literal(Literal::plain("x")).as_resource(), None);
    }
}
