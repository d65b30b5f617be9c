//! Namespace prefix mappings.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A prefix → name mapping entry; prefixes are unique per store
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Namespace {
    pub prefix: String,
    pub name: String,
}

impl Namespace {
    /// Create a namespace entry
    pub fn new(prefix: impl Into<String>, name: impl Into<String>) -> Self {
        Namespace {
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
