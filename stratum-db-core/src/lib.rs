//! # Stratum DB Core
//!
//! Core data model and primitives for Stratum DB, an embeddable
//! transactional RDF quad store.
//!
//! This crate provides:
//! - Value types: `Iri`, `BlankNode`, `Literal`, `Resource`, `Value`
//! - Statements (quads), statement patterns, and namespace entries
//! - `QuadModel`, an indexed statement set with smallest-set pattern scans
//! - Isolation levels and compatibility clamping
//! - Closeable single-pass iteration with interlocked resource release
//! - The shared error taxonomy and store configuration
//!
//! ## Design Principles
//!
//! 1. **Cheap value clones**: statements flow between change-sets, datasets,
//!    and listeners; everything is `Arc<str>` backed
//! 2. **Explicit resource lifecycles**: iterations own resources and must be
//!    closed; dropping one releases it deterministically
//! 3. **Errors by kind**: callers dispatch on the error variant, never on
//!    message text

pub mod config;
pub mod error;
pub mod isolation;
pub mod iter;
pub mod model;
pub mod namespace;
pub mod statement;
pub mod value;
pub mod vocab;

pub use config::{
    StoreConfig, INITIAL_LEAK_COLLECTION_INTERVAL_MS, MAX_LEAK_COLLECTION_INTERVAL_MS,
};
pub use error::{Error, Result};
pub use isolation::IsolationLevel;
pub use iter::{CloseableIter, ForceCloseable};
pub use model::QuadModel;
pub use namespace::Namespace;
pub use statement::{context_matches, Statement, StatementPattern};
pub use value::{BlankNode, Iri, Literal, Resource, Value, ValueFactory};
