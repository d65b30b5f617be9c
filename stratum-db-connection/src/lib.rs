//! # Stratum DB Connection
//!
//! The client-facing connection layer. A [`Connection`] binds snapshots and
//! sinks from a [`StatementStore`](stratum_db_store::StatementStore) to
//! operations, enforces the transaction lifecycle, buffers bulk updates,
//! duplicates work across the explicit and inferred branch stacks, emits
//! change notifications, and tracks every open iteration for leak
//! diagnosis.
//!
//! ## Example
//!
//! ```ignore
//! use stratum_db_connection::Connection;
//! use stratum_db_memory::MemoryStore;
//!
//! let conn = Connection::new(Arc::new(MemoryStore::new()), StoreConfig::default())?;
//! conn.begin()?;
//! conn.add_statement(subject, predicate, object, &[])?;
//! conn.commit()?;
//! ```

mod connection;
mod iterations;
mod listener;
mod triple_source;

pub use connection::{Connection, UpdateContext};
pub use listener::ConnectionListener;
pub use triple_source::ConnectionTripleSource;
