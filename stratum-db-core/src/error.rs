//! Error types shared across the Stratum DB crates.
//!
//! Every layer reports failures through the same taxonomy so that callers can
//! dispatch on the error kind rather than on message text. Foreign errors are
//! wrapped into `Store`/`Io` with their message preserved.

use thiserror::Error;

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for the store, transaction, and connection layers.
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// The query could not be parsed
    #[error("Malformed query: {0}")]
    MalformedQuery(String),

    /// The requested query language is not recognized
    #[error("Unsupported query language: {0}")]
    UnsupportedQueryLanguage(String),

    /// The current operation was interrupted (force-closed from another thread)
    #[error("Operation interrupted")]
    Interrupted,

    /// The per-operation execution time budget was exceeded
    #[error("Maximum query execution time exceeded")]
    QueryTimeout,

    /// Backing-store failure
    #[error("Store error: {0}")]
    Store(String),

    /// I/O failure in the backing store
    #[error("I/O error: {0}")]
    Io(String),

    /// Isolation conflict detected at prepare time
    #[error("Transaction conflict: {0}")]
    Conflict(String),

    /// A write was attempted without an active transaction
    #[error("No active transaction")]
    NoActiveTransaction,

    /// `begin` was called while a transaction was already active
    #[error("A transaction is already active on this connection")]
    TransactionActive,

    /// The connection has been closed
    #[error("Connection has been closed")]
    ConnectionClosed,

    /// `next` was called on a closed iteration
    #[error("Iteration has been closed")]
    IterationClosed,

    /// The requested isolation level is not supported by this store
    #[error("Isolation level {0} not supported by this store")]
    UnsupportedIsolation(String),

    /// Value-expression evaluation failure, surfaced unchanged
    #[error("Evaluation error: {0}")]
    Evaluation(String),
}

impl Error {
    /// Create a store error
    pub fn store(msg: impl Into<String>) -> Self {
        Error::Store(msg.into())
    }

    /// Create an I/O error
    pub fn io(msg: impl Into<String>) -> Self {
        Error::Io(msg.into())
    }

    /// Create a conflict error
    pub fn conflict(msg: impl Into<String>) -> Self {
        Error::Conflict(msg.into())
    }

    /// Create a malformed-query error
    pub fn malformed_query(msg: impl Into<String>) -> Self {
        Error::MalformedQuery(msg.into())
    }

    /// Create an evaluation error
    pub fn evaluation(msg: impl Into<String>) -> Self {
        Error::Evaluation(msg.into())
    }

    /// True for isolation conflicts ("observed state has changed")
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict(_))
    }

    /// True for transaction-state errors (wrong lifecycle state for the call)
    pub fn is_transaction_state(&self) -> bool {
        matches!(
            self,
            Error::NoActiveTransaction
                | Error::TransactionActive
                | Error::ConnectionClosed
                | Error::IterationClosed
                | Error::UnsupportedIsolation(_)
        )
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_kind() {
        let err = Error::conflict("observed state has changed");
        assert!(err.is_conflict());
        assert!(!err.is_transaction_state());
        assert_eq!(
            err.to_string(),
            "Transaction conflict: observed state has changed"
        );
    }

    #[test]
    fn test_transaction_state_kinds() {
        assert!(Error::NoActiveTransaction.is_transaction_state());
        assert!(Error::TransactionActive.is_transaction_state());
        assert!(Error::ConnectionClosed.is_transaction_state());
        assert!(!Error::store("boom").is_transaction_state());
    }

    #[test]
    fn test_io_error_wrapped_with_cause_preserved() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk gone");
        let err: Error = io.into();
        assert!(matches!(err, Error::Io(ref msg) if msg.contains("disk gone")));
    }
}
