//! # Stratum DB Store
//!
//! The transactional storage layer: snapshot isolation and serializable
//! transactions through a branching overlay of change-sets on top of a
//! backing statement store.
//!
//! ## Layering
//!
//! - [`BackingStore`] / [`BackingSnapshot`]: the source of truth, providing
//!   O(1) point-in-time snapshots and atomic commits
//! - [`Changeset`]: one transaction's staged writes and observations
//! - [`Source`]: a forkable overlay; branches live in an arena owned by the
//!   source root, referenced by handle
//! - [`Dataset`]: a read view merging pending change-sets with the state
//!   below
//! - [`Sink`]: the write handle staging into a branch's change-set
//!
//! Commits into one source are totally ordered by a per-source commit lock.
//! `prepare()` runs observation-based conflict detection and holds the lock
//! until `flush()` or `release()`, so a successful prepare cannot fail to
//! flush for isolation reasons.

mod branch;
mod changeset;
mod dataset;
mod sink;
mod source;
mod store;

pub use branch::SourceRoot;
pub use changeset::Changeset;
pub use dataset::{BoxedDataset, Dataset};
pub use sink::Sink;
pub use source::Source;
pub use store::{
    BackingSnapshot, BackingStore, EvaluationStatistics, StatementStore, TripleSource,
};
