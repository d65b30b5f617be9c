//! The change-set: one transaction's staged writes.
//!
//! A change-set records approvals (staged adds), deprecations (staged
//! removes), wholesale context clears, namespace edits, and, under
//! serializable isolation, the statement patterns the transaction observed.
//!
//! Invariants:
//! - `approved` and `deprecated` are disjoint at all times
//! - every approved statement with a named context has that context in
//!   `approved_contexts`
//! - when `statement_cleared` is set, the effective post-commit state is
//!   `approved` alone
//!
//! Ownership: a sink stages into a private change-set and *moves* it into
//! the branch on flush; from then on it is shared as `Arc<Changeset>` and
//! treated as read-only.

use rustc_hash::{FxHashMap, FxHashSet};
use std::fmt;
use std::sync::Arc;
use stratum_db_core::{Error, QuadModel, Resource, Result, Statement, StatementPattern};

/// Staged changes awaiting flush into a parent source
#[derive(Clone, Debug, Default)]
pub struct Changeset {
    approved: QuadModel,
    deprecated: QuadModel,
    approved_contexts: FxHashSet<Resource>,
    deprecated_contexts: FxHashSet<Option<Resource>>,
    statement_cleared: bool,
    added_namespaces: FxHashMap<String, String>,
    removed_prefixes: FxHashSet<String>,
    namespace_cleared: bool,
    observations: FxHashSet<StatementPattern>,
}

impl Changeset {
    /// Create an empty change-set
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage an addition. Removes any staged removal of the same statement.
    pub fn approve(&mut self, st: Statement) {
        self.deprecated.remove(&st);
        if let Some(ctx) = &st.context {
            self.approved_contexts.insert(ctx.clone());
        }
        self.approved.insert(st);
    }

    /// Stage a removal. Removes any staged addition of the same statement;
    /// the context leaves `approved_contexts` when no approvals target it
    /// anymore.
    pub fn deprecate(&mut self, st: Statement) {
        self.approved.remove(&st);
        if let Some(ctx) = &st.context {
            if !self.approved.has_context(&st.context) {
                self.approved_contexts.remove(ctx);
            }
        }
        self.deprecated.insert(st);
    }

    /// Record an observed read pattern for serializable conflict detection
    pub fn observe(&mut self, pattern: StatementPattern) {
        self.observations.insert(pattern);
    }

    /// Stage a clear. An empty selection clears all statements (the
    /// effective post-commit state becomes `approved` alone); otherwise the
    /// named contexts are recorded for wholesale removal.
    pub fn clear(&mut self, contexts: &[Option<Resource>]) {
        if contexts.is_empty() {
            self.approved.clear();
            self.approved_contexts.clear();
            self.statement_cleared = true;
        } else {
            for ctx in contexts {
                self.approved.remove_context(ctx);
                if let Some(r) = ctx {
                    self.approved_contexts.remove(r);
                }
                self.deprecated_contexts.insert(ctx.clone());
            }
        }
    }

    /// Stage a namespace binding
    pub fn set_namespace(&mut self, prefix: impl Into<String>, name: impl Into<String>) {
        let prefix = prefix.into();
        self.removed_prefixes.insert(prefix.clone());
        self.added_namespaces.insert(prefix, name.into());
    }

    /// Stage a namespace removal
    pub fn remove_namespace(&mut self, prefix: impl Into<String>) {
        let prefix = prefix.into();
        self.added_namespaces.remove(&prefix);
        self.removed_prefixes.insert(prefix);
    }

    /// Stage removal of all namespaces except ones added afterwards
    pub fn clear_namespaces(&mut self) {
        self.removed_prefixes.clear();
        self.added_namespaces.clear();
        self.namespace_cleared = true;
    }

    /// Fold a later change-set into this one, preserving FIFO semantics
    pub fn merge_from(&mut self, later: &Changeset) {
        if later.statement_cleared {
            self.statement_cleared = true;
            self.approved.clear();
            self.approved_contexts.clear();
            self.deprecated.clear();
            self.deprecated_contexts.clear();
        }
        let cleared: Vec<Option<Resource>> = later.deprecated_contexts.iter().cloned().collect();
        if !cleared.is_empty() {
            self.clear(&cleared);
        }
        for st in later.deprecated.iter() {
            self.deprecate(st.clone());
        }
        for st in later.approved.iter() {
            self.approve(st.clone());
        }
        self.observations
            .extend(later.observations.iter().cloned());
        if later.namespace_cleared {
            self.clear_namespaces();
        }
        for prefix in &later.removed_prefixes {
            self.remove_namespace(prefix.clone());
        }
        for (prefix, name) in &later.added_namespaces {
            self.set_namespace(prefix.clone(), name.clone());
        }
    }

    /// True when an observed pattern would see different results because of
    /// this change-set
    pub fn touches(&self, pattern: &StatementPattern) -> bool {
        if self.statement_cleared {
            return true;
        }
        if self.approved.contains_match(pattern) || self.deprecated.contains_match(pattern) {
            return true;
        }
        self.deprecated_contexts.iter().any(|ctx| match &pattern.context {
            None => true,
            Some(selected) => selected == ctx,
        })
    }

    /// Conflict-check this change-set's observations against change-sets
    /// committed into the parent since the owning branch forked.
    pub fn check_observations(&self, prepend: &[Arc<Changeset>]) -> Result<()> {
        for pattern in &self.observations {
            for committed in prepend {
                if committed.touches(pattern) {
                    return Err(Error::conflict("observed state has changed"));
                }
            }
        }
        Ok(())
    }

    /// Staged additions
    pub fn approved(&self) -> &QuadModel {
        &self.approved
    }

    /// Staged removals
    pub fn deprecated(&self) -> &QuadModel {
        &self.deprecated
    }

    /// Contexts with staged additions
    pub fn approved_contexts(&self) -> &FxHashSet<Resource> {
        &self.approved_contexts
    }

    /// Contexts staged for wholesale removal
    pub fn deprecated_contexts(&self) -> &FxHashSet<Option<Resource>> {
        &self.deprecated_contexts
    }

    /// True when all statements were cleared
    pub fn is_statement_cleared(&self) -> bool {
        self.statement_cleared
    }

    /// Staged namespace bindings
    pub fn added_namespaces(&self) -> &FxHashMap<String, String> {
        &self.added_namespaces
    }

    /// Staged namespace removals
    pub fn removed_prefixes(&self) -> &FxHashSet<String> {
        &self.removed_prefixes
    }

    /// True when all namespaces were cleared
    pub fn is_namespace_cleared(&self) -> bool {
        self.namespace_cleared
    }

    /// Observed read patterns
    pub fn observations(&self) -> &FxHashSet<StatementPattern> {
        &self.observations
    }

    /// True when nothing is staged (observations included)
    pub fn is_empty(&self) -> bool {
        !self.has_changes() && self.observations.is_empty()
    }

    /// True when the change-set would modify store state on commit
    pub fn has_changes(&self) -> bool {
        self.statement_cleared
            || self.namespace_cleared
            || !self.approved.is_empty()
            || !self.deprecated.is_empty()
            || !self.deprecated_contexts.is_empty()
            || !self.added_namespaces.is_empty()
            || !self.removed_prefixes.is_empty()
    }
}

impl fmt::Display for Changeset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if !self.observations.is_empty() {
            parts.push(format!("{} observations", self.observations.len()));
        }
        if self.statement_cleared {
            parts.push("statements cleared".to_string());
        }
        if !self.deprecated_contexts.is_empty() {
            parts.push(format!(
                "{} cleared contexts",
                self.deprecated_contexts.len()
            ));
        }
        if !self.deprecated.is_empty() {
            parts.push(format!("{} deprecated", self.deprecated.len()));
        }
        if !self.approved.is_empty() {
            parts.push(format!("{} approved", self.approved.len()));
        }
        if self.namespace_cleared {
            parts.push("namespaces cleared".to_string());
        }
        if !self.removed_prefixes.is_empty() {
            parts.push(format!("{} removed prefixes", self.removed_prefixes.len()));
        }
        if !self.added_namespaces.is_empty() {
            parts.push(format!("{} added namespaces", self.added_namespaces.len()));
        }
        if parts.is_empty() {
            f.write_str("empty changeset")
        } else {
            f.write_str(&parts.join(", "))
        }
    }
}
