//! Sinks: the write handle onto a branch's change-set.
//!
//! A sink stages mutations into a private change-set. `flush()` moves the
//! change-set into the owning branch's pending list (or commits it directly
//! into the backing store for a root-level sink) and is idempotent on an
//! empty change-set. `close()` without flush discards the staged changes.

use crate::branch::{BranchId, SourceRoot};
use crate::changeset::Changeset;
use std::sync::Arc;
use stratum_db_core::{
    Error, Iri, IsolationLevel, Resource, Result, Statement, StatementPattern, Value,
};

pub(crate) enum SinkTarget {
    /// Commits straight into the backing store on flush
    Direct(Arc<SourceRoot>),
    /// Appends to a branch's pending list on flush
    Branch { root: Arc<SourceRoot>, id: BranchId },
}

/// A buffered writer bound to one source at one isolation level
pub struct Sink {
    target: SinkTarget,
    changeset: Changeset,
    level: IsolationLevel,
    closed: bool,
}

impl Sink {
    pub(crate) fn new(target: SinkTarget, level: IsolationLevel) -> Self {
        Sink {
            target,
            changeset: Changeset::new(),
            level,
            closed: false,
        }
    }

    fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::store("sink has been closed"));
        }
        Ok(())
    }

    /// The isolation level this sink was opened at
    pub fn isolation_level(&self) -> IsolationLevel {
        self.level
    }

    /// The staged change-set
    pub fn staged(&self) -> &Changeset {
        &self.changeset
    }

    /// Stage an addition
    pub fn approve(&mut self, st: Statement) -> Result<()> {
        self.check_open()?;
        self.changeset.approve(st);
        Ok(())
    }

    /// Stage a removal
    pub fn deprecate(&mut self, st: Statement) -> Result<()> {
        self.check_open()?;
        self.changeset.deprecate(st);
        Ok(())
    }

    /// Record observed read patterns. Honored only under serializable
    /// isolation; a no-op otherwise.
    pub fn observe(
        &mut self,
        subject: Option<&Resource>,
        predicate: Option<&Iri>,
        object: Option<&Value>,
        contexts: &[Option<Resource>],
    ) -> Result<()> {
        self.check_open()?;
        if self.level < IsolationLevel::Serializable {
            return Ok(());
        }
        for pattern in StatementPattern::expand(subject, predicate, object, contexts) {
            self.changeset.observe(pattern);
        }
        Ok(())
    }

    /// Stage a clear of the selected contexts (all statements when the
    /// selection is empty)
    pub fn clear(&mut self, contexts: &[Option<Resource>]) -> Result<()> {
        self.check_open()?;
        self.changeset.clear(contexts);
        Ok(())
    }

    /// Stage a namespace binding
    pub fn set_namespace(
        &mut self,
        prefix: impl Into<String>,
        name: impl Into<String>,
    ) -> Result<()> {
        self.check_open()?;
        self.changeset.set_namespace(prefix, name);
        Ok(())
    }

    /// Stage a namespace removal
    pub fn remove_namespace(&mut self, prefix: impl Into<String>) -> Result<()> {
        self.check_open()?;
        self.changeset.remove_namespace(prefix);
        Ok(())
    }

    /// Stage removal of all namespaces
    pub fn clear_namespaces(&mut self) -> Result<()> {
        self.check_open()?;
        self.changeset.clear_namespaces();
        Ok(())
    }

    /// Move the staged change-set into the owning source. Idempotent on an
    /// empty change-set.
    pub fn flush(&mut self) -> Result<()> {
        self.check_open()?;
        if self.changeset.is_empty() {
            return Ok(());
        }
        let staged = std::mem::take(&mut self.changeset);
        match &self.target {
            SinkTarget::Direct(root) => root.commit_direct(staged),
            SinkTarget::Branch { root, id } => root.push_changeset(*id, staged),
        }
    }

    /// Discard any unflushed changes and release the sink. Idempotent.
    pub fn close(&mut self) {
        self.closed = true;
        self.changeset = Changeset::new();
    }
}
