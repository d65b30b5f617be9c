//! The statement-algebra capability handed to query evaluators.
//!
//! A triple source pins one dataset and its branch open for the life of the
//! evaluation. The evaluator calls [`ConnectionTripleSource::interlock`] on
//! its result iterator so that closing the iterator, normally or abnormally,
//! releases the snapshot and then the branch, in that order.

use std::sync::Arc;
use std::time::Instant;
use stratum_db_core::{
    CloseableIter, Iri, Resource, Result, Statement, Value, ValueFactory,
};
use stratum_db_store::{BoxedDataset, Source, TripleSource};

/// A consistent snapshot published to the query evaluator
pub struct ConnectionTripleSource {
    dataset: Option<BoxedDataset>,
    branch: Option<Source>,
    value_factory: Arc<ValueFactory>,
    deadline: Option<Instant>,
}

impl ConnectionTripleSource {
    pub(crate) fn new(
        dataset: BoxedDataset,
        branch: Source,
        value_factory: Arc<ValueFactory>,
        deadline: Option<Instant>,
    ) -> Self {
        ConnectionTripleSource {
            dataset: Some(dataset),
            branch: Some(branch),
            value_factory,
            deadline,
        }
    }

    /// Release the snapshot and branch now. Idempotent.
    pub fn close(&mut self) -> Result<()> {
        let closed = match self.dataset.take() {
            Some(mut dataset) => dataset.close(),
            None => Ok(()),
        };
        if let Some(branch) = self.branch.take() {
            branch.release();
        }
        closed
    }

    /// Hand resource ownership to a result iterator: when it closes, the
    /// snapshot is released first, the branch second.
    pub fn interlock<T: Send + 'static>(mut self, iter: CloseableIter<T>) -> CloseableIter<T> {
        let dataset = self.dataset.take();
        let branch = self.branch.take();
        iter.with_cleanup(move || {
            if let Some(mut dataset) = dataset {
                let _ = dataset.close();
            }
            if let Some(branch) = branch {
                branch.release();
            }
        })
    }
}

impl TripleSource for ConnectionTripleSource {
    fn get_statements(
        &self,
        subject: Option<&Resource>,
        predicate: Option<&Iri>,
        object: Option<&Value>,
        contexts: &[Option<Resource>],
    ) -> Result<CloseableIter<Statement>> {
        let dataset = self
            .dataset
            .as_ref()
            .ok_or(stratum_db_core::Error::IterationClosed)?;
        Ok(
            CloseableIter::from_results(dataset.statements(subject, predicate, object, contexts))
                .with_deadline(self.deadline),
        )
    }

    fn value_factory(&self) -> &Arc<ValueFactory> {
        &self.value_factory
    }
}

impl Drop for ConnectionTripleSource {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
