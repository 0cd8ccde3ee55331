//! Filters: pluggable policies that veto, amend, or react to state
//! transitions, plus the ordered registry that holds them.

mod context;
mod retry;

pub use context::{ApplyStateContext, ElectStateContext};
pub use retry::{
    AttemptsExceededAction, AutomaticRetry, DEFAULT_ATTEMPTS, RETRIES_SET, RETRY_COUNT_PARAMETER,
};

use std::sync::Arc;

use async_trait::async_trait;

use crate::domain::FilterAttachment;
use crate::error::StokerError;
use crate::storage::WriteOnlyTransaction;

/// A state filter. Implementations override any non-empty subset of the
/// hooks; defaults are no-ops.
///
/// Filter instances are shared across worker threads and must be internally
/// thread-safe. They must also be idempotent: a failed commit causes the
/// whole election + application to be re-run with the same inputs.
#[async_trait]
pub trait StateFilter: Send + Sync {
    /// Observe (and possibly replace) the current candidate state. Runs in
    /// registry order; each filter sees the rewrites of earlier ones.
    async fn on_state_election(
        &self,
        _ctx: &mut ElectStateContext<'_>,
    ) -> Result<(), StokerError> {
        Ok(())
    }

    /// React to the entering state by piggy-backing writes onto the
    /// transaction that commits it.
    async fn on_state_applied(
        &self,
        _ctx: &ApplyStateContext<'_>,
        _txn: &mut dyn WriteOnlyTransaction,
    ) -> Result<(), StokerError> {
        Ok(())
    }

    /// Undo the side-effects a prior `on_state_applied` made for the state
    /// now being left. Runs in the same transaction as the state change.
    async fn on_state_unapplied(
        &self,
        _ctx: &ApplyStateContext<'_>,
        _txn: &mut dyn WriteOnlyTransaction,
    ) -> Result<(), StokerError> {
        Ok(())
    }
}

struct RegisteredFilter {
    order: i32,
    seq: usize,
    filter: Arc<dyn StateFilter>,
}

/// Ordered collection of globally-registered filters.
///
/// Built during startup (mutable), then shared behind an `Arc` for the
/// lifetime of the process; ownership makes late registration impossible
/// once the first worker holds a handle.
#[derive(Default)]
pub struct FilterRegistry {
    entries: Vec<RegisteredFilter>,
}

impl FilterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a filter. Lower orders run earlier; ties are broken by
    /// registration order.
    pub fn add(&mut self, order: i32, filter: Arc<dyn StateFilter>) {
        let seq = self.entries.len();
        self.entries.push(RegisteredFilter { order, seq, filter });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Merge global filters with a job's method-level attachments into the
    /// final invocation order: ascending `order`, global before method-level
    /// on ties (so method-level rewrites win), registration order last.
    pub fn merged(&self, method_filters: &[FilterAttachment]) -> Vec<Arc<dyn StateFilter>> {
        let mut all: Vec<(i32, u8, usize, &Arc<dyn StateFilter>)> = self
            .entries
            .iter()
            .map(|e| (e.order, 0u8, e.seq, &e.filter))
            .collect();
        all.extend(
            method_filters
                .iter()
                .enumerate()
                .map(|(seq, a)| (a.order, 1u8, seq, &a.filter)),
        );
        all.sort_by_key(|&(order, source, seq, _)| (order, source, seq));
        all.into_iter().map(|(_, _, _, f)| Arc::clone(f)).collect()
    }
}
