//! Job record: the durable unit of work as the pipeline sees it.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::filters::StateFilter;

use super::ids::JobId;

/// A filter attached to a specific job's invocation rather than the global
/// registry. On equal order, method-level filters run after global ones, so
/// their election rewrites win.
#[derive(Clone)]
pub struct FilterAttachment {
    pub order: i32,
    pub filter: Arc<dyn StateFilter>,
}

impl FilterAttachment {
    pub fn new(order: i32, filter: Arc<dyn StateFilter>) -> Self {
        Self { order, filter }
    }
}

impl fmt::Debug for FilterAttachment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterAttachment")
            .field("order", &self.order)
            .finish_non_exhaustive()
    }
}

/// What to run: a method name plus serialized arguments, with any
/// method-level filter attachments.
#[derive(Debug, Clone)]
pub struct InvocationSpec {
    pub method: String,
    pub arguments: serde_json::Value,
    pub filters: Vec<FilterAttachment>,
}

impl InvocationSpec {
    pub fn new(method: impl Into<String>, arguments: serde_json::Value) -> Self {
        Self {
            method: method.into(),
            arguments,
            filters: Vec::new(),
        }
    }

    pub fn with_filter(mut self, order: i32, filter: Arc<dyn StateFilter>) -> Self {
        self.filters.push(FilterAttachment::new(order, filter));
        self
    }
}

/// Snapshot of a durable job as loaded from storage.
///
/// The snapshot is read-only from the pipeline's point of view: transitions
/// go through a write-only transaction, never through this struct. The
/// `state_version` is opaque to the core; storage uses it to detect
/// concurrent transitions at commit time.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub invocation: InvocationSpec,
    pub state_name: String,
    pub state_version: u64,
    pub created_at: DateTime<Utc>,
    /// Parameter snapshot taken when the job was loaded. Stale reads during
    /// election come from here.
    pub parameters: HashMap<String, String>,
}

impl Job {
    pub fn parameter_raw(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(String::as_str)
    }
}
