//! Exception descriptions and the subtype registry backing the retry
//! filter's allow/deny lists.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::StokerError;

/// Captured failure details carried by Failed (and optionally Deleted)
/// states. The type name is a fully-qualified string; matching against
/// allow/deny lists goes through [`ExceptionRegistry`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionInfo {
    pub exception_type: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<String>,
}

impl ExceptionInfo {
    pub fn new(exception_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            exception_type: exception_type.into(),
            message: message.into(),
            stack_trace: None,
        }
    }

    pub fn with_stack_trace(mut self, stack_trace: impl Into<String>) -> Self {
        self.stack_trace = Some(stack_trace.into());
        self
    }

    /// Describe a pipeline error as an exception, preserving the explicit
    /// type of filter faults so allow/deny lists can still match.
    pub fn from_error(err: &StokerError) -> Self {
        match err {
            StokerError::Filter(info) => info.clone(),
            StokerError::Configuration(_) => Self::new("ConfigurationError", err.to_string()),
            StokerError::Storage(_) => Self::new("StorageError", err.to_string()),
            StokerError::Serialization { .. } => Self::new("SerializationError", err.to_string()),
            StokerError::Fatal(_) => Self::new("FatalError", err.to_string()),
            StokerError::Canceled => Self::new("CanceledError", err.to_string()),
        }
    }
}

/// Registry of subtype relationships between exception type names.
///
/// The core has no runtime type information for exceptions raised in user
/// code, so assignability is looked up in this table: a candidate is
/// assignable to a base when it is the same name or a registered
/// (transitive) subtype of it. Unknown names never match anything but
/// themselves.
#[derive(Debug, Clone, Default)]
pub struct ExceptionRegistry {
    parents: HashMap<String, String>,
}

impl ExceptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `child` as a direct subtype of `parent`. Re-registering a
    /// child overwrites its previous parent.
    pub fn register_subtype(&mut self, child: impl Into<String>, parent: impl Into<String>) {
        self.parents.insert(child.into(), parent.into());
    }

    /// Is `candidate` the same type as `base`, or a registered subtype of
    /// it (transitively)?
    pub fn is_assignable(&self, candidate: &str, base: &str) -> bool {
        if candidate == base {
            return true;
        }
        let mut current = candidate;
        // Bounded walk: a malformed registration cycle must not hang the
        // election pipeline.
        for _ in 0..self.parents.len() {
            match self.parents.get(current) {
                Some(parent) if parent == base => return true,
                Some(parent) => current = parent,
                None => return false,
            }
        }
        false
    }
}
