//! Storage ports: the read side the election pipeline needs and the
//! write-only transaction the application pipeline commits through.
//!
//! Drivers buffer every write until `commit`; operations may be issued in
//! any order and commit is the only linearization point.

mod memory;

pub use memory::InMemoryStorage;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{Job, JobId, JobState};
use crate::error::StokerError;

/// A state as persisted: wire name, optional reason, serialized
/// case-specific payload, and the instant the record was written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateRecord {
    pub name: String,
    pub reason: Option<String>,
    pub data: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl StateRecord {
    pub fn from_state(state: &JobState, now: DateTime<Utc>) -> Result<Self, StokerError> {
        let data = serde_json::to_value(&state.data)
            .map_err(|e| StokerError::Storage(format!("state payload not serializable: {e}")))?;
        Ok(Self {
            name: state.name().to_string(),
            reason: state.reason.clone(),
            data,
            created_at: now,
        })
    }
}

/// Read side of a storage driver.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Load a job snapshot. A missing job is a permanent inconsistency
    /// ([`StokerError::Fatal`]), not a transient failure.
    async fn get_job(&self, id: &JobId) -> Result<Job, StokerError>;

    async fn get_current_state(&self, id: &JobId) -> Result<StateRecord, StokerError>;

    /// Raw serialized value of a job parameter, if set.
    async fn get_job_parameter(
        &self,
        id: &JobId,
        name: &str,
    ) -> Result<Option<String>, StokerError>;

    /// Open a new write-only transaction.
    fn begin(&self) -> Box<dyn WriteOnlyTransaction>;
}

/// Write side of a storage driver. All operations buffer; `commit` makes
/// them visible atomically or not at all.
#[async_trait]
pub trait WriteOnlyTransaction: Send {
    /// Replace the job's current state and append it to the state history.
    /// The `job` snapshot carries the state version the caller observed;
    /// commit fails with [`StokerError::Storage`] if another transition
    /// won the race.
    fn set_job_state(&mut self, job: &Job, record: StateRecord);

    fn set_job_parameter(&mut self, id: &JobId, name: &str, value: &str);

    /// Idempotent set membership.
    fn add_to_set(&mut self, set: &str, value: &str);

    /// Idempotent set removal.
    fn remove_from_set(&mut self, set: &str, value: &str);

    fn add_to_list(&mut self, list: &str, value: &str);

    /// Keep only the elements whose index falls in `keep_from..=keep_to`.
    fn trim_list(&mut self, list: &str, keep_from: usize, keep_to: usize);

    async fn commit(self: Box<Self>) -> Result<(), StokerError>;
}
