//! Contexts handed to filters during election and application.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::clock::Clock;
use crate::domain::{Job, JobState, ParameterCodec};
use crate::error::StokerError;
use crate::storage::Storage;

/// Mutable context for one state election. Holds the candidate state and a
/// buffer of parameter writes that commit together with the elected state.
pub struct ElectStateContext<'a> {
    job: &'a Job,
    storage: &'a dyn Storage,
    clock: &'a dyn Clock,
    candidate: JobState,
    pending: Vec<(String, String)>,
    faulted: bool,
}

impl<'a> ElectStateContext<'a> {
    pub(crate) fn new(
        job: &'a Job,
        storage: &'a dyn Storage,
        clock: &'a dyn Clock,
        proposed: JobState,
    ) -> Self {
        Self {
            job,
            storage,
            clock,
            candidate: proposed,
            pending: Vec::new(),
            faulted: false,
        }
    }

    pub fn job(&self) -> &Job {
        self.job
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn candidate(&self) -> &JobState {
        &self.candidate
    }

    /// Replace the candidate. Later filters observe the replacement.
    pub fn set_candidate(&mut self, state: JobState) {
        self.candidate = state;
    }

    /// Read a job parameter. With `allow_stale` the value comes from the
    /// snapshot taken when the job was loaded; otherwise the buffer of
    /// not-yet-committed writes is consulted first, then storage. Missing
    /// parameters decode to `T::default()`.
    pub async fn get_job_parameter<T>(
        &self,
        name: &str,
        allow_stale: bool,
    ) -> Result<T, StokerError>
    where
        T: DeserializeOwned + Default,
    {
        let raw = if allow_stale {
            self.job.parameter_raw(name).map(str::to_string)
        } else {
            match self.pending.iter().rev().find(|(k, _)| k == name) {
                Some((_, v)) => Some(v.clone()),
                None => self.storage.get_job_parameter(&self.job.id, name).await?,
            }
        };

        match raw {
            Some(raw) => ParameterCodec::decode(name, &raw),
            None => Ok(T::default()),
        }
    }

    /// Buffer a parameter write; it is flushed into the transaction that
    /// commits the elected state.
    pub fn set_job_parameter<T: Serialize>(
        &mut self,
        name: &str,
        value: &T,
    ) -> Result<(), StokerError> {
        let encoded = ParameterCodec::encode(name, value)?;
        self.pending.retain(|(k, _)| k != name);
        self.pending.push((name.to_string(), encoded));
        Ok(())
    }

    /// Whether a filter fault already replaced the candidate during this
    /// election. The replacement happens at most once.
    pub(crate) fn faulted(&self) -> bool {
        self.faulted
    }

    pub(crate) fn replace_after_fault(&mut self, state: JobState) {
        self.candidate = state;
        self.faulted = true;
    }

    pub(crate) fn into_parts(self) -> (JobState, Vec<(String, String)>) {
        (self.candidate, self.pending)
    }
}

/// Read-only context for state application hooks. `old_state_name` is the
/// state being left; `new_state` is the elected state being entered.
pub struct ApplyStateContext<'a> {
    job: &'a Job,
    old_state_name: &'a str,
    new_state: &'a JobState,
}

impl<'a> ApplyStateContext<'a> {
    pub(crate) fn new(job: &'a Job, old_state_name: &'a str, new_state: &'a JobState) -> Self {
        Self {
            job,
            old_state_name,
            new_state,
        }
    }

    pub fn job(&self) -> &Job {
        self.job
    }

    pub fn old_state_name(&self) -> &str {
        self.old_state_name
    }

    pub fn new_state(&self) -> &JobState {
        self.new_state
    }
}
