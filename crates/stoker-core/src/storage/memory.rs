//! In-memory storage backend: the reference implementation of the storage
//! ports, used by tests and the demo binary.
//!
//! Commit takes the single lock, validates the state-version of every
//! queued state write, then applies the whole buffer. That makes commit
//! the only linearization point and realizes the "at most one concurrent
//! transition commits" boundary.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::clock::{Clock, SystemClock};
use crate::domain::{InvocationSpec, Job, JobId, JobState};
use crate::error::StokerError;
use crate::observability::StateCounts;

use super::{StateRecord, Storage, WriteOnlyTransaction};

struct JobEntry {
    invocation: InvocationSpec,
    created_at: DateTime<Utc>,
    parameters: HashMap<String, String>,
    state: StateRecord,
    state_version: u64,
    history: Vec<StateRecord>,
}

#[derive(Default)]
struct StorageInner {
    jobs: HashMap<JobId, JobEntry>,
    sets: HashMap<String, BTreeSet<String>>,
    lists: HashMap<String, Vec<String>>,
}

pub struct InMemoryStorage {
    inner: Arc<Mutex<StorageInner>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(StorageInner::default())),
            clock,
        }
    }

    /// The external enqueue path: mint an id, persist the job with its
    /// initial state, and hand back the loaded snapshot.
    pub async fn create_job(
        &self,
        invocation: InvocationSpec,
        initial: JobState,
    ) -> Result<Job, StokerError> {
        let now = self.clock.now();
        let record = StateRecord::from_state(&initial, now)?;
        let id = JobId::generate();

        let mut inner = self.inner.lock().await;
        inner.jobs.insert(
            id.clone(),
            JobEntry {
                invocation: invocation.clone(),
                created_at: now,
                parameters: HashMap::new(),
                state: record.clone(),
                state_version: 1,
                history: vec![record],
            },
        );

        Ok(Job {
            id,
            invocation,
            state_name: initial.name().to_string(),
            state_version: 1,
            created_at: now,
            parameters: HashMap::new(),
        })
    }

    pub async fn counts_by_state(&self) -> StateCounts {
        use crate::domain::names;

        let inner = self.inner.lock().await;
        let mut counts = StateCounts::default();
        for entry in inner.jobs.values() {
            let name = entry.state.name.as_str();
            if names::eq(name, names::ENQUEUED) {
                counts.enqueued += 1;
            } else if names::eq(name, names::SCHEDULED) {
                counts.scheduled += 1;
            } else if names::eq(name, names::PROCESSING) {
                counts.processing += 1;
            } else if names::eq(name, names::SUCCEEDED) {
                counts.succeeded += 1;
            } else if names::eq(name, names::FAILED) {
                counts.failed += 1;
            } else if names::eq(name, names::DELETED) {
                counts.deleted += 1;
            } else if names::eq(name, names::AWAITING) {
                counts.awaiting += 1;
            }
        }
        counts
    }

    pub async fn set_contains(&self, set: &str, value: &str) -> bool {
        let inner = self.inner.lock().await;
        inner.sets.get(set).is_some_and(|s| s.contains(value))
    }

    pub async fn set_len(&self, set: &str) -> usize {
        let inner = self.inner.lock().await;
        inner.sets.get(set).map_or(0, BTreeSet::len)
    }

    pub async fn list(&self, name: &str) -> Vec<String> {
        let inner = self.inner.lock().await;
        inner.lists.get(name).cloned().unwrap_or_default()
    }

    pub async fn state_history(&self, id: &JobId) -> Result<Vec<StateRecord>, StokerError> {
        let inner = self.inner.lock().await;
        inner
            .jobs
            .get(id)
            .map(|entry| entry.history.clone())
            .ok_or_else(|| StokerError::Fatal(format!("job {id} does not exist")))
    }
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn get_job(&self, id: &JobId) -> Result<Job, StokerError> {
        let inner = self.inner.lock().await;
        let entry = inner
            .jobs
            .get(id)
            .ok_or_else(|| StokerError::Fatal(format!("job {id} does not exist")))?;

        Ok(Job {
            id: id.clone(),
            invocation: entry.invocation.clone(),
            state_name: entry.state.name.clone(),
            state_version: entry.state_version,
            created_at: entry.created_at,
            parameters: entry.parameters.clone(),
        })
    }

    async fn get_current_state(&self, id: &JobId) -> Result<StateRecord, StokerError> {
        let inner = self.inner.lock().await;
        inner
            .jobs
            .get(id)
            .map(|entry| entry.state.clone())
            .ok_or_else(|| StokerError::Fatal(format!("job {id} does not exist")))
    }

    async fn get_job_parameter(
        &self,
        id: &JobId,
        name: &str,
    ) -> Result<Option<String>, StokerError> {
        let inner = self.inner.lock().await;
        inner
            .jobs
            .get(id)
            .map(|entry| entry.parameters.get(name).cloned())
            .ok_or_else(|| StokerError::Fatal(format!("job {id} does not exist")))
    }

    fn begin(&self) -> Box<dyn WriteOnlyTransaction> {
        Box::new(InMemoryTransaction {
            inner: Arc::clone(&self.inner),
            ops: Vec::new(),
        })
    }
}

enum Op {
    SetJobState {
        job_id: JobId,
        expected_version: u64,
        record: StateRecord,
    },
    SetJobParameter {
        job_id: JobId,
        name: String,
        value: String,
    },
    AddToSet {
        set: String,
        value: String,
    },
    RemoveFromSet {
        set: String,
        value: String,
    },
    AddToList {
        list: String,
        value: String,
    },
    TrimList {
        list: String,
        keep_from: usize,
        keep_to: usize,
    },
}

struct InMemoryTransaction {
    inner: Arc<Mutex<StorageInner>>,
    ops: Vec<Op>,
}

#[async_trait]
impl WriteOnlyTransaction for InMemoryTransaction {
    fn set_job_state(&mut self, job: &Job, record: StateRecord) {
        self.ops.push(Op::SetJobState {
            job_id: job.id.clone(),
            expected_version: job.state_version,
            record,
        });
    }

    fn set_job_parameter(&mut self, id: &JobId, name: &str, value: &str) {
        self.ops.push(Op::SetJobParameter {
            job_id: id.clone(),
            name: name.to_string(),
            value: value.to_string(),
        });
    }

    fn add_to_set(&mut self, set: &str, value: &str) {
        self.ops.push(Op::AddToSet {
            set: set.to_string(),
            value: value.to_string(),
        });
    }

    fn remove_from_set(&mut self, set: &str, value: &str) {
        self.ops.push(Op::RemoveFromSet {
            set: set.to_string(),
            value: value.to_string(),
        });
    }

    fn add_to_list(&mut self, list: &str, value: &str) {
        self.ops.push(Op::AddToList {
            list: list.to_string(),
            value: value.to_string(),
        });
    }

    fn trim_list(&mut self, list: &str, keep_from: usize, keep_to: usize) {
        self.ops.push(Op::TrimList {
            list: list.to_string(),
            keep_from,
            keep_to,
        });
    }

    async fn commit(self: Box<Self>) -> Result<(), StokerError> {
        let Self { inner, ops } = *self;
        let mut inner = inner.lock().await;

        // Validate before touching anything, so a rejected commit leaves
        // storage exactly as it was.
        for op in &ops {
            match op {
                Op::SetJobState {
                    job_id,
                    expected_version,
                    ..
                } => {
                    let entry = inner
                        .jobs
                        .get(job_id)
                        .ok_or_else(|| StokerError::Fatal(format!("job {job_id} does not exist")))?;
                    if entry.state_version != *expected_version {
                        return Err(StokerError::Storage(format!(
                            "concurrent transition on job {job_id}: expected version {expected_version}, found {}",
                            entry.state_version
                        )));
                    }
                }
                Op::SetJobParameter { job_id, .. } => {
                    if !inner.jobs.contains_key(job_id) {
                        return Err(StokerError::Fatal(format!("job {job_id} does not exist")));
                    }
                }
                _ => {}
            }
        }

        for op in ops {
            match op {
                Op::SetJobState { job_id, record, .. } => {
                    if let Some(entry) = inner.jobs.get_mut(&job_id) {
                        entry.state = record.clone();
                        entry.state_version += 1;
                        entry.history.push(record);
                    }
                }
                Op::SetJobParameter {
                    job_id,
                    name,
                    value,
                } => {
                    if let Some(entry) = inner.jobs.get_mut(&job_id) {
                        entry.parameters.insert(name, value);
                    }
                }
                Op::AddToSet { set, value } => {
                    inner.sets.entry(set).or_default().insert(value);
                }
                Op::RemoveFromSet { set, value } => {
                    if let Some(members) = inner.sets.get_mut(&set) {
                        members.remove(&value);
                    }
                }
                Op::AddToList { list, value } => {
                    inner.lists.entry(list).or_default().push(value);
                }
                Op::TrimList {
                    list,
                    keep_from,
                    keep_to,
                } => {
                    if let Some(items) = inner.lists.get_mut(&list) {
                        *items = items
                            .iter()
                            .enumerate()
                            .filter(|(i, _)| *i >= keep_from && *i <= keep_to)
                            .map(|(_, v)| v.clone())
                            .collect();
                    }
                }
            }
        }

        Ok(())
    }
}
