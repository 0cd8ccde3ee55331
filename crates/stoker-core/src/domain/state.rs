//! Job states: the tagged variants a job moves through, plus their
//! case-specific payloads.
//!
//! State names are stable wire identifiers: they are written to storage
//! verbatim and must never be renamed. Comparisons are case-insensitive on
//! input; output always uses the canonical casing below.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::exception::ExceptionInfo;
use super::ids::{JobId, ServerId, WorkerId};

/// Canonical state names.
pub mod names {
    pub const ENQUEUED: &str = "Enqueued";
    pub const SCHEDULED: &str = "Scheduled";
    pub const PROCESSING: &str = "Processing";
    pub const SUCCEEDED: &str = "Succeeded";
    pub const FAILED: &str = "Failed";
    pub const DELETED: &str = "Deleted";
    pub const AWAITING: &str = "Awaiting";

    /// Case-insensitive state-name comparison.
    pub fn eq(a: &str, b: &str) -> bool {
        a.eq_ignore_ascii_case(b)
    }
}

/// Queue jobs land on when no explicit queue is requested.
pub const DEFAULT_QUEUE: &str = "default";

/// Case-specific state payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StateData {
    Enqueued {
        queue: String,
        enqueued_at: DateTime<Utc>,
    },
    Scheduled {
        /// Instant at which the job becomes eligible for enqueueing.
        enqueue_at: DateTime<Utc>,
        scheduled_at: DateTime<Utc>,
    },
    Processing {
        server_id: ServerId,
        worker_id: WorkerId,
        started_at: DateTime<Utc>,
    },
    Succeeded {
        result: Option<serde_json::Value>,
        total_duration_ms: u64,
        latency_ms: u64,
        succeeded_at: DateTime<Utc>,
    },
    Failed {
        exception: ExceptionInfo,
        failed_at: DateTime<Utc>,
    },
    Deleted {
        exception: Option<ExceptionInfo>,
        deleted_at: DateTime<Utc>,
    },
    Awaiting {
        parent_id: JobId,
    },
}

impl StateData {
    /// Canonical wire name of this state.
    pub fn name(&self) -> &'static str {
        match self {
            StateData::Enqueued { .. } => names::ENQUEUED,
            StateData::Scheduled { .. } => names::SCHEDULED,
            StateData::Processing { .. } => names::PROCESSING,
            StateData::Succeeded { .. } => names::SUCCEEDED,
            StateData::Failed { .. } => names::FAILED,
            StateData::Deleted { .. } => names::DELETED,
            StateData::Awaiting { .. } => names::AWAITING,
        }
    }
}

/// A state value as it flows through election and application: the tagged
/// payload plus an optional human-readable reason.
///
/// Reasons are free-form and short (500 chars is a sensible ceiling);
/// storage must accept longer ones without corruption.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobState {
    pub data: StateData,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl JobState {
    pub fn new(data: StateData) -> Self {
        Self { data, reason: None }
    }

    pub fn enqueued(now: DateTime<Utc>) -> Self {
        Self::enqueued_on(DEFAULT_QUEUE, now)
    }

    pub fn enqueued_on(queue: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self::new(StateData::Enqueued {
            queue: queue.into(),
            enqueued_at: now,
        })
    }

    pub fn scheduled(enqueue_at: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        Self::new(StateData::Scheduled {
            enqueue_at,
            scheduled_at: now,
        })
    }

    pub fn processing(server_id: ServerId, worker_id: WorkerId, now: DateTime<Utc>) -> Self {
        Self::new(StateData::Processing {
            server_id,
            worker_id,
            started_at: now,
        })
    }

    pub fn succeeded(
        result: Option<serde_json::Value>,
        total_duration_ms: u64,
        latency_ms: u64,
        now: DateTime<Utc>,
    ) -> Self {
        Self::new(StateData::Succeeded {
            result,
            total_duration_ms,
            latency_ms,
            succeeded_at: now,
        })
    }

    pub fn failed(exception: ExceptionInfo, now: DateTime<Utc>) -> Self {
        Self::new(StateData::Failed {
            exception,
            failed_at: now,
        })
    }

    pub fn deleted(exception: Option<ExceptionInfo>, now: DateTime<Utc>) -> Self {
        Self::new(StateData::Deleted {
            exception,
            deleted_at: now,
        })
    }

    pub fn awaiting(parent_id: JobId) -> Self {
        Self::new(StateData::Awaiting { parent_id })
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn name(&self) -> &'static str {
        self.data.name()
    }

    /// Terminal states are subject to the retention window managed outside
    /// the core; no transition is expected out of them.
    pub fn is_final(&self) -> bool {
        matches!(
            self.data,
            StateData::Succeeded { .. } | StateData::Deleted { .. }
        )
    }
}
