use serde::{Deserialize, Serialize};

/// Per-state census of all jobs known to a storage backend.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateCounts {
    pub enqueued: usize,
    pub scheduled: usize,
    pub processing: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub deleted: usize,
    pub awaiting: usize,
}
