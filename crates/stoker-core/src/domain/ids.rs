//! Domain identifiers (strongly-typed, string-valued).
//!
//! Identifiers are opaque strings on the wire: storage hands them out and
//! the core passes them back verbatim. The phantom marker keeps `JobId`,
//! `ServerId` and `WorkerId` from being mixed up at compile time while the
//! runtime representation stays a plain string.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use ulid::Ulid;

/// Marker trait for identifier kinds. Supplies the prefix used when the
/// in-memory backend mints fresh ids.
pub trait IdMarker: Send + Sync + 'static {
    fn prefix() -> &'static str;
}

/// Generic string-valued identifier. `T` is a zero-sized marker providing
/// compile-time separation between id kinds.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id<T: IdMarker> {
    value: String,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    /// Wrap an identifier received from storage, verbatim.
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            _marker: PhantomData,
        }
    }

    /// Mint a fresh identifier. ULIDs sort by creation time, so listings
    /// come out in insertion order without coordination between hosts.
    pub fn generate() -> Self {
        Self::new(format!("{}{}", T::prefix(), Ulid::new()))
    }

    pub fn as_str(&self) -> &str {
        &self.value
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)
    }
}

impl<T: IdMarker> From<&str> for Id<T> {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Marker for job identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Job {}

impl IdMarker for Job {
    fn prefix() -> &'static str {
        "job-"
    }
}

/// Marker for server (worker host) identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Server {}

impl IdMarker for Server {
    fn prefix() -> &'static str {
        "server-"
    }
}

/// Marker for worker (thread within a server) identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Worker {}

impl IdMarker for Worker {
    fn prefix() -> &'static str {
        "worker-"
    }
}

/// Identifier of a durable background job.
pub type JobId = Id<Job>;

/// Identifier of a worker host.
pub type ServerId = Id<Server>;

/// Identifier of a single worker within a host.
pub type WorkerId = Id<Worker>;
