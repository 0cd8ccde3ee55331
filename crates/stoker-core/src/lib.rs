//! stoker-core
//!
//! State-election core for the stoker background job framework.
//!
//! Every job transition runs through the same pipeline: a worker proposes a
//! candidate state, the ordered election filters rewrite it, and the elected
//! state commits through a write-only storage transaction together with all
//! side-effects the filters queued along the way.
//!
//! - domain: ids, states, exceptions, job records, parameter codec
//! - filters: filter trait + registry, the automatic retry policy
//! - machine: the election + application pipeline
//! - storage: transactional storage ports + the in-memory backend
//! - clock / cancel / observability / error: supporting pieces

pub mod cancel;
pub mod clock;
pub mod domain;
pub mod error;
pub mod filters;
pub mod machine;
pub mod observability;
pub mod storage;
