//! Domain model (IDs, states, exceptions, job records, parameter codec).
pub mod exception;
pub mod ids;
pub mod job;
pub mod params;
pub mod state;

pub use exception::{ExceptionInfo, ExceptionRegistry};
pub use ids::{JobId, ServerId, WorkerId};
pub use job::{FilterAttachment, InvocationSpec, Job};
pub use params::ParameterCodec;
pub use state::{names, JobState, StateData};
