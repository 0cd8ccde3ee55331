//! Automatic retry policy: a built-in filter that converts Failed into
//! Scheduled (retry with backoff) or Deleted (give up), and maintains the
//! `"retries"` set alongside.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rand::Rng;
use tracing::{error, warn};

use crate::domain::{names, ExceptionRegistry, JobState, StateData};
use crate::error::StokerError;
use crate::storage::WriteOnlyTransaction;

use super::context::{ApplyStateContext, ElectStateContext};
use super::StateFilter;

/// Set holding the ids of jobs currently scheduled for retry.
pub const RETRIES_SET: &str = "retries";

/// Job parameter tracking how many retries have been attempted. Serialized
/// as a JSON integer; only this filter writes it, always to `prev + 1`.
pub const RETRY_COUNT_PARAMETER: &str = "RetryCount";

/// Reason prefix identifying retry-scheduled states (matched
/// case-insensitively).
const RETRY_REASON_PREFIX: &str = "Retry attempt";

pub const DEFAULT_ATTEMPTS: u32 = 10;

/// What to do with a job whose retry attempts are exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptsExceededAction {
    /// Leave the candidate as Failed and log an error.
    Fail,
    /// Rewrite the candidate to Deleted.
    Delete,
}

type DelayFn = Arc<dyn Fn(u32) -> u64 + Send + Sync>;

#[derive(Clone)]
struct RetryConfig {
    attempts: u32,
    delays_in_seconds: Option<Vec<u64>>,
    delay_by_attempt: DelayFn,
    on_attempts_exceeded: AttemptsExceededAction,
    log_events: bool,
    only_on: Vec<String>,
    except_on: Vec<String>,
}

impl RetryConfig {
    /// Delay before attempt `n` (1-indexed). An explicit schedule clamps to
    /// its last entry; otherwise the configured backoff function decides.
    fn delay_for_attempt(&self, attempt: u32) -> u64 {
        match &self.delays_in_seconds {
            Some(delays) => {
                let index = (attempt as usize - 1).min(delays.len() - 1);
                delays[index]
            }
            None => (self.delay_by_attempt)(attempt),
        }
    }

    /// Allow/deny check against the failed exception's type.
    fn covers(&self, registry: &ExceptionRegistry, exception_type: &str) -> bool {
        if !self.only_on.is_empty()
            && !self
                .only_on
                .iter()
                .any(|base| registry.is_assignable(exception_type, base))
        {
            return false;
        }
        !self
            .except_on
            .iter()
            .any(|base| registry.is_assignable(exception_type, base))
    }
}

/// Default backoff: `(n-1)^4 + 15 + jitter * n` seconds, jitter drawn from
/// `[0, 30)` on the shared thread-local generator.
fn default_delay_in_seconds(attempt: u32) -> u64 {
    let n = attempt as u64;
    let jitter: u64 = rand::thread_rng().gen_range(0..30);
    (n - 1).pow(4) + 15 + jitter * n
}

/// Exception messages in retry reasons are capped at 49 characters plus a
/// single ellipsis; messages of 50 characters or fewer pass verbatim.
fn truncate_message(message: &str) -> String {
    if message.chars().count() <= 50 {
        message.to_string()
    } else {
        let mut truncated: String = message.chars().take(49).collect();
        truncated.push('…');
        truncated
    }
}

fn has_retry_reason(state: &JobState) -> bool {
    state.reason.as_deref().is_some_and(|reason| {
        reason
            .get(..RETRY_REASON_PREFIX.len())
            .is_some_and(|head| head.eq_ignore_ascii_case(RETRY_REASON_PREFIX))
    })
}

/// The built-in retry filter. Implements both the election hook (rewriting
/// Failed candidates) and the application hooks (maintaining the
/// `"retries"` set).
///
/// All configuration is behind a per-instance mutex so the filter can be
/// reconfigured while workers are running.
pub struct AutomaticRetry {
    config: Mutex<RetryConfig>,
    exceptions: Arc<ExceptionRegistry>,
}

impl AutomaticRetry {
    /// Registry order used by this filter. User filters that want to react
    /// to retry decisions register with a higher order.
    pub const ORDER: i32 = 20;

    pub fn new() -> Self {
        Self::with_exception_registry(Arc::new(ExceptionRegistry::new()))
    }

    pub fn with_exception_registry(exceptions: Arc<ExceptionRegistry>) -> Self {
        Self {
            config: Mutex::new(RetryConfig {
                attempts: DEFAULT_ATTEMPTS,
                delays_in_seconds: None,
                delay_by_attempt: Arc::new(default_delay_in_seconds),
                on_attempts_exceeded: AttemptsExceededAction::Fail,
                log_events: true,
                only_on: Vec::new(),
                except_on: Vec::new(),
            }),
            exceptions,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RetryConfig> {
        // A poisoned lock means a panic inside a setter, which cannot leave
        // the plain-data config in a torn state.
        match self.config.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn snapshot(&self) -> RetryConfig {
        self.lock().clone()
    }

    /// Maximum retry count. Zero disables retries.
    pub fn attempts(&self) -> u32 {
        self.snapshot().attempts
    }

    pub fn set_attempts(&self, attempts: u32) {
        self.lock().attempts = attempts;
    }

    /// Explicit delay schedule: the delay for attempt `n` is
    /// `delays[min(n-1, len-1)]`. Rejects empty schedules and negative
    /// entries.
    pub fn set_delays_in_seconds(&self, delays: &[i64]) -> Result<(), StokerError> {
        if delays.is_empty() {
            return Err(StokerError::Configuration(
                "delay schedule must not be empty".to_string(),
            ));
        }
        if delays.iter().any(|&d| d < 0) {
            return Err(StokerError::Configuration(
                "delay values must be non-negative".to_string(),
            ));
        }
        let delays = delays.iter().map(|&d| d as u64).collect();
        self.lock().delays_in_seconds = Some(delays);
        Ok(())
    }

    /// Backoff function used when no explicit schedule is set.
    pub fn set_delay_by_attempt(&self, f: impl Fn(u32) -> u64 + Send + Sync + 'static) {
        self.lock().delay_by_attempt = Arc::new(f);
    }

    pub fn set_on_attempts_exceeded(&self, action: AttemptsExceededAction) {
        self.lock().on_attempts_exceeded = action;
    }

    pub fn set_log_events(&self, log_events: bool) {
        self.lock().log_events = log_events;
    }

    /// Exception-type allow list (assignable-from semantics). Empty means
    /// all exceptions are retried.
    pub fn set_only_on(&self, types: impl IntoIterator<Item = impl Into<String>>) {
        self.lock().only_on = types.into_iter().map(Into::into).collect();
    }

    /// Exception-type deny list. Empty means none are excluded.
    pub fn set_except_on(&self, types: impl IntoIterator<Item = impl Into<String>>) {
        self.lock().except_on = types.into_iter().map(Into::into).collect();
    }
}

impl Default for AutomaticRetry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StateFilter for AutomaticRetry {
    async fn on_state_election(&self, ctx: &mut ElectStateContext<'_>) -> Result<(), StokerError> {
        let StateData::Failed { exception, .. } = &ctx.candidate().data else {
            return Ok(());
        };
        let exception = exception.clone();

        let config = self.snapshot();
        if !config.covers(&self.exceptions, &exception.exception_type) {
            return Ok(());
        }

        let retry_count: u32 = ctx.get_job_parameter(RETRY_COUNT_PARAMETER, true).await?;
        let attempt = retry_count + 1;

        if attempt <= config.attempts {
            ctx.set_job_parameter(RETRY_COUNT_PARAMETER, &attempt)?;

            let delay_seconds = config.delay_for_attempt(attempt);
            let message = truncate_message(&exception.message);
            let reason = format!(
                "{RETRY_REASON_PREFIX} {attempt} of {}: {message}",
                config.attempts
            );

            if config.log_events {
                warn!(
                    job_id = %ctx.job().id,
                    attempt,
                    max_attempts = config.attempts,
                    delay_seconds,
                    error = %message,
                    "scheduling retry"
                );
            }

            let now = ctx.now();
            let next = if delay_seconds > 0 {
                JobState::scheduled(now + chrono::Duration::seconds(delay_seconds as i64), now)
            } else {
                JobState::enqueued(now)
            };
            ctx.set_candidate(next.with_reason(reason));
        } else if config.on_attempts_exceeded == AttemptsExceededAction::Delete {
            let reason = if config.attempts == 0 {
                "Retries were disabled for this job."
            } else {
                "Exceeded the maximum number of retry attempts."
            };

            if config.log_events {
                warn!(
                    job_id = %ctx.job().id,
                    retry_count,
                    max_attempts = config.attempts,
                    error = %exception.message,
                    "removing job after exhausted retries"
                );
            }

            let now = ctx.now();
            ctx.set_candidate(JobState::deleted(Some(exception), now).with_reason(reason));
        } else if config.log_events {
            error!(
                job_id = %ctx.job().id,
                retry_count,
                max_attempts = config.attempts,
                error = %exception.message,
                "job failed; retry attempts exhausted"
            );
        }

        Ok(())
    }

    async fn on_state_applied(
        &self,
        ctx: &ApplyStateContext<'_>,
        txn: &mut dyn WriteOnlyTransaction,
    ) -> Result<(), StokerError> {
        let new_state = ctx.new_state();
        if matches!(new_state.data, StateData::Scheduled { .. }) && has_retry_reason(new_state) {
            txn.add_to_set(RETRIES_SET, ctx.job().id.as_str());
        }
        Ok(())
    }

    async fn on_state_unapplied(
        &self,
        ctx: &ApplyStateContext<'_>,
        txn: &mut dyn WriteOnlyTransaction,
    ) -> Result<(), StokerError> {
        // Also fires for Failed old states that never entered the set;
        // removal is idempotent.
        let old = ctx.old_state_name();
        if names::eq(old, names::SCHEDULED) || names::eq(old, names::FAILED) {
            txn.remove_from_set(RETRIES_SET, ctx.job().id.as_str());
        }
        Ok(())
    }
}
