//! The transition pipeline: state election followed by transactional state
//! application.
//!
//! A worker (or scheduler) proposes a candidate state; election filters
//! rewrite it in order; the elected state and every side-effect queued
//! along the way commit through a single write-only transaction.

use std::sync::Arc;

use tracing::error;

use crate::cancel::CancellationToken;
use crate::clock::{Clock, SystemClock};
use crate::domain::{ExceptionInfo, Job, JobState};
use crate::error::StokerError;
use crate::filters::{ApplyStateContext, ElectStateContext, FilterRegistry};
use crate::storage::{StateRecord, Storage, WriteOnlyTransaction};

/// Outcome of a state election: the elected state plus the parameter
/// writes buffered by filters, to be flushed with the commit.
pub struct Election {
    pub state: JobState,
    pub(crate) parameters: Vec<(String, String)>,
}

pub struct StateMachine {
    registry: Arc<FilterRegistry>,
    storage: Arc<dyn Storage>,
    clock: Arc<dyn Clock>,
}

impl StateMachine {
    pub fn new(registry: Arc<FilterRegistry>, storage: Arc<dyn Storage>) -> Self {
        Self::with_clock(registry, storage, Arc::new(SystemClock))
    }

    pub fn with_clock(
        registry: Arc<FilterRegistry>,
        storage: Arc<dyn Storage>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            registry,
            storage,
            clock,
        }
    }

    /// Run the whole pipeline: elect, then apply and commit. Cancellation
    /// observed before the commit aborts without writing; once the commit
    /// has gone through, the transition stands.
    pub async fn transition(
        &self,
        job: &Job,
        proposed: JobState,
        token: &CancellationToken,
    ) -> Result<JobState, StokerError> {
        let election = self.elect(job, proposed, token).await?;

        if token.is_canceled() {
            return Err(StokerError::Canceled);
        }

        let mut txn = self.storage.begin();
        self.apply_to(txn.as_mut(), job, &election).await?;
        txn.commit().await?;

        Ok(election.state)
    }

    /// Run the election filters over the proposed state.
    ///
    /// A filter failure is logged and, at most once per election, replaces
    /// the candidate with a Failed state carrying the raised exception, so
    /// downstream filters (the retry policy in particular) can react to it.
    /// Further failures in the same election are logged and swallowed.
    pub async fn elect(
        &self,
        job: &Job,
        proposed: JobState,
        token: &CancellationToken,
    ) -> Result<Election, StokerError> {
        let filters = self.registry.merged(&job.invocation.filters);
        let mut ctx =
            ElectStateContext::new(job, self.storage.as_ref(), self.clock.as_ref(), proposed);

        for filter in &filters {
            if token.is_canceled() {
                return Err(StokerError::Canceled);
            }

            if let Err(err) = filter.on_state_election(&mut ctx).await {
                error!(job_id = %job.id, error = %err, "state election filter raised");
                if !ctx.faulted() {
                    let exception = ExceptionInfo::from_error(&err);
                    ctx.replace_after_fault(JobState::failed(exception, self.clock.now()));
                }
            }
        }

        let (state, parameters) = ctx.into_parts();
        Ok(Election { state, parameters })
    }

    /// Queue a full state application onto `txn`: unapply hooks for the
    /// state being left, the primary state write, apply hooks for the state
    /// being entered, then the parameter writes buffered during election.
    /// Everything lands in the same transaction; the caller commits.
    pub async fn apply_to(
        &self,
        txn: &mut dyn WriteOnlyTransaction,
        job: &Job,
        election: &Election,
    ) -> Result<(), StokerError> {
        let filters = self.registry.merged(&job.invocation.filters);
        let ctx = ApplyStateContext::new(job, &job.state_name, &election.state);

        for filter in &filters {
            filter.on_state_unapplied(&ctx, txn).await?;
        }

        txn.set_job_state(job, StateRecord::from_state(&election.state, self.clock.now())?);

        for filter in &filters {
            filter.on_state_applied(&ctx, txn).await?;
        }

        for (name, value) in &election.parameters {
            txn.set_job_parameter(&job.id, name, value);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::domain::{
        names, ExceptionRegistry, InvocationSpec, JobId, ServerId, StateData, WorkerId,
    };
    use crate::filters::{
        AttemptsExceededAction, AutomaticRetry, StateFilter, RETRIES_SET, RETRY_COUNT_PARAMETER,
    };
    use crate::storage::InMemoryStorage;
    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone, Utc};

    fn test_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    fn test_clock() -> Arc<FixedClock> {
        Arc::new(FixedClock::new(test_now()))
    }

    fn io_failure() -> ExceptionInfo {
        ExceptionInfo::new("IoException", "disk full")
    }

    fn retry_registry(retry: Arc<AutomaticRetry>) -> Arc<FilterRegistry> {
        let mut registry = FilterRegistry::new();
        registry.add(AutomaticRetry::ORDER, retry);
        Arc::new(registry)
    }

    async fn storage_with_job() -> (Arc<InMemoryStorage>, Job) {
        let storage = Arc::new(InMemoryStorage::with_clock(test_clock()));
        let job = storage
            .create_job(
                InvocationSpec::new("send_email", serde_json::json!(["a@b.c"])),
                JobState::enqueued(test_now()),
            )
            .await
            .unwrap();
        (storage, job)
    }

    async fn set_raw_parameter(storage: &InMemoryStorage, id: &JobId, name: &str, value: &str) {
        let mut txn = storage.begin();
        txn.set_job_parameter(id, name, value);
        txn.commit().await.unwrap();
    }

    async fn retry_count(storage: &InMemoryStorage, id: &JobId) -> u32 {
        storage
            .get_job_parameter(id, RETRY_COUNT_PARAMETER)
            .await
            .unwrap()
            .map(|raw| raw.parse().unwrap())
            .unwrap_or(0)
    }

    #[tokio::test]
    async fn first_attempt_retry_schedules_with_backoff() {
        let (storage, job) = storage_with_job().await;
        let machine = StateMachine::with_clock(
            retry_registry(Arc::new(AutomaticRetry::new())),
            storage.clone(),
            test_clock(),
        );

        let elected = machine
            .transition(
                &job,
                JobState::failed(io_failure(), test_now()),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let StateData::Scheduled { enqueue_at, .. } = elected.data else {
            panic!("expected Scheduled, got {}", elected.name());
        };
        let delay = (enqueue_at - test_now()).num_seconds();
        assert!((15..45).contains(&delay), "unexpected delay {delay}s");
        assert_eq!(
            elected.reason.as_deref(),
            Some("Retry attempt 1 of 10: disk full")
        );

        assert_eq!(retry_count(&storage, &job.id).await, 1);
        assert!(storage.set_contains(RETRIES_SET, job.id.as_str()).await);
    }

    #[tokio::test]
    async fn exhausted_attempts_with_fail_leave_state_failed() {
        let (storage, job) = storage_with_job().await;
        set_raw_parameter(&storage, &job.id, RETRY_COUNT_PARAMETER, "10").await;
        let job = storage.get_job(&job.id).await.unwrap();

        let machine = StateMachine::with_clock(
            retry_registry(Arc::new(AutomaticRetry::new())),
            storage.clone(),
            test_clock(),
        );

        let elected = machine
            .transition(
                &job,
                JobState::failed(io_failure(), test_now()),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(elected.name(), names::FAILED);
        assert_eq!(retry_count(&storage, &job.id).await, 10);
        assert!(!storage.set_contains(RETRIES_SET, job.id.as_str()).await);
    }

    #[tokio::test]
    async fn exhausted_attempts_with_delete_rewrite_to_deleted() {
        let (storage, job) = storage_with_job().await;
        set_raw_parameter(&storage, &job.id, RETRY_COUNT_PARAMETER, "10").await;
        let job = storage.get_job(&job.id).await.unwrap();

        let retry = Arc::new(AutomaticRetry::new());
        retry.set_on_attempts_exceeded(AttemptsExceededAction::Delete);
        let machine =
            StateMachine::with_clock(retry_registry(retry), storage.clone(), test_clock());

        let elected = machine
            .transition(
                &job,
                JobState::failed(io_failure(), test_now()),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(elected.name(), names::DELETED);
        assert_eq!(
            elected.reason.as_deref(),
            Some("Exceeded the maximum number of retry attempts.")
        );
        let StateData::Deleted { exception, .. } = elected.data else {
            panic!("expected Deleted payload");
        };
        assert_eq!(exception.unwrap().exception_type, "IoException");
    }

    #[tokio::test]
    async fn disabled_retries_with_delete_use_dedicated_reason() {
        let (storage, job) = storage_with_job().await;

        let retry = Arc::new(AutomaticRetry::new());
        retry.set_attempts(0);
        retry.set_on_attempts_exceeded(AttemptsExceededAction::Delete);
        let machine =
            StateMachine::with_clock(retry_registry(retry), storage.clone(), test_clock());

        let elected = machine
            .transition(
                &job,
                JobState::failed(io_failure(), test_now()),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(elected.name(), names::DELETED);
        assert_eq!(
            elected.reason.as_deref(),
            Some("Retries were disabled for this job.")
        );
    }

    struct Faulting {
        exception_type: &'static str,
    }

    #[async_trait]
    impl StateFilter for Faulting {
        async fn on_state_election(
            &self,
            _ctx: &mut ElectStateContext<'_>,
        ) -> Result<(), StokerError> {
            Err(StokerError::filter(self.exception_type, "bad"))
        }
    }

    #[tokio::test]
    async fn filter_fault_becomes_failed_and_retry_reacts() {
        let (storage, job) = storage_with_job().await;

        let mut registry = FilterRegistry::new();
        registry.add(
            5,
            Arc::new(Faulting {
                exception_type: "InvalidOperationException",
            }),
        );
        registry.add(AutomaticRetry::ORDER, Arc::new(AutomaticRetry::new()));
        let machine =
            StateMachine::with_clock(Arc::new(registry), storage.clone(), test_clock());

        let elected = machine
            .transition(
                &job,
                JobState::enqueued(test_now()),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(elected.name(), names::SCHEDULED);
        assert_eq!(
            elected.reason.as_deref(),
            Some("Retry attempt 1 of 10: bad")
        );
        assert_eq!(retry_count(&storage, &job.id).await, 1);
    }

    #[tokio::test]
    async fn candidate_is_replaced_at_most_once_per_election() {
        let (storage, job) = storage_with_job().await;

        let mut registry = FilterRegistry::new();
        registry.add(
            1,
            Arc::new(Faulting {
                exception_type: "FirstException",
            }),
        );
        registry.add(
            2,
            Arc::new(Faulting {
                exception_type: "SecondException",
            }),
        );
        let machine =
            StateMachine::with_clock(Arc::new(registry), storage.clone(), test_clock());

        let election = machine
            .elect(
                &job,
                JobState::enqueued(test_now()),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let StateData::Failed { exception, .. } = &election.state.data else {
            panic!("expected Failed candidate");
        };
        assert_eq!(exception.exception_type, "FirstException");
    }

    #[tokio::test]
    async fn allow_list_mismatch_skips_the_rewrite() {
        let (storage, job) = storage_with_job().await;

        let retry = Arc::new(AutomaticRetry::new());
        retry.set_only_on(["TimeoutException"]);
        let machine =
            StateMachine::with_clock(retry_registry(retry), storage.clone(), test_clock());

        let elected = machine
            .transition(
                &job,
                JobState::failed(
                    ExceptionInfo::new("ArgumentException", "bad argument"),
                    test_now(),
                ),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(elected.name(), names::FAILED);
        assert_eq!(retry_count(&storage, &job.id).await, 0);
        assert!(!storage.set_contains(RETRIES_SET, job.id.as_str()).await);
    }

    #[tokio::test]
    async fn deny_list_match_skips_the_rewrite() {
        let (storage, job) = storage_with_job().await;

        let mut exceptions = ExceptionRegistry::new();
        exceptions.register_subtype("DiskFullException", "IoException");
        let retry = Arc::new(AutomaticRetry::with_exception_registry(Arc::new(exceptions)));
        retry.set_except_on(["IoException"]);
        let machine =
            StateMachine::with_clock(retry_registry(retry), storage.clone(), test_clock());

        let elected = machine
            .transition(
                &job,
                JobState::failed(
                    ExceptionInfo::new("DiskFullException", "disk full"),
                    test_now(),
                ),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(elected.name(), names::FAILED);
        assert_eq!(retry_count(&storage, &job.id).await, 0);
    }

    #[tokio::test]
    async fn leaving_retry_scheduled_removes_from_retries_set() {
        let (storage, job) = storage_with_job().await;
        let machine = StateMachine::with_clock(
            retry_registry(Arc::new(AutomaticRetry::new())),
            storage.clone(),
            test_clock(),
        );
        let token = CancellationToken::new();

        machine
            .transition(&job, JobState::failed(io_failure(), test_now()), &token)
            .await
            .unwrap();
        assert!(storage.set_contains(RETRIES_SET, job.id.as_str()).await);

        let job = storage.get_job(&job.id).await.unwrap();
        let elected = machine
            .transition(
                &job,
                JobState::processing(
                    ServerId::new("server-1"),
                    WorkerId::new("worker-1"),
                    test_now(),
                ),
                &token,
            )
            .await
            .unwrap();

        assert_eq!(elected.name(), names::PROCESSING);
        assert!(!storage.set_contains(RETRIES_SET, job.id.as_str()).await);
    }

    struct ReasonSetter(&'static str);

    #[async_trait]
    impl StateFilter for ReasonSetter {
        async fn on_state_election(
            &self,
            ctx: &mut ElectStateContext<'_>,
        ) -> Result<(), StokerError> {
            let next = ctx.candidate().clone().with_reason(self.0);
            ctx.set_candidate(next);
            Ok(())
        }
    }

    #[tokio::test]
    async fn later_filters_observe_and_override_earlier_rewrites() {
        let (storage, job) = storage_with_job().await;

        let mut registry = FilterRegistry::new();
        registry.add(10, Arc::new(ReasonSetter("A")));
        registry.add(20, Arc::new(ReasonSetter("B")));
        let machine = StateMachine::with_clock(Arc::new(registry), storage, test_clock());

        let election = machine
            .elect(
                &job,
                JobState::enqueued(test_now()),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(election.state.reason.as_deref(), Some("B"));
    }

    #[tokio::test]
    async fn method_level_filters_merge_into_the_run() {
        let (storage, mut job) = storage_with_job().await;
        job.invocation = job
            .invocation
            .clone()
            .with_filter(10, Arc::new(ReasonSetter("method")));

        let mut registry = FilterRegistry::new();
        registry.add(10, Arc::new(ReasonSetter("global")));
        let machine = StateMachine::with_clock(Arc::new(registry), storage, test_clock());

        let election = machine
            .elect(
                &job,
                JobState::enqueued(test_now()),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        // Equal order: the method-level filter runs later, so it wins.
        assert_eq!(election.state.reason.as_deref(), Some("method"));
    }

    struct ParameterProbe;

    #[async_trait]
    impl StateFilter for ParameterProbe {
        async fn on_state_election(
            &self,
            ctx: &mut ElectStateContext<'_>,
        ) -> Result<(), StokerError> {
            ctx.set_job_parameter("Checkpoint", &7u32)?;

            // Fresh reads observe the buffered write; stale reads come from
            // the snapshot taken when the job was loaded.
            let fresh: u32 = ctx.get_job_parameter("Checkpoint", false).await?;
            let stale: u32 = ctx.get_job_parameter("Checkpoint", true).await?;
            assert_eq!(fresh, 7);
            assert_eq!(stale, 0);
            Ok(())
        }
    }

    #[tokio::test]
    async fn buffered_parameters_flush_with_the_commit() {
        let (storage, job) = storage_with_job().await;

        let mut registry = FilterRegistry::new();
        registry.add(10, Arc::new(ParameterProbe));
        let machine =
            StateMachine::with_clock(Arc::new(registry), storage.clone(), test_clock());

        machine
            .transition(
                &job,
                JobState::enqueued(test_now()),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(
            storage
                .get_job_parameter(&job.id, "Checkpoint")
                .await
                .unwrap()
                .as_deref(),
            Some("7")
        );
    }

    #[tokio::test]
    async fn cancellation_before_commit_writes_nothing() {
        let (storage, job) = storage_with_job().await;
        let machine = StateMachine::with_clock(
            retry_registry(Arc::new(AutomaticRetry::new())),
            storage.clone(),
            test_clock(),
        );

        let token = CancellationToken::new();
        token.cancel();

        let err = machine
            .transition(&job, JobState::failed(io_failure(), test_now()), &token)
            .await
            .unwrap_err();
        assert!(matches!(err, StokerError::Canceled));

        let current = storage.get_current_state(&job.id).await.unwrap();
        assert_eq!(current.name, names::ENQUEUED);
        assert_eq!(retry_count(&storage, &job.id).await, 0);
    }

    #[tokio::test]
    async fn concurrent_transitions_serialize_at_commit() {
        let (storage, job) = storage_with_job().await;
        let machine = StateMachine::with_clock(
            retry_registry(Arc::new(AutomaticRetry::new())),
            storage.clone(),
            test_clock(),
        );
        let token = CancellationToken::new();

        // Both workers hold the same snapshot; the loser's commit is
        // rejected and it must re-run with fresh job data.
        let stale = job.clone();
        machine
            .transition(&job, JobState::failed(io_failure(), test_now()), &token)
            .await
            .unwrap();

        let err = machine
            .transition(
                &stale,
                JobState::succeeded(None, 10, 5, test_now()),
                &token,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StokerError::Storage(_)));
    }

    #[tokio::test]
    async fn reapplying_after_a_failed_commit_is_idempotent() {
        let (storage, job) = storage_with_job().await;
        let machine = StateMachine::with_clock(
            retry_registry(Arc::new(AutomaticRetry::new())),
            storage.clone(),
            test_clock(),
        );
        let token = CancellationToken::new();

        let election = machine
            .elect(&job, JobState::failed(io_failure(), test_now()), &token)
            .await
            .unwrap();

        // First transaction is lost before commit (simulated storage
        // failure); the worker re-applies the same election and commits.
        let mut lost = storage.begin();
        machine.apply_to(lost.as_mut(), &job, &election).await.unwrap();
        drop(lost);

        let mut txn = storage.begin();
        machine.apply_to(txn.as_mut(), &job, &election).await.unwrap();
        txn.commit().await.unwrap();

        let current = storage.get_current_state(&job.id).await.unwrap();
        assert_eq!(current.name, names::SCHEDULED);
        assert_eq!(retry_count(&storage, &job.id).await, 1);
        assert!(storage.set_contains(RETRIES_SET, job.id.as_str()).await);
        assert_eq!(storage.state_history(&job.id).await.unwrap().len(), 2);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        #[derive(Debug, Clone, Copy)]
        enum Step {
            Fail,
            Succeed,
            Process,
            Enqueue,
            Delete,
        }

        fn any_step() -> impl Strategy<Value = Step> {
            prop::sample::select(vec![
                Step::Fail,
                Step::Succeed,
                Step::Process,
                Step::Enqueue,
                Step::Delete,
            ])
        }

        async fn run_walk(steps: Vec<Step>) {
            let storage = Arc::new(InMemoryStorage::with_clock(test_clock()));
            let job = storage
                .create_job(
                    InvocationSpec::new("walk", serde_json::json!([])),
                    JobState::enqueued(test_now()),
                )
                .await
                .unwrap();
            let machine = StateMachine::with_clock(
                retry_registry(Arc::new(AutomaticRetry::new())),
                storage.clone(),
                test_clock(),
            );
            let token = CancellationToken::new();

            let mut last_count = 0u32;
            for step in steps {
                let snapshot = storage.get_job(&job.id).await.unwrap();
                let proposed = match step {
                    Step::Fail => JobState::failed(io_failure(), test_now()),
                    Step::Succeed => JobState::succeeded(None, 10, 5, test_now()),
                    Step::Process => JobState::processing(
                        ServerId::new("server-1"),
                        WorkerId::new("worker-1"),
                        test_now(),
                    ),
                    Step::Enqueue => JobState::enqueued(test_now()),
                    Step::Delete => JobState::deleted(None, test_now()),
                };
                machine.transition(&snapshot, proposed, &token).await.unwrap();

                // Retry monotonicity.
                let count = retry_count(&storage, &job.id).await;
                assert!(count >= last_count, "RetryCount went {last_count} -> {count}");
                last_count = count;

                // Retry-set coherence.
                let current = storage.get_current_state(&job.id).await.unwrap();
                let retry_scheduled = names::eq(&current.name, names::SCHEDULED)
                    && current.reason.as_deref().is_some_and(|r| {
                        r.get(.."Retry attempt".len())
                            .is_some_and(|head| head.eq_ignore_ascii_case("Retry attempt"))
                    });
                assert_eq!(
                    storage.set_contains(RETRIES_SET, job.id.as_str()).await,
                    retry_scheduled,
                    "retries set out of sync after {step:?}"
                );
            }
        }

        proptest! {
            #![proptest_config(ProptestConfig {
                cases: 64,
                ..ProptestConfig::default()
            })]

            #[test]
            fn random_transition_walks_hold_the_retry_invariants(
                steps in prop::collection::vec(any_step(), 1..12)
            ) {
                let rt = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .unwrap();
                rt.block_on(run_walk(steps));
            }
        }
    }
}
