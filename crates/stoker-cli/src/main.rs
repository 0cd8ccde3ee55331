use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use stoker_core::cancel::CancellationToken;
use stoker_core::domain::{ExceptionInfo, InvocationSpec, JobState, ServerId, WorkerId};
use stoker_core::filters::{AutomaticRetry, FilterRegistry, RETRIES_SET};
use stoker_core::machine::StateMachine;
use stoker_core::storage::{InMemoryStorage, Storage};

/// Initialize logging for the process. Configurable via RUST_LOG.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

#[tokio::main]
async fn main() {
    init_tracing();

    // (A) Storage, filter registry with the retry policy, state machine.
    let storage = Arc::new(InMemoryStorage::new());
    let retry = Arc::new(AutomaticRetry::new());
    retry.set_attempts(3);
    retry.set_delays_in_seconds(&[1, 5, 30]).expect("valid schedule");

    let mut registry = FilterRegistry::new();
    registry.add(AutomaticRetry::ORDER, retry);

    let machine = StateMachine::new(Arc::new(registry), storage.clone());
    let token = CancellationToken::new();

    // (B) Enqueue a job, the way an external client would.
    let now = chrono::Utc::now();
    let job = storage
        .create_job(
            InvocationSpec::new("send_email", serde_json::json!(["user@example.com"])),
            JobState::enqueued(now),
        )
        .await
        .expect("create job");
    println!("enqueued job: {}", job.id);

    // (C) Simulate a worker: lease the job, start processing, then report a
    // failure and let the election pipeline decide what happens next.
    let snapshot = storage.get_job(&job.id).await.expect("job exists");
    machine
        .transition(
            &snapshot,
            JobState::processing(ServerId::generate(), WorkerId::generate(), chrono::Utc::now()),
            &token,
        )
        .await
        .expect("transition to Processing");

    let snapshot = storage.get_job(&job.id).await.expect("job exists");
    let failure = ExceptionInfo::new("SmtpException", "connection refused");
    let elected = machine
        .transition(
            &snapshot,
            JobState::failed(failure, chrono::Utc::now()),
            &token,
        )
        .await
        .expect("transition out of Processing");

    println!(
        "proposed Failed, elected {} (reason: {})",
        elected.name(),
        elected.reason.as_deref().unwrap_or("-")
    );
    println!(
        "job in retries set: {}",
        storage.set_contains(RETRIES_SET, job.id.as_str()).await
    );

    // (D) Final census.
    let counts = storage.counts_by_state().await;
    println!(
        "counts: enqueued={} scheduled={} processing={} succeeded={} failed={} deleted={}",
        counts.enqueued,
        counts.scheduled,
        counts.processing,
        counts.succeeded,
        counts.failed,
        counts.deleted
    );
}
