//! End-to-end job processing through [`JobPipeline`] with in-memory
//! engine, queue and delivery.

mod common;

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use common::{completed_with_images, failed_status, job, pixel_png, write_template, FakeDelivery, FakeEngine, FakeQueue};
use kiln_core::media::MediaKind;
use kiln_pipeline::detector::DetectorConfig;
use kiln_pipeline::engine::EngineStatus;
use kiln_pipeline::error::{PipelineError, TemplateError};
use kiln_pipeline::orchestrator::{JobPipeline, PipelineConfig, ProcessOutcome};
use kiln_pipeline::templates::TemplateStore;
use tokio_util::sync::CancellationToken;

fn config() -> PipelineConfig {
    PipelineConfig {
        detector: DetectorConfig {
            timeout: Duration::from_secs(30),
            early_poll: Duration::from_secs(1),
            late_poll: Duration::from_secs(1),
            ..Default::default()
        },
        max_concurrent_jobs: 2,
        pop_interval: Duration::from_millis(100),
        error_backoff: Duration::from_secs(1),
    }
}

struct Harness {
    pipeline: Arc<JobPipeline>,
    engine: Arc<FakeEngine>,
    queue: Arc<FakeQueue>,
    delivery: Arc<FakeDelivery>,
    _templates: tempfile::TempDir,
}

fn harness(engine: FakeEngine, queue: FakeQueue) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    write_template(dir.path());

    let engine = Arc::new(engine);
    let queue = Arc::new(queue);
    let delivery = Arc::new(FakeDelivery::default());
    let pipeline = JobPipeline::new(
        engine.clone(),
        Arc::new(TemplateStore::new(dir.path())),
        queue.clone(),
        delivery.clone(),
        config(),
    );

    Harness {
        pipeline: Arc::new(pipeline),
        engine,
        queue,
        delivery,
        _templates: dir,
    }
}

fn image_engine(filenames: &[&str]) -> FakeEngine {
    let mut engine = FakeEngine::new([EngineStatus::pending(), completed_with_images(filenames)]);
    for name in filenames {
        engine = engine.with_file(name, pixel_png());
    }
    engine
}

// ---------------------------------------------------------------------------
// Test: a successful job is delivered and submitted per batch item
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn batch_job_is_delivered_to_queue() {
    let h = harness(
        image_engine(&["kiln_a_00001_.png", "kiln_a_00002_.png"]),
        FakeQueue::default(),
    );

    let outcome = h
        .pipeline
        .process(job(&["a", "b"]), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(
        outcome,
        ProcessOutcome::Completed {
            delivered: 2,
            rejected: 0,
            failed: 0
        }
    );

    let mut submissions = h.queue.submissions();
    submissions.sort_by(|x, y| x.job_id.cmp(&y.job_id));
    assert_eq!(submissions.len(), 2);
    assert_eq!(submissions[0].job_id, "a");
    assert_eq!(submissions[0].seed, 100);
    assert_eq!(submissions[1].job_id, "b");
    assert_eq!(submissions[1].seed, 101);
    assert!(submissions.iter().all(|s| s.reference == "R2" && s.media_kind == MediaKind::Image));

    let mut targets = h.delivery.targets.lock().unwrap().clone();
    targets.sort();
    assert_eq!(
        targets,
        vec![Some("https://blob/a".to_string()), Some("https://blob/b".to_string())]
    );
    assert!(h.queue.cancelled_ids().is_empty());
    assert_eq!(h.pipeline.in_flight_count(), 0);
}

// ---------------------------------------------------------------------------
// Test: the compiled workflow carries the job's prompt and prefix
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn submitted_workflow_is_compiled_for_the_job() {
    let h = harness(image_engine(&["kiln_a_00001_.png"]), FakeQueue::default());

    h.pipeline
        .process(job(&["a"]), &CancellationToken::new())
        .await
        .unwrap();

    let submitted = h.engine.submitted.lock().unwrap().clone();
    assert_eq!(submitted.len(), 1);
    let graph = &submitted[0];
    assert_eq!(graph["6"]["inputs"]["text"], "a lighthouse at dusk");
    assert_eq!(graph["3"]["inputs"]["seed"], 100);
    assert_eq!(graph["9"]["inputs"]["filename_prefix"], "kiln_a");
}

// ---------------------------------------------------------------------------
// Test: the same id twice while in flight runs exactly one cycle
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn duplicate_job_is_ignored_while_in_flight() {
    let h = harness(image_engine(&["kiln_a_00001_.png"]), FakeQueue::default());
    let cancel = CancellationToken::new();

    let (first, second) = tokio::join!(
        h.pipeline.process(job(&["a"]), &cancel),
        h.pipeline.process(job(&["a"]), &cancel),
    );

    let mut outcomes = vec![first.unwrap(), second.unwrap()];
    outcomes.sort_by_key(|o| matches!(o, ProcessOutcome::Duplicate));
    assert_matches!(outcomes[0], ProcessOutcome::Completed { delivered: 1, .. });
    assert_eq!(outcomes[1], ProcessOutcome::Duplicate);
    assert_eq!(FakeEngine::count(&h.engine.submits), 1);
    assert_eq!(h.queue.submissions().len(), 1);
}

// ---------------------------------------------------------------------------
// Test: once finished, the same id may be processed again
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn finished_id_can_be_processed_again() {
    let h = harness(image_engine(&["kiln_a_00001_.png"]), FakeQueue::default());
    let cancel = CancellationToken::new();

    h.pipeline.process(job(&["a"]), &cancel).await.unwrap();
    h.pipeline.process(job(&["a"]), &cancel).await.unwrap();

    assert_eq!(FakeEngine::count(&h.engine.submits), 2);
}

// ---------------------------------------------------------------------------
// Test: failures are reported to the queue and clear the in-flight set
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn missing_template_cancels_job() {
    let h = harness(image_engine(&["x.png"]), FakeQueue::default());
    let mut job = job(&["a", "b"]);
    job.model = "no-such-model".into();

    let result = h.pipeline.process(job, &CancellationToken::new()).await;

    assert_matches!(result, Err(PipelineError::Template(TemplateError::NotFound(name))) if name == "no-such-model");
    assert_eq!(h.queue.cancelled_ids(), vec!["a".to_string(), "b".to_string()]);
    assert_eq!(FakeEngine::count(&h.engine.submits), 0);
    assert!(!h.pipeline.is_in_flight("a"));
}

#[tokio::test(start_paused = true)]
async fn engine_failure_cancels_job() {
    let h = harness(
        FakeEngine::new([EngineStatus::pending(), failed_status("bad node")]),
        FakeQueue::default(),
    );

    let result = h.pipeline.process(job(&["a"]), &CancellationToken::new()).await;

    assert_matches!(result, Err(PipelineError::Failed(_)));
    assert_eq!(h.queue.cancelled_ids(), vec!["a".to_string()]);
    assert!(h.queue.submissions().is_empty());
    // Failed executions are already off the engine queue.
    assert_eq!(FakeEngine::count(&h.engine.cancels), 0);
    assert_eq!(h.pipeline.in_flight_count(), 0);
}

// ---------------------------------------------------------------------------
// Test: a timed-out execution is removed from the engine queue
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn timeout_cancels_engine_execution() {
    let h = harness(FakeEngine::new([EngineStatus::pending()]), FakeQueue::default());

    let result = h.pipeline.process(job(&["a"]), &CancellationToken::new()).await;

    assert_matches!(result, Err(PipelineError::TimedOut { .. }));
    assert_eq!(FakeEngine::count(&h.engine.cancels), 1);
    assert_eq!(h.queue.cancelled_ids(), vec!["a".to_string()]);
}

// ---------------------------------------------------------------------------
// Test: undecodable outputs end in NoArtifact
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn corrupt_output_is_no_artifact() {
    let engine = FakeEngine::new([completed_with_images(&["kiln_a_00001_.png"])])
        .with_file("kiln_a_00001_.png", b"not an image".to_vec());
    let h = harness(engine, FakeQueue::default());

    let result = h.pipeline.process(job(&["a"]), &CancellationToken::new()).await;

    assert_matches!(result, Err(PipelineError::NoArtifact(_)));
    assert_eq!(h.queue.cancelled_ids(), vec!["a".to_string()]);
}

// ---------------------------------------------------------------------------
// Test: a queue-side rejection is dropped, not treated as failure
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn rejected_submission_is_dropped() {
    let h = harness(image_engine(&["kiln_a_00001_.png"]), FakeQueue::rejecting());

    let outcome = h
        .pipeline
        .process(job(&["a"]), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(
        outcome,
        ProcessOutcome::Completed {
            delivered: 0,
            rejected: 1,
            failed: 0
        }
    );
    assert!(h.queue.cancelled_ids().is_empty());
}

// ---------------------------------------------------------------------------
// Test: run() pops, processes and drains on shutdown
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn run_processes_popped_jobs_until_cancelled() {
    let h = harness(
        image_engine(&["kiln_a_00001_.png"]),
        FakeQueue::with_jobs([job(&["a"])]),
    );
    h.pipeline.init().await;

    let cancel = CancellationToken::new();
    let runner = tokio::spawn(Arc::clone(&h.pipeline).run(cancel.clone()));

    while h.queue.submissions().is_empty() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    cancel.cancel();
    runner.await.unwrap();

    assert_eq!(h.queue.submissions().len(), 1);
    assert_eq!(h.pipeline.in_flight_count(), 0);
}
