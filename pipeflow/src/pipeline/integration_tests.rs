//! End-to-end tests for pipelines with steps and barriers.

use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use super::*;
use crate::core::{State, StateKind};
use crate::errors::BoxError;
use crate::events::CollectingEventSink;
use crate::repository::{InMemoryRepository, Repository};
use crate::testing::{assert_failed_with, assert_succeeded, RecordingListener};

fn repository() -> Arc<InMemoryRepository<Job<u32>>> {
    Arc::new(InMemoryRepository::new())
}

fn build(builder: PipelineBuilder<u32>, repository: &Arc<InMemoryRepository<Job<u32>>>) -> Pipeline<u32> {
    builder.build(Arc::clone(repository) as Arc<dyn MutableRepository<Job<u32>>>)
}

async fn eventually(condition: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("condition never held");
}

fn recording_batches(seen: &Arc<Mutex<Vec<Vec<u32>>>>, factor: u32) -> CountedBarrierSpec<u32> {
    let seen = Arc::clone(seen);
    CountedBarrierSpec::new().with_aggregator(move |batch: Vec<u32>| {
        seen.lock().push(batch.clone());
        async move { Ok::<_, BoxError>(batch.into_iter().map(|x| x * factor).collect()) }
    })
}

#[tokio::test]
async fn test_steps_transform_data() {
    let repository = repository();
    let pipeline = build(
        PipelineBuilder::new("math")
            .step("double", 1, |x: u32| async move { Ok(x * 2) })
            .step("increment", 1, |x: u32| async move { Ok(x + 1) }),
        &repository,
    );

    let job = pipeline.push(20, Some("answers")).unwrap();
    assert_eq!(job.state().kind(), StateKind::Scheduled);
    job.start();

    assert_succeeded(&job.wait_for_terminal().await);
    assert_eq!(job.result(), Some(41));
    assert_eq!(repository.get_by_tag(Some("answers")).len(), 1);
    assert_eq!(repository.get(job.id()).unwrap().position, 0);
}

#[tokio::test]
async fn test_empty_pipeline_returns_input() {
    let pipeline = build(PipelineBuilder::new("empty"), &repository());
    let job = pipeline.push(9, None).unwrap();
    job.start();

    assert_succeeded(&job.wait_for_terminal().await);
    assert_eq!(job.result(), Some(9));
}

#[tokio::test]
async fn test_manual_barrier_holds_jobs_until_lifted() {
    let pipeline = build(
        PipelineBuilder::new("gated")
            .step("square", 1, |x: u32| async move { Ok(x * x) })
            .manual_barrier("gate")
            .step("increment", 1, |x: u32| async move { Ok(x + 1) }),
        &repository(),
    );
    let gate = Arc::clone(&pipeline.manual_barriers()[0]);

    let jobs: Vec<_> = (1..=3).map(|x| pipeline.push(x, None).unwrap()).collect();
    jobs.iter().for_each(Job::start);
    eventually(|| gate.arrival_count() == 3).await;
    assert!(jobs.iter().all(|job| !job.state().is_terminal()));

    gate.lift();
    let mut results = Vec::new();
    for job in &jobs {
        assert_succeeded(&job.wait_for_terminal().await);
        results.push(job.result().unwrap());
    }
    assert_eq!(results, vec![2, 5, 10]);

    let late = pipeline.push(4, None).unwrap();
    late.start();
    assert_succeeded(&late.wait_for_terminal().await);
    assert_eq!(late.result(), Some(17));
}

#[tokio::test]
async fn test_counted_barrier_aggregates_in_submission_order() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let pipeline = build(
        PipelineBuilder::new("batched").counted_barrier("batch", recording_batches(&seen, 10).with_capacity(3)),
        &repository(),
    );

    let jobs: Vec<_> = [3, 1, 2].into_iter().map(|x| pipeline.push(x, None).unwrap()).collect();
    for job in jobs.iter().rev() {
        job.start();
    }

    let mut results = Vec::new();
    for job in &jobs {
        assert_succeeded(&job.wait_for_terminal().await);
        results.push(job.result().unwrap());
    }
    assert_eq!(results, vec![30, 10, 20]);
    assert_eq!(*seen.lock(), vec![vec![3, 1, 2]]);
}

#[tokio::test]
async fn test_failed_job_is_counted_as_absent() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let pipeline = build(
        PipelineBuilder::new("lossy")
            .step("reject-zero", 2, |x: u32| async move {
                if x == 0 {
                    return Err::<u32, BoxError>("zero is not allowed".into());
                }
                Ok(x)
            })
            .counted_barrier("batch", recording_batches(&seen, 2).with_capacity(3)),
        &repository(),
    );
    let batch = Arc::clone(&pipeline.counted_barriers()[0]);

    let jobs: Vec<_> = [4, 0, 5].into_iter().map(|x| pipeline.push(x, None).unwrap()).collect();
    jobs.iter().for_each(Job::start);

    assert_failed_with(&jobs[1].wait_for_terminal().await, 2);
    assert_succeeded(&jobs[0].wait_for_terminal().await);
    assert_succeeded(&jobs[2].wait_for_terminal().await);
    assert_eq!(jobs[0].result(), Some(8));
    assert_eq!(jobs[2].result(), Some(10));
    assert_eq!(batch.error_count(), 1);
    assert_eq!(*seen.lock(), vec![vec![4, 5]]);
}

#[tokio::test]
async fn test_counted_barrier_retries_after_failed_aggregation() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let sink = Arc::new(CollectingEventSink::new());
    let spec = CountedBarrierSpec::new()
        .with_capacity(2)
        .with_attempts(2)
        .with_aggregator(move |batch: Vec<u32>| {
            let first = counter.fetch_add(1, Ordering::SeqCst) == 0;
            async move {
                if first {
                    return Err::<Vec<u32>, BoxError>("warming up".into());
                }
                Ok(batch.into_iter().map(|x| x + 100).collect())
            }
        });
    let pipeline = build(
        PipelineBuilder::new("retrying")
            .with_event_sink(sink.clone())
            .counted_barrier("batch", spec),
        &repository(),
    );

    let a = pipeline.push(1, None).unwrap();
    let b = pipeline.push(2, None).unwrap();
    let recorder = RecordingListener::new();
    a.subscribe(recorder.clone());
    a.start();
    b.start();

    assert_succeeded(&a.wait_for_terminal().await);
    assert_succeeded(&b.wait_for_terminal().await);
    assert_eq!((a.result(), b.result()), (Some(101), Some(102)));
    assert_eq!(recorder.count_of(StateKind::AttemptFailed), 1);
    assert_eq!(sink.payloads_of("barrier.release_failed").len(), 1);
    assert_eq!(sink.payloads_of("barrier.released").len(), 1);
}

#[tokio::test]
async fn test_interrupting_a_counted_sibling_interrupts_all() {
    let pipeline = build(
        PipelineBuilder::new("fragile").counted_barrier("batch", CountedBarrierSpec::new().with_capacity(3)),
        &repository(),
    );
    let batch = Arc::clone(&pipeline.counted_barriers()[0]);

    let jobs: Vec<_> = (0..3).map(|x| pipeline.push(x, None).unwrap()).collect();
    jobs[0].start();
    jobs[1].start();
    eventually(|| batch.arrival_count() == 2).await;

    jobs[0].interrupt();
    jobs[2].start();

    for job in &jobs {
        let state = job.wait_for_terminal().await;
        assert!(state.is_failure());
        assert!(state.causes().iter().all(JobError::is_interruption));
    }
    assert!(batch.is_interrupted());
}

#[tokio::test]
async fn test_interrupt_between_barrier_retries_cascades_to_siblings() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let spec = CountedBarrierSpec::new()
        .with_capacity(2)
        .with_attempts(3)
        .with_aggregator(move |batch: Vec<u32>| {
            let first = counter.fetch_add(1, Ordering::SeqCst) == 0;
            async move {
                if first {
                    return Err::<Vec<u32>, BoxError>("warming up".into());
                }
                Ok(batch)
            }
        });
    let pipeline = build(PipelineBuilder::new("retrying").counted_barrier("batch", spec), &repository());
    let batch = Arc::clone(&pipeline.counted_barriers()[0]);

    let a = pipeline.push(1, None).unwrap();
    let b = pipeline.push(2, None).unwrap();
    let handle = a.clone();
    a.subscribe(move |_: Uuid, _: &State, next: &State| -> Result<(), BoxError> {
        if next.kind() == StateKind::AttemptFailed {
            handle.interrupt();
        }
        Ok(())
    });
    a.start();
    b.start();

    let first = a.wait_for_terminal().await;
    assert!(first.is_failure());
    assert!(first.causes().last().is_some_and(JobError::is_interruption));

    let second = tokio::time::timeout(Duration::from_secs(5), b.wait_for_terminal())
        .await
        .expect("sibling is still waiting at the barrier");
    assert!(second.is_failure());
    assert!(second.causes().last().is_some_and(JobError::is_interruption));
    assert!(batch.is_interrupted());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_interrupting_a_manual_sibling_leaves_others_waiting() {
    let pipeline = build(PipelineBuilder::new("gated").manual_barrier("gate"), &repository());
    let gate = Arc::clone(&pipeline.manual_barriers()[0]);

    let a = pipeline.push(1, None).unwrap();
    let b = pipeline.push(2, None).unwrap();
    a.start();
    b.start();
    eventually(|| gate.arrival_count() == 2).await;

    a.interrupt();
    assert!(a.wait_for_terminal().await.is_failure());
    assert!(!b.state().is_terminal());

    gate.lift();
    assert_succeeded(&b.wait_for_terminal().await);
    assert_eq!(b.result(), Some(2));
}

#[tokio::test(start_paused = true)]
async fn test_lift_when_releases_once_everyone_arrived() {
    let pipeline = build(PipelineBuilder::new("polled").manual_barrier("gate"), &repository());
    let gate = Arc::clone(&pipeline.manual_barriers()[0]);
    let watched = Arc::clone(&gate);
    let poller = gate.lift_when(Duration::from_millis(50), move || {
        let watched = Arc::clone(&watched);
        async move { watched.arrival_count() == 2 }
    });

    let a = pipeline.push(1, None).unwrap();
    let b = pipeline.push(2, None).unwrap();
    a.start();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!gate.is_lifted());

    b.start();
    assert_succeeded(&a.wait_for_terminal().await);
    assert_succeeded(&b.wait_for_terminal().await);
    assert!(poller.is_finished());
}
