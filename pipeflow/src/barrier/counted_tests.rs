//! Tests for the counted barrier controller.

use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use super::*;
use crate::dispatch::TokioDispatcher;
use crate::errors::{cause_chain, BarrierError, BoxError};
use crate::events::CollectingEventSink;

type Arrival = JoinHandle<Result<Option<u32>, BarrierError>>;

fn controller(capacity: usize) -> CountedBarrierController<u32> {
    CountedBarrierController::new(Arc::new(TokioDispatcher::current()))
        .with_name("batch")
        .with_capacity(capacity)
}

fn register(controller: &Arc<CountedBarrierController<u32>>) -> Arc<Barrier<u32>> {
    Barrier::new(Arc::clone(controller) as Arc<dyn BarrierController<u32>>)
}

fn arrive(barrier: &Arc<Barrier<u32>>, input: u32) -> Arrival {
    let barrier = Arc::clone(barrier);
    tokio::spawn(async move { barrier.invoke(input).await })
}

async fn outcome(arrival: Arrival) -> Result<Option<u32>, BarrierError> {
    arrival.await.unwrap()
}

async fn wait_until(condition: impl Fn() -> bool) {
    for _ in 0..1_000 {
        if condition() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition never held");
}

fn plus_ten(seen: &Arc<Mutex<Vec<Vec<u32>>>>) -> impl Aggregator<u32> {
    let seen = Arc::clone(seen);
    FnAggregator::new(move |batch: Vec<u32>| {
        seen.lock().push(batch.clone());
        async move { Ok::<_, BoxError>(batch.into_iter().map(|x| x + 10).collect()) }
    })
}

#[tokio::test]
async fn test_outputs_follow_their_inputs() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let controller = Arc::new(controller(3).with_aggregator(plus_ten(&seen)));
    let b3 = register(&controller);
    let b1 = register(&controller);
    let b2 = register(&controller);

    let h3 = arrive(&b3, 3);
    let h1 = arrive(&b1, 1);
    let h2 = arrive(&b2, 2);

    assert_eq!(outcome(h3).await.unwrap(), Some(13));
    assert_eq!(outcome(h1).await.unwrap(), Some(11));
    assert_eq!(outcome(h2).await.unwrap(), Some(12));
    assert_eq!(*seen.lock(), vec![vec![1, 2, 3]]);
}

#[tokio::test]
async fn test_release_without_aggregator_passes_inputs_through() {
    let controller = Arc::new(controller(2));
    let a = register(&controller);
    let b = register(&controller);

    let ha = arrive(&a, 7);
    let hb = arrive(&b, 8);

    assert_eq!(outcome(ha).await.unwrap(), Some(7));
    assert_eq!(outcome(hb).await.unwrap(), Some(8));
    assert_eq!(a.status(), BarrierStatus::Lifted);
}

#[tokio::test]
async fn test_absentee_completes_the_count() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let controller = Arc::new(controller(3).with_aggregator(plus_ten(&seen)));
    let a = register(&controller);
    let b = register(&controller);
    let _absent = register(&controller);

    let ha = arrive(&a, 5);
    let hb = arrive(&b, 4);
    wait_until(|| controller.arrival_count() == 2).await;
    assert!(!ha.is_finished());

    controller.notify_error();
    assert_eq!(controller.error_count(), 1);
    assert_eq!(outcome(ha).await.unwrap(), Some(15));
    assert_eq!(outcome(hb).await.unwrap(), Some(14));
    assert_eq!(*seen.lock(), vec![vec![4, 5]]);
}

#[tokio::test]
async fn test_absentees_only_skip_the_aggregator() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::new(CollectingEventSink::new());
    let controller = Arc::new(
        controller(2)
            .with_aggregator(plus_ten(&seen))
            .with_event_sink(sink.clone()),
    );
    let _a = register(&controller);
    let _b = register(&controller);

    controller.notify_error();
    controller.notify_error();
    wait_until(|| sink.len() == 1).await;

    assert!(seen.lock().is_empty());
    assert_eq!(sink.payloads_of("barrier.released")[0]["arrived"], 0);
}

#[tokio::test]
async fn test_set_capacity_releases_when_met() {
    let controller = Arc::new(controller(usize::MAX));
    let a = register(&controller);
    let b = register(&controller);

    let ha = arrive(&a, 1);
    let hb = arrive(&b, 2);
    wait_until(|| controller.arrival_count() == 2).await;
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    assert!(!ha.is_finished());

    controller.set_capacity(2);
    assert_eq!(controller.capacity(), 2);
    assert_eq!(outcome(ha).await.unwrap(), Some(1));
    assert_eq!(outcome(hb).await.unwrap(), Some(2));
}

#[tokio::test]
#[should_panic(expected = "barriers are already registered")]
async fn test_capacity_below_registrations_panics() {
    let controller = Arc::new(controller(5));
    let _a = register(&controller);
    let _b = register(&controller);
    controller.set_capacity(1);
}

#[tokio::test]
#[should_panic(expected = "has reached its capacity of 1")]
async fn test_registration_beyond_capacity_panics() {
    let controller = Arc::new(controller(1));
    let _a = register(&controller);
    let _b = register(&controller);
}

#[tokio::test]
async fn test_interrupt_cascades_to_siblings() {
    let controller = Arc::new(controller(3));
    let a = register(&controller);
    let b = register(&controller);
    let c = register(&controller);

    let ha = arrive(&a, 1);
    let hb = arrive(&b, 2);
    wait_until(|| controller.arrival_count() == 2).await;

    c.interrupt();
    assert!(controller.is_interrupted());
    assert_eq!(outcome(ha).await.unwrap(), None);
    assert_eq!(outcome(hb).await.unwrap(), None);
    for barrier in [&a, &b, &c] {
        assert_eq!(barrier.status(), BarrierStatus::Interrupted);
    }

    let late = register(&controller);
    assert_eq!(late.status(), BarrierStatus::Interrupted);
    assert_eq!(controller.registered_count(), 3);
}

#[tokio::test]
async fn test_interrupt_during_release_is_ignored() {
    let entered = Arc::new(Notify::new());
    let gate = Arc::new(Notify::new());
    let (on_enter, on_gate) = (Arc::clone(&entered), Arc::clone(&gate));
    let controller = Arc::new(controller(2).with_aggregator(FnAggregator::new(move |batch: Vec<u32>| {
        let (on_enter, on_gate) = (Arc::clone(&on_enter), Arc::clone(&on_gate));
        async move {
            on_enter.notify_one();
            on_gate.notified().await;
            Ok::<_, BoxError>(batch.into_iter().map(|x| x + 10).collect())
        }
    })));
    let a = register(&controller);
    let b = register(&controller);

    let ha = arrive(&a, 1);
    let hb = arrive(&b, 2);
    entered.notified().await;

    a.interrupt();
    assert!(!controller.is_interrupted());
    gate.notify_one();

    assert_eq!(outcome(ha).await.unwrap(), None);
    assert_eq!(outcome(hb).await.unwrap(), Some(12));
}

#[tokio::test]
async fn test_aggregation_error_fails_everyone_and_resets() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let sink = Arc::new(CollectingEventSink::new());
    let controller = Arc::new(
        controller(2)
            .with_event_sink(sink.clone())
            .with_aggregator(FnAggregator::new(move |batch: Vec<u32>| {
                let first = counter.fetch_add(1, Ordering::SeqCst) == 0;
                async move {
                    if first {
                        return Err::<Vec<u32>, BoxError>("upstream offline".into());
                    }
                    Ok(batch.into_iter().map(|x| x * 100).collect())
                }
            })),
    );
    let a = register(&controller);
    let b = register(&controller);

    let errors = [outcome(arrive(&a, 1)), outcome(arrive(&b, 2))];
    for result in futures::future::join_all(errors).await {
        let err = result.unwrap_err();
        assert!(matches!(err, BarrierError::AggregationFailed(_)));
        assert!(cause_chain(&err).ends_with("Caused by: upstream offline"));
    }
    assert_eq!(controller.arrival_count(), 0);
    assert_eq!(a.status(), BarrierStatus::Initialized);
    assert_eq!(sink.payloads_of("barrier.release_failed").len(), 1);

    let ha = arrive(&a, 1);
    let hb = arrive(&b, 2);
    assert_eq!(outcome(ha).await.unwrap(), Some(100));
    assert_eq!(outcome(hb).await.unwrap(), Some(200));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_wrong_output_size_fails_everyone() {
    let controller = Arc::new(controller(2).with_aggregator(FnAggregator::new(|_batch: Vec<u32>| async {
        Ok::<_, BoxError>(vec![1])
    })));
    let a = register(&controller);
    let b = register(&controller);

    let ha = arrive(&a, 1);
    let hb = arrive(&b, 2);
    for result in [outcome(ha).await, outcome(hb).await] {
        assert!(matches!(
            result.unwrap_err(),
            BarrierError::SizeMismatch { expected: 2, actual: 1 }
        ));
    }
}

#[tokio::test]
async fn test_aggregator_panic_fails_everyone() {
    let controller = Arc::new(controller(1).with_aggregator(FnAggregator::new(|_batch: Vec<u32>| async {
        if true {
            panic!("aggregator exploded");
        }
        Ok::<Vec<u32>, BoxError>(Vec::new())
    })));
    let a = register(&controller);

    let err = outcome(arrive(&a, 1)).await.unwrap_err();
    assert!(cause_chain(&err).contains("aggregator exploded"));
}

#[tokio::test]
#[should_panic(expected = "was never registered")]
async fn test_unknown_barrier_panics() {
    let controller = Arc::new(controller(2));
    let other = Arc::new(crate::barrier::ManualBarrierController::<u32>::new("other"));
    let foreign = Barrier::new(other as Arc<dyn BarrierController<u32>>);

    BarrierController::on_barrier_blocked(controller.as_ref(), &foreign);
}
