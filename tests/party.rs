//! End-to-end party behavior: spawning, waking, bulk commits, waitables,
//! and orphaning.

#![allow(missing_docs)]

mod common;

use common::{init_test_logging, Notification, PromiseNotification};
use parking_lot::Mutex;
use party::{context, Arena, InlineExecutor, Party, Poll, ThreadPoolExecutor, Waker};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// A party on a four-worker pool. The pool handle is returned so the test
/// keeps the last pool reference on its own thread; a pool whose final
/// reference dies inside one of its own workers would join itself.
fn pooled_party() -> (Party, Arc<ThreadPoolExecutor>) {
    let executor = Arc::new(ThreadPoolExecutor::new(4));
    (Party::make(Arena::new(), executor.clone()), executor)
}

fn inline_party() -> Party {
    Party::make(Arena::new(), Arc::new(InlineExecutor::new()))
}

#[test]
fn can_spawn_and_run() {
    init_test_logging();
    let (party, _executor) = pooled_party();
    let n = Arc::new(Notification::new());
    let n2 = Arc::clone(&n);
    let mut remaining = 10;
    party
        .spawn(
            "test_spawn",
            move || {
                assert!(remaining > 0);
                context::force_immediate_repoll();
                remaining -= 1;
                if remaining == 0 {
                    Poll::Ready(42)
                } else {
                    Poll::Pending
                }
            },
            move |value: i32| {
                assert_eq!(value, 42);
                n2.notify();
            },
        )
        .unwrap();
    n.wait();
}

#[test]
fn can_spawn_waitable_and_run() {
    init_test_logging();
    let executor = Arc::new(ThreadPoolExecutor::new(4));
    let party1 = Party::make(Arena::new(), executor.clone());
    let party2 = Party::make(Arena::new(), executor.clone());
    let n = Arc::new(Notification::new());
    let done = PromiseNotification::new(true);

    // party2 hosts the waited-on work; party1 awaits it through a waitable.
    let waitable = party2.spawn_waitable("party2_main", done.wait()).unwrap();
    let n2 = Arc::clone(&n);
    party1
        .spawn("party1_main", waitable.wait(), move |value: i32| {
            assert_eq!(value, 42);
            n2.notify();
        })
        .unwrap();
    assert!(!n.has_been_notified());

    // Completing the latch from a party1 participant must ripple across
    // both parties.
    let done2 = Arc::clone(&done);
    party1
        .spawn(
            "party1_notify_latch",
            move || {
                done2.notify();
                Poll::Ready(())
            },
            |()| {},
        )
        .unwrap();
    n.wait();
}

#[test]
fn can_spawn_from_spawn() {
    init_test_logging();
    let (party, _executor) = pooled_party();
    let n1 = Arc::new(Notification::new());
    let n2 = Arc::new(Notification::new());
    let inner_party = party.clone();
    let n1_done = Arc::clone(&n1);
    let n2_done = Arc::clone(&n2);
    party
        .spawn(
            "test_spawn",
            move || {
                let n2_inner = Arc::clone(&n2_done);
                let mut remaining = 10;
                inner_party
                    .spawn(
                        "test_spawn_inner",
                        move || {
                            context::force_immediate_repoll();
                            remaining -= 1;
                            if remaining == 0 {
                                Poll::Ready(42)
                            } else {
                                Poll::Pending
                            }
                        },
                        move |value: i32| {
                            assert_eq!(value, 42);
                            n2_inner.notify();
                        },
                    )
                    .unwrap();
                Poll::Ready(1234)
            },
            move |value: i32| {
                assert_eq!(value, 1234);
                n1_done.notify();
            },
        )
        .unwrap();
    n1.wait();
    n2.wait();
}

#[test]
fn can_wakeup_with_owning_waker() {
    init_test_logging();
    let (party, _executor) = pooled_party();
    let rounds: Arc<Vec<Notification>> = Arc::new((0..10).map(|_| Notification::new()).collect());
    let complete = Arc::new(Notification::new());
    let waker_cell: Arc<Mutex<Option<Waker>>> = Arc::new(Mutex::new(None));

    let rounds_poll = Arc::clone(&rounds);
    let waker_poll = Arc::clone(&waker_cell);
    let complete2 = Arc::clone(&complete);
    let mut polled = 0;
    party
        .spawn(
            "test_spawn",
            move || {
                *waker_poll.lock() = Some(context::make_owning_waker());
                rounds_poll[polled].notify();
                polled += 1;
                if polled == 10 {
                    Poll::Ready(42)
                } else {
                    Poll::Pending
                }
            },
            move |value: i32| {
                assert_eq!(value, 42);
                complete2.notify();
            },
        )
        .unwrap();

    for round in 0..10 {
        rounds[round].wait();
        let waker = waker_cell.lock().take();
        if let Some(mut waker) = waker {
            waker.wakeup();
        }
    }
    complete.wait();
}

#[test]
fn can_wakeup_with_non_owning_waker() {
    init_test_logging();
    let (party, _executor) = pooled_party();
    let rounds: Arc<Vec<Notification>> = Arc::new((0..10).map(|_| Notification::new()).collect());
    let complete = Arc::new(Notification::new());
    let waker_cell: Arc<Mutex<Option<Waker>>> = Arc::new(Mutex::new(None));

    let rounds_poll = Arc::clone(&rounds);
    let waker_poll = Arc::clone(&waker_cell);
    let complete2 = Arc::clone(&complete);
    let mut remaining = 10;
    party
        .spawn(
            "test_spawn",
            move || {
                *waker_poll.lock() = Some(context::make_non_owning_waker());
                remaining -= 1;
                rounds_poll[9 - remaining].notify();
                if remaining == 0 {
                    Poll::Ready(42)
                } else {
                    Poll::Pending
                }
            },
            move |value: i32| {
                assert_eq!(value, 42);
                complete2.notify();
            },
        )
        .unwrap();

    for round in 0..9 {
        rounds[round].wait();
        assert!(!rounds[round + 1].has_been_notified());
        let waker = waker_cell.lock().take();
        if let Some(mut waker) = waker {
            waker.wakeup();
        }
    }
    complete.wait();
}

#[test]
fn non_owning_waker_tombstones_after_orphaning() {
    init_test_logging();
    // Inline executor: the first poll (which arms the waker) happens during
    // `spawn`, and dropping the handle orphans the party synchronously —
    // the parked participant can never be revived after that.
    let party = inline_party();
    let waker_cell: Arc<Mutex<Option<Waker>>> = Arc::new(Mutex::new(None));
    let waker_poll = Arc::clone(&waker_cell);
    party
        .spawn(
            "test_spawn",
            move || {
                *waker_poll.lock() = Some(context::make_non_owning_waker());
                Poll::Pending
            },
            |_: i32| panic!("the orphaned participant must never complete"),
        )
        .unwrap();

    let mut waker = waker_cell.lock().take().expect("first poll armed the waker");
    assert!(!waker.is_unwakeable());
    drop(party);
    // Orphaning alone does not flip the waker; the first (no-op) wakeup does.
    assert!(!waker.is_unwakeable());
    waker.wakeup();
    assert!(waker.is_unwakeable());
}

#[test]
fn non_owning_waker_can_be_dropped_after_orphaning() {
    init_test_logging();
    let party = inline_party();
    let waker_cell: Arc<Mutex<Option<Waker>>> = Arc::new(Mutex::new(None));
    let waker_poll = Arc::clone(&waker_cell);
    party
        .spawn(
            "test_spawn",
            move || {
                *waker_poll.lock() = Some(context::make_non_owning_waker());
                Poll::Pending
            },
            |_: i32| panic!("the orphaned participant must never complete"),
        )
        .unwrap();
    drop(party);
    let waker = waker_cell.lock().take();
    assert!(waker.is_some());
    drop(waker);
}

#[test]
fn can_bulk_spawn() {
    init_test_logging();
    let (party, _executor) = pooled_party();
    let n1 = Arc::new(Notification::new());
    let n2 = Arc::new(Notification::new());
    {
        let mut spawner = party.bulk_spawner();
        let n1_done = Arc::clone(&n1);
        let n2_done = Arc::clone(&n2);
        spawner.spawn("spawn1", || Poll::Ready(()), move |()| n1_done.notify());
        spawner.spawn("spawn2", || Poll::Ready(()), move |()| n2_done.notify());
        for _ in 0..1000 {
            assert!(!n1.has_been_notified());
            assert!(!n2.has_been_notified());
        }
    }
    n1.wait();
    n2.wait();
}

#[test]
fn nested_spawn_to_a_lower_slot_runs_before_the_party_sleeps() {
    init_test_logging();
    let party = inline_party();
    let events: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

    // Slot 0: a blocker that keeps the lowest slot taken while the parent
    // spawns, then frees it.
    let blocker = PromiseNotification::new(true);
    party.spawn("blocker", blocker.wait(), |_| {}).unwrap();

    // Slot 1: the parent. Its second poll spawns a child that lands in the
    // freed slot 0, below the parent.
    let waker_cell: Arc<Mutex<Option<Waker>>> = Arc::new(Mutex::new(None));
    let waker_poll = Arc::clone(&waker_cell);
    let parent_events = Arc::clone(&events);
    let mut polls = 0;
    party
        .spawn(
            "parent",
            move || {
                polls += 1;
                if polls == 1 {
                    parent_events.lock().push("parent_first_poll");
                    *waker_poll.lock() = Some(context::make_owning_waker());
                    Poll::Pending
                } else {
                    parent_events.lock().push("parent_second_poll");
                    let child_events = Arc::clone(&parent_events);
                    context::current()
                        .spawn(
                            "child",
                            move || {
                                child_events.lock().push("child");
                                Poll::Ready(())
                            },
                            |()| {},
                        )
                        .unwrap();
                    Poll::Ready(())
                }
            },
            |()| {},
        )
        .unwrap();

    blocker.notify(); // retires slot 0
    let mut waker = waker_cell.lock().take().expect("parent armed its waker");
    waker.wakeup();
    // The child was polled inside the same run tenure (on the pass after
    // the parent's), before the wakeup call returned.
    assert_eq!(
        *events.lock(),
        vec!["parent_first_poll", "parent_second_poll", "child"]
    );
}

#[test]
fn duplicate_wakeups_coalesce_into_one_completion() {
    init_test_logging();
    let party = inline_party();
    let completions = Arc::new(AtomicUsize::new(0));
    let owning_cell: Arc<Mutex<Option<Waker>>> = Arc::new(Mutex::new(None));
    let weak_cell: Arc<Mutex<Option<Waker>>> = Arc::new(Mutex::new(None));

    let owning_poll = Arc::clone(&owning_cell);
    let weak_poll = Arc::clone(&weak_cell);
    let completions2 = Arc::clone(&completions);
    let mut polls = 0;
    party
        .spawn(
            "test_spawn",
            move || {
                polls += 1;
                if polls == 1 {
                    *owning_poll.lock() = Some(context::make_owning_waker());
                    *weak_poll.lock() = Some(context::make_non_owning_waker());
                    Poll::Pending
                } else {
                    Poll::Ready(polls)
                }
            },
            move |_| {
                completions2.fetch_add(1, Ordering::SeqCst);
            },
        )
        .unwrap();

    // The first wake completes the participant; the second addresses a
    // retired generation and is dropped.
    owning_cell.lock().take().unwrap().wakeup();
    weak_cell.lock().take().unwrap().wakeup();
    assert_eq!(completions.load(Ordering::SeqCst), 1);
}
