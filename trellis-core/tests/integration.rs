//! Integration Tests for the Store
//!
//! These tests drive the public API the way an application would: build
//! declarations, dispatch outputs and observe subscribers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::Mutex;

use trellis_core::{
    CommandDecl, CommitMode, EntityDecl, EventDecl, ExternDecl, Output, QueryDecl, StateDecl,
    Store, StoreError, StoreOptions,
};

fn recorder<T: Clone + Send + 'static>() -> (Arc<Mutex<Vec<T>>>, impl Fn(&T) + Send + Sync) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = {
        let seen = seen.clone();
        move |value: &T| seen.lock().push(value.clone())
    };
    (seen, sink)
}

fn counter() -> (StateDecl<u32>, QueryDecl<u32>, CommandDecl) {
    let count = StateDecl::new("Count", 0u32);
    let doubled = {
        let count = count.clone();
        QueryDecl::new("Doubled", move |r| Ok(r.get(&count)? * 2))
    };
    let increase = {
        let count = count.clone();
        CommandDecl::new("Increase", move |r, ()| Ok(count.set(r.get(&count)? + 1)))
    };
    (count, doubled, increase)
}

/// Three increases reach the subscriber as three notifications, in order.
#[test]
fn increase_three_times_notifies_two_four_six() {
    let store = Store::new();
    let (_, doubled, increase) = counter();
    let (seen, sink) = recorder::<u32>();
    let _sub = store.subscribe_query(&doubled, sink).unwrap();

    for _ in 0..3 {
        store.dispatch(increase.call(())).unwrap();
    }

    assert_eq!(*seen.lock(), vec![2, 4, 6]);
}

/// Writing a state to its current value notifies nobody.
#[test]
fn equal_write_notifies_nobody() {
    let store = Store::new();
    let (count, doubled, _) = counter();
    let parity = {
        let count = count.clone();
        QueryDecl::new("Parity", move |r| Ok(r.get(&count)? % 2))
    };
    let (doubled_seen, doubled_sink) = recorder::<u32>();
    let (parity_seen, parity_sink) = recorder::<u32>();
    let _a = store.subscribe_query(&doubled, doubled_sink).unwrap();
    let _b = store.subscribe_query(&parity, parity_sink).unwrap();

    store.dispatch(count.set(0)).unwrap();
    assert!(doubled_seen.lock().is_empty());

    // Parity stays 0, so only Doubled hears about it.
    store.dispatch(count.set(2)).unwrap();
    assert_eq!(*doubled_seen.lock(), vec![4]);
    assert!(parity_seen.lock().is_empty());
}

/// A -> (B, C) -> D: each derived node evaluates once per change of A, and
/// D only after both B and C settled.
#[test]
fn diamond_evaluates_each_node_once() {
    let store = Store::new();
    let log: Arc<Mutex<Vec<&'static str>>> = Arc::default();
    let a = StateDecl::new("A", 1i64);
    let b = {
        let (a, log) = (a.clone(), log.clone());
        QueryDecl::new("B", move |r| {
            log.lock().push("B");
            Ok(r.get(&a)? + 1)
        })
    };
    let c = {
        let (a, log) = (a.clone(), log.clone());
        QueryDecl::new("C", move |r| {
            log.lock().push("C");
            Ok(r.get(&a)? * 10)
        })
    };
    let d = {
        let (b, c, log) = (b.clone(), c.clone(), log.clone());
        QueryDecl::new("D", move |r| {
            log.lock().push("D");
            Ok(r.get(&b)? + r.get(&c)?)
        })
    };
    let (seen, sink) = recorder::<i64>();
    let _sub = store.subscribe_query(&d, sink).unwrap();
    log.lock().clear();

    store.dispatch(a.set(2)).unwrap();

    let log = log.lock().clone();
    assert_eq!(log.iter().filter(|n| **n == "B").count(), 1);
    assert_eq!(log.iter().filter(|n| **n == "C").count(), 1);
    assert_eq!(log.last(), Some(&"D"));
    assert_eq!(log.len(), 3);
    assert_eq!(*seen.lock(), vec![23]);
}

/// A query whose value does not change stops propagation below it.
#[test]
fn unchanged_intermediate_short_circuits() {
    let store = Store::new();
    let evaluations = Arc::new(AtomicUsize::new(0));
    let n = StateDecl::new("N", 1u32);
    let sign = {
        let n = n.clone();
        QueryDecl::new("IsPositive", move |r| Ok(r.get(&n)? > 0))
    };
    let label = {
        let (sign, evaluations) = (sign.clone(), evaluations.clone());
        QueryDecl::new("Label", move |r| {
            evaluations.fetch_add(1, Ordering::SeqCst);
            Ok(if r.get(&sign)? { "positive" } else { "zero" }.to_string())
        })
    };
    let _sub = store.subscribe_query(&label, |_| {}).unwrap();
    assert_eq!(evaluations.load(Ordering::SeqCst), 1);

    store.dispatch(n.set(5)).unwrap();
    store.dispatch(n.set(9)).unwrap();
    assert_eq!(evaluations.load(Ordering::SeqCst), 1);

    store.dispatch(n.set(0)).unwrap();
    assert_eq!(evaluations.load(Ordering::SeqCst), 2);
    assert_eq!(store.get(&label).unwrap(), "zero");
}

/// Derived values always match a fresh evaluation of the final state.
#[test]
fn incremental_results_match_fresh_evaluation() {
    let store = Store::new();
    let items = StateDecl::new("Items", Vec::<u32>::new());
    let threshold = StateDecl::new("Threshold", 10u32);
    let total = {
        let items = items.clone();
        QueryDecl::new("Total", move |r| Ok(r.get(&items)?.iter().sum::<u32>()))
    };
    let over = {
        let (total, threshold) = (total.clone(), threshold.clone());
        QueryDecl::new("Over", move |r| Ok(r.get(&total)? > r.get(&threshold)?))
    };
    let _sub = store.subscribe_query(&over, |_| {}).unwrap();

    let mut expected = Vec::new();
    for (i, n) in [4u32, 3, 8, 1, 6].into_iter().enumerate() {
        expected.push(n);
        store.dispatch(items.set(expected.clone())).unwrap();
        if i == 2 {
            store.dispatch(threshold.set(20)).unwrap();
        }
    }

    let sum: u32 = expected.iter().sum();
    assert_eq!(store.get(&total).unwrap(), sum);
    assert_eq!(store.get(&over).unwrap(), sum > 20);
}

/// Unsubscribing drops the storage; subscribing again rebuilds it from the
/// current state.
#[test]
fn unsubscribed_query_is_collected() {
    let store = Store::new();
    let (count, doubled, _) = counter();
    let sub = store.subscribe_query(&doubled, |_| {}).unwrap();
    assert!(store.has_storage(&doubled));

    sub.unsubscribe();
    assert!(!store.has_storage(&doubled));

    store.dispatch(count.set(21)).unwrap();
    let (seen, sink) = recorder::<u32>();
    let _sub = store.subscribe_query(&doubled, sink).unwrap();
    assert!(store.has_storage(&doubled));
    assert_eq!(store.get(&doubled).unwrap(), 42);
    assert!(seen.lock().is_empty());
}

/// Collection cascades through a chain of queries that only fed each other.
#[test]
fn collection_cascades_upstream() {
    let store = Store::new();
    let (_, doubled, _) = counter();
    let quadrupled = {
        let doubled = doubled.clone();
        QueryDecl::new("Quadrupled", move |r| Ok(r.get(&doubled)? * 2))
    };
    let direct = store.subscribe_query(&doubled, |_| {}).unwrap();
    let chained = store.subscribe_query(&quadrupled, |_| {}).unwrap();

    chained.unsubscribe();
    assert!(!store.has_storage(&quadrupled));
    assert!(store.has_storage(&doubled));

    drop(direct);
    assert!(!store.has_storage(&doubled));
}

/// A failing command leaves no trace: no write, no notification.
#[test]
fn failed_dispatch_rolls_back() {
    let store = Store::new();
    let (count, doubled, increase) = counter();
    let fail = CommandDecl::new("Fail", |_, reason: String| -> trellis_core::Result<Output> {
        Err(StoreError::evaluation(reason))
    });
    let (seen, sink) = recorder::<u32>();
    let _sub = store.subscribe_query(&doubled, sink).unwrap();

    let err = store
        .dispatch(vec![increase.call(()), fail.call("nope".into())])
        .unwrap_err();
    assert_eq!(err, StoreError::evaluation("nope"));
    assert_eq!(store.get(&count).unwrap(), 0);
    assert!(seen.lock().is_empty());

    store.dispatch(increase.call(())).unwrap();
    assert_eq!(*seen.lock(), vec![2]);
}

/// An evaluation error surfaces to the dispatcher and the last good value
/// stays in place.
#[test]
fn evaluation_error_reaches_dispatcher() {
    let store = Store::new();
    let divisor = StateDecl::new("Divisor", 2u32);
    let half = {
        let divisor = divisor.clone();
        QueryDecl::new("Quotient", move |r| {
            let d = r.get(&divisor)?;
            if d == 0 {
                return Err(StoreError::evaluation("division by zero"));
            }
            Ok(100 / d)
        })
    };
    let _sub = store.subscribe_query(&half, |_| {}).unwrap();

    let err = store.dispatch(divisor.set(0)).unwrap_err();
    assert!(matches!(err, StoreError::Evaluation(_)));
    assert_eq!(store.get(&divisor).unwrap(), 2);
    assert_eq!(store.get(&half).unwrap(), 50);

    store.dispatch(divisor.set(4)).unwrap();
    assert_eq!(store.get(&half).unwrap(), 25);
}

#[test]
fn entities_must_exist_before_reading() {
    let store = Store::new();
    let todo = EntityDecl::<String, u32>::new("Todo");
    let first = todo.key(1);

    let err = store.get(&first).unwrap_err();
    assert!(matches!(err, StoreError::EntityNotCreated(_)));
    assert!(!store.has(&first).unwrap());

    store.dispatch(first.set("write docs".into())).unwrap();
    assert_eq!(store.get(&todo.key(1)).unwrap(), "write docs");

    store.dispatch(first.delete()).unwrap();
    assert!(!store.has(&first).unwrap());
    assert!(store.has_storage(&first));
}

#[test]
fn queries_see_entity_deletion() {
    let store = Store::new();
    let todo = EntityDecl::<String, u32>::new("Todo");
    let title = {
        let todo = todo.clone();
        QueryDecl::family("Title", move |r, id: &u32| {
            let key = todo.key(*id);
            Ok(if r.has(&key)? { r.get(&key)? } else { "(deleted)".to_string() })
        })
    };
    let (seen, sink) = recorder::<String>();
    store.dispatch(todo.key(7).set("draft".into())).unwrap();
    let _sub = store.subscribe_query(&title.key(7), sink).unwrap();

    store.dispatch(todo.key(7).delete()).unwrap();
    store.dispatch(todo.key(7).set("final".into())).unwrap();
    assert_eq!(*seen.lock(), vec!["(deleted)".to_string(), "final".to_string()]);
}

/// Instances built independently with equal arguments share one storage.
#[test]
fn equal_arguments_share_storage() {
    #[derive(serde::Serialize, Clone)]
    struct Cell {
        row: u32,
        col: u32,
    }

    let store = Store::new();
    let grid = StateDecl::family("Grid", |cell: &Cell| cell.row * 10 + cell.col);
    store.dispatch(grid.key(Cell { row: 1, col: 2 }).set(99)).unwrap();
    assert_eq!(store.get(&grid.key(Cell { row: 1, col: 2 })).unwrap(), 99);
    assert_eq!(store.get(&grid.key(Cell { row: 2, col: 1 })).unwrap(), 21);
}

#[test]
fn query_reading_itself_is_a_cycle() {
    let store = Store::new();
    let slot: Arc<OnceLock<QueryDecl<u32>>> = Arc::default();
    let looped = {
        let slot = slot.clone();
        QueryDecl::new("Looped", move |r| match slot.get() {
            Some(me) => Ok(r.get(me)? + 1),
            None => Ok(0),
        })
    };
    let _ = slot.set(looped.clone());

    let err = store.get(&looped).unwrap_err();
    assert!(matches!(err, StoreError::Cycle(_)));
}

/// Events reach subscribers after query notifications, in emission order,
/// with the transform applied at emit time.
#[test]
fn events_follow_query_notifications() {
    let store = Store::new();
    let (count, doubled, _) = counter();
    let order: Arc<Mutex<Vec<String>>> = Arc::default();
    let announced = {
        let count = count.clone();
        EventDecl::mapped("Announced", move |r, word: &'static str| {
            Ok(format!("{word} at {}", r.get(&count)?))
        })
    };
    let _q = {
        let order = order.clone();
        store
            .subscribe_query(&doubled, move |n| order.lock().push(format!("doubled {n}")))
            .unwrap()
    };
    let _e = {
        let order = order.clone();
        store
            .subscribe_event(&announced, move |text: &String| order.lock().push(text.clone()))
            .unwrap()
    };

    store
        .dispatch(vec![
            announced.emit("first"),
            count.set(3),
            announced.emit("second"),
        ])
        .unwrap();

    assert_eq!(
        *order.lock(),
        vec!["doubled 6".to_string(), "first at 0".to_string(), "second at 3".to_string()]
    );
}

#[test]
fn unobserved_events_leave_nothing_behind() {
    let store = Store::new();
    let ping = EventDecl::<()>::new("Ping");
    store.dispatch(ping.emit(())).unwrap();
    assert!(!store.has_storage(&ping));

    let sub = store.subscribe_event(&ping, |_| {}).unwrap();
    assert!(store.has_storage(&ping));
    drop(sub);
    assert!(!store.has_storage(&ping));
}

#[test]
fn externs_resolve_overrides_then_defaults() {
    let rate = ExternDecl::new("Rate", 2u32);
    let unit = ExternDecl::new("Unit", "kg".to_string());
    let store = Store::with_options(StoreOptions::new().with_extern(rate.provide(3)));
    let weight = StateDecl::new("Weight", 5u32);
    let shown = {
        let (weight, rate, unit) = (weight.clone(), rate.clone(), unit.clone());
        QueryDecl::new("Shown", move |r| {
            Ok(format!("{} {}", r.get(&weight)? * r.get_extern(&rate)?, r.get_extern(&unit)?))
        })
    };

    assert_eq!(store.get(&shown).unwrap(), "15 kg");
    assert_eq!(store.get_extern(&rate).unwrap(), 3);
}

#[test]
fn deferred_commits_wait_for_flush() {
    let store = Store::with_options(StoreOptions::new().with_commit_mode(CommitMode::Deferred));
    let (_, doubled, increase) = counter();
    let (seen, sink) = recorder::<u32>();
    let _sub = store.subscribe_query(&doubled, sink).unwrap();

    store.dispatch(increase.call(())).unwrap();
    store.dispatch(increase.call(())).unwrap();
    assert!(seen.lock().is_empty());

    store.flush();
    assert_eq!(*seen.lock(), vec![4]);
}

/// Dispatches in one tick coalesce into a single commit.
#[tokio::test]
async fn deferred_commits_coalesce_within_a_tick() {
    let store = Store::with_options(StoreOptions::new().with_commit_mode(CommitMode::Deferred));
    let (_, doubled, increase) = counter();
    let (seen, sink) = recorder::<u32>();
    let _sub = store.subscribe_query(&doubled, sink).unwrap();

    for _ in 0..3 {
        store.dispatch(increase.call(())).unwrap();
    }
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(*seen.lock(), vec![6]);
}

/// A round trip back to the committed value is not a change.
#[test]
fn deferred_round_trip_is_silent() {
    let store = Store::with_options(StoreOptions::new().with_commit_mode(CommitMode::Deferred));
    let (count, doubled, _) = counter();
    let (seen, sink) = recorder::<u32>();
    let _sub = store.subscribe_query(&doubled, sink).unwrap();

    store.dispatch(count.set(8)).unwrap();
    store.dispatch(count.set(0)).unwrap();
    store.flush();
    assert!(seen.lock().is_empty());
}

#[test]
fn store_is_shared_across_threads() {
    let store = Store::new();
    let (count, _, increase) = counter();

    std::thread::scope(|scope| {
        for _ in 0..4 {
            let store = store.clone();
            let increase = increase.clone();
            scope.spawn(move || {
                for _ in 0..25 {
                    store.dispatch(increase.call(())).unwrap();
                }
            });
        }
    });

    assert_eq!(store.get(&count).unwrap(), 100);
}
