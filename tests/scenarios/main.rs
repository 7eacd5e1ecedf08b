//! End-to-end scenarios across the whole stack
//!
//! Each test drives the public `objtrack` API only.

#[path = "../common/mod.rs"]
mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use common::*;
use objtrack::{
    AddOutcome, CollectionOptions, MultiIndexStore, SegmentedAppendList, ThreadPartitionedMap,
    TombstoneGrowableArray,
};
use proptest::prelude::*;
use rand::seq::SliceRandom;

// ============================================================================
// Collections
// ============================================================================

#[test]
fn test_partitioned_map_ten_thousand_items() {
    init_tracing();
    let map: Arc<ThreadPartitionedMap<u64, String>> = Arc::new(ThreadPartitionedMap::new(8));

    let m = Arc::clone(&map);
    run_parallel(8, move |t| {
        for i in 0..1_250u64 {
            let key = t as u64 * 1_250 + i;
            m.upsert(key, key.to_string()).unwrap();
        }
    });

    assert_eq!(map.count(), 10_000);
    for key in 0..10_000u64 {
        assert_eq!(map.get(&key).unwrap(), key.to_string());
    }
    let missing = map.get(&10_000).unwrap_err();
    assert!(matches!(missing, objtrack::Error::MissingKey(_)));
}

#[test]
fn test_growable_array_removal_during_iteration() {
    let array = Arc::new(TombstoneGrowableArray::new());
    for i in 0..2_000u64 {
        array.add(i).unwrap();
    }
    let torn = Arc::new(AtomicUsize::new(0));

    let a = Arc::clone(&array);
    let bad = Arc::clone(&torn);
    run_parallel(2, move |t| {
        if t == 0 {
            for i in (0..2_000u64).rev() {
                a.remove(i);
            }
        } else {
            for _ in 0..20 {
                for v in a.iter() {
                    if v >= 2_000 {
                        bad.fetch_add(1, Ordering::SeqCst);
                    }
                }
            }
        }
    });

    assert_eq!(torn.load(Ordering::SeqCst), 0);
    assert!(array.is_empty());
}

#[test]
fn test_append_list_keeps_order_per_writer() {
    let list: SegmentedAppendList<Row> = SegmentedAppendList::with_options(&CollectionOptions {
        bucket_count: 1,
        ..CollectionOptions::default()
    });
    let rows: Vec<_> = (0..50).map(|i| Row::order(i, 0)).collect();
    for row in &rows {
        list.add(Arc::clone(row)).unwrap();
    }
    let ids: Vec<i64> = list
        .iter()
        .unwrap()
        .filter_map(|r| r.get("Id").and_then(|v| v.as_int()))
        .collect();
    assert_eq!(ids, (0..50).collect::<Vec<_>>());

    assert!(list.remove(&rows[10]).unwrap());
    assert!(!list.contains(&rows[10]).unwrap());
    assert_eq!(list.len(), 49);
}

// ============================================================================
// Multi-index store
// ============================================================================

#[test]
fn test_unique_ssn_scenario() {
    init_tracing();
    let store: MultiIndexStore<Row> =
        MultiIndexStore::with_indexes([IndexConfig::new("SSN").unique()]).unwrap();

    store.add(Row::customer(1, "123"), false).unwrap();
    let err = store.add(Row::customer(2, "123"), false).unwrap_err();
    assert!(err.is_constraint());

    assert_eq!(store.count(), 1);
    assert_eq!(store.bag_len("SSN", &Value::from("123")).unwrap(), 1);
    let hit = store
        .get_first_by_property("SSN", &Value::from("123"))
        .unwrap()
        .unwrap();
    assert_eq!(hit.get("Id"), Some(Value::Int(1)));

    let shared = store.add_safe(Row::customer(3, "123")).unwrap();
    assert!(matches!(shared, AddOutcome::SharedUnique { .. }));
    assert_eq!(store.bag_len("SSN", &Value::from("123")).unwrap(), 1);
}

#[test]
fn test_store_from_toml_config() {
    let config = StoreConfig::from_toml_str(
        r#"
        assume_safe = false

        [collection]
        bucket_count = 4
        lock_timeout_ms = 250

        [[indexes]]
        name = "SSN"
        unique = true

        [[indexes]]
        name = "Nickname"
        never_track_null = true
        "#,
    )
    .unwrap();
    let store: MultiIndexStore<Row> = MultiIndexStore::new(config).unwrap();
    assert_eq!(store.index_names(), vec!["SSN".to_string(), "Nickname".to_string()]);

    store.add(Row::customer(1, "1"), false).unwrap();
    assert_eq!(store.bag_len("Nickname", &Value::Null).unwrap(), 0);
    assert!(store.add(Row::customer(2, "1"), false).is_err());
}

#[test]
fn test_store_count_matches_enumeration_under_churn() {
    let store: Arc<MultiIndexStore<Row>> = Arc::new(
        MultiIndexStore::with_indexes([IndexConfig::new("Id").unique(), IndexConfig::new("CustomerId")])
            .unwrap(),
    );

    let s = Arc::clone(&store);
    run_parallel(6, move |t| {
        for i in 0..300i64 {
            let row = Row::order(t as i64 * 1_000 + i, i % 5);
            s.add(Arc::clone(&row), false).unwrap();
            if i % 3 == 0 {
                assert!(s.remove(&row).unwrap());
            }
        }
    });

    let enumerated = store.safe_enumerate().unwrap();
    assert_eq!(store.count(), enumerated.len());
    assert_eq!(store.count(), 6 * 200);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    /// N writers each adding M distinct rows, in shuffled order, leave N×M rows
    #[test]
    fn prop_concurrent_adds_count_every_row(threads in 1usize..6, per_thread in 1i64..80, buckets in 1usize..9) {
        let store: Arc<MultiIndexStore<Row>> = Arc::new(
            MultiIndexStore::new(
                StoreConfig::default()
                    .with_collection(CollectionOptions::with_buckets(buckets))
                    .with_index(IndexConfig::new("Id").unique())
                    .with_index(IndexConfig::new("CustomerId")),
            )
            .unwrap(),
        );

        let s = Arc::clone(&store);
        run_parallel(threads, move |t| {
            let mut ids: Vec<i64> = (0..per_thread).map(|i| t as i64 * 1_000 + i).collect();
            ids.shuffle(&mut rand::thread_rng());
            for id in ids {
                s.add(Row::order(id, id % 3), false).unwrap();
            }
        });

        let expected = threads * per_thread as usize;
        prop_assert_eq!(store.count(), expected);
        prop_assert_eq!(store.safe_enumerate().unwrap().len(), expected);
        prop_assert_eq!(store.distinct_values("Id").unwrap(), expected);
        let per_customer: usize = (0..3)
            .map(|c| store.bag_len("CustomerId", &Value::Int(c)).unwrap())
            .sum();
        prop_assert_eq!(per_customer, expected);
    }
}

// ============================================================================
// Tracker
// ============================================================================

fn customer_tracker(relationships: Arc<CustomerOrders>) -> ObjectTracker {
    let config = StoreConfig::default()
        .with_index(IndexConfig::new("Id").never_track_null())
        .with_index(IndexConfig::new("SSN").unique().never_track_null());
    ObjectTracker::new(config, relationships).unwrap()
}

#[test]
fn test_added_modified_set_null_scenario() {
    init_tracing();
    let orders = Arc::new(CustomerOrders::default());
    let tracker = customer_tracker(Arc::clone(&orders));

    let customer = Row::customer(7, "777");
    let first = Row::order(1, 7);
    let second = Row::order(2, 7);
    orders.register(&first);
    orders.register(&second);

    tracker.create(customer.clone()).unwrap();
    tracker.materialize(first.clone()).unwrap();
    tracker.materialize(second.clone()).unwrap();

    tracker
        .set_property(&*customer, "SSN", Value::from("778"))
        .unwrap();
    assert_eq!(tracker.state_of(&*customer).unwrap(), Some(EntityState::Modified));
    assert!(tracker.find_by("SSN", &Value::from("778")).unwrap().is_some());

    tracker.delete(&*customer, DeletePolicy::SetNull).unwrap();
    for order in [&first, &second] {
        assert_eq!(
            tracker.state_of(&**order).unwrap(),
            Some(EntityState::ModifiedPriority)
        );
        assert_eq!(order.get("CustomerId"), Some(Value::Null));
        let record = tracker.get(&**order).unwrap().unwrap();
        assert_eq!(record.original_value("CustomerId"), Some(Value::Int(7)));
    }

    let changes = tracker.all_pending_changes().unwrap();
    assert_eq!(changes.modified_priority.len(), 2);
    assert_eq!(changes.deleted.len(), 1);
    let last = changes.iter().last().unwrap();
    assert!(last.refers_to(&*customer));

    tracker.accept_changes(&changes).unwrap();
    assert_eq!(tracker.tracked_count(), 2);
    assert!(tracker.all_pending_changes().unwrap().is_empty());
}

#[test]
fn test_cascade_delete_scenario() {
    let orders = Arc::new(CustomerOrders::default());
    let tracker = customer_tracker(Arc::clone(&orders));

    let customer = Row::customer(1, "1");
    let children: Vec<_> = (10..13).map(|id| Row::order(id, 1)).collect();
    for child in &children {
        orders.register(child);
    }
    tracker.include(customer.clone()).unwrap();

    let err = tracker.delete(&*customer, DeletePolicy::Fail).unwrap_err();
    assert!(matches!(err, objtrack::Error::DeleteRestricted { children: 3, .. }));

    tracker.delete(&*customer, DeletePolicy::Cascade).unwrap();
    assert_eq!(tracker.tracked_count(), 4);
    let changes = tracker.all_pending_changes().unwrap();
    assert_eq!(changes.deleted.len(), 4);
}

#[test]
fn test_scope_dispose_releases_records() {
    let tracker = ObjectTracker::with_defaults().unwrap();
    let rows: Vec<_> = (0..10).map(|i| Row::customer(i, &i.to_string())).collect();
    let records: Vec<_> = rows
        .iter()
        .map(|r| tracker.include(r.clone()).unwrap())
        .collect();

    tracker.dispose().unwrap();
    assert!(records.iter().all(|r| r.state() == EntityState::Unlinked));
    assert_eq!(tracker.tracked_count(), 0);
}
