// ABOUTME: Integration tests for the persistent cache
// ABOUTME: Covers entry round-trips, index replay order and reference counting

use proptest::prelude::*;
use tempfile::TempDir;
use uuid::Uuid;

use headway::cache::trace::fields;
use headway::cache::{Cache, IndexReader, TraceRecord, TraceValue};
use headway::task::{TaskContext, TaskHash, Value};

mod common;

fn arb_trace_value() -> impl Strategy<Value = TraceValue> {
    prop_oneof![
        any::<bool>().prop_map(TraceValue::Bool),
        any::<i64>().prop_map(TraceValue::Int),
        "[ -~]{0,24}".prop_map(TraceValue::Str),
    ]
}

proptest! {
    // Every field of a stored record and context comes back unchanged.
    #[test]
    fn cache_entry_round_trip(
        names in prop::collection::vec("[a-z_%]{1,12}", 1..8),
        values in prop::collection::vec(arb_trace_value(), 8),
        ctx_value in "[ -~]{0,16}",
    ) {
        let base = TempDir::new().unwrap();
        let cache = Cache::open(base.path(), Uuid::new_v4(), "round_trip").unwrap();

        let mut trace = TraceRecord::new();
        for (name, value) in names.iter().zip(values.iter()) {
            trace.set(name.clone(), value.clone());
        }
        let mut context = TaskContext::new();
        context.set("sample", Value::str(ctx_value.clone()));
        context.set("input", Value::path("/data/in.fq"));

        let hash = TaskHash::from_bytes([7; 16]);
        cache.put_entry(&hash, trace.clone(), Some(context.clone())).unwrap();

        let loaded = cache.get_entry(&hash).unwrap().unwrap();
        prop_assert_eq!(loaded.trace, trace);
        prop_assert_eq!(loaded.context, Some(context));
        prop_assert_eq!(loaded.ref_count, 1);
    }

    // Replaying the index yields hashes in append order.
    #[test]
    fn index_replay_preserves_order(seeds in prop::collection::vec(any::<u8>(), 1..20)) {
        let base = TempDir::new().unwrap();
        let cache = Cache::open(base.path(), Uuid::new_v4(), "replay").unwrap();

        let hashes: Vec<TaskHash> = seeds
            .iter()
            .enumerate()
            .map(|(i, &seed)| {
                let mut bytes = [seed; 16];
                bytes[15] = i as u8;
                TaskHash::from_bytes(bytes)
            })
            .collect();
        for (i, hash) in hashes.iter().enumerate() {
            cache.write_index(hash, i % 3 == 0).unwrap();
        }

        let records = IndexReader::open(&cache.index_path()).unwrap().records().unwrap();
        let replayed: Vec<TaskHash> = records.iter().map(|r| r.hash).collect();
        prop_assert_eq!(replayed, hashes);
    }
}

#[test]
fn ref_count_lifecycle_across_runs() {
    let base = TempDir::new().unwrap();
    let session = Uuid::new_v4();
    let hash = TaskHash::from_bytes([3; 16]);

    // First run creates the entry.
    {
        let cache = Cache::open(base.path(), session, "first").unwrap();
        let mut trace = TraceRecord::new();
        trace.set(fields::PROCESS, TraceValue::from("p"));
        cache.put_entry(&hash, trace, None).unwrap();
        cache.write_index(&hash, false).unwrap();
    }

    // A resumed run increments the shared count.
    {
        let cache = Cache::open(base.path(), session, "second").unwrap();
        assert_eq!(cache.inc_entry(&hash).unwrap(), Some(2));
        cache.write_index(&hash, true).unwrap();
    }

    // Decrement-then-test: the entry survives one decrement, the second
    // removes it.
    let cache = Cache::open_for_modify(base.path(), session, "second").unwrap();
    assert_eq!(cache.dec_entry(&hash).unwrap(), Some(1));
    assert_eq!(cache.dec_entry(&hash).unwrap(), Some(0));
    assert!(cache.get_entry(&hash).unwrap().is_none());
}

#[test]
fn each_record_resolves_payloads_in_order() {
    let base = TempDir::new().unwrap();
    let session = Uuid::new_v4();
    let tasks = vec![
        common::SeededTask::new(1, "/w/aa", 0),
        common::SeededTask::new(2, "/w/bb", 0),
        common::SeededTask::new(3, "/w/cc", 1),
    ];
    let cache = common::seed_cached_run(base.path(), session, "ordered", &tasks);

    let mut folders = Vec::new();
    cache
        .each_record(|_, entry, _| {
            folders.push(entry.trace.folder().unwrap().to_string());
        })
        .unwrap();
    assert_eq!(folders, vec!["/w/aa", "/w/bb", "/w/cc"]);
}

#[test]
fn open_for_read_requires_existing_index() {
    let base = TempDir::new().unwrap();
    let session = Uuid::new_v4();
    assert!(Cache::open_for_read(base.path(), session, "absent").is_err());
}
