//! Split scanning: chunking the object listing into shard-range proposals.

use cleave_core::traits::broker::ContainerBroker;
use cleave_core::types::shard_range::ShardRange;
use cleave_core::types::timestamp::Timestamp;
use cleave_store::SqliteBroker;
use tempfile::TempDir;

fn ts(usecs: i64) -> Timestamp {
    Timestamp::from_usecs(usecs)
}

fn broker_with_objects(dir: &TempDir, names: &[&str]) -> SqliteBroker {
    let path = dir.path().join("cont.db");
    let broker = SqliteBroker::create(&path, "acct", "cont", 0, ts(1)).unwrap();
    for name in names {
        broker.put_object(name, ts(5), 10, "text/plain", name).unwrap();
    }
    broker
}

#[test]
fn splits_into_target_sized_chunks_with_unbounded_tail() {
    let dir = TempDir::new().unwrap();
    let broker = broker_with_objects(&dir, &["a", "b", "c", "d", "e"]);

    let (found, last) = broker.find_shard_ranges(2, 10, &[]).unwrap();
    assert!(last);
    assert_eq!(found.len(), 3);

    assert_eq!((found[0].lower.as_str(), found[0].upper.as_str()), ("", "b"));
    assert_eq!(found[0].object_count, 2);
    assert_eq!(found[0].bytes_used, 20);
    assert_eq!(found[0].index, 0);

    assert_eq!((found[1].lower.as_str(), found[1].upper.as_str()), ("b", "d"));

    // The tail chunk takes the remainder and runs out to +inf.
    assert_eq!((found[2].lower.as_str(), found[2].upper.as_str()), ("d", ""));
    assert_eq!(found[2].object_count, 1);
    assert_eq!(found[2].index, 2);
}

#[test]
fn batch_limit_leaves_the_scan_unfinished() {
    let dir = TempDir::new().unwrap();
    let broker = broker_with_objects(&dir, &["a", "b", "c", "d", "e", "f"]);

    let (found, last) = broker.find_shard_ranges(2, 2, &[]).unwrap();
    assert!(!last, "limit reached before the namespace end");
    assert_eq!(found.len(), 2);
    assert_eq!(found[1].upper, "d");
}

#[test]
fn scan_resumes_after_existing_ranges() {
    let dir = TempDir::new().unwrap();
    let broker = broker_with_objects(&dir, &["a", "b", "c", "d", "e", "f"]);

    let (first, last) = broker.find_shard_ranges(2, 2, &[]).unwrap();
    assert!(!last);

    let existing: Vec<ShardRange> = first
        .iter()
        .map(|f| {
            ShardRange::new("acct", format!("cont-{}", f.index), ts(9), f.lower.clone(), f.upper.clone())
        })
        .collect();
    let (second, last) = broker.find_shard_ranges(2, 10, &existing).unwrap();
    assert!(last);
    assert_eq!(second.len(), 1);
    assert_eq!((second[0].lower.as_str(), second[0].upper.as_str()), ("d", ""));
    assert_eq!(second[0].index, 2, "indexes continue past the existing ranges");
}

#[test]
fn covered_namespace_reports_done_without_new_ranges() {
    let dir = TempDir::new().unwrap();
    let broker = broker_with_objects(&dir, &["a", "b"]);

    let existing = vec![
        ShardRange::new("acct", "cont-0", ts(9), "", "m"),
        ShardRange::new("acct", "cont-1", ts(9), "m", ""),
    ];
    let (found, last) = broker.find_shard_ranges(1, 10, &existing).unwrap();
    assert!(last);
    assert!(found.is_empty());
}

#[test]
fn exact_multiple_of_target_still_ends_unbounded() {
    let dir = TempDir::new().unwrap();
    let broker = broker_with_objects(&dir, &["a", "b", "c", "d"]);

    let (found, last) = broker.find_shard_ranges(2, 10, &[]).unwrap();
    assert!(last);
    // The remainder chunk absorbs the tail: (-inf, b], then (b, +inf).
    let bounds: Vec<(&str, &str)> = found
        .iter()
        .map(|f| (f.lower.as_str(), f.upper.as_str()))
        .collect();
    assert_eq!(bounds.last().unwrap().1, "");
}
