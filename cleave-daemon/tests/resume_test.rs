//! Cleave resumption: the persisted cursor survives a daemon restart and
//! never moves backwards.

mod common;

use cleave_core::traits::broker::{ContainerBroker, DbState, ShardRangeFilter};
use cleave_core::types::shard_range::ShardState;
use cleave_core::types::timestamp::Timestamp;
use common::TestEnv;

fn ts(usecs: i64) -> Timestamp {
    Timestamp::from_usecs(usecs)
}

#[test]
fn restart_resumes_from_the_cursor_without_redoing_work() {
    let env = TestEnv::new();
    let mut config = env.config();
    config.shard_container_size = Some(2);
    config.shard_batch_size = Some(1);

    let root = env.create_container("acct", "cont");
    root.update_metadata("X-Container-Sysmeta-Sharding", "True", ts(2)).unwrap();
    for name in ["a", "m", "z"] {
        root.put_object(name, ts(5), 10, "text/plain", name).unwrap();
    }

    // First daemon: scan finds three ranges, cleaves only the first.
    let mut sharder = env.sharder(&config);
    sharder.run_cycle(&[], &[]).unwrap();
    let cursor_after_first = root.load_cleave_context().unwrap();
    assert_eq!(cursor_after_first.cursor, "a");
    assert!(!cursor_after_first.done);

    // "Kill" the daemon between cleaves and start a fresh one.
    drop(sharder);
    let mut sharder = env.sharder(&config);
    sharder.run_cycle(&[], &[]).unwrap();

    // Exactly one further range was cleaved; the first was not redone.
    assert_eq!(sharder.stats().cleaved.attempted, 1);
    assert_eq!(sharder.stats().cleaved.success, 1);
    let context = root.load_cleave_context().unwrap();
    assert_eq!(context.cursor, "m");
    assert!(!context.done);

    // Third cycle finishes the namespace and completes the shard.
    sharder.run_cycle(&[], &[]).unwrap();
    let context = root.load_cleave_context().unwrap();
    assert_eq!(context.cursor, "");
    assert!(context.done);
    assert_eq!(root.get_db_state().unwrap(), DbState::Sharded);

    let ranges = root.get_shard_ranges(&ShardRangeFilter::default()).unwrap();
    assert_eq!(ranges.len(), 3);
    assert!(ranges.iter().all(|r| r.state == ShardState::Active));
}

#[test]
fn cursor_is_monotonic_across_cycles() {
    let env = TestEnv::new();
    let mut config = env.config();
    config.shard_container_size = Some(2);
    config.shard_batch_size = Some(1);
    let mut sharder = env.sharder(&config);

    let root = env.create_container("acct", "cont");
    root.update_metadata("X-Container-Sysmeta-Sharding", "True", ts(2)).unwrap();
    for name in ["a", "m", "z"] {
        root.put_object(name, ts(5), 10, "text/plain", name).unwrap();
    }

    let mut previous = String::new();
    for _ in 0..4 {
        sharder.run_cycle(&[], &[]).unwrap();
        let context = root.load_cleave_context().unwrap();
        let cursor_rank = if context.cursor.is_empty() && context.done {
            // Unbounded tail: treat as past every name.
            "\u{10ffff}".to_string()
        } else {
            context.cursor.clone()
        };
        assert!(cursor_rank >= previous, "cursor went backwards");
        previous = cursor_rank;
    }
}
