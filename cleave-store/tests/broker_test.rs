//! Broker round-trip tests: object and shard-range merges persist correctly
//! and replay as no-ops.

use std::sync::Arc;

use cleave_core::traits::broker::{CleaveContext, ContainerBroker, DbState, ShardRangeFilter};
use cleave_core::types::shard_range::{ShardRange, ShardState};
use cleave_core::types::timestamp::Timestamp;
use cleave_store::SqliteBroker;
use tempfile::TempDir;

fn ts(usecs: i64) -> Timestamp {
    Timestamp::from_usecs(usecs)
}

fn setup_broker(dir: &TempDir, account: &str, container: &str) -> SqliteBroker {
    let path = dir.path().join(format!("{container}.db"));
    SqliteBroker::create(&path, account, container, 0, ts(1)).unwrap()
}

fn shard(account: &str, container: &str, lower: &str, upper: &str, t: i64) -> ShardRange {
    ShardRange::new(account, container, ts(t), lower, upper)
}

#[test]
fn info_reflects_live_objects_only() {
    let dir = TempDir::new().unwrap();
    let broker = setup_broker(&dir, "acct", "cont");

    broker.put_object("a", ts(10), 100, "text/plain", "etag-a").unwrap();
    broker.put_object("b", ts(10), 50, "text/plain", "etag-b").unwrap();
    broker.delete_object("b", ts(11)).unwrap();

    let info = broker.get_info().unwrap();
    assert_eq!(info.account, "acct");
    assert_eq!(info.container, "cont");
    assert_eq!(info.object_count, 1);
    assert_eq!(info.bytes_used, 100);
}

#[test]
fn object_merge_is_timestamp_keyed() {
    let dir = TempDir::new().unwrap();
    let broker = setup_broker(&dir, "acct", "cont");

    broker.put_object("x", ts(20), 10, "text/plain", "v2").unwrap();
    // An older write must not clobber the newer row.
    broker.put_object("x", ts(10), 99, "text/plain", "v1").unwrap();

    let objs = broker.get_objects(10, "", "", 0, false).unwrap();
    assert_eq!(objs.len(), 1);
    assert_eq!(objs[0].size, 10);
    assert_eq!(objs[0].etag, "v2");

    // Replaying the newer write changes nothing.
    broker.put_object("x", ts(20), 10, "text/plain", "v2").unwrap();
    assert_eq!(broker.get_objects(10, "", "", 0, false).unwrap().len(), 1);
}

#[test]
fn listing_respects_markers_and_tombstones() {
    let dir = TempDir::new().unwrap();
    let broker = setup_broker(&dir, "acct", "cont");
    for name in ["a", "b", "c", "d"] {
        broker.put_object(name, ts(5), 1, "text/plain", name).unwrap();
    }
    broker.delete_object("c", ts(6)).unwrap();

    let names = |objs: Vec<cleave_core::ObjectRecord>| {
        objs.into_iter().map(|o| o.name).collect::<Vec<_>>()
    };

    assert_eq!(names(broker.get_objects(10, "", "", 0, false).unwrap()), ["a", "b", "d"]);
    assert_eq!(
        names(broker.get_objects(10, "a", "d", 0, false).unwrap()),
        ["b"],
        "marker is exclusive, end_marker is exclusive"
    );
    assert_eq!(
        names(broker.get_objects(10, "", "", 0, true).unwrap()),
        ["a", "b", "c", "d"],
        "tombstones are listed when asked for"
    );
    assert_eq!(names(broker.get_objects(2, "", "", 0, false).unwrap()), ["a", "b"]);
}

#[test]
fn remove_objects_is_lower_exclusive_upper_inclusive() {
    let dir = TempDir::new().unwrap();
    let broker = setup_broker(&dir, "acct", "cont");
    for name in ["a", "m", "s", "z"] {
        broker.put_object(name, ts(5), 1, "text/plain", name).unwrap();
    }

    broker.remove_objects("a", "s", 0).unwrap();
    let left: Vec<String> = broker
        .get_objects(10, "", "", 0, true)
        .unwrap()
        .into_iter()
        .map(|o| o.name)
        .collect();
    assert_eq!(left, ["a", "z"]);

    broker.remove_objects("", "", 0).unwrap();
    assert!(broker.get_objects(10, "", "", 0, true).unwrap().is_empty());
}

#[test]
fn shard_range_merge_is_last_writer_wins_per_column() {
    let dir = TempDir::new().unwrap();
    let broker = setup_broker(&dir, "acct", "cont");

    let mut original = shard(".shards_acct", "cont-1", "", "m", 100);
    original.object_count = 5;
    broker.merge_shard_ranges(&[original.clone()]).unwrap();

    // Newer stats, older state: only the stats columns move.
    let mut update = original.clone();
    update.object_count = 50;
    update.meta_timestamp = ts(200);
    update.state = ShardState::Created;
    update.state_timestamp = ts(50);
    broker.merge_shard_ranges(&[update]).unwrap();

    let stored = &broker
        .get_shard_ranges(&ShardRangeFilter::default())
        .unwrap()[0];
    assert_eq!(stored.object_count, 50);
    assert_eq!(stored.meta_timestamp, ts(200));
    assert_eq!(stored.state, ShardState::Found, "older state change ignored");

    // Replay of the original is a no-op.
    broker.merge_shard_ranges(&[original]).unwrap();
    let stored = &broker
        .get_shard_ranges(&ShardRangeFilter::default())
        .unwrap()[0];
    assert_eq!(stored.object_count, 50);
}

#[test]
fn shard_range_filters_select_states_markers_and_own() {
    let dir = TempDir::new().unwrap();
    let broker = setup_broker(&dir, "acct", "cont");

    let mut a = shard(".shards_acct", "cont-a", "", "g", 10);
    a.state = ShardState::Created;
    let mut b = shard(".shards_acct", "cont-b", "g", "p", 10);
    b.state = ShardState::Cleaved;
    let mut c = shard(".shards_acct", "cont-c", "p", "", 10);
    c.state = ShardState::Created;
    c.deleted = true;
    let own = shard("acct", "cont", "", "", 10);
    broker.merge_shard_ranges(&[a, b, c, own]).unwrap();

    let all = broker.get_shard_ranges(&ShardRangeFilter::default()).unwrap();
    assert_eq!(all.len(), 2, "deleted and own excluded by default");

    let created = broker
        .get_shard_ranges(&ShardRangeFilter::states(&[ShardState::Created]))
        .unwrap();
    assert_eq!(created.len(), 1);
    assert_eq!(created[0].container, "cont-a");

    let with_deleted = broker
        .get_shard_ranges(&ShardRangeFilter {
            include_deleted: true,
            ..Default::default()
        })
        .unwrap();
    assert_eq!(with_deleted.len(), 3);

    // Marker skips ranges wholly below it.
    let after_g = broker
        .get_shard_ranges(&ShardRangeFilter {
            marker: Some("g\u{0}".to_string()),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(after_g.len(), 1);
    assert_eq!(after_g[0].container, "cont-b");

    let only_own = broker
        .get_shard_ranges(&ShardRangeFilter {
            include_own: true,
            exclude_others: true,
            ..Default::default()
        })
        .unwrap();
    assert_eq!(only_own.len(), 1);
    assert_eq!(only_own[0].container, "cont");
}

#[test]
fn own_shard_range_defaults_to_whole_namespace() {
    let dir = TempDir::new().unwrap();
    let broker = setup_broker(&dir, "acct", "cont");
    broker.put_object("a", ts(5), 7, "text/plain", "a").unwrap();

    assert!(broker.get_own_shard_range_opt().unwrap().is_none());
    let own = broker.get_own_shard_range().unwrap();
    assert_eq!(own.lower, "");
    assert_eq!(own.upper, "");
    assert_eq!(own.state, ShardState::Active);
    assert_eq!(own.object_count, 1);
    assert_eq!(own.bytes_used, 7);

    // Once stored, the persisted record wins.
    let mut stored = own.clone();
    stored.upper = "m".to_string();
    broker.merge_shard_ranges(&[stored]).unwrap();
    assert_eq!(broker.get_own_shard_range().unwrap().upper, "m");
}

#[test]
fn db_state_advances_and_collapses() {
    let dir = TempDir::new().unwrap();
    let broker = setup_broker(&dir, "acct", "cont");
    assert_eq!(broker.get_db_state().unwrap(), DbState::Unsharded);
    assert!(!broker.set_sharded_state().unwrap(), "cannot shard before an epoch is set");

    broker.set_sharding_state(ts(100)).unwrap();
    assert_eq!(broker.get_db_state().unwrap(), DbState::Sharding);

    let mut child = shard(".shards_acct", "cont-child", "", "", 10);
    child.state = ShardState::Active;
    broker.merge_shard_ranges(&[child.clone()]).unwrap();
    assert!(broker.set_sharded_state().unwrap());
    assert_eq!(broker.get_db_state().unwrap(), DbState::Sharded);

    // Retiring the last live child collapses the database.
    let mut gone = child;
    gone.timestamp = ts(20);
    gone.deleted = true;
    broker.merge_shard_ranges(&[gone]).unwrap();
    assert_eq!(broker.get_db_state().unwrap(), DbState::Collapsed);
}

#[test]
fn cleave_context_round_trips_and_resets_with_new_epoch() {
    let dir = TempDir::new().unwrap();
    let broker = setup_broker(&dir, "acct", "cont");
    assert_eq!(broker.load_cleave_context().unwrap(), CleaveContext::default());

    let context = CleaveContext { cursor: "m".to_string(), done: true };
    broker.dump_cleave_context(&context).unwrap();
    assert_eq!(broker.load_cleave_context().unwrap(), context);

    broker.set_sharding_state(ts(500)).unwrap();
    assert_eq!(
        broker.load_cleave_context().unwrap(),
        CleaveContext::default(),
        "a new epoch restarts cleaving from the namespace start"
    );
}

#[test]
fn sharding_info_and_root_detection() {
    let dir = TempDir::new().unwrap();
    let root = setup_broker(&dir, "acct", "cont");
    assert!(root.is_root_container().unwrap());
    assert_eq!(root.root_path().unwrap(), "acct/cont");

    let child = setup_broker(&dir, ".shards_acct", "cont-child");
    child.update_sharding_info(&[("Root", "acct/cont")]).unwrap();
    assert!(!child.is_root_container().unwrap());
    assert_eq!(child.root_account().unwrap(), "acct");
    assert_eq!(child.root_container().unwrap(), "cont");

    child.update_sharding_info(&[("Scan-Done", "true")]).unwrap();
    assert_eq!(child.get_sharding_info("Scan-Done").unwrap().as_deref(), Some("true"));
    assert_eq!(child.get_sharding_info("Epoch").unwrap(), None);
}

#[test]
fn deleting_strips_sysmeta_but_keeps_shard_bookkeeping() {
    let dir = TempDir::new().unwrap();
    let broker = setup_broker(&dir, "acct", "cont");
    broker
        .update_metadata("X-Container-Sysmeta-Sharding", "True", ts(5))
        .unwrap();
    broker.update_sharding_info(&[("Root", "acct/root")]).unwrap();

    broker.delete_db(ts(50)).unwrap();
    assert!(broker.is_deleted().unwrap());
    assert_eq!(broker.get_metadata("X-Container-Sysmeta-Sharding").unwrap(), None);
    assert_eq!(broker.get_sharding_info("Root").unwrap().as_deref(), Some("acct/root"));
}

#[test]
fn sharding_lock_is_exclusive_and_released_on_drop() {
    let dir = TempDir::new().unwrap();
    let broker = setup_broker(&dir, "acct", "cont");

    let guard = broker.sharding_lock().unwrap();
    assert!(broker.sharding_lock().is_err(), "second acquisition must fail");
    drop(guard);
    let again = broker.sharding_lock().unwrap();
    drop(again);
}

#[test]
fn brokers_share_state_through_the_trait_object() {
    let dir = TempDir::new().unwrap();
    let broker = setup_broker(&dir, "acct", "cont");
    broker.put_object("a", ts(5), 1, "text/plain", "a").unwrap();

    let sources = broker.get_brokers();
    assert_eq!(sources.len(), 1);
    let via_trait: &Arc<dyn ContainerBroker> = &sources[0];
    assert_eq!(via_trait.get_info().unwrap().object_count, 1);
}
