//! Cross-connection leader election over the shared database file.

mod common;

use std::sync::Arc;
use std::time::Duration;

use code_ledger::{OwnershipManager, Store, WatcherRole};
use common::TestWorkspace;

/// A pid that certainly refers to a live process (init / PID 1 exists on any
/// unix host; a permission-denied probe still counts as alive).
const FOREIGN_LIVE_PID: u32 = 1;

/// A pid that cannot exist: far above pid_max, but still positive as a
/// signed pid_t.
const DEAD_PID: u32 = i32::MAX as u32 - 1;

fn manager(store: Arc<Store>, staleness: Duration) -> OwnershipManager {
    OwnershipManager::new(store, staleness)
}

#[test]
fn second_connection_becomes_reader() {
    let ws = TestWorkspace::new();
    let first = manager(ws.store(), Duration::from_secs(90));
    let second = manager(
        Arc::new(Store::open(&ws.options.db_path()).unwrap()),
        Duration::from_secs(90),
    );

    assert_eq!(first.acquire(std::process::id()).unwrap(), WatcherRole::Owner);
    assert_eq!(second.acquire(FOREIGN_LIVE_PID).unwrap(), WatcherRole::Reader);
}

#[test]
fn concurrent_acquire_elects_exactly_one_owner() {
    let ws = TestWorkspace::new();
    let db_path = ws.options.db_path();
    // Create the schema before the race so both threads contend only on the
    // owner row.
    drop(Store::open(&db_path).unwrap());

    let contenders = [std::process::id(), FOREIGN_LIVE_PID];
    let mut threads = Vec::new();
    for pid in contenders {
        let db_path = db_path.clone();
        threads.push(std::thread::spawn(move || {
            let store = Arc::new(Store::open(&db_path).unwrap());
            let ownership = OwnershipManager::new(store, Duration::from_secs(90));
            ownership.acquire(pid).unwrap()
        }));
    }

    let roles: Vec<WatcherRole> = threads.into_iter().map(|t| t.join().unwrap()).collect();
    let owners = roles.iter().filter(|r| **r == WatcherRole::Owner).count();
    assert_eq!(owners, 1, "exactly one process may win the election: {roles:?}");
}

#[test]
fn dead_owner_is_taken_over_by_other_connection() {
    let ws = TestWorkspace::new();
    let first = manager(ws.store(), Duration::from_secs(90));
    assert_eq!(first.acquire(DEAD_PID).unwrap(), WatcherRole::Owner);

    let second = manager(
        Arc::new(Store::open(&ws.options.db_path()).unwrap()),
        Duration::from_secs(90),
    );
    assert_eq!(second.acquire(std::process::id()).unwrap(), WatcherRole::Owner);
    let (pid, _, _) = second.current_owner().unwrap().unwrap();
    assert_eq!(pid, std::process::id());
}

#[test]
fn heartbeat_extends_ownership_past_staleness() {
    let ws = TestWorkspace::new();
    let staleness = Duration::from_millis(150);
    let ownership = manager(ws.store(), staleness);
    let pid = std::process::id();
    ownership.acquire(pid).unwrap();

    std::thread::sleep(Duration::from_millis(100));
    ownership.heartbeat(pid).unwrap();
    std::thread::sleep(Duration::from_millis(100));

    // 200 ms since acquire, but only 100 ms since the heartbeat.
    let probe = manager(
        Arc::new(Store::open(&ws.options.db_path()).unwrap()),
        staleness,
    );
    assert_eq!(probe.acquire(FOREIGN_LIVE_PID).unwrap(), WatcherRole::Reader);
}

#[test]
fn missed_heartbeats_allow_takeover() {
    let ws = TestWorkspace::new();
    let staleness = Duration::from_millis(100);
    let ownership = manager(ws.store(), staleness);
    ownership.acquire(std::process::id()).unwrap();

    std::thread::sleep(Duration::from_millis(150));

    let probe = manager(
        Arc::new(Store::open(&ws.options.db_path()).unwrap()),
        staleness,
    );
    assert_eq!(probe.acquire(FOREIGN_LIVE_PID).unwrap(), WatcherRole::Owner);
}
