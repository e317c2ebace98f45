//! Contract tests run over the memory and file backends.

use std::{collections::BTreeSet, sync::Arc, thread};

use bytes::Bytes;
use deltalog::{
    store::{fs::FsStore, memory::MemStore},
    AppendError, DatasetDesc, LogError, Patch, PatchHeader, PatchId, PatchStore, Version,
};

fn desc(name: &str) -> DatasetDesc {
    DatasetDesc::new(PatchId::random(&mut rand::thread_rng()), name, None)
}

fn patch(previous: Option<PatchId>, body: &str) -> Patch {
    Patch::new(
        PatchHeader::new(PatchId::random(&mut rand::thread_rng()), previous),
        Bytes::copy_from_slice(body.as_bytes()),
    )
}

fn version(value: i64) -> Version {
    Version::new(value).unwrap()
}

/// The worked example: P1 and P2 chain, P3 names the wrong previous.
fn contract_example_scenario(store: &dyn PatchStore) {
    let log = store.create(&desc("example")).unwrap();
    assert!(log.is_empty().unwrap());

    let p1 = patch(None, "P1");
    let a = p1.id();
    assert_eq!(log.append(p1).unwrap(), version(1));

    let p2 = patch(Some(a), "P2");
    let b = p2.id();
    assert_eq!(log.append(p2).unwrap(), version(2));

    // wrong: should chain from B
    let p3 = patch(Some(a), "P3");
    assert!(matches!(
        log.append(p3),
        Err(AppendError::HeadMismatch { .. })
    ));
    assert_eq!(log.latest_version().unwrap(), version(2));
    assert_eq!(log.latest_id().unwrap(), Some(b));
}

/// n appends from empty yield versions exactly 1..=n.
fn contract_contiguous_versions(store: &dyn PatchStore) {
    let log = store.create(&desc("contiguous")).unwrap();
    let mut previous = None;
    for expected in 1..=10i64 {
        let p = patch(previous, &format!("body {expected}"));
        previous = Some(p.id());
        assert_eq!(log.append(p).unwrap(), version(expected));
    }
    assert_eq!(log.earliest_version().unwrap(), version(1));
    assert_eq!(log.latest_version().unwrap(), version(10));
}

/// fetch returns what was appended; unknown keys are empty, not errors.
fn contract_fetch(store: &dyn PatchStore) {
    let log = store.create(&desc("fetch")).unwrap();
    let p1 = patch(None, "one");
    let id = p1.id();
    let v = log.append(p1.clone()).unwrap();
    assert_eq!(log.fetch_version(v).unwrap().unwrap().id(), id);
    assert_eq!(log.fetch(&id).unwrap().unwrap(), p1);
    assert!(log.fetch_version(version(2)).unwrap().is_none());
    assert!(log
        .fetch(&PatchId::random(&mut rand::thread_rng()))
        .unwrap()
        .is_none());
}

/// range is inclusive, ordered, and bounds-checked.
fn contract_range(store: &dyn PatchStore) {
    let log = store.create(&desc("range")).unwrap();
    let mut previous = None;
    let mut bodies = Vec::new();
    for i in 1..=5i64 {
        let p = patch(previous, &format!("body {i}"));
        previous = Some(p.id());
        bodies.push(p.body().clone());
        log.append(p).unwrap();
    }

    let collected: Vec<Patch> = log
        .range(version(2), version(4))
        .unwrap()
        .map(|item| item.unwrap())
        .collect();
    assert_eq!(collected.len(), 3);
    for (patch, i) in collected.iter().zip(2usize..) {
        assert_eq!(patch.body(), &bodies[i - 1]);
    }

    // full range
    assert_eq!(log.range(version(1), version(5)).unwrap().count(), 5);
    // out of bounds
    assert!(matches!(
        log.range(version(1), version(6)),
        Err(LogError::OutOfRange { .. })
    ));
    assert!(matches!(
        log.range(Version::INIT, version(2)),
        Err(LogError::OutOfRange { .. })
    ));
    assert!(matches!(
        log.range(version(4), version(2)),
        Err(LogError::OutOfRange { .. })
    ));
}

/// Concurrent appends serialize: no duplicate or skipped versions.
fn contract_concurrent_appends(store: &dyn PatchStore) {
    const WRITERS: usize = 4;
    const PER_WRITER: usize = 25;

    let log = store.create(&desc("concurrent")).unwrap();
    let committed: Vec<Version> = thread::scope(|scope| {
        let handles: Vec<_> = (0..WRITERS)
            .map(|writer| {
                let log = log.clone();
                scope.spawn(move || {
                    let mut versions = Vec::new();
                    for i in 0..PER_WRITER {
                        loop {
                            let head = log.latest_id().unwrap();
                            let p = patch(head, &format!("w{writer} p{i}"));
                            match log.append(p) {
                                Ok(v) => {
                                    versions.push(v);
                                    break;
                                }
                                Err(AppendError::HeadMismatch { .. }) => continue,
                                Err(err) => panic!("append failed: {err}"),
                            }
                        }
                    }
                    versions
                })
            })
            .collect();
        handles
            .into_iter()
            .flat_map(|handle| handle.join().unwrap())
            .collect()
    });

    let total = WRITERS * PER_WRITER;
    let unique: BTreeSet<i64> = committed.iter().map(|v| v.value()).collect();
    assert_eq!(unique.len(), total);
    assert_eq!(*unique.first().unwrap(), 1);
    assert_eq!(*unique.last().unwrap(), total as i64);
    assert_eq!(log.latest_version().unwrap(), version(total as i64));
}

fn run_contract(make: impl Fn() -> Arc<dyn PatchStore>) {
    contract_example_scenario(&*make());
    contract_contiguous_versions(&*make());
    contract_fetch(&*make());
    contract_range(&*make());
    contract_concurrent_appends(&*make());
}

#[test]
fn contract_memory() {
    run_contract(|| {
        let store: Arc<dyn PatchStore> = Arc::new(MemStore::new());
        store
    });
}

#[test]
fn contract_file() {
    // one store root per scenario
    run_contract(|| {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn PatchStore> = FsStore::open(dir.path()).unwrap();
        // keep the tempdir alive as long as the store
        Box::leak(Box::new(dir));
        store
    });
}

#[test]
fn file_round_trip_reattach() {
    let dir = tempfile::tempdir().unwrap();
    let d = desc("roundtrip");

    let before = {
        let store = FsStore::open(dir.path()).unwrap();
        let log = store.create(&d).unwrap();
        let mut previous = None;
        for i in 0..7 {
            let p = patch(previous, &format!("patch {i}"));
            previous = Some(p.id());
            log.append(p).unwrap();
        }
        let info = log.info().unwrap();
        log.release();
        info
    };

    // a new process: fresh store over the same directory
    let store = FsStore::open(dir.path()).unwrap();
    let log = store.attach("roundtrip").unwrap();
    let after = log.info().unwrap();
    assert_eq!(after.earliest, before.earliest);
    assert_eq!(after.latest, before.latest);
    assert_eq!(after.latest_id, before.latest_id);

    // and the recovered log keeps accepting correctly-chained appends
    let next = patch(after.latest_id, "after recovery");
    assert_eq!(log.append(next).unwrap(), version(8));
}

#[test]
fn info_is_a_snapshot() {
    let store = MemStore::new();
    let log = store.create(&desc("info")).unwrap();
    let empty = log.info().unwrap();
    assert_eq!(empty.earliest, Version::INIT);
    assert_eq!(empty.latest, Version::INIT);
    assert_eq!(empty.latest_id, None);

    let p = patch(None, "one");
    let id = p.id();
    log.append(p).unwrap();

    // the old snapshot is stale; a refetch sees the new head
    assert_eq!(empty.latest, Version::INIT);
    let fresh = log.info().unwrap();
    assert_eq!(fresh.latest, version(1));
    assert_eq!(fresh.latest_id, Some(id));
}
