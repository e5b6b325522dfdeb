#![allow(clippy::unwrap_used, missing_docs)]

mod common;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use common::{MockStore, RecordingExpiry, mount, p};
use docfs::backend::ObjectKind;
use docfs::dispatch::{Backpressure, DispatcherOptions};
use docfs::error::FsError;
use docfs::mount::{
    Access, AccessMode, MountContext, MountError, MountOptions, MountState, ShutdownError,
};
use docfs::telemetry::{StatOp, StatsSink};
use docfs::watchdog::{ExpiryAction, WatchdogState};

fn store() -> MockStore {
    MockStore::new()
        .file("/a.txt", b"hello world")
        .file("/docs/readme.md", b"# docs")
        .file("/docs/notes.txt", b"n")
        .dir("/docs/empty")
}

#[test]
fn unreachable_store_fails_init() {
    let err = MountContext::<MockStore>::init(&false, MountOptions::default()).unwrap_err();
    assert!(matches!(err, MountError::Connect(_)));
}

#[test]
fn init_reaches_active() {
    let ctx = MountContext::<MockStore>::init(&true, MountOptions::default()).unwrap();
    assert_eq!(ctx.state(), MountState::Active);
    assert!(!ctx.is_quiescing());
    ctx.shutdown().unwrap();
    assert_eq!(ctx.state(), MountState::TornDown);
}

#[test]
fn open_twice_release_and_lookup() {
    let (ctx, _store, _) = mount(store(), MountOptions::default());
    let a = p("/a.txt");

    let first = ctx.open(&a).unwrap();
    let second = ctx.open(&a).unwrap();
    assert_eq!((first, second), (4, 5));

    ctx.release(first).unwrap();
    assert!(ctx.handles().lookup_by_handle(first).is_none());
    assert!(matches!(ctx.read(first, 0, 5), Err(FsError::UnknownHandle(4))));
    assert_eq!(&ctx.read(second, 0, 5).unwrap()[..], b"hello");

    ctx.release(second).unwrap();
    assert_eq!(ctx.handles().handles_for_path(&a), None);

    let err = ctx.release(second).unwrap_err();
    assert_eq!(err.errno(), libc::ENOENT);

    assert_eq!(ctx.open(&a).unwrap(), 6, "handles are not reused");
}

#[test]
fn read_honours_offset_and_end_of_file() {
    let (ctx, _store, _) = mount(store(), MountOptions::default());
    let fh = ctx.open(&p("/a.txt")).unwrap();

    assert_eq!(&ctx.read(fh, 6, 100).unwrap()[..], b"world");
    assert!(ctx.read(fh, 11, 10).unwrap().is_empty());
    assert!(ctx.read(fh, 500, 10).unwrap().is_empty());
}

#[test]
fn open_rejects_directories_and_missing_paths() {
    let (ctx, _store, _) = mount(store(), MountOptions::default());

    let err = ctx.open(&p("/docs")).unwrap_err();
    assert_eq!(err.errno(), libc::EISDIR);
    let err = ctx.open(&p("/missing")).unwrap_err();
    assert!(matches!(err, FsError::NotFound(_)));
    assert_eq!(err.errno(), libc::ENOENT);
    assert!(ctx.handles().is_empty());
}

#[test]
fn stat_and_list() {
    let (ctx, _store, _) = mount(store(), MountOptions::default());

    let attrs = ctx.stat(&p("/docs/readme.md")).unwrap();
    assert_eq!(attrs.kind, ObjectKind::File);
    assert_eq!(attrs.size, 6);

    let names: Vec<_> = ctx
        .list(&p("/docs"))
        .unwrap()
        .into_iter()
        .map(|c| (c.name, c.kind))
        .collect();
    assert_eq!(
        names,
        vec![
            ("empty".to_owned(), ObjectKind::Directory),
            ("notes.txt".to_owned(), ObjectKind::File),
            ("readme.md".to_owned(), ObjectKind::File),
        ]
    );
    assert!(ctx.list(&p("/docs/empty")).unwrap().is_empty());
    assert_eq!(
        ctx.list(&p("/a.txt")).unwrap_err().errno(),
        libc::ENOTDIR
    );
}

#[test]
fn access_checks_against_a_read_only_mount() {
    let (ctx, _store, _) = mount(store(), MountOptions::default());
    let file = p("/a.txt");
    let dir = p("/docs");

    assert_eq!(ctx.access(&file, AccessMode::empty()).unwrap(), Access::Allowed);
    assert_eq!(ctx.access(&file, AccessMode::READ).unwrap(), Access::Allowed);
    assert_eq!(ctx.access(&file, AccessMode::WRITE).unwrap(), Access::Denied);
    assert_eq!(ctx.access(&file, AccessMode::EXECUTE).unwrap(), Access::Denied);
    assert_eq!(
        ctx.access(&dir, AccessMode::READ | AccessMode::EXECUTE).unwrap(),
        Access::Allowed
    );
    assert!(matches!(
        ctx.access(&p("/nope"), AccessMode::READ),
        Err(FsError::NotFound(_))
    ));
}

#[test]
fn statfs_reports_open_files() {
    let (ctx, _store, _) = mount(store(), MountOptions::default());
    ctx.open(&p("/a.txt")).unwrap();
    ctx.open(&p("/docs/notes.txt")).unwrap();

    let stats = ctx.statfs().unwrap();
    assert_eq!(stats.open_files, 2);
    assert_eq!(stats.block_size, 4096);
    assert_eq!(stats.max_filename_length, 255);
    assert_eq!(stats.free_blocks, 0);
}

#[test]
fn quiescing_refuses_gated_operations_with_eio_but_allows_release() {
    let (ctx, _store, _) = mount(store(), MountOptions::default());
    let fh = ctx.open(&p("/a.txt")).unwrap();

    let report = ctx.shutdown().unwrap();
    assert_eq!(report.released_handles, 1);
    assert_eq!(report.watchdog, Some(WatchdogState::Disarmed));
    assert!(ctx.is_quiescing());

    let refusals = [
        ctx.open(&p("/a.txt")).map(|_| ()),
        ctx.read(fh, 0, 1).map(|_| ()),
        ctx.stat(&p("/a.txt")).map(|_| ()),
        ctx.list(&p("/")).map(|_| ()),
        ctx.access(&p("/a.txt"), AccessMode::READ).map(|_| ()),
        ctx.statfs().map(|_| ()),
    ];
    for refusal in refusals {
        let err = refusal.unwrap_err();
        assert!(matches!(err, FsError::MountClosing), "{err:?}");
        assert_eq!(err.errno(), libc::EIO);
    }

    // Teardown already released it; release itself is still answered, not refused.
    assert!(matches!(ctx.release(fh), Err(FsError::UnknownHandle(_))));
}

#[test]
fn release_during_quiesce_helps_teardown() {
    let (ctx, store, _) = mount(store(), MountOptions::default());
    let held_open = ctx.open(&p("/a.txt")).unwrap();
    let reading = ctx.open(&p("/docs/notes.txt")).unwrap();

    store.hold();
    let reader = {
        let ctx = Arc::clone(&ctx);
        thread::spawn(move || ctx.read(reading, 0, 1))
    };
    store.wait_for_held_calls(1);

    let shutdown = {
        let ctx = Arc::clone(&ctx);
        thread::spawn(move || ctx.shutdown())
    };
    while !ctx.is_quiescing() {
        thread::yield_now();
    }
    assert_eq!(ctx.state(), MountState::Quiescing);

    ctx.release(held_open).unwrap();
    store.unhold();

    assert_eq!(&reader.join().unwrap().unwrap()[..], b"n");
    let report = shutdown.join().unwrap().unwrap();
    assert_eq!(report.in_flight_at_start, 1);
    assert_eq!(report.released_handles, 1, "only the reading handle was left");
    assert_eq!(ctx.state(), MountState::TornDown);
}

#[test]
fn in_flight_read_keeps_its_entry_after_release() {
    let (ctx, store, _) = mount(store(), MountOptions::default());
    let fh = ctx.open(&p("/a.txt")).unwrap();
    let watch = ctx.handles().lookup_by_handle(fh).unwrap().watch();

    store.hold();
    let reader = {
        let ctx = Arc::clone(&ctx);
        thread::spawn(move || ctx.read(fh, 0, 5))
    };
    store.wait_for_held_calls(1);

    ctx.release(fh).unwrap();
    assert!(ctx.handles().lookup_by_handle(fh).is_none());
    assert!(watch.is_alive(), "the read still borrows the entry");

    store.unhold();
    assert_eq!(&reader.join().unwrap().unwrap()[..], b"hello");
    assert!(!watch.is_alive());
}

#[test]
fn shutdown_happens_exactly_once() {
    let (ctx, _store, _) = mount(store(), MountOptions::default());
    ctx.shutdown().unwrap();
    assert!(matches!(ctx.shutdown(), Err(ShutdownError::AlreadyShutDown)));
}

#[test]
fn stuck_backend_trips_the_watchdog() {
    let (expiry, fired_rx) = RecordingExpiry::new();
    let action: Arc<dyn ExpiryAction> = expiry.clone();
    let store = Arc::new(store());
    let ctx = MountContext::with_backend(
        Arc::clone(&store),
        MountOptions {
            watchdog_deadline: Duration::from_millis(50),
            ..MountOptions::default()
        },
        action,
    )
    .unwrap();

    store.hold();
    let stuck = {
        let ctx = Arc::clone(&ctx);
        thread::spawn(move || ctx.stat(&p("/a.txt")))
    };
    store.wait_for_held_calls(1);

    let shutdown = {
        let ctx = Arc::clone(&ctx);
        thread::spawn(move || ctx.shutdown())
    };
    assert_eq!(
        fired_rx.recv_timeout(Duration::from_secs(5)).unwrap(),
        Duration::from_millis(50)
    );

    // The process would be gone by now; let the test clean up.
    store.unhold();
    stuck.join().unwrap().unwrap();
    let report = shutdown.join().unwrap().unwrap();
    assert_eq!(report.watchdog, Some(WatchdogState::Expired));
    assert_eq!(expiry.fired(), 1);
}

#[test]
fn request_timeout_surfaces_as_eio() {
    let (ctx, store, _) = mount(
        store(),
        MountOptions {
            request_timeout: Some(Duration::from_millis(20)),
            ..MountOptions::default()
        },
    );
    store.hold();
    let err = ctx.stat(&p("/a.txt")).unwrap_err();
    assert!(matches!(err, FsError::TimedOut));
    assert_eq!(err.errno(), libc::EIO);
    store.unhold();
}

#[test]
fn fail_fast_mount_reports_ebusy() {
    let (ctx, store, _) = mount(
        store(),
        MountOptions {
            dispatcher: DispatcherOptions {
                workers: 1,
                queue_depth: 1,
                backpressure: Backpressure::FailFast,
            },
            ..MountOptions::default()
        },
    );
    store.hold();
    let stat_in_background = || {
        let ctx = Arc::clone(&ctx);
        thread::spawn(move || ctx.stat(&p("/a.txt")))
    };
    let running = stat_in_background();
    store.wait_for_held_calls(1);
    let queued = stat_in_background();
    while ctx.dispatcher().queued() < 1 {
        thread::yield_now();
    }

    let err = ctx.stat(&p("/a.txt")).unwrap_err();
    assert_eq!(err.errno(), libc::EBUSY);

    store.unhold();
    running.join().unwrap().unwrap();
    queued.join().unwrap().unwrap();
}

#[test]
fn completed_operations_emit_stats_records() {
    let (sink, records) = StatsSink::channel(64);
    let (ctx, _store, _) = mount(
        store(),
        MountOptions {
            stats: sink,
            ..MountOptions::default()
        },
    );

    let fh = ctx.open(&p("/a.txt")).unwrap();
    ctx.read(fh, 2, 3).unwrap();
    ctx.list(&p("/docs")).unwrap();
    ctx.release(fh).unwrap();
    let _ = ctx.stat(&p("/missing"));

    let seen: Vec<_> = records.try_iter().collect();
    let ops: Vec<_> = seen.iter().map(|r| r.op).collect();
    assert_eq!(
        ops,
        vec![StatOp::Open, StatOp::Read, StatOp::List, StatOp::Release]
    );
    assert_eq!(seen[1].path, "/a.txt");
    assert_eq!((seen[1].offset, seen[1].bytes), (2, 3));
    assert_eq!(seen[2].bytes, 3, "three children listed");
}

#[test]
fn dropping_the_last_reference_tears_down() {
    let (sink, records) = StatsSink::channel(8);
    let (ctx, _store, _) = mount(
        store(),
        MountOptions {
            stats: sink,
            ..MountOptions::default()
        },
    );
    ctx.open(&p("/a.txt")).unwrap();
    drop(ctx);

    assert_eq!(records.try_iter().count(), 1);
    assert!(
        records.recv_timeout(Duration::from_millis(50)).is_err(),
        "sink is closed once the mount is gone"
    );
}
