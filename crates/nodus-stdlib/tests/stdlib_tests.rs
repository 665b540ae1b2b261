//! Timers and zlib driven through a real loop

use nodus_engine::{EventLoop, LoopConfig, LoopError, Logging, PoolConfig};
use nodus_sdk::{callback, CallbackError, CallbackRef, Value};
use nodus_stdlib::{TimerId, Timers, Zlib};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn new_loop() -> EventLoop {
    let config = LoopConfig {
        pool: PoolConfig {
            core_threads: 1,
            max_threads: Some(2),
            ..Default::default()
        },
        ..Default::default()
    };
    EventLoop::new(config, &Logging::new(false)).unwrap()
}

fn tagged(log: &Arc<Mutex<Vec<String>>>, tag: &str) -> CallbackRef {
    let log = log.clone();
    let tag = tag.to_string();
    callback(move |_, _| {
        log.lock().push(tag.clone());
        Ok(())
    })
}

// ============================================================================
// Timers
// ============================================================================

#[test]
fn test_timeouts_fire_in_deadline_order() {
    let mut event_loop = new_loop();
    let timers = Timers::new(event_loop.handle(), event_loop.logging());
    let log = Arc::new(Mutex::new(Vec::new()));

    timers.set_timeout(30.0, tagged(&log, "30"), vec![]);
    timers.set_timeout(10.0, tagged(&log, "10"), vec![]);
    timers.set_timeout(20.0, tagged(&log, "20"), vec![]);

    let start = Instant::now();
    event_loop.run().unwrap();
    assert!(start.elapsed() >= Duration::from_millis(30));
    assert_eq!(*log.lock(), vec!["10", "20", "30"]);
    assert_eq!(timers.active_count(), 0);
}

#[test]
fn test_timeout_receives_args() {
    let mut event_loop = new_loop();
    let timers = Timers::new(event_loop.handle(), event_loop.logging());
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen2 = seen.clone();

    timers.set_timeout(
        -1.0,
        callback(move |_, args| {
            seen2.lock().extend_from_slice(args);
            Ok(())
        }),
        vec![Value::from("a"), Value::from(2)],
    );
    event_loop.run().unwrap();
    assert_eq!(*seen.lock(), vec![Value::from("a"), Value::from(2)]);
}

#[test]
fn test_cleared_timeout_never_fires() {
    let mut event_loop = new_loop();
    let timers = Timers::new(event_loop.handle(), event_loop.logging());
    let log = Arc::new(Mutex::new(Vec::new()));

    let id = timers.set_timeout(200.0, tagged(&log, "late"), vec![]);
    timers.clear_timer(id);

    let start = Instant::now();
    event_loop.run().unwrap();
    assert!(start.elapsed() < Duration::from_millis(200));
    assert!(log.lock().is_empty());
}

#[test]
fn test_interval_until_cleared() {
    let mut event_loop = new_loop();
    let timers = Timers::new(event_loop.handle(), event_loop.logging());
    let count = Arc::new(AtomicUsize::new(0));
    let slot: Arc<Mutex<Option<TimerId>>> = Arc::new(Mutex::new(None));

    let (count2, slot2, timers2) = (count.clone(), slot.clone(), timers.clone());
    let id = timers.set_interval(
        5.0,
        callback(move |_, _| {
            if count2.fetch_add(1, Ordering::SeqCst) + 1 == 3 {
                if let Some(id) = *slot2.lock() {
                    timers2.clear_timer(id);
                }
            }
            Ok(())
        }),
        vec![],
    );
    *slot.lock() = Some(id);

    event_loop.run().unwrap();
    assert_eq!(count.load(Ordering::SeqCst), 3);
}

#[test]
fn test_unref_timer_does_not_hold_loop() {
    let mut event_loop = new_loop();
    let timers = Timers::new(event_loop.handle(), event_loop.logging());
    let log = Arc::new(Mutex::new(Vec::new()));

    let id = timers.set_timeout(500.0, tagged(&log, "unref"), vec![]);
    timers.unref_timer(id);

    let start = Instant::now();
    event_loop.run().unwrap();
    assert!(start.elapsed() < Duration::from_millis(400));
    assert!(log.lock().is_empty());
}

#[test]
fn test_immediates() {
    let mut event_loop = new_loop();
    let timers = Timers::new(event_loop.handle(), event_loop.logging());
    let log = Arc::new(Mutex::new(Vec::new()));

    timers.set_immediate(tagged(&log, "first"), vec![]);
    let dropped = timers.set_immediate(tagged(&log, "cleared"), vec![]);
    timers.set_immediate(tagged(&log, "last"), vec![]);
    timers.clear_immediate(dropped);

    event_loop.run().unwrap();
    assert_eq!(*log.lock(), vec!["first", "last"]);
    assert_eq!(timers.active_count(), 0);
}

#[test]
fn test_timer_error_fails_run() {
    let mut event_loop = new_loop();
    let timers = Timers::new(event_loop.handle(), event_loop.logging());
    timers.set_timeout(
        1.0,
        callback(|_, _| Err(CallbackError::script("tick failed"))),
        vec![],
    );

    match event_loop.run() {
        Err(LoopError::Uncaught(e)) => assert_eq!(e.root.to_string(), "tick failed"),
        other => panic!("expected uncaught error, got {:?}", other.err()),
    }
}

// ============================================================================
// Zlib
// ============================================================================

type Outcome = Arc<Mutex<Option<(Option<String>, Vec<Value>)>>>;

fn capture() -> (Outcome, CallbackRef) {
    let slot: Outcome = Arc::new(Mutex::new(None));
    let slot2 = slot.clone();
    let cb = callback(move |name, args| {
        *slot2.lock() = Some((name.map(str::to_string), args.to_vec()));
        Ok(())
    });
    (slot, cb)
}

#[test]
fn test_gzip_then_gunzip_on_pool() {
    let mut event_loop = new_loop();
    let zlib = Zlib::new(event_loop.handle(), event_loop.logging());
    let input = b"the quick brown fox jumps over the lazy dog".repeat(20);

    let (compressed, cb) = capture();
    zlib.gzip(input.clone(), None, cb).unwrap();
    event_loop.run().unwrap();

    let (name, args) = compressed.lock().take().unwrap();
    assert_eq!(name.as_deref(), Some("zlib.gzip"));
    assert_eq!(args[0], Value::Null);
    let packed = args[1].as_bytes().unwrap().to_vec();
    assert!(packed.len() < input.len());

    let (plain, cb) = capture();
    zlib.gunzip(packed, cb).unwrap();
    event_loop.run().unwrap();

    let (name, args) = plain.lock().take().unwrap();
    assert_eq!(name.as_deref(), Some("zlib.gunzip"));
    assert_eq!(args[1].as_bytes(), Some(&input[..]));
}

#[test]
fn test_corrupt_input_reports_data_error() {
    let mut event_loop = new_loop();
    let zlib = Zlib::new(event_loop.handle(), event_loop.logging());

    let (outcome, cb) = capture();
    zlib.inflate(b"definitely not zlib".to_vec(), cb).unwrap();
    event_loop.run().unwrap();

    let (name, args) = outcome.lock().take().unwrap();
    assert_eq!(name.as_deref(), Some("zlib.inflate.error"));
    let error = args[0].as_error().unwrap();
    assert_eq!(error.code, "Z_DATA_ERROR");
    assert_eq!(error.syscall.as_deref(), Some("inflate"));
}
