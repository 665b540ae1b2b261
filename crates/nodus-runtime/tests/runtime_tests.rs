//! Program lifecycle: init, started, loop, finalization, stopped

use nodus_engine::UNCAUGHT_EXCEPTION;
use nodus_runtime::{Context, Program, Runtime, RuntimeConfig, RuntimeError};
use nodus_sdk::{callback, CallbackError, CallbackRef, Value};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

type Journal = Arc<Mutex<Vec<String>>>;

fn config() -> RuntimeConfig {
    let mut config = RuntimeConfig::default();
    config.pool.core_threads = 1;
    config.pool.max_threads = Some(2);
    config
}

fn listener(journal: &Journal) -> CallbackRef {
    let journal = journal.clone();
    callback(move |name, _| {
        journal.lock().push(format!("listener:{}", name.unwrap_or("?")));
        Ok(())
    })
}

/// Records its lifecycle and fails where asked
#[derive(Default)]
struct Scripted {
    journal: Journal,
    fail_init: bool,
    fail_timer: bool,
    fail_finalize: bool,
    exit_code: Option<i32>,
}

impl Program for Scripted {
    fn init(&mut self, cx: &mut Context<'_>) -> Result<(), CallbackError> {
        self.journal.lock().push("init".into());
        if self.fail_init {
            return Err(CallbackError::script("init failed"));
        }
        let journal = self.journal.clone();
        let fail = self.fail_timer;
        cx.modules().timers.set_timeout(
            5.0,
            callback(move |_, _| {
                journal.lock().push("timer".into());
                if fail {
                    return Err(CallbackError::script("timer failed"));
                }
                Ok(())
            }),
            vec![],
        );
        if let Some(code) = self.exit_code {
            cx.set_exit_code(code);
        }
        Ok(())
    }

    fn finalize(&mut self, _cx: &mut Context<'_>) -> Result<(), CallbackError> {
        self.journal.lock().push("finalize".into());
        if self.fail_finalize {
            return Err(CallbackError::host("finalize failed"));
        }
        Ok(())
    }
}

#[test]
fn test_normal_lifecycle() {
    let journal = Journal::default();
    let mut runtime = Runtime::new(config()).unwrap().with_listener(listener(&journal));
    let mut program = Scripted {
        journal: journal.clone(),
        exit_code: Some(3),
        ..Default::default()
    };

    assert_eq!(runtime.run(&mut program).unwrap(), 3);
    assert_eq!(
        *journal.lock(),
        vec!["init", "listener:started", "timer", "finalize", "listener:stopped"]
    );
    assert_eq!(runtime.exit_code(), 3);
}

#[test]
fn test_unhandled_init_error_skips_loop() {
    let journal = Journal::default();
    let mut runtime = Runtime::new(config()).unwrap().with_listener(listener(&journal));
    let mut program = Scripted {
        journal: journal.clone(),
        fail_init: true,
        ..Default::default()
    };

    let err = runtime.run(&mut program).unwrap_err();
    assert_eq!(err.exit_code(), 1);
    assert_eq!(*journal.lock(), vec!["init", "finalize", "listener:stopped"]);
    match err {
        RuntimeError::Loop(e) => {
            let uncaught = e.as_uncaught().unwrap();
            assert_eq!(uncaught.root.to_string(), "init failed");
            assert!(uncaught.suppressed.is_empty());
        }
        other => panic!("unexpected error {}", other),
    }
}

#[test]
fn test_finalization_failure_is_suppressed() {
    let journal = Journal::default();
    let mut runtime = Runtime::new(config()).unwrap();
    let mut program = Scripted {
        journal: journal.clone(),
        fail_timer: true,
        fail_finalize: true,
        ..Default::default()
    };

    let err = runtime.run(&mut program).unwrap_err();
    let RuntimeError::Loop(e) = err else {
        panic!("expected a loop error");
    };
    let uncaught = e.as_uncaught().unwrap();
    assert_eq!(uncaught.root.to_string(), "timer failed");
    assert_eq!(uncaught.suppressed.len(), 1);
    assert_eq!(uncaught.suppressed[0].to_string(), "finalize failed");
    assert_eq!(runtime.exit_code(), 1);
    assert_eq!(*journal.lock(), vec!["init", "timer", "finalize"]);
}

#[test]
fn test_handled_init_error_keeps_running() {
    let journal = Journal::default();
    let mut runtime = Runtime::new(config()).unwrap().with_listener(listener(&journal));

    let seen = journal.clone();
    runtime.event_loop().set_uncaught_exception_handler(
        Arc::new(|event: &str| Ok(event == UNCAUGHT_EXCEPTION)),
        callback(move |_, args| {
            let message = args[0].get("message").and_then(Value::as_str).unwrap_or("");
            seen.lock().push(format!("handler:{}", message));
            Ok(())
        }),
    );

    let mut program = Scripted {
        journal: journal.clone(),
        fail_init: true,
        ..Default::default()
    };
    assert_eq!(runtime.run(&mut program).unwrap(), 0);
    assert_eq!(
        *journal.lock(),
        vec![
            "init",
            "handler:init failed",
            "listener:started",
            "finalize",
            "listener:stopped"
        ]
    );
}

#[test]
fn test_embedded_runs_until_closed() {
    let mut embedded = config();
    embedded.embedded = true;
    let mut runtime = Runtime::new(embedded).unwrap();
    let closer = runtime.closer();

    let start = Instant::now();
    let remote = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        closer.close();
        closer.close();
        closer.is_closed()
    });

    let journal = Journal::default();
    let mut program = Scripted {
        journal: journal.clone(),
        ..Default::default()
    };
    assert_eq!(runtime.run(&mut program).unwrap(), 0);
    assert!(start.elapsed() >= Duration::from_millis(50));
    assert!(remote.join().unwrap());
    assert_eq!(journal.lock().last().map(String::as_str), Some("finalize"));
}

#[test]
fn test_closer_ignored_when_not_embedded() {
    let mut runtime = Runtime::new(config()).unwrap();
    let closer = runtime.closer();
    closer.close();
    assert!(closer.is_closed());

    let journal = Journal::default();
    let mut program = Scripted {
        journal: journal.clone(),
        ..Default::default()
    };
    assert_eq!(runtime.run(&mut program).unwrap(), 0);
    assert!(journal.lock().contains(&"timer".to_string()));
}

#[test]
fn test_runtimes_share_a_pool() {
    use nodus_engine::{Logging, PoolConfig, WorkerPool};

    let pool = Arc::new(
        WorkerPool::new(
            PoolConfig {
                core_threads: 2,
                max_threads: Some(4),
                ..Default::default()
            },
            Logging::new(false).get("pool"),
        )
        .unwrap(),
    );

    for instance in 0..3 {
        let mut config = config();
        config.event_loop.instance = instance;
        let mut runtime = Runtime::with_shared_pool(config, pool.clone()).unwrap();
        let journal = Journal::default();
        let mut program = Scripted {
            journal: journal.clone(),
            ..Default::default()
        };
        assert_eq!(runtime.run(&mut program).unwrap(), 0);
        assert_eq!(*journal.lock(), vec!["init", "timer", "finalize"]);
    }
    assert!(!pool.is_shutdown());
}
