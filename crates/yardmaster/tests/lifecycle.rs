//! End-to-end lifecycle tests: counter worker pause/resume, child process
//! stop semantics, exit status visibility.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use yardmaster::{Supervisor, SupervisorError, ThreadState, WorkerContext};

/// A worker that increments a counter every tick while honouring its
/// checkpoints.
fn counter_worker(counter: Arc<AtomicU64>) -> impl Fn(WorkerContext) + Send + Sync + 'static {
    move |ctx: WorkerContext| {
        while ctx.check_pause() {
            counter.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}

#[test]
fn pause_stalls_counter_resume_restores_it() {
    let supervisor = Supervisor::new();
    let counter = Arc::new(AtomicU64::new(0));
    let id = supervisor.create(counter_worker(counter.clone()), None).unwrap();

    // Let it tick, then pause.
    std::thread::sleep(Duration::from_millis(200));
    supervisor.pause(id).unwrap();
    // One more increment may land between our pause and the worker's next
    // checkpoint; settle first.
    std::thread::sleep(Duration::from_millis(50));
    let at_pause = counter.load(Ordering::SeqCst);
    assert!(at_pause > 0, "worker never ticked before pause");

    // While paused, the counter stalls.
    std::thread::sleep(Duration::from_millis(300));
    assert_eq!(counter.load(Ordering::SeqCst), at_pause);

    // Resume: ticking continues.
    supervisor.resume(id).unwrap();
    std::thread::sleep(Duration::from_millis(300));
    assert!(counter.load(Ordering::SeqCst) > at_pause);

    // Stop: terminal.
    supervisor.stop(id).unwrap();
    assert_eq!(supervisor.get_state(id).unwrap(), ThreadState::Stopped);

    // get_exit_status is defined only for process records.
    assert!(matches!(
        supervisor.get_exit_status(id),
        Err(SupervisorError::NotAProcess(_))
    ));
}

#[test]
fn child_process_full_lifecycle() {
    let supervisor = Supervisor::new();
    let id = supervisor
        .create_process("sleep", vec!["30".to_string()])
        .unwrap();
    assert_eq!(supervisor.get_state(id).unwrap(), ThreadState::Running);
    assert!(supervisor.is_alive(id).unwrap());

    // Exit status is undefined while running.
    assert!(matches!(
        supervisor.get_exit_status(id),
        Err(SupervisorError::ExitStatusUnavailable(_))
    ));

    supervisor.pause(id).unwrap();
    assert_eq!(supervisor.get_state(id).unwrap(), ThreadState::Paused);
    supervisor.resume(id).unwrap();
    assert_eq!(supervisor.get_state(id).unwrap(), ThreadState::Running);

    // SIGTERM lands within the ~1s grace; sleep exits on it.
    let started = std::time::Instant::now();
    supervisor.stop(id).unwrap();
    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(supervisor.get_state(id).unwrap(), ThreadState::Stopped);
    assert!(supervisor.get_exit_status(id).is_ok());
}

#[test]
fn child_that_exits_on_its_own_is_reaped() {
    let supervisor = Supervisor::new();
    let id = supervisor
        .create_process("sh", vec!["-c".to_string(), "exit 3".to_string()])
        .unwrap();

    // The monitor thread observes the exit without any stop() call.
    let mut state = supervisor.get_state(id).unwrap();
    for _ in 0..100 {
        state = supervisor.get_state(id).unwrap();
        if matches!(state, ThreadState::Stopped | ThreadState::Error) {
            break;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    assert_eq!(state, ThreadState::Error);
    assert_eq!(supervisor.get_exit_status(id).unwrap(), 3);
}

#[test]
fn join_returns_child_exit_value() {
    let supervisor = Supervisor::new();
    let id = supervisor
        .create_process("sh", vec!["-c".to_string(), "exit 0".to_string()])
        .unwrap();
    assert_eq!(supervisor.join(id).unwrap(), Some(0));
    assert_eq!(supervisor.get_state(id).unwrap(), ThreadState::Stopped);
}

#[test]
fn child_stdio_pipes() {
    let supervisor = Supervisor::new();
    let id = supervisor.create_process("cat", vec![]).unwrap();
    supervisor.register(id, "echo-service").unwrap();

    let written = supervisor.write_to_process(id, b"over the wire\n").unwrap();
    assert_eq!(written, 14);

    let mut buf = [0u8; 64];
    let mut n = 0;
    for _ in 0..100 {
        n = supervisor.read_from_process(id, &mut buf).unwrap();
        if n > 0 {
            break;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    assert_eq!(&buf[..n], b"over the wire\n");

    supervisor.kill_by_attachment("echo-service").unwrap();
    assert_eq!(supervisor.get_state(id).unwrap(), ThreadState::Stopped);
}

#[test]
fn restart_process_with_new_argv() {
    let supervisor = Supervisor::new();
    let id = supervisor
        .create_process("sleep", vec!["30".to_string()])
        .unwrap();

    supervisor
        .restart(id, Some(serde_json::json!(["45"])))
        .unwrap();
    assert_eq!(supervisor.get_state(id).unwrap(), ThreadState::Running);

    let info = supervisor.get_info(id).unwrap();
    assert_eq!(info.args.as_deref(), Some(&["45".to_string()][..]));

    supervisor.kill(id).unwrap();
}

#[test]
fn destroy_stops_every_record() {
    let supervisor = Supervisor::new();
    let counter = Arc::new(AtomicU64::new(0));
    let worker = supervisor.create(counter_worker(counter), None).unwrap();
    let process = supervisor
        .create_process("sleep", vec!["30".to_string()])
        .unwrap();

    supervisor.destroy();

    // The records were stopped on the way down; the API now reports the
    // supervisor gone.
    assert!(matches!(
        supervisor.get_state(worker),
        Err(SupervisorError::SupervisorGone)
    ));
    assert!(matches!(
        supervisor.get_state(process),
        Err(SupervisorError::SupervisorGone)
    ));
}
