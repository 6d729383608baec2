//! Cooperative pause/stop machinery for in-process workers.
//!
//! The pause contract: a worker that intends to be pausable MUST call
//! [`WorkerContext::check_pause`] at safe points and
//! [`WorkerContext::should_exit`] in loops. `check_pause` parks the thread
//! on a condition variable while paused and wakes on resume or stop.

use std::sync::{Arc, Condvar, Mutex};

use serde_json::Value;

#[derive(Debug, Default)]
struct ControlFlags {
    paused: bool,
    should_exit: bool,
}

/// Shared pause/stop flags for one worker. The supervisor holds the writer
/// side; the worker polls through its [`WorkerContext`].
#[derive(Debug, Default)]
pub struct WorkerControl {
    flags: Mutex<ControlFlags>,
    cond: Condvar,
}

impl WorkerControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block while paused. Returns `false` when the worker should exit
    /// instead of continuing.
    pub fn check_pause(&self) -> bool {
        let mut flags = self.flags.lock().unwrap_or_else(|e| e.into_inner());
        while flags.paused && !flags.should_exit {
            flags = self
                .cond
                .wait(flags)
                .unwrap_or_else(|e| e.into_inner());
        }
        !flags.should_exit
    }

    pub fn should_exit(&self) -> bool {
        self.flags
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .should_exit
    }

    pub(crate) fn request_pause(&self) {
        self.flags
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .paused = true;
    }

    pub(crate) fn request_resume(&self) {
        self.flags
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .paused = false;
        self.cond.notify_all();
    }

    pub(crate) fn request_stop(&self) {
        {
            let mut flags = self.flags.lock().unwrap_or_else(|e| e.into_inner());
            flags.should_exit = true;
            flags.paused = false;
        }
        self.cond.notify_all();
    }
}

/// The worker body's view of its record: id, argument, and checkpoints.
///
/// Workers never hold a pointer back into the supervisor table - only the
/// id and this control handle.
#[derive(Clone)]
pub struct WorkerContext {
    id: u64,
    arg: Option<Value>,
    control: Arc<WorkerControl>,
}

impl WorkerContext {
    pub(crate) fn new(id: u64, arg: Option<Value>, control: Arc<WorkerControl>) -> Self {
        Self { id, arg, control }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn arg(&self) -> Option<&Value> {
        self.arg.as_ref()
    }

    /// Cooperative checkpoint: blocks while paused, returns `false` when
    /// the worker should exit.
    pub fn check_pause(&self) -> bool {
        self.control.check_pause()
    }

    pub fn should_exit(&self) -> bool {
        self.control.should_exit()
    }
}

/// An in-process worker body. Kept behind an `Arc` so restart can re-run
/// the same function with the same (or a replacement) argument.
pub type WorkerFn = Arc<dyn Fn(WorkerContext) + Send + Sync + 'static>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn checkpoint_passes_when_running() {
        let control = WorkerControl::new();
        assert!(control.check_pause());
        assert!(!control.should_exit());
    }

    #[test]
    fn stop_unblocks_paused_checkpoint() {
        let control = Arc::new(WorkerControl::new());
        control.request_pause();

        let worker_control = control.clone();
        let handle = std::thread::spawn(move || worker_control.check_pause());

        // The worker is parked on the condvar; stop must wake it and tell
        // it to exit.
        std::thread::sleep(Duration::from_millis(50));
        control.request_stop();
        assert!(!handle.join().unwrap());
    }

    #[test]
    fn resume_unblocks_paused_checkpoint() {
        let control = Arc::new(WorkerControl::new());
        control.request_pause();

        let worker_control = control.clone();
        let handle = std::thread::spawn(move || worker_control.check_pause());

        std::thread::sleep(Duration::from_millis(50));
        control.request_resume();
        assert!(handle.join().unwrap());
    }
}
