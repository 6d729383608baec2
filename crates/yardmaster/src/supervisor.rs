//! The supervisor: record table, lifecycle operations, attachment registry.
//!
//! All records live in one mutex-guarded table owned by the supervisor;
//! workers carry only their id and a control handle, never a pointer into
//! the table. Destroying the supervisor marks the table invalid under the
//! lock first, so late callers that raced the teardown observe
//! [`SupervisorError::SupervisorGone`] instead of touching freed state.
//!
//! Per-record state machine:
//!
//! ```text
//! Created -> Running <-> Paused
//!     |         |
//!     |         +-> Stopped (terminal)
//!     +-> Error
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use nix::sys::signal::Signal;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::child::ChildHandle;
use crate::error::SupervisorError;
use crate::worker::{WorkerContext, WorkerControl, WorkerFn};

/// Grace between SIGTERM and SIGKILL when stopping a child process.
const STOP_GRACE: Duration = Duration::from_secs(1);

/// Poll step for join() waiting on a child record.
const JOIN_POLL: Duration = Duration::from_millis(50);

/// Lifecycle state of one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreadState {
    Created,
    Running,
    Paused,
    Stopped,
    Error,
}

/// What kind of worker a record hosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WorkerKind {
    #[serde(rename = "thread")]
    InProcess,
    #[serde(rename = "process")]
    ChildProcess,
}

/// Serializable snapshot of one record.
#[derive(Debug, Clone, Serialize)]
pub struct ThreadInfo {
    pub id: u64,
    pub state: ThreadState,
    #[serde(rename = "type")]
    pub kind: WorkerKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_status: Option<i32>,
}

/// The worker payload, retained so restart can recreate the record.
enum Payload {
    InProcess { body: WorkerFn, arg: Option<Value> },
    ChildProcess { command: String, args: Vec<String> },
}

struct Record {
    id: u64,
    state: ThreadState,
    tag: Option<String>,
    payload: Payload,
    control: Arc<WorkerControl>,
    join_handle: Option<std::thread::JoinHandle<()>>,
    child: Option<Arc<ChildHandle>>,
    exit_status: Option<i32>,
}

impl Record {
    fn kind(&self) -> WorkerKind {
        match self.payload {
            Payload::InProcess { .. } => WorkerKind::InProcess,
            Payload::ChildProcess { .. } => WorkerKind::ChildProcess,
        }
    }

    fn info(&self) -> ThreadInfo {
        let (command, args) = match &self.payload {
            Payload::InProcess { .. } => (None, None),
            Payload::ChildProcess { command, args } => {
                (Some(command.clone()), Some(args.clone()))
            }
        };
        ThreadInfo {
            id: self.id,
            state: self.state,
            kind: self.kind(),
            command,
            args,
            tag: self.tag.clone(),
            exit_status: self.exit_status,
        }
    }
}

struct Table {
    records: HashMap<u64, Record>,
    tags: HashMap<String, u64>,
    next_id: u64,
    destroyed: bool,
}

struct Inner {
    table: Mutex<Table>,
}

impl Inner {
    /// Lock the table, refusing once destroyed.
    fn lock(&self) -> Result<MutexGuard<'_, Table>, SupervisorError> {
        let table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        if table.destroyed {
            return Err(SupervisorError::SupervisorGone);
        }
        Ok(table)
    }

    /// Lock for internal machinery (worker finalizers, teardown) that must
    /// still reach the table after the destroyed marker is set.
    fn lock_internal(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Called from the worker thread when its body returns.
    fn finalize_worker(&self, id: u64) {
        let mut table = self.lock_internal();
        if let Some(record) = table.records.get_mut(&id) {
            if !matches!(record.state, ThreadState::Stopped | ThreadState::Error) {
                record.state = ThreadState::Stopped;
            }
            record.join_handle.take();
            debug!("worker {} finished, state {:?}", id, record.state);
        }
    }

    /// Called from a monitor thread when its child exits.
    fn finalize_child(&self, id: u64, exit_status: i32) {
        let mut table = self.lock_internal();
        if let Some(record) = table.records.get_mut(&id) {
            if record.exit_status.is_none() {
                record.exit_status = Some(exit_status);
            }
            if !matches!(record.state, ThreadState::Stopped | ThreadState::Error) {
                record.state = if exit_status == 0 {
                    ThreadState::Stopped
                } else {
                    ThreadState::Error
                };
            }
            debug!(
                "child {} exited with {}, state {:?}",
                id, exit_status, record.state
            );
        }
    }
}

/// Supervisor over a dynamic set of in-process workers and child
/// processes.
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                table: Mutex::new(Table {
                    records: HashMap::new(),
                    tags: HashMap::new(),
                    next_id: 1,
                    destroyed: false,
                }),
            }),
        }
    }

    // === creation ===

    /// Create an in-process worker. The body runs on its own OS thread and
    /// reaches Running automatically after the spawn prelude.
    pub fn create(
        &self,
        body: impl Fn(WorkerContext) + Send + Sync + 'static,
        arg: Option<Value>,
    ) -> Result<u64, SupervisorError> {
        let body: WorkerFn = Arc::new(body);
        let control = Arc::new(WorkerControl::new());

        let mut table = self.inner.lock()?;
        let id = table.next_id;
        table.next_id += 1;

        let handle = spawn_worker(&self.inner, id, body.clone(), arg.clone(), control.clone());
        table.records.insert(
            id,
            Record {
                id,
                state: ThreadState::Created,
                tag: None,
                payload: Payload::InProcess { body, arg },
                control,
                join_handle: Some(handle),
                child: None,
                exit_status: None,
            },
        );
        info!("created worker {}", id);
        Ok(id)
    }

    /// Create a child process worker with piped, non-blocking stdio.
    pub fn create_process(
        &self,
        command: impl Into<String>,
        args: Vec<String>,
    ) -> Result<u64, SupervisorError> {
        let command = command.into();
        let child = Arc::new(ChildHandle::spawn(&command, &args)?);
        let control = Arc::new(WorkerControl::new());

        let mut table = self.inner.lock()?;
        let id = table.next_id;
        table.next_id += 1;

        spawn_monitor(&self.inner, id, child.clone(), control.clone());
        table.records.insert(
            id,
            Record {
                id,
                state: ThreadState::Running,
                tag: None,
                payload: Payload::ChildProcess {
                    command: command.clone(),
                    args,
                },
                control,
                join_handle: None,
                child: Some(child),
                exit_status: None,
            },
        );
        info!("created process {} ({})", id, command);
        Ok(id)
    }

    // === lifecycle ===

    /// Signal a record to stop and wait for it. Stopping a record that is
    /// already Stopped is a no-op.
    pub fn stop(&self, id: u64) -> Result<(), SupervisorError> {
        self.stop_inner(id, false)
    }

    /// `bypass_destroyed` lets the teardown path keep stopping records
    /// after the destroyed marker is set.
    fn stop_inner(&self, id: u64, bypass_destroyed: bool) -> Result<(), SupervisorError> {
        enum StopAction {
            Join(Option<std::thread::JoinHandle<()>>),
            Terminate(Arc<ChildHandle>),
            Done,
        }

        let action = {
            let mut table = if bypass_destroyed {
                self.inner.lock_internal()
            } else {
                self.inner.lock()?
            };
            let record = table
                .records
                .get_mut(&id)
                .ok_or(SupervisorError::ThreadNotFound(id))?;
            match record.state {
                ThreadState::Stopped => StopAction::Done,
                _ => {
                    record.control.request_stop();
                    match &record.child {
                        Some(child) => StopAction::Terminate(child.clone()),
                        None => StopAction::Join(record.join_handle.take()),
                    }
                }
            }
        };

        // The table lock is dropped before any waiting.
        match action {
            StopAction::Done => Ok(()),
            StopAction::Join(handle) => {
                if let Some(handle) = handle {
                    if handle.join().is_err() {
                        warn!("worker {} panicked", id);
                        let mut table = self.inner.lock_internal();
                        if let Some(record) = table.records.get_mut(&id) {
                            record.state = ThreadState::Error;
                        }
                        return Ok(());
                    }
                }
                let mut table = self.inner.lock_internal();
                if let Some(record) = table.records.get_mut(&id) {
                    record.state = ThreadState::Stopped;
                }
                info!("stopped worker {}", id);
                Ok(())
            }
            StopAction::Terminate(child) => {
                let code = child.stop_with_grace(STOP_GRACE)?;
                let mut table = self.inner.lock_internal();
                if let Some(record) = table.records.get_mut(&id) {
                    record.state = ThreadState::Stopped;
                    if record.exit_status.is_none() {
                        record.exit_status = Some(code);
                    }
                }
                info!("stopped process {} (exit {})", id, code);
                Ok(())
            }
        }
    }

    /// Pause a Running record. In-process workers park at their next
    /// checkpoint; child processes receive SIGSTOP.
    pub fn pause(&self, id: u64) -> Result<(), SupervisorError> {
        let mut table = self.inner.lock()?;
        let record = table
            .records
            .get_mut(&id)
            .ok_or(SupervisorError::ThreadNotFound(id))?;
        if record.state != ThreadState::Running {
            return Err(SupervisorError::InvalidTransition {
                id,
                from: record.state,
                operation: "pause",
            });
        }
        match &record.child {
            Some(child) => child.signal(Signal::SIGSTOP)?,
            None => record.control.request_pause(),
        }
        record.state = ThreadState::Paused;
        debug!("paused {}", id);
        Ok(())
    }

    /// Resume a Paused record.
    pub fn resume(&self, id: u64) -> Result<(), SupervisorError> {
        let mut table = self.inner.lock()?;
        let record = table
            .records
            .get_mut(&id)
            .ok_or(SupervisorError::ThreadNotFound(id))?;
        if record.state != ThreadState::Paused {
            return Err(SupervisorError::InvalidTransition {
                id,
                from: record.state,
                operation: "resume",
            });
        }
        match &record.child {
            Some(child) => child.signal(Signal::SIGCONT)?,
            None => record.control.request_resume(),
        }
        record.state = ThreadState::Running;
        debug!("resumed {}", id);
        Ok(())
    }

    /// Force-terminate a record. Child processes get SIGKILL; in-process
    /// workers are flagged and detached (threads cannot be preempted).
    pub fn kill(&self, id: u64) -> Result<(), SupervisorError> {
        let child = {
            let mut table = self.inner.lock()?;
            let record = table
                .records
                .get_mut(&id)
                .ok_or(SupervisorError::ThreadNotFound(id))?;
            if record.state == ThreadState::Stopped {
                return Ok(());
            }
            record.control.request_stop();
            match &record.child {
                Some(child) => Some(child.clone()),
                None => {
                    // Detach; the body observes should_exit at its next
                    // checkpoint.
                    record.join_handle.take();
                    record.state = ThreadState::Stopped;
                    None
                }
            }
        };

        if let Some(child) = child {
            let code = child.kill_now()?;
            let mut table = self.inner.lock_internal();
            if let Some(record) = table.records.get_mut(&id) {
                record.state = ThreadState::Stopped;
                if record.exit_status.is_none() {
                    record.exit_status = Some(code);
                }
            }
        }
        info!("killed {}", id);
        Ok(())
    }

    /// Stop and recreate a record in place, preserving its id and worker
    /// payload. For in-process workers `new_arg` replaces the argument; for
    /// child processes an array of strings replaces the argv.
    pub fn restart(&self, id: u64, new_arg: Option<Value>) -> Result<(), SupervisorError> {
        self.stop(id)?;

        let mut table = self.inner.lock()?;
        let record = table
            .records
            .get_mut(&id)
            .ok_or(SupervisorError::ThreadNotFound(id))?;

        let control = Arc::new(WorkerControl::new());
        match &mut record.payload {
            Payload::InProcess { body, arg } => {
                if let Some(value) = new_arg {
                    *arg = Some(value);
                }
                record.control = control.clone();
                record.exit_status = None;
                record.child = None;
                record.state = ThreadState::Created;
                record.join_handle = Some(spawn_worker(
                    &self.inner,
                    id,
                    body.clone(),
                    arg.clone(),
                    control,
                ));
            }
            Payload::ChildProcess { command, args } => {
                if let Some(Value::Array(values)) = new_arg {
                    *args = values
                        .into_iter()
                        .filter_map(|v| match v {
                            Value::String(s) => Some(s),
                            other => Some(other.to_string()),
                        })
                        .collect();
                }
                let child = Arc::new(ChildHandle::spawn(command, args)?);
                record.control = control.clone();
                record.exit_status = None;
                record.child = Some(child.clone());
                record.state = ThreadState::Running;
                spawn_monitor(&self.inner, id, child, control);
            }
        }
        info!("restarted {}", id);
        Ok(())
    }

    /// Wait for a record to finish. Returns the exit code for child
    /// processes, `None` for in-process workers.
    pub fn join(&self, id: u64) -> Result<Option<i32>, SupervisorError> {
        let (handle, is_child) = {
            let mut table = self.inner.lock()?;
            let record = table
                .records
                .get_mut(&id)
                .ok_or(SupervisorError::ThreadNotFound(id))?;
            (record.join_handle.take(), record.child.is_some())
        };

        if let Some(handle) = handle {
            if handle.join().is_err() {
                let mut table = self.inner.lock_internal();
                if let Some(record) = table.records.get_mut(&id) {
                    record.state = ThreadState::Error;
                }
            }
            return Ok(None);
        }

        if !is_child {
            // Worker already finished (or was detached by kill).
            return Ok(None);
        }

        // Child records: the monitor thread observes the exit; poll for it.
        loop {
            {
                let table = self.inner.lock()?;
                let record = table
                    .records
                    .get(&id)
                    .ok_or(SupervisorError::ThreadNotFound(id))?;
                if matches!(record.state, ThreadState::Stopped | ThreadState::Error) {
                    return Ok(record.exit_status);
                }
            }
            std::thread::sleep(JOIN_POLL);
        }
    }

    // === queries ===

    pub fn is_alive(&self, id: u64) -> Result<bool, SupervisorError> {
        Ok(matches!(
            self.get_state(id)?,
            ThreadState::Created | ThreadState::Running | ThreadState::Paused
        ))
    }

    pub fn get_state(&self, id: u64) -> Result<ThreadState, SupervisorError> {
        let table = self.inner.lock()?;
        table
            .records
            .get(&id)
            .map(|record| record.state)
            .ok_or(SupervisorError::ThreadNotFound(id))
    }

    pub fn get_info(&self, id: u64) -> Result<ThreadInfo, SupervisorError> {
        let table = self.inner.lock()?;
        table
            .records
            .get(&id)
            .map(Record::info)
            .ok_or(SupervisorError::ThreadNotFound(id))
    }

    pub fn get_count(&self) -> Result<usize, SupervisorError> {
        Ok(self.inner.lock()?.records.len())
    }

    pub fn get_all_ids(&self) -> Result<Vec<u64>, SupervisorError> {
        let table = self.inner.lock()?;
        let mut ids: Vec<u64> = table.records.keys().copied().collect();
        ids.sort_unstable();
        Ok(ids)
    }

    /// Snapshot every record, for status reporting or JSON persistence.
    pub fn snapshot(&self) -> Result<Vec<ThreadInfo>, SupervisorError> {
        let table = self.inner.lock()?;
        let mut infos: Vec<ThreadInfo> = table.records.values().map(Record::info).collect();
        infos.sort_unstable_by_key(|info| info.id);
        Ok(infos)
    }

    /// Exit code of a child process record; defined only once Stopped.
    pub fn get_exit_status(&self, id: u64) -> Result<i32, SupervisorError> {
        let table = self.inner.lock()?;
        let record = table
            .records
            .get(&id)
            .ok_or(SupervisorError::ThreadNotFound(id))?;
        if record.kind() != WorkerKind::ChildProcess {
            return Err(SupervisorError::NotAProcess(id));
        }
        if !matches!(record.state, ThreadState::Stopped | ThreadState::Error) {
            return Err(SupervisorError::ExitStatusUnavailable(id));
        }
        record
            .exit_status
            .ok_or(SupervisorError::ExitStatusUnavailable(id))
    }

    // === child stdio ===

    pub fn write_to_process(&self, id: u64, bytes: &[u8]) -> Result<usize, SupervisorError> {
        self.with_child(id, |child| child.write_stdin(bytes))
    }

    pub fn read_from_process(&self, id: u64, buf: &mut [u8]) -> Result<usize, SupervisorError> {
        self.with_child(id, |child| child.read_stdout(buf))
    }

    pub fn read_error_from_process(
        &self,
        id: u64,
        buf: &mut [u8],
    ) -> Result<usize, SupervisorError> {
        self.with_child(id, |child| child.read_stderr(buf))
    }

    fn with_child<T>(
        &self,
        id: u64,
        f: impl FnOnce(&ChildHandle) -> Result<T, SupervisorError>,
    ) -> Result<T, SupervisorError> {
        let child = {
            let table = self.inner.lock()?;
            let record = table
                .records
                .get(&id)
                .ok_or(SupervisorError::ThreadNotFound(id))?;
            record
                .child
                .clone()
                .ok_or(SupervisorError::NotAProcess(id))?
        };
        f(&child)
    }

    // === attachment registry ===

    /// Register an opaque tag for a record. Tags are unique within the
    /// supervisor.
    pub fn register(&self, id: u64, tag: impl Into<String>) -> Result<(), SupervisorError> {
        let tag = tag.into();
        let mut table = self.inner.lock()?;
        if !table.records.contains_key(&id) {
            return Err(SupervisorError::ThreadNotFound(id));
        }
        if table.tags.contains_key(&tag) {
            return Err(SupervisorError::TagExists(tag));
        }
        table.tags.insert(tag.clone(), id);
        if let Some(record) = table.records.get_mut(&id) {
            record.tag = Some(tag);
        }
        Ok(())
    }

    pub fn unregister(&self, tag: &str) -> Result<(), SupervisorError> {
        let mut table = self.inner.lock()?;
        let id = table
            .tags
            .remove(tag)
            .ok_or_else(|| SupervisorError::AttachmentNotFound(tag.to_string()))?;
        if let Some(record) = table.records.get_mut(&id) {
            record.tag = None;
        }
        Ok(())
    }

    pub fn find_by_attachment(&self, tag: &str) -> Result<u64, SupervisorError> {
        let table = self.inner.lock()?;
        table
            .tags
            .get(tag)
            .copied()
            .ok_or_else(|| SupervisorError::AttachmentNotFound(tag.to_string()))
    }

    pub fn stop_by_attachment(&self, tag: &str) -> Result<(), SupervisorError> {
        let id = self.find_by_attachment(tag)?;
        self.stop(id)
    }

    pub fn restart_by_attachment(
        &self,
        tag: &str,
        new_arg: Option<Value>,
    ) -> Result<(), SupervisorError> {
        let id = self.find_by_attachment(tag)?;
        self.restart(id, new_arg)
    }

    pub fn kill_by_attachment(&self, tag: &str) -> Result<(), SupervisorError> {
        let id = self.find_by_attachment(tag)?;
        self.kill(id)
    }

    // === teardown ===

    /// Stop every record and invalidate the table. The destroyed marker is
    /// set under the lock before any record is touched.
    pub fn destroy(&self) {
        let ids = {
            let mut table = self.inner.lock_internal();
            if table.destroyed {
                return;
            }
            table.destroyed = true;
            table.tags.clear();
            let mut ids: Vec<u64> = table.records.keys().copied().collect();
            ids.sort_unstable();
            ids
        };

        for id in ids {
            if let Err(e) = self.stop_inner(id, true) {
                warn!("destroy: stopping {} failed: {}", id, e);
            }
        }
        info!("supervisor destroyed");
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Spawn the OS thread hosting an in-process worker body.
fn spawn_worker(
    inner: &Arc<Inner>,
    id: u64,
    body: WorkerFn,
    arg: Option<Value>,
    control: Arc<WorkerControl>,
) -> std::thread::JoinHandle<()> {
    let inner = inner.clone();
    std::thread::spawn(move || {
        // Worker prelude: mark Running before the body gets control.
        {
            let mut table = inner.lock_internal();
            if let Some(record) = table.records.get_mut(&id) {
                if record.state == ThreadState::Created {
                    record.state = ThreadState::Running;
                }
            }
        }
        let context = WorkerContext::new(id, arg, control);
        body(context);
        inner.finalize_worker(id);
    })
}

/// Spawn the monitor thread that reaps a child process when it exits on
/// its own.
fn spawn_monitor(inner: &Arc<Inner>, id: u64, child: Arc<ChildHandle>, control: Arc<WorkerControl>) {
    let inner = inner.clone();
    std::thread::spawn(move || {
        loop {
            match child.try_wait() {
                Ok(Some(code)) => {
                    inner.finalize_child(id, code);
                    break;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!("monitor for {} failed: {}", id, e);
                    break;
                }
            }
            if control.should_exit() {
                // stop()/kill() own the reaping from here.
                break;
            }
            std::thread::sleep(Duration::from_millis(100));
        }
    });
}
