//! Child process plumbing: spawn with piped stdio, non-blocking reads,
//! signal-based pause/stop.
//!
//! Reads from stdout/stderr report would-block as zero bytes available
//! rather than as an error, so callers can poll without special-casing
//! EAGAIN.

use std::io::{Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::process::ExitStatusExt;
use std::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tracing::debug;

use crate::error::SupervisorError;

/// Poll step while waiting out the SIGTERM grace.
const WAIT_POLL: Duration = Duration::from_millis(50);

/// One spawned child with its three pipes.
pub(crate) struct ChildHandle {
    pid: i32,
    child: Mutex<Child>,
    stdin: Mutex<Option<ChildStdin>>,
    stdout: Mutex<Option<ChildStdout>>,
    stderr: Mutex<Option<ChildStderr>>,
}

impl ChildHandle {
    /// Spawn `command` with argv and pipe all three stdio streams. The
    /// output pipes are switched to non-blocking immediately.
    pub fn spawn(command: &str, args: &[String]) -> Result<Self, SupervisorError> {
        let mut child = Command::new(command)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        if let Some(out) = &stdout {
            set_nonblocking(out)?;
        }
        if let Some(err) = &stderr {
            set_nonblocking(err)?;
        }

        let pid = child.id() as i32;
        debug!("spawned child {} (pid {})", command, pid);

        Ok(Self {
            pid,
            child: Mutex::new(child),
            stdin: Mutex::new(stdin),
            stdout: Mutex::new(stdout),
            stderr: Mutex::new(stderr),
        })
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    /// Deliver a signal without reaping.
    pub fn signal(&self, signal: Signal) -> Result<(), SupervisorError> {
        kill(Pid::from_raw(self.pid), signal)
            .map_err(|e| SupervisorError::Signal(format!("{} to pid {}: {}", signal, self.pid, e)))
    }

    /// Non-blocking exit check. Returns the exit code once the child has
    /// been reaped.
    pub fn try_wait(&self) -> Result<Option<i32>, SupervisorError> {
        let mut child = self.child.lock().unwrap_or_else(|e| e.into_inner());
        Ok(child.try_wait()?.map(exit_code))
    }

    /// SIGTERM, wait out the grace, then SIGKILL. Returns the exit code.
    pub fn stop_with_grace(&self, grace: Duration) -> Result<i32, SupervisorError> {
        if let Some(code) = self.try_wait()? {
            return Ok(code);
        }

        self.signal(Signal::SIGTERM)?;
        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            if let Some(code) = self.try_wait()? {
                return Ok(code);
            }
            std::thread::sleep(WAIT_POLL);
        }

        debug!("pid {} survived SIGTERM grace, sending SIGKILL", self.pid);
        self.signal(Signal::SIGKILL)?;
        let mut child = self.child.lock().unwrap_or_else(|e| e.into_inner());
        Ok(exit_code(child.wait()?))
    }

    /// SIGKILL and reap immediately.
    pub fn kill_now(&self) -> Result<i32, SupervisorError> {
        if let Some(code) = self.try_wait()? {
            return Ok(code);
        }
        self.signal(Signal::SIGKILL)?;
        let mut child = self.child.lock().unwrap_or_else(|e| e.into_inner());
        Ok(exit_code(child.wait()?))
    }

    /// Write to the child's stdin.
    pub fn write_stdin(&self, bytes: &[u8]) -> Result<usize, SupervisorError> {
        let mut stdin = self.stdin.lock().unwrap_or_else(|e| e.into_inner());
        match stdin.as_mut() {
            Some(pipe) => {
                let written = pipe.write(bytes)?;
                pipe.flush()?;
                Ok(written)
            }
            None => Err(SupervisorError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "stdin closed",
            ))),
        }
    }

    /// Read from the child's stdout; zero means nothing available right
    /// now (or the pipe is closed).
    pub fn read_stdout(&self, buf: &mut [u8]) -> Result<usize, SupervisorError> {
        read_nonblocking(&self.stdout, buf)
    }

    /// Read from the child's stderr; same would-block convention.
    pub fn read_stderr(&self, buf: &mut [u8]) -> Result<usize, SupervisorError> {
        read_nonblocking(&self.stderr, buf)
    }
}

fn read_nonblocking<R: Read>(
    pipe: &Mutex<Option<R>>,
    buf: &mut [u8],
) -> Result<usize, SupervisorError> {
    let mut guard = pipe.lock().unwrap_or_else(|e| e.into_inner());
    let Some(reader) = guard.as_mut() else {
        return Ok(0);
    };
    match reader.read(buf) {
        Ok(n) => Ok(n),
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(0),
        Err(e) => Err(e.into()),
    }
}

fn set_nonblocking<F: std::os::fd::AsFd>(fd: &F) -> Result<(), SupervisorError> {
    let raw_fd = fd.as_fd().as_raw_fd();
    let flags = fcntl(raw_fd, FcntlArg::F_GETFL)
        .map_err(|e| SupervisorError::Io(std::io::Error::from_raw_os_error(e as i32)))?;
    let mut oflags = OFlag::from_bits_truncate(flags);
    oflags.insert(OFlag::O_NONBLOCK);
    fcntl(raw_fd, FcntlArg::F_SETFL(oflags))
        .map_err(|e| SupervisorError::Io(std::io::Error::from_raw_os_error(e as i32)))?;
    Ok(())
}

/// Exit code, folding a terminating signal into the 128+n convention.
fn exit_code(status: std::process::ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|s| 128 + s))
        .unwrap_or(-1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawn_echo_and_read_output() {
        let child =
            ChildHandle::spawn("sh", &["-c".to_string(), "echo hello".to_string()]).unwrap();

        // Wait for exit, then drain stdout.
        let mut code = None;
        for _ in 0..100 {
            if let Some(c) = child.try_wait().unwrap() {
                code = Some(c);
                break;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(code, Some(0));

        let mut buf = [0u8; 64];
        let n = child.read_stdout(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello\n");
    }

    #[test]
    fn read_with_nothing_available_returns_zero() {
        let child = ChildHandle::spawn("sleep", &["2".to_string()]).unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(child.read_stdout(&mut buf).unwrap(), 0);
        assert_eq!(child.read_stderr(&mut buf).unwrap(), 0);
        child.kill_now().unwrap();
    }

    #[test]
    fn stdin_roundtrip_through_cat() {
        let child = ChildHandle::spawn("cat", &[]).unwrap();
        child.write_stdin(b"ping\n").unwrap();

        let mut buf = [0u8; 16];
        let mut n = 0;
        for _ in 0..100 {
            n = child.read_stdout(&mut buf).unwrap();
            if n > 0 {
                break;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(&buf[..n], b"ping\n");
        child.kill_now().unwrap();
    }

    #[test]
    fn sigterm_grace_then_exit_code() {
        let child = ChildHandle::spawn("sleep", &["30".to_string()]).unwrap();
        let started = Instant::now();
        let code = child.stop_with_grace(Duration::from_secs(1)).unwrap();
        // sleep dies on SIGTERM within the grace.
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(code, 128 + libc_sigterm());
    }

    #[test]
    fn sigkill_after_grace_for_ignoring_child() {
        // This shell traps and ignores SIGTERM, so the grace must elapse
        // and SIGKILL must finish the job.
        let child = ChildHandle::spawn(
            "sh",
            &["-c".to_string(), "trap '' TERM; sleep 30".to_string()],
        )
        .unwrap();
        std::thread::sleep(Duration::from_millis(100));
        let started = Instant::now();
        let code = child.stop_with_grace(Duration::from_millis(500)).unwrap();
        assert!(started.elapsed() >= Duration::from_millis(500));
        assert_eq!(code, 128 + libc_sigkill());
    }

    #[test]
    fn exit_codes_propagate() {
        let child = ChildHandle::spawn("sh", &["-c".to_string(), "exit 7".to_string()]).unwrap();
        let mut code = None;
        for _ in 0..100 {
            if let Some(c) = child.try_wait().unwrap() {
                code = Some(c);
                break;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(code, Some(7));
    }

    fn libc_sigterm() -> i32 {
        Signal::SIGTERM as i32
    }

    fn libc_sigkill() -> i32 {
        Signal::SIGKILL as i32
    }
}
