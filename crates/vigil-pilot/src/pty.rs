//! The shell's pseudo-terminal.
//!
//! [`PtySession`] forks a shell onto the slave side of a new PTY and keeps
//! the master side. Everything the shell and its children print is read from
//! the master; everything written to the master arrives as typed input. It
//! is the terminal channel the supervisor falls back to for delivery.

use std::ffi::CString;
use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::poll::{PollFd, PollFlags, PollTimeout};
use nix::pty::{openpty, OpenptyResult, Winsize};
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{self, ForkResult, Pid};
use tracing::{debug, warn};

use vigil_types::VigilError;

use crate::delivery::TerminalChannel;

/// `openpty` attempts before giving up.
const OPENPTY_ATTEMPTS: u32 = 3;
/// First retry delay; doubled on each further attempt.
const OPENPTY_BACKOFF: Duration = Duration::from_millis(100);
/// EAGAIN retries before a write gives up.
const WRITE_RETRY_LIMIT: u32 = 5_000;
const WRITE_RETRY_DELAY: Duration = Duration::from_millis(1);

/// Result of a non-blocking read from the master.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PtyRead {
    Data(usize),
    /// Nothing buffered right now.
    WouldBlock,
    /// Every slave descriptor is closed: the shell is gone.
    Closed,
}

/// What to run on the slave side.
#[derive(Debug, Clone)]
pub struct PtyCommand<'a> {
    pub program: &'a str,
    pub args: &'a [String],
    pub working_dir: Option<&'a Path>,
    pub env: &'a [(String, String)],
    pub size: Option<Winsize>,
}

impl<'a> PtyCommand<'a> {
    pub fn new(program: &'a str, args: &'a [String]) -> Self {
        Self {
            program,
            args,
            working_dir: None,
            env: &[],
            size: None,
        }
    }
}

/// A shell running on a pseudo-terminal.
pub struct PtySession {
    master: OwnedFd,
    child: Pid,
}

fn open_with_retry(size: Option<&Winsize>) -> Result<OpenptyResult, VigilError> {
    let mut last_error = None;
    for attempt in 0..OPENPTY_ATTEMPTS {
        match openpty(size, None) {
            Ok(pty) => return Ok(pty),
            Err(e) => {
                warn!(attempt = attempt + 1, error = %e, "openpty failed");
                last_error = Some(e);
                if attempt + 1 < OPENPTY_ATTEMPTS {
                    std::thread::sleep(OPENPTY_BACKOFF * 2u32.pow(attempt));
                }
            }
        }
    }
    Err(VigilError::PtyError(format!(
        "openpty failed after {OPENPTY_ATTEMPTS} attempts: {}",
        last_error.map(|e| e.to_string()).unwrap_or_default()
    )))
}

fn cstring(value: &str, what: &str) -> Result<CString, VigilError> {
    CString::new(value).map_err(|_| VigilError::PtyError(format!("{what} contains a NUL byte")))
}

impl PtySession {
    /// Fork `command` onto a fresh PTY.
    ///
    /// The master is non-blocking; use [`poll_readable`](Self::poll_readable)
    /// to wait for output.
    pub fn spawn(command: &PtyCommand<'_>) -> Result<Self, VigilError> {
        // Everything the child needs is allocated before fork.
        let program = cstring(command.program, "program")?;
        let mut argv = vec![program.clone()];
        for arg in command.args {
            argv.push(cstring(arg, "argument")?);
        }
        let dir = command
            .working_dir
            .map(|d| cstring(&d.to_string_lossy(), "working directory"))
            .transpose()?;
        let mut env = Vec::with_capacity(command.env.len());
        for (key, value) in command.env {
            env.push((cstring(key, "environment key")?, cstring(value, "environment value")?));
        }

        let pty = open_with_retry(command.size.as_ref())?;

        // Safety: the child only calls async-signal-safe functions before
        // exec, with all allocations done above.
        match unsafe { unistd::fork() } {
            Ok(ForkResult::Child) => {
                let code = child_exec(pty, &program, &argv, dir.as_ref(), &env);
                unsafe { libc::_exit(code) };
            }
            Ok(ForkResult::Parent { child }) => {
                drop(pty.slave);
                let flags = fcntl(pty.master.as_raw_fd(), FcntlArg::F_GETFL)
                    .map_err(|e| VigilError::PtyError(format!("fcntl F_GETFL: {e}")))?;
                fcntl(
                    pty.master.as_raw_fd(),
                    FcntlArg::F_SETFL(OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK),
                )
                .map_err(|e| VigilError::PtyError(format!("fcntl F_SETFL: {e}")))?;
                debug!(pid = child.as_raw(), program = command.program, "spawned on pty");
                Ok(Self {
                    master: pty.master,
                    child,
                })
            }
            Err(e) => Err(VigilError::PtyError(format!("fork failed: {e}"))),
        }
    }

    /// Non-blocking read of whatever output is buffered.
    pub fn read(&self, buf: &mut [u8]) -> Result<PtyRead, VigilError> {
        match unistd::read(self.master.as_raw_fd(), buf) {
            Ok(0) => Ok(PtyRead::Closed),
            Ok(n) => Ok(PtyRead::Data(n)),
            Err(Errno::EAGAIN) | Err(Errno::EINTR) => Ok(PtyRead::WouldBlock),
            // Linux reports a hung-up slave as EIO.
            Err(Errno::EIO) => Ok(PtyRead::Closed),
            Err(e) => Err(VigilError::PtyError(format!("pty read: {e}"))),
        }
    }

    /// Wait up to `timeout` for the master to become readable or hang up.
    pub fn poll_readable(&self, timeout: Duration) -> Result<bool, VigilError> {
        let mut fds = [PollFd::new(self.master.as_fd(), PollFlags::POLLIN)];
        let millis = u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX);
        let timeout = PollTimeout::try_from(millis).unwrap_or(PollTimeout::MAX);
        match nix::poll::poll(&mut fds, timeout) {
            Ok(0) => Ok(false),
            Ok(_) => Ok(fds[0]
                .revents()
                .is_some_and(|r| r.intersects(PollFlags::POLLIN | PollFlags::POLLHUP))),
            Err(Errno::EINTR) => Ok(false),
            Err(e) => Err(VigilError::PtyError(format!("poll: {e}"))),
        }
    }

    /// Write every byte, retrying a full buffer for a bounded time.
    ///
    /// Sleeps the calling thread between retries; async callers go through
    /// [`TerminalChannel::write_all`] instead.
    pub fn write_bytes(&self, data: &[u8]) -> Result<(), VigilError> {
        let mut written = 0;
        let mut retries = 0;
        while written < data.len() {
            match self.write_some(&data[written..])? {
                Some(n) => {
                    written += n;
                    retries = 0;
                }
                None => {
                    retries = next_retry(retries)?;
                    std::thread::sleep(WRITE_RETRY_DELAY);
                }
            }
        }
        Ok(())
    }

    /// One non-blocking write. `None` when the input buffer is full.
    fn write_some(&self, data: &[u8]) -> Result<Option<usize>, VigilError> {
        match unistd::write(&self.master, data) {
            Ok(n) => Ok(Some(n)),
            Err(Errno::EAGAIN) | Err(Errno::EINTR) => Ok(None),
            Err(e) => Err(VigilError::TerminalError(format!("pty write: {e}"))),
        }
    }

    /// Propagate a window size change to the shell.
    pub fn resize(&self, rows: u16, cols: u16) -> Result<(), VigilError> {
        let size = Winsize {
            ws_row: rows,
            ws_col: cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        // Safety: TIOCSWINSZ reads one Winsize from the pointer.
        let ret = unsafe { libc::ioctl(self.master.as_raw_fd(), libc::TIOCSWINSZ, &size as *const Winsize) };
        if ret < 0 {
            return Err(VigilError::PtyError(format!(
                "TIOCSWINSZ: {}",
                std::io::Error::last_os_error()
            )));
        }
        Ok(())
    }

    pub fn pid(&self) -> u32 {
        u32::try_from(self.child.as_raw()).unwrap_or(0)
    }

    pub fn master_fd(&self) -> RawFd {
        self.master.as_raw_fd()
    }

    /// Exit code if the shell has exited; negative for a fatal signal.
    pub fn try_wait(&self) -> Result<Option<i32>, VigilError> {
        match waitpid(self.child, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(_, code)) => Ok(Some(code)),
            Ok(WaitStatus::Signaled(_, sig, _)) => Ok(Some(-(sig as i32))),
            Ok(_) => Ok(None),
            Err(Errno::ECHILD) => Ok(Some(0)),
            Err(e) => Err(VigilError::PtyError(format!("waitpid: {e}"))),
        }
    }

    /// Block until the shell exits.
    pub fn wait(&self) -> Result<i32, VigilError> {
        loop {
            match waitpid(self.child, None) {
                Ok(WaitStatus::Exited(_, code)) => return Ok(code),
                Ok(WaitStatus::Signaled(_, sig, _)) => return Ok(-(sig as i32)),
                Ok(_) => continue,
                Err(Errno::ECHILD) => return Ok(0),
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(VigilError::PtyError(format!("waitpid: {e}"))),
            }
        }
    }

    /// Send SIGHUP, as a closing terminal would.
    pub fn hangup(&self) -> Result<(), VigilError> {
        signal::kill(self.child, Signal::SIGHUP)
            .map_err(|e| VigilError::PtyError(format!("kill SIGHUP: {e}")))
    }
}

#[async_trait]
impl TerminalChannel for PtySession {
    async fn write_all(&self, bytes: &[u8]) -> Result<(), VigilError> {
        let mut written = 0;
        let mut retries = 0;
        while written < bytes.len() {
            match self.write_some(&bytes[written..])? {
                Some(n) => {
                    written += n;
                    retries = 0;
                }
                None => {
                    retries = next_retry(retries)?;
                    tokio::time::sleep(WRITE_RETRY_DELAY).await;
                }
            }
        }
        Ok(())
    }
}

fn next_retry(retries: u32) -> Result<u32, VigilError> {
    if retries >= WRITE_RETRY_LIMIT {
        return Err(VigilError::TerminalError("pty input buffer stayed full".into()));
    }
    Ok(retries + 1)
}

impl Drop for PtySession {
    fn drop(&mut self) {
        if matches!(
            waitpid(self.child, Some(WaitPidFlag::WNOHANG)),
            Ok(WaitStatus::StillAlive)
        ) {
            let _ = signal::kill(self.child, Signal::SIGHUP);
            std::thread::sleep(Duration::from_millis(100));
            let _ = waitpid(self.child, Some(WaitPidFlag::WNOHANG));
        }
    }
}

/// Runs in the forked child. Returns an exit code only if exec failed.
fn child_exec(
    pty: OpenptyResult,
    program: &CString,
    argv: &[CString],
    dir: Option<&CString>,
    env: &[(CString, CString)],
) -> i32 {
    drop(pty.master);
    if unistd::setsid().is_err() {
        return 126;
    }
    let slave = pty.slave.as_raw_fd();
    unsafe {
        libc::ioctl(slave, libc::TIOCSCTTY as _, 0);
    }
    for target in [libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO] {
        if unistd::dup2(slave, target).is_err() {
            return 126;
        }
    }
    if slave > libc::STDERR_FILENO {
        drop(pty.slave);
    } else {
        std::mem::forget(pty.slave);
    }
    if let Some(dir) = dir {
        if unsafe { libc::chdir(dir.as_ptr()) } != 0 {
            return 126;
        }
    }
    for (key, value) in env {
        unsafe {
            libc::setenv(key.as_ptr(), value.as_ptr(), 1);
        }
    }
    let _ = unistd::execvp(program, argv);
    127
}
