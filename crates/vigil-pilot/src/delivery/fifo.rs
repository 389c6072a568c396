use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::stat::Mode;
use tracing::debug;

use vigil_types::VigilError;

use super::{DeliveryRequest, DeliveryStrategy};

/// How long to wait for the relay to open the read end.
const READER_WAIT_STEPS: u32 = 20;
const READER_WAIT_STEP: Duration = Duration::from_millis(25);

/// Relays the response through a named pipe keyed by the target PID.
///
/// A background `sh -c "cat <pipe> > /proc/<pid>/fd/0"` copies whatever is
/// written to the pipe into the target's stdin. Only used when that stdin is
/// itself a pipe or socket: writing to a terminal's `/proc` entry prints to
/// the screen instead of queueing input. This is the least reliable
/// strategy: the relay may fail to open the target's stdin, in which case
/// nobody ever opens the read end and the write times out.
pub struct NamedPipe {
    dir: PathBuf,
    pipes: Mutex<HashMap<u32, PathBuf>>,
}

impl NamedPipe {
    /// Pipes live in `$TMPDIR`, falling back to `/tmp`.
    pub fn new() -> Self {
        let dir = std::env::var("TMPDIR").unwrap_or_else(|_| "/tmp".into());
        Self::in_dir(dir)
    }

    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            pipes: Mutex::new(HashMap::new()),
        }
    }

    pub fn pipe_path(&self, pid: u32) -> PathBuf {
        self.dir.join(format!("vigil-{pid}.pipe"))
    }

    /// Create the pipe for `pid`, or reuse an existing one.
    fn ensure_pipe(&self, pid: u32) -> Result<PathBuf, VigilError> {
        let path = self.pipe_path(pid);
        match nix::unistd::mkfifo(&path, Mode::from_bits_truncate(0o600)) {
            Ok(()) | Err(Errno::EEXIST) => {}
            Err(e) => {
                return Err(VigilError::DeliveryError(format!(
                    "mkfifo {}: {e}",
                    path.display()
                )))
            }
        }
        if let Ok(mut pipes) = self.pipes.lock() {
            pipes.insert(pid, path.clone());
        }
        Ok(path)
    }
}

impl Default for NamedPipe {
    fn default() -> Self {
        Self::new()
    }
}

/// Refuse unless `stdin` is a FIFO or socket the relay can feed.
fn check_stdin(stdin: &Path) -> Result<(), VigilError> {
    use std::os::unix::fs::FileTypeExt;

    let file_type = std::fs::metadata(stdin)
        .map_err(|e| VigilError::DeliveryError(format!("stat {}: {e}", stdin.display())))?
        .file_type();
    if file_type.is_fifo() || file_type.is_socket() {
        return Ok(());
    }
    let kind = if file_type.is_char_device() {
        "a character device"
    } else {
        "not a pipe"
    };
    Err(VigilError::DeliveryError(format!(
        "{} is {kind}",
        stdin.display()
    )))
}

fn stdin_path(pid: u32) -> PathBuf {
    PathBuf::from(format!("/proc/{pid}/fd/0"))
}

fn shell_quote(path: &Path) -> String {
    let escaped = path.to_string_lossy().replace('\'', "'\\''");
    format!("'{escaped}'")
}

fn spawn_relay(pipe: &Path, stdin: &Path) -> Result<(), VigilError> {
    let script = format!("cat {} > {}", shell_quote(pipe), shell_quote(stdin));
    // The child is reaped by tokio in the background once dropped.
    tokio::process::Command::new("sh")
        .arg("-c")
        .arg(&script)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map(drop)
        .map_err(|e| VigilError::DeliveryError(format!("spawn relay: {e}")))
}

async fn write_to_pipe(pipe: &Path, text: &str) -> Result<(), VigilError> {
    for _ in 0..READER_WAIT_STEPS {
        // O_NONBLOCK makes open fail with ENXIO until a reader exists.
        match OpenOptions::new()
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(pipe)
        {
            Ok(mut file) => {
                let line = format!("{text}\n");
                return file
                    .write_all(line.as_bytes())
                    .map_err(|e| VigilError::DeliveryError(format!("write pipe: {e}")));
            }
            Err(e) if e.raw_os_error() == Some(libc::ENXIO) => {
                tokio::time::sleep(READER_WAIT_STEP).await;
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => {
                return Err(VigilError::DeliveryError(format!(
                    "open {}: {e}",
                    pipe.display()
                )))
            }
        }
    }
    Err(VigilError::DeliveryError(format!(
        "no reader on {}",
        pipe.display()
    )))
}

#[async_trait]
impl DeliveryStrategy for NamedPipe {
    fn name(&self) -> &'static str {
        "named_pipe"
    }

    async fn attempt(&self, request: &DeliveryRequest<'_>) -> Result<(), VigilError> {
        let stdin = stdin_path(request.pid);
        check_stdin(&stdin)?;
        let pipe = self.ensure_pipe(request.pid)?;
        spawn_relay(&pipe, &stdin)?;
        debug!(pid = request.pid, pipe = %pipe.display(), "relay started");
        write_to_pipe(&pipe, request.text).await
    }

    fn release(&self, pid: u32) {
        let removed = self.pipes.lock().ok().and_then(|mut pipes| pipes.remove(&pid));
        if let Some(path) = removed {
            let _ = std::fs::remove_file(&path);
            debug!(pid, pipe = %path.display(), "named pipe removed");
        }
    }
}

impl Drop for NamedPipe {
    fn drop(&mut self) {
        if let Ok(pipes) = self.pipes.get_mut() {
            for path in pipes.values() {
                let _ = std::fs::remove_file(path);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::FileTypeExt;

    use super::*;

    #[test]
    fn pipe_is_created_once_and_released() {
        let dir = tempfile::tempdir().unwrap();
        let strategy = NamedPipe::in_dir(dir.path());
        let first = strategy.ensure_pipe(42).unwrap();
        let second = strategy.ensure_pipe(42).unwrap();
        assert_eq!(first, second);
        assert_eq!(first, dir.path().join("vigil-42.pipe"));
        assert!(std::fs::metadata(&first).unwrap().file_type().is_fifo());

        strategy.release(42);
        assert!(!first.exists());
    }

    #[test]
    fn drop_removes_pipes() {
        let dir = tempfile::tempdir().unwrap();
        let path = {
            let strategy = NamedPipe::in_dir(dir.path());
            strategy.ensure_pipe(7).unwrap()
        };
        assert!(!path.exists());
    }

    #[test]
    fn relay_only_feeds_pipes() {
        let dir = tempfile::tempdir().unwrap();
        let fifo = dir.path().join("stdin.fifo");
        nix::unistd::mkfifo(&fifo, Mode::from_bits_truncate(0o600)).unwrap();
        assert!(check_stdin(&fifo).is_ok());

        let err = check_stdin(Path::new("/dev/null")).unwrap_err();
        assert!(err.to_string().contains("a character device"));

        let file = dir.path().join("plain");
        std::fs::write(&file, "").unwrap();
        assert!(check_stdin(&file).unwrap_err().to_string().contains("not a pipe"));
    }

    #[tokio::test]
    async fn missing_target_creates_no_pipe() {
        let dir = tempfile::tempdir().unwrap();
        let strategy = NamedPipe::in_dir(dir.path());
        let terminal = crate::delivery::testing::RecordingTerminal::default();
        let request = DeliveryRequest {
            text: "1",
            pid: u32::MAX,
            terminal: &terminal,
        };
        assert!(strategy.attempt(&request).await.is_err());
        assert!(!strategy.pipe_path(u32::MAX).exists());
    }

    #[test]
    fn quoting_survives_single_quotes() {
        assert_eq!(shell_quote(Path::new("/tmp/it's")), r"'/tmp/it'\''s'");
    }

    #[tokio::test(start_paused = true)]
    async fn write_without_reader_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let strategy = NamedPipe::in_dir(dir.path());
        let pipe = strategy.ensure_pipe(9).unwrap();
        let err = write_to_pipe(&pipe, "1").await.unwrap_err();
        assert!(err.to_string().contains("no reader"));
    }

    #[tokio::test]
    async fn write_reaches_reader() {
        use std::io::Read;

        let dir = tempfile::tempdir().unwrap();
        let strategy = NamedPipe::in_dir(dir.path());
        let pipe = strategy.ensure_pipe(11).unwrap();

        let reader_path = pipe.clone();
        let reader = std::thread::spawn(move || {
            let mut out = String::new();
            std::fs::File::open(reader_path)
                .unwrap()
                .read_to_string(&mut out)
                .unwrap();
            out
        });

        write_to_pipe(&pipe, "yes").await.unwrap();
        assert_eq!(reader.join().unwrap(), "yes\n");
    }
}
