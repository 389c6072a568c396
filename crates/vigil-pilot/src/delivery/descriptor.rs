use async_trait::async_trait;

use vigil_types::VigilError;

use super::{DeliveryRequest, DeliveryStrategy};

/// Writes straight into the target's standard input through `/proc`.
///
/// When stdin is a FIFO the response is written to it. When it is a
/// terminal each byte is pushed into the terminal's input queue with
/// `TIOCSTI`, which most kernels restrict; `EPERM` here is the usual
/// outcome and simply moves the cascade on.
pub struct DirectDescriptor;

#[async_trait]
impl DeliveryStrategy for DirectDescriptor {
    fn name(&self) -> &'static str {
        "direct_descriptor"
    }

    async fn attempt(&self, request: &DeliveryRequest<'_>) -> Result<(), VigilError> {
        write_stdin(request.pid, request.text)
    }
}

#[cfg(target_os = "linux")]
fn write_stdin(pid: u32, text: &str) -> Result<(), VigilError> {
    use std::fs::OpenOptions;
    use std::io::Write;
    use std::os::fd::AsRawFd;
    use std::os::unix::fs::{FileTypeExt, OpenOptionsExt};

    let path = format!("/proc/{pid}/fd/0");
    let meta = std::fs::metadata(&path)
        .map_err(|e| VigilError::DeliveryError(format!("stat {path}: {e}")))?;
    let mut stdin = OpenOptions::new()
        .write(true)
        .custom_flags(libc::O_NONBLOCK | libc::O_NOCTTY)
        .open(&path)
        .map_err(|e| VigilError::DeliveryError(format!("open {path}: {e}")))?;

    let file_type = meta.file_type();
    if file_type.is_fifo() {
        let line = format!("{text}\n");
        return stdin
            .write_all(line.as_bytes())
            .map_err(|e| VigilError::DeliveryError(format!("write {path}: {e}")));
    }

    if file_type.is_char_device() {
        let fd = stdin.as_raw_fd();
        for byte in text.bytes().chain(std::iter::once(b'\r')) {
            // Safety: fd is open for the duration of the loop and TIOCSTI
            // reads exactly one byte from the pointer.
            let ret = unsafe { libc::ioctl(fd, libc::TIOCSTI, &byte as *const u8) };
            if ret < 0 {
                return Err(VigilError::DeliveryError(format!(
                    "TIOCSTI on {path}: {}",
                    std::io::Error::last_os_error()
                )));
            }
        }
        return Ok(());
    }

    Err(VigilError::DeliveryError(format!(
        "stdin of {pid} is neither a pipe nor a terminal"
    )))
}

#[cfg(not(target_os = "linux"))]
fn write_stdin(pid: u32, _text: &str) -> Result<(), VigilError> {
    Err(VigilError::DeliveryError(format!(
        "per-process descriptors are not exposed on this platform (pid {pid})"
    )))
}
