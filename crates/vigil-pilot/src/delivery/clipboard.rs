use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use vigil_types::VigilError;

use super::{DeliveryRequest, DeliveryStrategy, ENTER};

const TOOL_TIMEOUT: Duration = Duration::from_secs(2);

const PASTE_START: &[u8] = b"\x1b[200~";
const PASTE_END: &[u8] = b"\x1b[201~";

/// Command lines for writing and reading the system clipboard.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ClipboardTool {
    copy: Vec<String>,
    paste: Vec<String>,
}

impl ClipboardTool {
    fn new(copy: &[&str], paste: &[&str]) -> Self {
        Self {
            copy: copy.iter().map(|s| s.to_string()).collect(),
            paste: paste.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn detect() -> Option<Self> {
        Self::for_platform(
            std::env::consts::OS,
            std::env::var_os("WAYLAND_DISPLAY").is_some(),
            std::env::var_os("DISPLAY").is_some(),
        )
    }

    fn for_platform(os: &str, wayland: bool, x11: bool) -> Option<Self> {
        match os {
            "macos" => Some(Self::new(&["pbcopy"], &["pbpaste"])),
            _ if wayland => Some(Self::new(&["wl-copy"], &["wl-paste", "--no-newline"])),
            _ if x11 => Some(Self::new(
                &["xclip", "-selection", "clipboard"],
                &["xclip", "-selection", "clipboard", "-o"],
            )),
            _ => None,
        }
    }
}

/// Copies the response to the system clipboard and pastes it into the
/// terminal as a bracketed paste, followed by Enter.
///
/// Fails on hosts without a clipboard tool, and when reading the clipboard
/// back does not return the response. Text the user had on the clipboard is
/// put back afterwards; non-text contents are not preserved.
pub struct Clipboard {
    enter_delay: Duration,
    /// Fixed tool; detected per attempt when unset.
    tool: Option<ClipboardTool>,
}

impl Clipboard {
    pub fn new(enter_delay: Duration) -> Self {
        Self {
            enter_delay,
            tool: None,
        }
    }

    async fn paste(&self, tool: &ClipboardTool, request: &DeliveryRequest<'_>) -> Result<(), VigilError> {
        copy(tool, request.text).await?;
        let pasted = read_back(tool).await?;
        if pasted.trim_end_matches('\n') != request.text {
            return Err(VigilError::DeliveryError(
                "clipboard contents changed before paste".into(),
            ));
        }

        debug!(pid = request.pid, tool = %tool.copy[0], "pasting from clipboard");
        request.terminal.write_all(&paste_sequence(request.text)).await?;
        tokio::time::sleep(self.enter_delay).await;
        request.terminal.write_all(ENTER).await
    }
}

fn command(argv: &[String]) -> Command {
    let mut cmd = Command::new(&argv[0]);
    cmd.args(&argv[1..]).kill_on_drop(true);
    cmd
}

async fn copy(tool: &ClipboardTool, text: &str) -> Result<(), VigilError> {
    let mut child = command(&tool.copy)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| VigilError::DeliveryError(format!("spawn {}: {e}", tool.copy[0])))?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(text.as_bytes())
            .await
            .map_err(|e| VigilError::DeliveryError(format!("write clipboard: {e}")))?;
    }

    let status = tokio::time::timeout(TOOL_TIMEOUT, child.wait())
        .await
        .map_err(|_| VigilError::DeliveryError(format!("{} timed out", tool.copy[0])))?
        .map_err(|e| VigilError::DeliveryError(format!("wait {}: {e}", tool.copy[0])))?;
    if !status.success() {
        return Err(VigilError::DeliveryError(format!(
            "{} exited with {status}",
            tool.copy[0]
        )));
    }
    Ok(())
}

async fn read_back(tool: &ClipboardTool) -> Result<String, VigilError> {
    let output = tokio::time::timeout(
        TOOL_TIMEOUT,
        command(&tool.paste)
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .output(),
    )
    .await
    .map_err(|_| VigilError::DeliveryError(format!("{} timed out", tool.paste[0])))?
    .map_err(|e| VigilError::DeliveryError(format!("run {}: {e}", tool.paste[0])))?;

    if !output.status.success() {
        return Err(VigilError::DeliveryError(format!(
            "{} exited with {}",
            tool.paste[0], output.status
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn paste_sequence(text: &str) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(PASTE_START.len() + text.len() + PASTE_END.len());
    bytes.extend_from_slice(PASTE_START);
    bytes.extend_from_slice(text.as_bytes());
    bytes.extend_from_slice(PASTE_END);
    bytes
}

#[async_trait]
impl DeliveryStrategy for Clipboard {
    fn name(&self) -> &'static str {
        "clipboard"
    }

    async fn attempt(&self, request: &DeliveryRequest<'_>) -> Result<(), VigilError> {
        let tool = self
            .tool
            .clone()
            .or_else(ClipboardTool::detect)
            .ok_or_else(|| VigilError::DeliveryError("no system clipboard available".into()))?;

        let saved = read_back(&tool).await.ok();
        let result = self.paste(&tool, request).await;
        if let Some(previous) = saved {
            if let Err(e) = copy(&tool, &previous).await {
                debug!(error = %e, "failed to restore clipboard");
            }
        }
        result
    }
}
