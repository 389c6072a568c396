//! Process locator: finds the target program among the shell's children.
//!
//! State machine:
//!
//! ```text
//! Unbound --launch seen--> Searching --found--> Bound --poll: gone--> Exited
//!    ^                         |
//!    +-------not found---------+
//! ```
//!
//! A search only starts after a launch command is observed in the shell,
//! and waits `search_delay` so the program has time to exec. A failed search
//! leaves the locator unbound until the next launch command; there is no
//! periodic re-search. While bound, liveness is polled every
//! `poll_interval`.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use vigil_types::{LocatorConfig, VigilError};

use crate::ansi::strip_ansi;
use crate::process::{find_target, ProcessTable};

/// Upper bound on `<target> --version`.
const VERSION_PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// The resolved target process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TargetIdentity {
    pub pid: u32,
    pub detected_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum LocatorState {
    Unbound,
    Searching,
    Bound(TargetIdentity),
    Exited { pid: u32 },
}

/// Transitions reported to the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocatorEvent {
    Detected(TargetIdentity),
    Exited { pid: u32 },
}

pub struct ProcessLocator {
    shell_pid: u32,
    target_name: String,
    launch: Regex,
    search_delay: Duration,
    poll_interval: Duration,
    probe_version: bool,
    table: Arc<dyn ProcessTable>,
    state: LocatorState,
    search_at: Option<Instant>,
    next_poll: Option<Instant>,
    /// Bytes typed since the last Enter.
    typed: Vec<u8>,
}

impl ProcessLocator {
    pub fn new(
        config: &LocatorConfig,
        shell_pid: u32,
        table: Arc<dyn ProcessTable>,
    ) -> Result<Self, VigilError> {
        let pattern = config.effective_launch_pattern();
        let launch = Regex::new(&pattern).map_err(|e| {
            VigilError::LocatorError(format!("invalid launch pattern {pattern:?}: {e}"))
        })?;
        Ok(Self {
            shell_pid,
            target_name: config.target_name.trim().to_string(),
            launch,
            search_delay: config.search_delay(),
            poll_interval: config.poll_interval(),
            probe_version: config.probe_version,
            table,
            state: LocatorState::Unbound,
            search_at: None,
            next_poll: None,
            typed: Vec::new(),
        })
    }

    pub fn state(&self) -> &LocatorState {
        &self.state
    }

    pub fn target(&self) -> Option<&TargetIdentity> {
        match &self.state {
            LocatorState::Bound(identity) => Some(identity),
            _ => None,
        }
    }

    pub fn shell_pid(&self) -> u32 {
        self.shell_pid
    }

    /// Feed bytes typed into the shell. Returns true if a completed line
    /// was a launch command that started a search.
    pub fn observe_input(&mut self, bytes: &[u8], now: Instant) -> bool {
        let mut launched = false;
        for &byte in bytes {
            if byte == b'\r' || byte == b'\n' {
                let raw = std::mem::take(&mut self.typed);
                let line = edit_line(&strip_ansi(&raw));
                if self.launch.is_match(&line) {
                    debug!(line = %line, "launch command observed");
                    launched |= self.observe_launch(now);
                }
            } else {
                self.typed.push(byte);
            }
        }
        launched
    }

    /// Schedule a search after the launch delay. Ignored while bound.
    pub fn observe_launch(&mut self, now: Instant) -> bool {
        if let LocatorState::Bound(identity) = &self.state {
            debug!(pid = identity.pid, "launch observed while bound, ignoring");
            return false;
        }
        self.state = LocatorState::Searching;
        self.search_at = Some(now + self.search_delay);
        true
    }

    /// The earliest pending search or poll.
    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.search_at, self.next_poll) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Run whatever is due at `now`.
    pub async fn on_timer(&mut self, now: Instant) -> Option<LocatorEvent> {
        if self.search_at.is_some_and(|at| at <= now) {
            self.search_at = None;
            return self.search(now).await;
        }
        if self.next_poll.is_some_and(|at| at <= now) {
            return self.poll(now);
        }
        None
    }

    /// Forget the target and cancel pending timers.
    pub fn reset(&mut self) {
        self.state = LocatorState::Unbound;
        self.search_at = None;
        self.next_poll = None;
    }

    async fn search(&mut self, now: Instant) -> Option<LocatorEvent> {
        let table = Arc::clone(&self.table);
        let shell_pid = self.shell_pid;
        let target_name = self.target_name.clone();
        let found = tokio::task::spawn_blocking(move || {
            let processes = table.processes()?;
            Ok::<_, VigilError>(find_target(shell_pid, &target_name, &processes).map(|p| p.pid))
        })
        .await;

        let pid = match found {
            Ok(Ok(Some(pid))) => pid,
            Ok(Ok(None)) => {
                info!(shell = shell_pid, target = %self.target_name, "target process not found");
                self.state = LocatorState::Unbound;
                return None;
            }
            Ok(Err(e)) => {
                warn!(error = %e, "process enumeration failed");
                self.state = LocatorState::Unbound;
                return None;
            }
            Err(e) => {
                warn!(error = %e, "process search task failed");
                self.state = LocatorState::Unbound;
                return None;
            }
        };

        let version = if self.probe_version {
            probe_version(&self.target_name).await
        } else {
            None
        };

        let identity = TargetIdentity {
            pid,
            detected_at: Utc::now(),
            version,
        };
        info!(pid, version = ?identity.version, "target process bound");
        self.state = LocatorState::Bound(identity.clone());
        self.next_poll = Some(now + self.poll_interval);
        Some(LocatorEvent::Detected(identity))
    }

    fn poll(&mut self, now: Instant) -> Option<LocatorEvent> {
        let LocatorState::Bound(identity) = &self.state else {
            self.next_poll = None;
            return None;
        };
        let pid = identity.pid;
        if self.table.is_alive(pid) {
            self.next_poll = Some(now + self.poll_interval);
            return None;
        }
        info!(pid, "target process exited");
        self.state = LocatorState::Exited { pid };
        self.next_poll = None;
        Some(LocatorEvent::Exited { pid })
    }
}

/// Apply the line-editing keys a shell would: backspace, Ctrl-U, Ctrl-W.
fn edit_line(raw: &str) -> String {
    let mut line = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '\x7f' | '\x08' => {
                line.pop();
            }
            '\x15' => line.clear(),
            '\x17' => {
                let trimmed = line.trim_end().len();
                line.truncate(trimmed);
                let cut = line.rfind(char::is_whitespace).map_or(0, |i| i + 1);
                line.truncate(cut);
            }
            c if c.is_control() && c != '\t' => {}
            c => line.push(c),
        }
    }
    line
}

async fn probe_version(target_name: &str) -> Option<String> {
    let mut command = tokio::process::Command::new(target_name);
    command
        .arg("--version")
        .stdin(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .kill_on_drop(true);

    match tokio::time::timeout(VERSION_PROBE_TIMEOUT, command.output()).await {
        Ok(Ok(output)) if output.status.success() => String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .map(str::to_string),
        Ok(Ok(output)) => {
            debug!(status = %output.status, "version probe exited unsuccessfully");
            None
        }
        Ok(Err(e)) => {
            debug!(error = %e, "version probe failed to run");
            None
        }
        Err(_) => {
            debug!("version probe timed out");
            None
        }
    }
}
