//! `vigil run`: supervise an interactive shell.
//!
//! `vigil run [--config FILE] [--target NAME] [--log-file FILE] [--events FILE] [-- SHELL ARGS]`
//!
//! Spawns the shell on a pseudo-terminal, mirrors it to the user's terminal
//! in raw mode, and feeds everything it prints (and everything the user
//! types) to one supervised session. When the target program shows a
//! prompt the session answers it; confusion and errors are logged.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use vigil_pilot::pty::{PtyCommand, PtyRead, PtySession};
use vigil_pilot::{
    Escalation, EventKind, GuidanceSink, SessionCommand, SessionFeed, SessionStats, Supervisor,
    SupervisorEvent, TerminalChannel,
};
use vigil_types::{PilotConfig, SessionId};

use crate::commands::load_config;
use crate::terminal::{self, RawModeGuard};

/// How long the reader waits for output before checking again.
const READ_POLL: Duration = Duration::from_millis(100);

/// Environment variable exposing the session id to the shell.
const SESSION_ENV: &str = "VIGIL_SESSION";

pub struct RunOptions {
    pub config: Option<PathBuf>,
    pub target: Option<String>,
    pub events: Option<PathBuf>,
    pub command: Vec<String>,
}

/// Run the shell to completion. Returns its exit code.
pub fn run(options: RunOptions) -> Result<i32> {
    let mut config = load_config(options.config.as_deref())?;
    if let Some(target) = options.target {
        config.locator.target_name = target;
        config.validate().context("invalid --target")?;
    }

    let (program, args) = shell_command(&options.command, std::env::var("SHELL").ok());
    let session_id = SessionId::random();
    let env = vec![(SESSION_ENV.to_string(), session_id.to_string())];
    let mut command = PtyCommand::new(&program, &args);
    command.env = &env[..];
    command.size = terminal::window_size();

    let pty = Arc::new(PtySession::spawn(&command).context("failed to spawn shell in PTY")?);
    info!(pid = pty.pid(), program = %program, session = %session_id, "shell spawned");

    let events = options
        .events
        .as_deref()
        .map(EventLog::open)
        .transpose()?;
    let target_name = config.locator.target_name.clone();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start tokio runtime")?;

    let raw = RawModeGuard::enable()?;
    let result = runtime.block_on(supervise(config, session_id.clone(), Arc::clone(&pty), events));
    drop(raw);
    let stats = result?;

    let exit_code = pty.wait().context("failed to wait for shell")?;
    print_summary(&session_id, &target_name, exit_code, &stats);
    Ok(exit_code)
}

/// The shell to run: the trailing arguments, else `$SHELL`, else `/bin/sh`.
fn shell_command(command: &[String], shell: Option<String>) -> (String, Vec<String>) {
    match command.split_first() {
        Some((program, args)) => (program.clone(), args.to_vec()),
        None => (
            shell
                .filter(|s| !s.trim().is_empty())
                .unwrap_or_else(|| "/bin/sh".to_string()),
            Vec::new(),
        ),
    }
}

async fn supervise(
    config: PilotConfig,
    id: SessionId,
    pty: Arc<PtySession>,
    events: Option<EventLog>,
) -> Result<SessionStats> {
    let mut supervisor = Supervisor::new(config).with_guidance(Arc::new(LogGuidance));
    let mut event_writer = None;
    if let Some(log) = events {
        let (tx, rx) = mpsc::unbounded_channel();
        supervisor = supervisor.with_events(tx);
        event_writer = Some(log.spawn(rx)?);
    }

    let terminal: Arc<dyn TerminalChannel> = pty.clone();
    let handle = supervisor
        .start(id, terminal, pty.pid())
        .context("failed to start supervision")?;

    let reader = spawn_named("vigil-pty-reader", {
        let pty = Arc::clone(&pty);
        let feed = handle.feed();
        move || pump_output(&pty, &feed)
    })?;
    // Blocks on stdin until the process exits; never joined.
    spawn_named("vigil-stdin", {
        let pty = Arc::clone(&pty);
        let feed = handle.feed();
        move || pump_input(&pty, &feed)
    })?;
    let resizer = tokio::spawn(forward_resizes(Arc::clone(&pty)));

    let stats = handle.join().await.context("session task failed")?;

    // Supervision may stop with the target while the shell keeps running.
    tokio::task::spawn_blocking(move || reader.join())
        .await
        .context("failed to join pty reader")?
        .map_err(|_| anyhow!("pty reader thread panicked"))?;
    resizer.abort();

    drop(supervisor);
    if let Some(writer) = event_writer {
        tokio::task::spawn_blocking(move || writer.join())
            .await
            .context("failed to join event writer")?
            .map_err(|_| anyhow!("event writer thread panicked"))?;
    }
    Ok(stats)
}

fn spawn_named<F>(name: &str, f: F) -> Result<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    std::thread::Builder::new()
        .name(name.to_string())
        .spawn(f)
        .with_context(|| format!("failed to spawn {name} thread"))
}

/// Mirror shell output to stdout and into the session until the PTY closes.
fn pump_output(pty: &PtySession, feed: &SessionFeed) {
    let mut buf = [0u8; 8192];
    let mut stdout = std::io::stdout();
    loop {
        match pty.poll_readable(READ_POLL) {
            Ok(true) => {}
            Ok(false) => continue,
            Err(e) => {
                warn!(error = %e, "pty poll failed");
                break;
            }
        }
        match pty.read(&mut buf) {
            Ok(PtyRead::Data(n)) => {
                let chunk = &buf[..n];
                if let Err(e) = stdout.write_all(chunk).and_then(|()| stdout.flush()) {
                    debug!(error = %e, "stdout write failed");
                }
                if !feed.is_closed() {
                    let _ = feed.blocking_send(SessionCommand::Output(chunk.to_vec()));
                }
            }
            Ok(PtyRead::WouldBlock) => {}
            Ok(PtyRead::Closed) => break,
            Err(e) => {
                warn!(error = %e, "pty read failed");
                break;
            }
        }
    }
    debug!("shell output closed");
    let _ = feed.blocking_send(SessionCommand::TerminalExited);
}

/// Forward the user's keystrokes to the shell and to the session.
fn pump_input(pty: &PtySession, feed: &SessionFeed) {
    let mut stdin = std::io::stdin().lock();
    let mut buf = [0u8; 1024];
    loop {
        match stdin.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                let typed = &buf[..n];
                if let Err(e) = pty.write_bytes(typed) {
                    debug!(error = %e, "pty input closed");
                    break;
                }
                if !feed.is_closed() {
                    let _ = feed.blocking_send(SessionCommand::Input(typed.to_vec()));
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!(error = %e, "stdin read failed");
                break;
            }
        }
    }
}

async fn forward_resizes(pty: Arc<PtySession>) {
    let mut resized = match signal(SignalKind::window_change()) {
        Ok(stream) => stream,
        Err(e) => {
            debug!(error = %e, "cannot watch window size");
            return;
        }
    };
    while resized.recv().await.is_some() {
        if let Some(size) = terminal::window_size() {
            if let Err(e) = pty.resize(size.ws_row, size.ws_col) {
                debug!(error = %e, "resize failed");
            }
        }
    }
}

/// Escalations end up in the log; nobody answers them.
struct LogGuidance;

impl GuidanceSink for LogGuidance {
    fn escalate(&self, escalation: &Escalation) {
        warn!(
            session = %escalation.session_id,
            kind = ?escalation.kind,
            rule = %escalation.rule_type,
            priority = ?escalation.priority,
            matched = %escalation.matched_text,
            "needs attention"
        );
    }
}

/// JSON-lines event file. Output passthrough events are not written.
struct EventLog {
    file: File,
}

impl EventLog {
    fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("cannot open events file {}", path.display()))?;
        Ok(Self { file })
    }

    fn spawn(self, mut rx: mpsc::UnboundedReceiver<SupervisorEvent>) -> Result<JoinHandle<()>> {
        spawn_named("vigil-events", move || {
            let mut out = BufWriter::new(self.file);
            while let Some(event) = rx.blocking_recv() {
                if let Err(e) = write_event(&mut out, &event) {
                    warn!(error = %e, "failed to write event");
                }
            }
        })
    }
}

/// Write one event as a JSON line; passthrough output is skipped.
fn write_event(out: &mut impl Write, event: &SupervisorEvent) -> Result<()> {
    if matches!(event.kind, EventKind::Output { .. }) {
        return Ok(());
    }
    serde_json::to_writer(&mut *out, event)?;
    out.write_all(b"\n")?;
    out.flush()?;
    Ok(())
}

fn print_summary(id: &SessionId, target: &str, exit_code: i32, stats: &SessionStats) {
    println!();
    println!("--- Vigil Session Summary ---");
    println!("  Session:        {id}");
    println!("  Target:         {target}");
    println!("  Exit code:      {exit_code}");
    println!(
        "  Interventions:  {} ({} oracle, {} fallback)",
        stats.interventions, stats.oracle_decisions, stats.fallbacks
    );
    println!("  Withheld:       {}", stats.withheld);
    println!(
        "  Escalations:    {} ({} confusion, {} errors)",
        stats.escalations, stats.confusion, stats.errors
    );
    println!("  Vetoed chunks:  {}", stats.vetoed);
    println!("  Failed writes:  {}", stats.injection_failures);
    println!("  Chunks read:    {}", stats.chunks);
}
