//! Shared helpers for integration tests.
//!
//! Each integration test file compiles common/ as its own module, so not
//! every helper is used in every file.
#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use vigil_pilot::{
    DeliveryRequest, DeliveryStrategy, EventKind, ProcessInfo, ProcessTable, StrategyFactory,
    Supervisor, SupervisorEvent, TerminalChannel,
};
use vigil_types::{PilotConfig, VigilError};

/// PID the fake shell runs as.
pub const SHELL_PID: u32 = 4_000;
/// PID the fake target gets once launched.
pub const TARGET_PID: u32 = 4_001;

/// Terminal channel that records every write.
#[derive(Default)]
pub struct RecordingTerminal {
    writes: Mutex<Vec<u8>>,
    closed: AtomicBool,
}

impl RecordingTerminal {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn written(&self) -> String {
        String::from_utf8_lossy(&self.writes.lock().unwrap()).into_owned()
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl TerminalChannel for RecordingTerminal {
    async fn write_all(&self, bytes: &[u8]) -> Result<(), VigilError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(VigilError::TerminalError("terminal closed".into()));
        }
        self.writes.lock().unwrap().extend_from_slice(bytes);
        Ok(())
    }
}

/// Process table with a scripted shell and target.
#[derive(Default)]
pub struct FakeProcesses {
    processes: Mutex<Vec<ProcessInfo>>,
    dead: Mutex<HashSet<u32>>,
}

impl FakeProcesses {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Put a `claude` process under the shell.
    pub fn launch_target(&self) {
        self.processes.lock().unwrap().push(ProcessInfo {
            pid: TARGET_PID,
            ppid: SHELL_PID,
            name: "node".into(),
            cmdline: vec!["node".into(), "/usr/local/bin/claude".into()],
        });
    }

    pub fn kill(&self, pid: u32) {
        self.dead.lock().unwrap().insert(pid);
    }
}

impl ProcessTable for FakeProcesses {
    fn processes(&self) -> Result<Vec<ProcessInfo>, VigilError> {
        Ok(self.processes.lock().unwrap().clone())
    }

    fn is_alive(&self, pid: u32) -> bool {
        !self.dead.lock().unwrap().contains(&pid)
    }
}

/// Strategy that always fails and counts its attempts.
pub struct FailingStrategy {
    pub name: &'static str,
    pub calls: Arc<AtomicU32>,
}

#[async_trait]
impl DeliveryStrategy for FailingStrategy {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn attempt(&self, _request: &DeliveryRequest<'_>) -> Result<(), VigilError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(VigilError::DeliveryError(format!("{} unavailable", self.name)))
    }
}

/// Strategy that always succeeds by writing the response to the terminal.
pub struct AcceptingStrategy {
    pub calls: Arc<AtomicU32>,
}

#[async_trait]
impl DeliveryStrategy for AcceptingStrategy {
    fn name(&self) -> &'static str {
        "accepting"
    }

    async fn attempt(&self, request: &DeliveryRequest<'_>) -> Result<(), VigilError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        request
            .terminal
            .write_all(format!("<{}>", request.text).as_bytes())
            .await
    }
}

/// `n` failing strategies sharing one call counter.
pub fn failing_strategies(n: usize) -> (StrategyFactory, Arc<AtomicU32>) {
    let calls = Arc::new(AtomicU32::new(0));
    let shared = calls.clone();
    let names = ["first", "second", "third", "fourth"];
    let factory: StrategyFactory = Arc::new(move || {
        names
            .iter()
            .take(n)
            .map(|&name| {
                Box::new(FailingStrategy {
                    name,
                    calls: shared.clone(),
                }) as Box<dyn DeliveryStrategy>
            })
            .collect()
    });
    (factory, calls)
}

pub fn accepting_strategy() -> (StrategyFactory, Arc<AtomicU32>) {
    let calls = Arc::new(AtomicU32::new(0));
    let shared = calls.clone();
    let factory: StrategyFactory = Arc::new(move || {
        vec![Box::new(AcceptingStrategy {
            calls: shared.clone(),
        }) as Box<dyn DeliveryStrategy>]
    });
    (factory, calls)
}

/// Defaults with probes and verification turned off for deterministic runs.
pub fn test_config() -> PilotConfig {
    let mut config = PilotConfig::default();
    config.locator.probe_version = false;
    config.delivery.verify_after_ms = None;
    config
}

/// A supervisor wired to an event receiver and a fake process table.
pub fn supervisor(
    config: PilotConfig,
    processes: Arc<FakeProcesses>,
) -> (Supervisor, mpsc::UnboundedReceiver<SupervisorEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let supervisor = Supervisor::new(config)
        .with_events(tx)
        .with_process_table(processes);
    (supervisor, rx)
}

/// Event names received so far, skipping raw output passthrough.
pub fn event_names(rx: &mut mpsc::UnboundedReceiver<SupervisorEvent>) -> Vec<&'static str> {
    drain(rx)
        .into_iter()
        .map(|e| e.kind.name())
        .filter(|&name| name != "output")
        .collect()
}

pub fn drain(rx: &mut mpsc::UnboundedReceiver<SupervisorEvent>) -> Vec<SupervisorEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Interventions among `events`.
pub fn interventions(events: &[SupervisorEvent]) -> Vec<&EventKind> {
    events
        .iter()
        .map(|e| &e.kind)
        .filter(|kind| matches!(kind, EventKind::Intervention { .. }))
        .collect()
}

pub async fn advance(duration: Duration) {
    tokio::time::sleep(duration).await;
}
