//! Session supervisor: one actor task per supervised session.
//!
//! [`Supervisor`] holds what all sessions share (configuration, the rule
//! table, the oracle and the guidance sink) and starts sessions. Each
//! session runs in its own tokio task that owns its [`Session`] state and
//! reacts to:
//! - [`SessionCommand`]s from the host (output chunks, typed input, stop),
//! - its earliest timer deadline (cooldown clear, target search, liveness
//!   poll), awaited in the same `select!`.
//!
//! Dropping out of the loop drops every pending timer with it, which is how
//! stopping a session cancels its polling and cooldown.

use std::future;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use vigil_types::{PilotConfig, SessionId, VigilError};

use crate::decision::{DecisionOracle, DecisionStep, GuidanceSink};
use crate::delivery::{Delivery, DeliveryStrategy, TerminalChannel};
use crate::event::{EventSink, SupervisorEvent};
use crate::locator::ProcessLocator;
use crate::process::{ProcessTable, SystemProcessTable};
use crate::rules::RuleTable;
use crate::session::{Flow, Session, SessionParts, SessionSnapshot, SessionStats};

/// Capacity of each session's command mailbox.
const COMMAND_CAPACITY: usize = 256;

/// Builds the delivery cascade for a new session.
pub type StrategyFactory = Arc<dyn Fn() -> Vec<Box<dyn DeliveryStrategy>> + Send + Sync>;

/// Messages handled by a session actor.
#[derive(Debug)]
pub enum SessionCommand {
    /// A chunk read from the terminal.
    Output(Vec<u8>),
    /// Bytes the user typed into the terminal.
    Input(Vec<u8>),
    /// A launch command for the target was issued.
    LaunchObserved,
    /// The terminal channel closed.
    TerminalExited,
    Snapshot(oneshot::Sender<SessionSnapshot>),
    Stop,
}

/// Shared configuration and collaborators; starts sessions.
pub struct Supervisor {
    config: PilotConfig,
    rules: Arc<RuleTable>,
    oracle: Option<Arc<dyn DecisionOracle>>,
    guidance: Option<Arc<dyn GuidanceSink>>,
    events: Option<mpsc::UnboundedSender<SupervisorEvent>>,
    processes: Arc<dyn ProcessTable>,
    strategies: Option<StrategyFactory>,
}

impl Supervisor {
    /// A supervisor with the built-in rules plus the configured custom rules.
    pub fn new(config: PilotConfig) -> Self {
        let rules = Arc::new(RuleTable::with_custom(&config.rules));
        Self {
            config,
            rules,
            oracle: None,
            guidance: None,
            events: None,
            processes: Arc::new(SystemProcessTable),
            strategies: None,
        }
    }

    pub fn with_oracle(mut self, oracle: Arc<dyn DecisionOracle>) -> Self {
        self.oracle = Some(oracle);
        self
    }

    pub fn with_guidance(mut self, sink: Arc<dyn GuidanceSink>) -> Self {
        self.guidance = Some(sink);
        self
    }

    pub fn with_events(mut self, tx: mpsc::UnboundedSender<SupervisorEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn with_process_table(mut self, table: Arc<dyn ProcessTable>) -> Self {
        self.processes = table;
        self
    }

    /// Replace the configured delivery strategies.
    pub fn with_strategies(mut self, factory: StrategyFactory) -> Self {
        self.strategies = Some(factory);
        self
    }

    pub fn config(&self) -> &PilotConfig {
        &self.config
    }

    pub fn rules(&self) -> &RuleTable {
        &self.rules
    }

    /// Start supervising the shell `shell_pid` whose terminal is `terminal`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        &self,
        id: SessionId,
        terminal: Arc<dyn TerminalChannel>,
        shell_pid: u32,
    ) -> Result<SessionHandle, VigilError> {
        let locator = ProcessLocator::new(&self.config.locator, shell_pid, Arc::clone(&self.processes))?;
        let delivery = match &self.strategies {
            Some(factory) => Delivery::new(
                factory(),
                self.config.delivery.retry_attempts,
                self.config.delivery.retry_pause(),
                self.config.delivery.verify_after(),
                Arc::clone(&self.processes),
            ),
            None => Delivery::from_config(&self.config.delivery, Arc::clone(&self.processes)),
        };

        let session = Session::new(SessionParts {
            id: id.clone(),
            config: self.config.clone(),
            rules: Arc::clone(&self.rules),
            decision: DecisionStep::new(&self.config.decision, self.oracle.clone()),
            delivery,
            locator,
            terminal,
            guidance: self.guidance.clone(),
            events: EventSink::new(id.clone(), self.events.clone()),
        });

        let (tx, rx) = mpsc::channel(COMMAND_CAPACITY);
        let task = tokio::spawn(run_session(session, rx));
        Ok(SessionHandle {
            id: id.clone(),
            feed: SessionFeed { id, tx },
            task,
        })
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => future::pending().await,
    }
}

async fn run_session(mut session: Session, mut commands: mpsc::Receiver<SessionCommand>) -> SessionStats {
    session.start();
    let reason = loop {
        let deadline = session.next_deadline();
        tokio::select! {
            command = commands.recv() => match command {
                Some(SessionCommand::Output(bytes)) => {
                    session.handle_output(&bytes, Instant::now()).await;
                }
                Some(SessionCommand::Input(bytes)) => session.handle_input(&bytes, Instant::now()),
                Some(SessionCommand::LaunchObserved) => session.handle_launch(Instant::now()),
                Some(SessionCommand::Snapshot(reply)) => {
                    let _ = reply.send(session.snapshot());
                }
                Some(SessionCommand::TerminalExited) => break "terminal exited".to_string(),
                Some(SessionCommand::Stop) => break "stopped".to_string(),
                None => break "handle dropped".to_string(),
            },
            _ = wait_until(deadline) => {
                if let Flow::Stop(reason) = session.on_timer(Instant::now()).await {
                    break reason;
                }
            }
        }
    };
    debug!(reason = %reason, "session loop ended");
    session.finish(&reason)
}

/// Cloneable sender into a session, usable from async code or plain threads.
#[derive(Clone)]
pub struct SessionFeed {
    id: SessionId,
    tx: mpsc::Sender<SessionCommand>,
}

impl SessionFeed {
    fn closed(&self) -> VigilError {
        VigilError::SessionClosed(self.id.to_string())
    }

    pub async fn send(&self, command: SessionCommand) -> Result<(), VigilError> {
        self.tx.send(command).await.map_err(|_| self.closed())
    }

    /// Send from a thread outside the runtime. Panics if called from
    /// within an async context.
    pub fn blocking_send(&self, command: SessionCommand) -> Result<(), VigilError> {
        self.tx.blocking_send(command).map_err(|_| self.closed())
    }

    pub async fn output(&self, bytes: impl Into<Vec<u8>>) -> Result<(), VigilError> {
        self.send(SessionCommand::Output(bytes.into())).await
    }

    pub async fn input(&self, bytes: impl Into<Vec<u8>>) -> Result<(), VigilError> {
        self.send(SessionCommand::Input(bytes.into())).await
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Owner's handle to a running session.
pub struct SessionHandle {
    id: SessionId,
    feed: SessionFeed,
    task: JoinHandle<SessionStats>,
}

impl SessionHandle {
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// A sender for reader threads.
    pub fn feed(&self) -> SessionFeed {
        self.feed.clone()
    }

    pub async fn feed_output(&self, bytes: impl Into<Vec<u8>>) -> Result<(), VigilError> {
        self.feed.output(bytes).await
    }

    pub async fn feed_input(&self, bytes: impl Into<Vec<u8>>) -> Result<(), VigilError> {
        self.feed.input(bytes).await
    }

    pub async fn launch_observed(&self) -> Result<(), VigilError> {
        self.feed.send(SessionCommand::LaunchObserved).await
    }

    pub async fn terminal_exited(&self) -> Result<(), VigilError> {
        self.feed.send(SessionCommand::TerminalExited).await
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot, VigilError> {
        let (reply, rx) = oneshot::channel();
        self.feed.send(SessionCommand::Snapshot(reply)).await?;
        rx.await.map_err(|_| self.feed.closed())
    }

    /// Stop supervision and wait for the actor to finish.
    pub async fn stop(self) -> Result<SessionStats, VigilError> {
        // The actor may already have stopped on its own.
        let _ = self.feed.send(SessionCommand::Stop).await;
        self.join().await
    }

    /// Wait for the actor to end on its own (terminal or target exit).
    pub async fn join(self) -> Result<SessionStats, VigilError> {
        let id = self.id.to_string();
        drop(self.feed);
        self.task
            .await
            .map_err(|e| VigilError::SessionClosed(format!("{id}: {e}")))
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
