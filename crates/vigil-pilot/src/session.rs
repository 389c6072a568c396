//! State and per-chunk logic of one supervised session.
//!
//! A [`Session`] is owned by exactly one actor task (see
//! [`crate::supervisor`]). Nothing in here is shared or locked; concurrency
//! is handled entirely by that ownership.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use vigil_types::{Category, InterventionKind, InterventionRecord, PilotConfig, SessionId};

use crate::ansi::AnsiStripper;
use crate::classifier::{classify, Classification, Detection};
use crate::decision::{DecisionStep, Escalation, GuidanceSink, OracleContext, ResolvedResponse, Verdict};
use crate::delivery::{Delivery, TerminalChannel};
use crate::event::{EventKind, EventSink};
use crate::guard::LoopGuard;
use crate::locator::{LocatorEvent, LocatorState, ProcessLocator, TargetIdentity};
use crate::output::RecentOutput;
use crate::rules::RuleTable;

/// Lines of recent output kept for oracle context.
const RECENT_OUTPUT_LINES: usize = 200;
/// Lines of recent output handed to the oracle.
const ORACLE_CONTEXT_LINES: usize = 40;
/// Interventions handed to the oracle.
const ORACLE_CONTEXT_INTERVENTIONS: usize = 5;

/// Counters collected during a session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    /// Output chunks processed.
    pub chunks: u64,
    /// Chunks suppressed by the loop guard.
    pub vetoed: u64,
    /// Question detections.
    pub questions: u64,
    /// Completed auto-responses.
    pub interventions: u64,
    /// Interventions whose response came from the oracle.
    pub oracle_decisions: u64,
    /// Interventions that used the rule's static default.
    pub fallbacks: u64,
    /// Questions withheld below the confidence gate.
    pub withheld: u64,
    pub confusion: u64,
    pub errors: u64,
    /// Escalations of any kind, including guidance requests.
    pub escalations: u64,
    /// Injections that failed on the terminal channel.
    pub injection_failures: u64,
}

/// Point-in-time view of a session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub session_id: SessionId,
    pub started_at: DateTime<Utc>,
    pub stats: SessionStats,
    pub awaiting_response: bool,
    pub locator: LocatorState,
    pub last_intervention: Option<InterventionRecord>,
    pub last_intervention_at: Option<DateTime<Utc>>,
    /// Recently injected responses, oldest first.
    pub recent_responses: Vec<String>,
    /// Intervention records currently held.
    pub history_len: usize,
}

impl SessionSnapshot {
    pub fn target(&self) -> Option<&TargetIdentity> {
        match &self.locator {
            LocatorState::Bound(identity) => Some(identity),
            _ => None,
        }
    }
}

/// Why the actor loop should end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Flow {
    Continue,
    Stop(String),
}

pub(crate) struct Session {
    id: SessionId,
    rules: Arc<RuleTable>,
    guard: LoopGuard,
    decision: DecisionStep,
    delivery: Delivery,
    locator: ProcessLocator,
    terminal: Arc<dyn TerminalChannel>,
    guidance: Option<Arc<dyn GuidanceSink>>,
    events: EventSink,
    stripper: AnsiStripper,
    recent_output: RecentOutput,
    history: VecDeque<InterventionRecord>,
    history_limit: usize,
    stats: SessionStats,
    started_at: DateTime<Utc>,
    last_intervention_at: Option<DateTime<Utc>>,
    stop_on_target_exit: bool,
}

pub(crate) struct SessionParts {
    pub id: SessionId,
    pub config: PilotConfig,
    pub rules: Arc<RuleTable>,
    pub decision: DecisionStep,
    pub delivery: Delivery,
    pub locator: ProcessLocator,
    pub terminal: Arc<dyn TerminalChannel>,
    pub guidance: Option<Arc<dyn GuidanceSink>>,
    pub events: EventSink,
}

impl Session {
    pub(crate) fn new(parts: SessionParts) -> Self {
        let SessionParts {
            id,
            config,
            rules,
            decision,
            delivery,
            locator,
            terminal,
            guidance,
            events,
        } = parts;
        Self {
            id,
            rules,
            guard: LoopGuard::new(&config.guard),
            decision,
            delivery,
            locator,
            terminal,
            guidance,
            events,
            stripper: AnsiStripper::new(),
            recent_output: RecentOutput::new(RECENT_OUTPUT_LINES),
            history: VecDeque::new(),
            history_limit: config.decision.history_limit.max(1),
            stats: SessionStats::default(),
            started_at: Utc::now(),
            last_intervention_at: None,
            stop_on_target_exit: config.locator.stop_on_target_exit,
        }
    }

    pub(crate) fn start(&self) {
        info!(session = %self.id, shell = self.locator.shell_pid(), "supervision started");
        self.events.emit(EventKind::SupervisionStarted {
            shell_pid: self.locator.shell_pid(),
        });
    }

    /// Classify one chunk of raw output and act on it.
    pub(crate) async fn handle_output(&mut self, bytes: &[u8], now: Instant) {
        self.events.emit(EventKind::Output {
            text: String::from_utf8_lossy(bytes).into_owned(),
        });
        self.stats.chunks += 1;

        let text = self.stripper.feed(bytes);
        self.recent_output.push(&text);

        match classify(&text, &self.rules, &self.guard, now) {
            Classification::None => {}
            Classification::Vetoed(veto) => {
                self.stats.vetoed += 1;
                debug!(session = %self.id, ?veto, "chunk vetoed");
            }
            Classification::Detected(detection) => self.handle_detection(detection, now).await,
        }
    }

    /// Bytes typed into the shell.
    pub(crate) fn handle_input(&mut self, bytes: &[u8], now: Instant) {
        if self.locator.observe_input(bytes, now) {
            debug!(session = %self.id, "search for target scheduled");
        }
    }

    pub(crate) fn handle_launch(&mut self, now: Instant) {
        self.locator.observe_launch(now);
    }

    /// The earliest timer this session is waiting for.
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        match (self.guard.cooldown_deadline(), self.locator.next_deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    pub(crate) async fn on_timer(&mut self, now: Instant) -> Flow {
        if self.guard.expire_cooldown(now) {
            debug!(session = %self.id, "cooldown elapsed");
        }

        match self.locator.on_timer(now).await {
            Some(LocatorEvent::Detected(identity)) => {
                self.events.emit(EventKind::TargetDetected {
                    pid: identity.pid,
                    version: identity.version.clone(),
                });
                Flow::Continue
            }
            Some(LocatorEvent::Exited { pid }) => {
                self.delivery.release(pid);
                self.events.emit(EventKind::TargetExited { pid });
                if self.stop_on_target_exit {
                    Flow::Stop("target exited".into())
                } else {
                    Flow::Continue
                }
            }
            None => Flow::Continue,
        }
    }

    pub(crate) fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.id.clone(),
            started_at: self.started_at,
            stats: self.stats.clone(),
            awaiting_response: self.guard.awaiting_response(),
            locator: self.locator.state().clone(),
            last_intervention: self.history.back().cloned(),
            last_intervention_at: self.last_intervention_at,
            recent_responses: self.guard.recent_responses().map(str::to_string).collect(),
            history_len: self.history.len(),
        }
    }

    /// Release target resources and announce the end of supervision.
    pub(crate) fn finish(mut self, reason: &str) -> SessionStats {
        if let Some(pid) = self.locator.target().map(|t| t.pid) {
            self.delivery.release(pid);
        }
        self.locator.reset();
        info!(session = %self.id, reason, interventions = self.stats.interventions, "supervision stopped");
        self.events.emit(EventKind::SupervisionStopped {
            reason: reason.to_string(),
        });
        self.stats
    }

    async fn handle_detection(&mut self, detection: Detection, now: Instant) {
        match detection.category {
            Category::Question => {
                self.stats.questions += 1;
                let context = self.oracle_context();
                match self.decision.decide(&detection, &context).await {
                    Verdict::Inject(resolved) => self.inject(&detection, resolved, now).await,
                    Verdict::Withhold(resolved) => {
                        self.stats.withheld += 1;
                        let escalation = Escalation::guidance(&self.id, &detection, &resolved);
                        self.escalate(EventKind::GuidanceRequested { escalation });
                    }
                    Verdict::Escalate => {
                        let escalation = Escalation::from_detection(&self.id, &detection);
                        self.escalate(EventKind::GuidanceRequested { escalation });
                    }
                }
            }
            Category::Confusion => {
                self.stats.confusion += 1;
                let escalation = Escalation::from_detection(&self.id, &detection);
                self.escalate(EventKind::ConfusionDetected { escalation });
            }
            Category::Error => {
                self.stats.errors += 1;
                let escalation = Escalation::from_detection(&self.id, &detection);
                self.escalate(EventKind::ErrorDetected { escalation });
            }
        }
    }

    fn escalate(&mut self, kind: EventKind) {
        self.stats.escalations += 1;
        let escalation = match &kind {
            EventKind::ConfusionDetected { escalation }
            | EventKind::ErrorDetected { escalation }
            | EventKind::GuidanceRequested { escalation } => Some(escalation),
            _ => None,
        };
        if let Some(escalation) = escalation {
            info!(
                session = %self.id,
                rule = %escalation.rule_type,
                priority = ?escalation.priority,
                "{}",
                kind.name()
            );
            if let Some(sink) = &self.guidance {
                sink.escalate(escalation);
            }
        }
        self.events.emit(kind);
    }

    async fn inject(&mut self, detection: &Detection, resolved: ResolvedResponse, now: Instant) {
        self.guard.begin_injection(now);
        let pid = self.locator.target().map(|t| t.pid);
        let response = resolved.response.clone();

        match self.delivery.deliver(&response, pid, self.terminal.as_ref()).await {
            Ok(report) => {
                self.guard.record_sent(&response, now);
                match resolved.kind {
                    InterventionKind::Decision => self.stats.oracle_decisions += 1,
                    InterventionKind::Fallback => self.stats.fallbacks += 1,
                }
                let record = resolved.into_record(detection, &report.via);
                info!(
                    session = %self.id,
                    rule = %record.rule_type,
                    response = %record.response,
                    confidence = record.confidence,
                    via = %report.via,
                    "intervention"
                );
                self.stats.interventions += 1;
                self.last_intervention_at = Some(record.timestamp);
                if self.history.len() >= self.history_limit {
                    self.history.pop_front();
                }
                self.history.push_back(record.clone());
                self.events.emit(EventKind::Intervention {
                    record,
                    delivery: report,
                });
            }
            Err(e) => {
                self.guard.abort_injection();
                self.stats.injection_failures += 1;
                warn!(session = %self.id, error = %e, "injection failed");
                self.events.emit(EventKind::InjectionFailed {
                    response,
                    error: e.to_string(),
                });
            }
        }
    }

    fn oracle_context(&self) -> OracleContext {
        let skip = self.history.len().saturating_sub(ORACLE_CONTEXT_INTERVENTIONS);
        OracleContext {
            session_id: self.id.clone(),
            recent_output: self.recent_output.context(ORACLE_CONTEXT_LINES),
            recent_interventions: self.history.iter().skip(skip).cloned().collect(),
            target: self.locator.target().cloned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::*;
    use crate::delivery::testing::{AliveTable, RecordingTerminal};
    use crate::event::SupervisorEvent;
    use crate::process::ProcessTable;

    fn session(
        terminal: Arc<RecordingTerminal>,
    ) -> (Session, mpsc::UnboundedReceiver<SupervisorEvent>) {
        let config = PilotConfig::default();
        let table: Arc<dyn ProcessTable> = Arc::new(AliveTable);
        let (tx, rx) = mpsc::unbounded_channel();
        let id = SessionId::new("unit");
        let session = Session::new(SessionParts {
            id: id.clone(),
            rules: Arc::new(RuleTable::builtin()),
            decision: DecisionStep::new(&config.decision, None),
            delivery: Delivery::from_config(&config.delivery, table.clone()),
            locator: ProcessLocator::new(&config.locator, 1, table).unwrap(),
            terminal,
            guidance: None,
            events: EventSink::new(id, Some(tx)),
            config,
        });
        (session, rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<SupervisorEvent>) -> Vec<&'static str> {
        let mut names = Vec::new();
        while let Ok(event) = rx.try_recv() {
            names.push(event.kind.name());
        }
        names
    }

    #[tokio::test(start_paused = true)]
    async fn question_is_answered_through_terminal() {
        let terminal = Arc::new(RecordingTerminal::default());
        let (mut s, mut rx) = session(terminal.clone());
        s.handle_output(b"\x1b[1mShall I proceed with creating the file?\x1b[0m", Instant::now())
            .await;

        assert_eq!(terminal.bytes(), b"1\r");
        let snap = s.snapshot();
        assert!(snap.awaiting_response);
        assert_eq!(snap.stats.interventions, 1);
        assert_eq!(snap.stats.fallbacks, 1);
        assert_eq!(snap.last_intervention.unwrap().delivered_via, "raw_terminal");
        assert_eq!(drain(&mut rx), vec!["output", "intervention"]);
    }

    #[tokio::test(start_paused = true)]
    async fn cooldown_deadline_clears_awaiting() {
        let terminal = Arc::new(RecordingTerminal::default());
        let (mut s, _rx) = session(terminal);
        let t0 = Instant::now();
        s.handle_output(b"Shall I proceed?", t0).await;
        assert_eq!(s.next_deadline(), Some(t0 + Duration::from_secs(8)));
        assert_eq!(s.on_timer(t0 + Duration::from_secs(8)).await, Flow::Continue);
        assert!(!s.snapshot().awaiting_response);
        assert_eq!(s.next_deadline(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn closed_terminal_reports_failure_and_reopens_gate() {
        let terminal = Arc::new(RecordingTerminal::default());
        terminal.closed.store(true, std::sync::atomic::Ordering::SeqCst);
        let (mut s, mut rx) = session(terminal);
        s.handle_output(b"Shall I proceed?", Instant::now()).await;

        let snap = s.snapshot();
        assert!(!snap.awaiting_response);
        assert_eq!(snap.stats.injection_failures, 1);
        assert_eq!(snap.stats.interventions, 0);
        assert_eq!(snap.history_len, 0);
        assert_eq!(drain(&mut rx), vec!["output", "injection-failed"]);
    }

    #[tokio::test(start_paused = true)]
    async fn error_escalates_without_writing() {
        let terminal = Arc::new(RecordingTerminal::default());
        let (mut s, mut rx) = session(terminal.clone());
        s.handle_output(b"Error: permission denied", Instant::now()).await;
        assert!(terminal.bytes().is_empty());
        let snap = s.snapshot();
        assert_eq!(snap.stats.errors, 1);
        assert_eq!(snap.stats.escalations, 1);
        assert_eq!(snap.stats.interventions, 0);
        assert_eq!(drain(&mut rx), vec!["output", "error-detected"]);
    }

    #[tokio::test(start_paused = true)]
    async fn escape_split_between_reads_still_matches() {
        let terminal = Arc::new(RecordingTerminal::default());
        let (mut s, _rx) = session(terminal);
        let now = Instant::now();
        s.handle_output(b"build output\n\x1b[1;3", now).await;
        s.handle_output(b"1mError: disk quota exceeded\x1b[0m\n", now).await;
        assert_eq!(s.snapshot().stats.errors, 1);
        assert_eq!(
            s.recent_output.context(2),
            vec!["build output", "Error: disk quota exceeded"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn low_confidence_question_requests_guidance() {
        let terminal = Arc::new(RecordingTerminal::default());
        let (mut s, mut rx) = session(terminal.clone());
        s.handle_output(b"Do you want to run this command?", Instant::now()).await;
        assert!(terminal.bytes().is_empty());
        assert!(!s.snapshot().awaiting_response);
        assert_eq!(s.snapshot().stats.withheld, 1);
        assert_eq!(drain(&mut rx), vec!["output", "guidance-requested"]);
    }

    #[tokio::test(start_paused = true)]
    async fn history_is_capped() {
        let terminal = Arc::new(RecordingTerminal::default());
        let (mut s, _rx) = session(terminal);
        s.history_limit = 2;
        let mut now = Instant::now();
        for _ in 0..3 {
            s.handle_output(b"Shall I proceed?", now).await;
            now += Duration::from_secs(11);
            s.on_timer(now).await;
        }
        let snap = s.snapshot();
        assert_eq!(snap.stats.interventions, 3);
        assert_eq!(snap.history_len, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn finish_emits_stopped() {
        let terminal = Arc::new(RecordingTerminal::default());
        let (s, mut rx) = session(terminal);
        s.start();
        let stats = s.finish("stopped");
        assert_eq!(stats, SessionStats::default());
        assert_eq!(drain(&mut rx), vec!["supervision-started", "supervision-stopped"]);
    }
}
