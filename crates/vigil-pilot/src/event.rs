//! Events emitted by a supervised session for external consumers.
//!
//! Serialized as one JSON object per event with an `event` tag in
//! kebab-case (`supervision-started`, `intervention`, ...), which is what
//! the CLI writes to its `--events` file.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;

use vigil_types::{InterventionRecord, SessionId};

use crate::decision::Escalation;
use crate::delivery::DeliveryReport;

#[derive(Debug, Clone, Serialize)]
pub struct SupervisorEvent {
    pub session_id: SessionId,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum EventKind {
    SupervisionStarted {
        shell_pid: u32,
    },
    SupervisionStopped {
        reason: String,
    },
    /// Output passthrough, lossily decoded but not stripped.
    Output {
        text: String,
    },
    Intervention {
        record: InterventionRecord,
        delivery: DeliveryReport,
    },
    ConfusionDetected {
        escalation: Escalation,
    },
    ErrorDetected {
        escalation: Escalation,
    },
    GuidanceRequested {
        escalation: Escalation,
    },
    TargetDetected {
        pid: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        version: Option<String>,
    },
    TargetExited {
        pid: u32,
    },
    /// The terminal channel itself rejected the write.
    InjectionFailed {
        response: String,
        error: String,
    },
}

impl EventKind {
    /// The serialized tag, for logs and filters.
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::SupervisionStarted { .. } => "supervision-started",
            EventKind::SupervisionStopped { .. } => "supervision-stopped",
            EventKind::Output { .. } => "output",
            EventKind::Intervention { .. } => "intervention",
            EventKind::ConfusionDetected { .. } => "confusion-detected",
            EventKind::ErrorDetected { .. } => "error-detected",
            EventKind::GuidanceRequested { .. } => "guidance-requested",
            EventKind::TargetDetected { .. } => "target-detected",
            EventKind::TargetExited { .. } => "target-exited",
            EventKind::InjectionFailed { .. } => "injection-failed",
        }
    }
}

/// Session-tagged sender; a missing or dropped receiver is ignored.
#[derive(Clone)]
pub(crate) struct EventSink {
    session_id: SessionId,
    tx: Option<UnboundedSender<SupervisorEvent>>,
}

impl EventSink {
    pub(crate) fn new(session_id: SessionId, tx: Option<UnboundedSender<SupervisorEvent>>) -> Self {
        Self { session_id, tx }
    }

    pub(crate) fn emit(&self, kind: EventKind) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(SupervisorEvent {
                session_id: self.session_id.clone(),
                at: Utc::now(),
                kind,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_kebab_tag() {
        let event = SupervisorEvent {
            session_id: SessionId::new("s1"),
            at: Utc::now(),
            kind: EventKind::TargetDetected {
                pid: 42,
                version: None,
            },
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "target-detected");
        assert_eq!(json["session_id"], "s1");
        assert_eq!(json["pid"], 42);
        assert!(json.get("version").is_none());
        assert_eq!(event.kind.name(), "target-detected");
    }

    #[test]
    fn sink_without_receiver_is_silent() {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        drop(rx);
        let sink = EventSink::new(SessionId::new("s"), Some(tx));
        sink.emit(EventKind::TargetExited { pid: 1 });
        EventSink::new(SessionId::new("s"), None).emit(EventKind::TargetExited { pid: 1 });
    }

    #[test]
    fn sink_tags_session() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let sink = EventSink::new(SessionId::new("abc"), Some(tx));
        sink.emit(EventKind::SupervisionStopped {
            reason: "stopped".into(),
        });
        let event = rx.try_recv().unwrap();
        assert_eq!(event.session_id, "abc");
        assert_eq!(event.kind.name(), "supervision-stopped");
    }
}
