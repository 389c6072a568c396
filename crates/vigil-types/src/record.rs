use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which family of rules produced a detection.
///
/// Categories are tested in declaration order: a chunk that matches both a
/// question rule and a confusion rule is a question.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    /// The agent is asking for a yes/no or menu choice.
    Question,
    /// The agent says it does not know how to continue.
    Confusion,
    /// The agent printed an error.
    Error,
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Category::Question => write!(f, "question"),
            Category::Confusion => write!(f, "confusion"),
            Category::Error => write!(f, "error"),
        }
    }
}

/// Escalation priority attached to confusion and error rules.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Medium => write!(f, "medium"),
            Priority::High => write!(f, "high"),
        }
    }
}

/// How the response of an intervention was chosen.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum InterventionKind {
    /// The decision oracle picked the response.
    Decision,
    /// The oracle was absent or failed; the rule's static default was used.
    Fallback,
}

/// One completed auto-response, appended to the session history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterventionRecord {
    pub kind: InterventionKind,
    /// Label of the rule that matched (e.g. `claude_cli_proceed`).
    pub rule_type: String,
    /// The ANSI-stripped text that was classified.
    pub original_text: String,
    /// The text that was injected (without the line terminator).
    pub response: String,
    pub confidence: f64,
    /// Human-readable explanation of why this response was chosen.
    pub reason: String,
    /// Opaque data reported by the oracle, if it made the decision.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    /// Name of the delivery path that reported success.
    pub delivered_via: String,
    pub timestamp: DateTime<Utc>,
}
