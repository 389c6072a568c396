//! Classifier: turns one chunk of visible output into at most one detection.
//!
//! Categories are tested in a fixed order (question, confusion, error) and
//! the first matching rule wins. The whole chunk is matched at once, so a
//! rule may span line breaks.

use std::sync::Arc;

use tokio::time::Instant;

use vigil_types::{Category, Priority};

use crate::guard::{LoopGuard, Veto};
use crate::rules::{Rule, RuleTable};

/// A chunk matched by a rule.
#[derive(Debug, Clone)]
pub struct Detection {
    pub category: Category,
    pub rule: Arc<Rule>,
    /// The part of the chunk the rule matched.
    pub matched_text: String,
    /// The whole chunk that was classified.
    pub text: String,
    /// Static confidence of question rules.
    pub confidence: Option<f64>,
}

impl Detection {
    pub fn rule_type(&self) -> &str {
        self.rule.rule_type()
    }

    /// Escalation priority of confusion and error detections.
    pub fn priority(&self) -> Option<Priority> {
        self.rule.priority()
    }
}

/// Result of classifying one chunk.
#[derive(Debug, Clone)]
pub enum Classification {
    /// No rule matched; the common case.
    None,
    /// The loop guard suppressed the chunk.
    Vetoed(Veto),
    Detected(Detection),
}

impl Classification {
    pub fn detection(&self) -> Option<&Detection> {
        match self {
            Classification::Detected(d) => Some(d),
            _ => None,
        }
    }

    pub fn into_detection(self) -> Option<Detection> {
        match self {
            Classification::Detected(d) => Some(d),
            _ => None,
        }
    }
}

/// Classify an ANSI-stripped chunk.
///
/// Deterministic in `(text, rules, guard state, now)`. While the guard is
/// awaiting a response, question rules are vetoed but the chunk still goes
/// through the confusion and error rules, which never write to the target.
/// The veto is reported only when nothing else matched.
pub fn classify(text: &str, rules: &RuleTable, guard: &LoopGuard, now: Instant) -> Classification {
    if text.trim().is_empty() {
        return Classification::None;
    }
    if let Some(veto) = guard.echo_veto(text, now) {
        return Classification::Vetoed(veto);
    }

    let mut vetoed = None;
    if let Some(detection) = first_match(text, rules, Category::Question) {
        if !guard.awaiting_response() {
            return Classification::Detected(detection);
        }
        vetoed = Some(Veto::AwaitingResponse);
    }

    for category in [Category::Confusion, Category::Error] {
        if let Some(detection) = first_match(text, rules, category) {
            return Classification::Detected(detection);
        }
    }

    vetoed.map_or(Classification::None, Classification::Vetoed)
}

fn first_match(text: &str, rules: &RuleTable, category: Category) -> Option<Detection> {
    rules.category(category).iter().find_map(|rule| {
        rule.find(text).map(|matched| Detection {
            category,
            rule: Arc::clone(rule),
            matched_text: matched.to_string(),
            text: text.to_string(),
            confidence: rule.confidence(),
        })
    })
}
