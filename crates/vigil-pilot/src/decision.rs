//! Decision step: picks the response for a question detection.
//!
//! The external [`DecisionOracle`] is consulted first. When it is absent,
//! fails, times out or reports a confidence outside `0..=1`, the rule's
//! static default is used instead. Either way the resolved confidence must
//! clear the minimum-confidence gate before anything is written to the
//! target; below the gate the prompt is withheld and escalated.
//!
//! Confusion and error detections are never answered automatically.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use vigil_types::{
    Category, DecisionConfig, InterventionKind, InterventionRecord, Priority, SessionId,
    VigilError,
};

use crate::classifier::Detection;
use crate::locator::TargetIdentity;

/// What the oracle sees besides the detection itself.
#[derive(Debug, Clone)]
pub struct OracleContext {
    pub session_id: SessionId,
    /// Last lines of visible output, oldest first.
    pub recent_output: Vec<String>,
    /// Most recent interventions of this session, oldest first.
    pub recent_interventions: Vec<InterventionRecord>,
    pub target: Option<TargetIdentity>,
}

/// The oracle's answer to a question detection.
#[derive(Debug, Clone, PartialEq)]
pub struct OracleDecision {
    pub option: String,
    pub confidence: f64,
    pub reason: String,
    pub metadata: Option<serde_json::Value>,
}

/// External policy that chooses a response option.
///
/// Shared by every session, so implementations must tolerate concurrent
/// calls.
#[async_trait]
pub trait DecisionOracle: Send + Sync {
    async fn decide(
        &self,
        detection: &Detection,
        context: &OracleContext,
    ) -> Result<OracleDecision, VigilError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationKind {
    Confusion,
    Error,
    /// A question whose best response fell below the confidence gate.
    GuidanceRequested,
}

/// Something a human or a higher-level policy should look at.
#[derive(Debug, Clone, Serialize)]
pub struct Escalation {
    pub session_id: SessionId,
    pub kind: EscalationKind,
    pub rule_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    pub matched_text: String,
    pub text: String,
    /// The withheld response, for guidance requests.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggested_response: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub at: DateTime<Utc>,
}

impl Escalation {
    /// Escalation for a confusion or error detection.
    pub fn from_detection(session_id: &SessionId, detection: &Detection) -> Self {
        let kind = match detection.category {
            Category::Confusion => EscalationKind::Confusion,
            Category::Error => EscalationKind::Error,
            Category::Question => EscalationKind::GuidanceRequested,
        };
        Self {
            session_id: session_id.clone(),
            kind,
            rule_type: detection.rule_type().to_string(),
            priority: detection.priority(),
            matched_text: detection.matched_text.clone(),
            text: detection.text.clone(),
            suggested_response: None,
            confidence: detection.confidence,
            reason: None,
            at: Utc::now(),
        }
    }

    /// Escalation for a question whose response was withheld.
    pub fn guidance(session_id: &SessionId, detection: &Detection, resolved: &ResolvedResponse) -> Self {
        Self {
            kind: EscalationKind::GuidanceRequested,
            suggested_response: Some(resolved.response.clone()),
            confidence: Some(resolved.confidence),
            reason: Some(resolved.reason.clone()),
            ..Self::from_detection(session_id, detection)
        }
    }
}

/// Outbound receiver of escalations. No answer is read back.
pub trait GuidanceSink: Send + Sync {
    fn escalate(&self, escalation: &Escalation);
}

/// A response chosen for a question, before the gate is applied.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedResponse {
    pub kind: InterventionKind,
    pub response: String,
    pub confidence: f64,
    pub reason: String,
    pub metadata: Option<serde_json::Value>,
}

impl ResolvedResponse {
    /// Build the record stored after a successful injection.
    pub fn into_record(self, detection: &Detection, delivered_via: &str) -> InterventionRecord {
        InterventionRecord {
            kind: self.kind,
            rule_type: detection.rule_type().to_string(),
            original_text: detection.text.clone(),
            response: self.response,
            confidence: self.confidence,
            reason: self.reason,
            metadata: self.metadata,
            delivered_via: delivered_via.to_string(),
            timestamp: Utc::now(),
        }
    }
}

/// Outcome of the decision step for one detection.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    /// Confident enough: deliver this response.
    Inject(ResolvedResponse),
    /// Below the confidence gate: send nothing, request guidance.
    Withhold(ResolvedResponse),
    /// Confusion or error: escalate only.
    Escalate,
}

/// Oracle consultation plus the confidence gate.
pub struct DecisionStep {
    oracle: Option<Arc<dyn DecisionOracle>>,
    min_confidence: f64,
    timeout: Duration,
}

impl DecisionStep {
    pub fn new(config: &DecisionConfig, oracle: Option<Arc<dyn DecisionOracle>>) -> Self {
        Self {
            oracle,
            min_confidence: config.min_confidence,
            timeout: config.oracle_timeout(),
        }
    }

    pub fn has_oracle(&self) -> bool {
        self.oracle.is_some()
    }

    pub fn min_confidence(&self) -> f64 {
        self.min_confidence
    }

    pub async fn decide(&self, detection: &Detection, context: &OracleContext) -> Verdict {
        if detection.category != Category::Question {
            return Verdict::Escalate;
        }

        let resolved = self.resolve(detection, context).await;
        if resolved.confidence >= self.min_confidence {
            Verdict::Inject(resolved)
        } else {
            debug!(
                rule = detection.rule_type(),
                confidence = resolved.confidence,
                min = self.min_confidence,
                "response below confidence gate"
            );
            Verdict::Withhold(resolved)
        }
    }

    async fn resolve(&self, detection: &Detection, context: &OracleContext) -> ResolvedResponse {
        let Some(oracle) = &self.oracle else {
            return fallback(detection, "no decision oracle configured".into());
        };

        let outcome = tokio::time::timeout(self.timeout, oracle.decide(detection, context)).await;
        match outcome {
            Ok(Ok(decision)) if valid_confidence(decision.confidence) => ResolvedResponse {
                kind: InterventionKind::Decision,
                response: decision.option,
                confidence: decision.confidence,
                reason: decision.reason,
                metadata: decision.metadata,
            },
            Ok(Ok(decision)) => {
                warn!(
                    session = %context.session_id,
                    confidence = decision.confidence,
                    "oracle reported an invalid confidence, using rule default"
                );
                fallback(
                    detection,
                    format!("oracle reported invalid confidence {}", decision.confidence),
                )
            }
            Ok(Err(e)) => {
                warn!(session = %context.session_id, error = %e, "oracle failed, using rule default");
                fallback(detection, format!("oracle failed: {e}"))
            }
            Err(_) => {
                warn!(
                    session = %context.session_id,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "oracle timed out, using rule default"
                );
                fallback(
                    detection,
                    format!("oracle timed out after {}ms", self.timeout.as_millis()),
                )
            }
        }
    }
}

fn valid_confidence(confidence: f64) -> bool {
    confidence.is_finite() && (0.0..=1.0).contains(&confidence)
}

fn fallback(detection: &Detection, reason: String) -> ResolvedResponse {
    ResolvedResponse {
        kind: InterventionKind::Fallback,
        response: detection.rule.default_response().unwrap_or_default().to_string(),
        confidence: detection.confidence.unwrap_or(0.0),
        reason,
        metadata: None,
    }
}
