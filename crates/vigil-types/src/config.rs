//! Configuration types for a vigil supervisor.
//!
//! [`PilotConfig`] is the top-level configuration loaded from `vigil.toml`.
//! Every field has a default, so an empty file (or no file at all) yields a
//! working supervisor for the `claude` CLI.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Category, Priority, VigilError};

/// Default file name looked up by the CLI when `--config` is not given.
pub const CONFIG_FILENAME: &str = "vigil.toml";

/// Top-level supervisor configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PilotConfig {
    /// Loop guard and cooldown timing.
    #[serde(default)]
    pub guard: GuardConfig,
    /// Confidence gate and oracle behaviour.
    #[serde(default)]
    pub decision: DecisionConfig,
    /// Injection cascade tuning.
    #[serde(default)]
    pub delivery: DeliveryConfig,
    /// How the target program is found among the shell's children.
    #[serde(default)]
    pub locator: LocatorConfig,
    /// Extra rules appended after the built-in table.
    #[serde(default)]
    pub rules: Vec<CustomRuleConfig>,
}

impl PilotConfig {
    /// Parse a configuration from a TOML string and validate it.
    pub fn from_toml(content: &str) -> Result<Self, VigilError> {
        let config: Self =
            toml::from_str(content).map_err(|e| VigilError::ConfigError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize the configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String, VigilError> {
        toml::to_string_pretty(self).map_err(|e| VigilError::ConfigError(e.to_string()))
    }

    /// Read and parse a configuration file.
    pub fn load(path: &Path) -> Result<Self, VigilError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            VigilError::ConfigError(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml(&content)
    }

    /// Check value ranges that serde cannot express.
    pub fn validate(&self) -> Result<(), VigilError> {
        if !(0.0..=1.0).contains(&self.decision.min_confidence) {
            return Err(VigilError::ConfigError(format!(
                "decision.min_confidence must be within 0..=1, got {}",
                self.decision.min_confidence
            )));
        }
        if self.delivery.retry_attempts == 0 {
            return Err(VigilError::ConfigError(
                "delivery.retry_attempts must be at least 1".into(),
            ));
        }
        if self.guard.recent_capacity == 0 {
            return Err(VigilError::ConfigError(
                "guard.recent_capacity must be at least 1".into(),
            ));
        }
        if self.locator.target_name.trim().is_empty() {
            return Err(VigilError::ConfigError("locator.target_name is empty".into()));
        }
        regex::Regex::new(&self.locator.effective_launch_pattern()).map_err(|e| {
            VigilError::ConfigError(format!("locator.launch_pattern is not a valid regex: {e}"))
        })?;
        for rule in &self.rules {
            if let Some(confidence) = rule.confidence {
                if !(0.0..=1.0).contains(&confidence) {
                    return Err(VigilError::ConfigError(format!(
                        "rule {:?}: confidence must be within 0..=1, got {confidence}",
                        rule.rule_type
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Loop guard timing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GuardConfig {
    /// How long `awaiting_response` stays set after an injection.
    pub cooldown_ms: u64,
    /// Window in which a chunk echoing the latest injection is ignored.
    pub echo_window_ms: u64,
    /// Window in which a chunk echoing any recent injection is ignored.
    pub recent_window_ms: u64,
    /// Number of recent injections remembered.
    pub recent_capacity: usize,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            cooldown_ms: 8_000,
            echo_window_ms: 5_000,
            recent_window_ms: 10_000,
            recent_capacity: 5,
        }
    }
}

impl GuardConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    pub fn echo_window(&self) -> Duration {
        Duration::from_millis(self.echo_window_ms)
    }

    pub fn recent_window(&self) -> Duration {
        Duration::from_millis(self.recent_window_ms)
    }
}

/// Decision step tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DecisionConfig {
    /// Responses below this confidence are withheld and escalated instead.
    pub min_confidence: f64,
    /// An oracle call that takes longer than this counts as a failure.
    pub oracle_timeout_ms: u64,
    /// Maximum intervention records kept per session (oldest dropped first).
    pub history_limit: usize,
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            min_confidence: 0.9,
            oracle_timeout_ms: 5_000,
            history_limit: 200,
        }
    }
}

impl DecisionConfig {
    pub fn oracle_timeout(&self) -> Duration {
        Duration::from_millis(self.oracle_timeout_ms)
    }
}

/// A delivery strategy that can be enabled in the cascade.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    /// Write to the target's stdin descriptor through the OS.
    DirectDescriptor,
    /// Type the response into the terminal one character at a time.
    Keystrokes,
    /// Relay the response through a FIFO keyed by the target PID.
    NamedPipe,
    /// Copy to the system clipboard and paste into the terminal.
    Clipboard,
}

impl StrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::DirectDescriptor => "direct_descriptor",
            StrategyKind::Keystrokes => "keystrokes",
            StrategyKind::NamedPipe => "named_pipe",
            StrategyKind::Clipboard => "clipboard",
        }
    }
}

/// Injection cascade tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DeliveryConfig {
    /// How many times the whole cascade is tried before the raw fallback.
    pub retry_attempts: u32,
    /// Pause between cascade attempts.
    pub retry_pause_ms: u64,
    /// Delay between synthesized keystrokes.
    pub keystroke_delay_ms: u64,
    /// Pause before the final Enter of a typed or pasted response.
    pub enter_delay_ms: u64,
    /// Check target liveness this long after injecting; `None` disables it.
    pub verify_after_ms: Option<u64>,
    /// Strategies tried, in order, when the target is known.
    pub strategies: Vec<StrategyKind>,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            retry_attempts: 3,
            retry_pause_ms: 500,
            keystroke_delay_ms: 30,
            enter_delay_ms: 100,
            verify_after_ms: Some(500),
            strategies: vec![
                StrategyKind::DirectDescriptor,
                StrategyKind::Keystrokes,
                StrategyKind::NamedPipe,
                StrategyKind::Clipboard,
            ],
        }
    }
}

impl DeliveryConfig {
    pub fn retry_pause(&self) -> Duration {
        Duration::from_millis(self.retry_pause_ms)
    }

    pub fn keystroke_delay(&self) -> Duration {
        Duration::from_millis(self.keystroke_delay_ms)
    }

    pub fn enter_delay(&self) -> Duration {
        Duration::from_millis(self.enter_delay_ms)
    }

    pub fn verify_after(&self) -> Option<Duration> {
        self.verify_after_ms.map(Duration::from_millis)
    }
}

/// Target program discovery.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LocatorConfig {
    /// Process name of the supervised program.
    pub target_name: String,
    /// Regex matched against each line typed into the shell. When absent the
    /// pattern matches a command line whose first word is `target_name`.
    pub launch_pattern: Option<String>,
    /// Delay between seeing the launch command and searching for the PID.
    pub search_delay_ms: u64,
    /// Liveness poll interval once the target is bound.
    pub poll_interval_ms: u64,
    /// Run `<target_name> --version` when the target is bound.
    pub probe_version: bool,
    /// Stop supervising the session when the target exits.
    pub stop_on_target_exit: bool,
}

impl Default for LocatorConfig {
    fn default() -> Self {
        Self {
            target_name: "claude".into(),
            launch_pattern: None,
            search_delay_ms: 1_500,
            poll_interval_ms: 2_000,
            probe_version: true,
            stop_on_target_exit: true,
        }
    }
}

impl LocatorConfig {
    pub fn search_delay(&self) -> Duration {
        Duration::from_millis(self.search_delay_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// The configured launch pattern, or one derived from `target_name`.
    pub fn effective_launch_pattern(&self) -> String {
        match &self.launch_pattern {
            Some(pattern) => pattern.clone(),
            None => format!(
                r"^\s*(?:\S*/)?{}(?:\s|$)",
                regex::escape(self.target_name.trim())
            ),
        }
    }
}

/// A user-supplied rule, appended after the built-in rule table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CustomRuleConfig {
    pub category: Category,
    /// Regex tested against the ANSI-stripped chunk.
    pub regex: String,
    /// Label reported in detections and intervention records.
    pub rule_type: String,
    /// Default response (question rules only).
    #[serde(default)]
    pub response: Option<String>,
    /// Static confidence (question rules only).
    #[serde(default)]
    pub confidence: Option<f64>,
    /// Escalation priority (confusion and error rules only).
    #[serde(default)]
    pub priority: Option<Priority>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_gives_defaults() {
        let config = PilotConfig::from_toml("").unwrap();
        assert_eq!(config, PilotConfig::default());
        assert_eq!(config.guard.cooldown(), Duration::from_secs(8));
        assert_eq!(config.guard.recent_capacity, 5);
        assert_eq!(config.decision.min_confidence, 0.9);
        assert_eq!(config.delivery.retry_attempts, 3);
        assert_eq!(config.delivery.strategies.len(), 4);
        assert_eq!(config.locator.poll_interval(), Duration::from_secs(2));
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = PilotConfig::from_toml(
            r#"
            [guard]
            cooldown_ms = 3000

            [delivery]
            strategies = ["keystrokes", "clipboard"]
            verify_after_ms = 250
            "#,
        )
        .unwrap();
        assert_eq!(config.guard.cooldown_ms, 3000);
        assert_eq!(config.guard.echo_window_ms, 5000);
        assert_eq!(
            config.delivery.strategies,
            vec![StrategyKind::Keystrokes, StrategyKind::Clipboard]
        );
        assert_eq!(config.delivery.verify_after(), Some(Duration::from_millis(250)));
    }

    #[test]
    fn custom_rules_parse() {
        let config = PilotConfig::from_toml(
            r#"
            [[rules]]
            category = "question"
            regex = "(?i)overwrite\\?"
            rule_type = "overwrite_prompt"
            response = "y"
            confidence = 0.92

            [[rules]]
            category = "error"
            regex = "(?i)disk full"
            rule_type = "disk_full"
            priority = "high"
            "#,
        )
        .unwrap();
        assert_eq!(config.rules.len(), 2);
        assert_eq!(config.rules[0].category, Category::Question);
        assert_eq!(config.rules[1].priority, Some(Priority::High));
    }

    #[test]
    fn rejects_out_of_range_confidence() {
        let err = PilotConfig::from_toml("[decision]\nmin_confidence = 1.5\n").unwrap_err();
        assert!(err.to_string().contains("min_confidence"), "{err}");
    }

    #[test]
    fn rejects_zero_retry_attempts() {
        let err = PilotConfig::from_toml("[delivery]\nretry_attempts = 0\n").unwrap_err();
        assert!(err.to_string().contains("retry_attempts"), "{err}");
    }

    #[test]
    fn rejects_invalid_launch_pattern() {
        let err = PilotConfig::from_toml("[locator]\nlaunch_pattern = \"[oops\"\n").unwrap_err();
        assert!(err.to_string().contains("launch_pattern"), "{err}");
    }

    #[test]
    fn derived_launch_pattern_matches_first_word() {
        let locator = LocatorConfig::default();
        let re = regex::Regex::new(&locator.effective_launch_pattern()).unwrap();
        assert!(re.is_match("claude"));
        assert!(re.is_match("  claude --resume"));
        assert!(re.is_match("/usr/local/bin/claude"));
        assert!(!re.is_match("echo claude"));
        assert!(!re.is_match("claudette"));
    }

    #[test]
    fn toml_roundtrip() {
        let config = PilotConfig::default();
        let text = config.to_toml().unwrap();
        assert_eq!(PilotConfig::from_toml(&text).unwrap(), config);
    }

    #[test]
    fn load_reads_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut file, b"[locator]\ntarget_name = \"codex\"\n").unwrap();
        let config = PilotConfig::load(file.path()).unwrap();
        assert_eq!(config.locator.target_name, "codex");
    }
}
