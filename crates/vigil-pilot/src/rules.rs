//! The rule table: ordered text patterns that recognise prompts, confusion
//! and errors in the target's output.
//!
//! Rules are grouped by [`Category`] and scanned in declaration order within
//! a category. The first rule that matches wins, even when a later rule would
//! report a higher confidence, so reordering the table changes behaviour.
//!
//! User rules from [`CustomRuleConfig`] are appended after the built-in rules
//! of their category. Invalid user regexes are logged and skipped.

use std::sync::Arc;

use regex::Regex;
use tracing::warn;

use vigil_types::{Category, CustomRuleConfig, Priority};

/// What a rule does when it matches.
#[derive(Debug, Clone, PartialEq)]
pub enum RuleKind {
    /// A prompt the supervisor may answer on its own.
    Question {
        default_response: String,
        confidence: f64,
    },
    /// The agent is stuck; escalate, never inject.
    Confusion { priority: Priority },
    /// The agent hit an error; escalate, never inject.
    Error { priority: Priority },
}

/// One immutable entry of the rule table.
#[derive(Debug)]
pub struct Rule {
    rule_type: String,
    matcher: Regex,
    kind: RuleKind,
}

impl Rule {
    /// Build a rule from a regex source.
    pub fn new(rule_type: impl Into<String>, pattern: &str, kind: RuleKind) -> Result<Self, regex::Error> {
        Ok(Self {
            rule_type: rule_type.into(),
            matcher: Regex::new(pattern)?,
            kind,
        })
    }

    pub fn rule_type(&self) -> &str {
        &self.rule_type
    }

    pub fn kind(&self) -> &RuleKind {
        &self.kind
    }

    pub fn category(&self) -> Category {
        match self.kind {
            RuleKind::Question { .. } => Category::Question,
            RuleKind::Confusion { .. } => Category::Confusion,
            RuleKind::Error { .. } => Category::Error,
        }
    }

    /// Static confidence of a question rule.
    pub fn confidence(&self) -> Option<f64> {
        match self.kind {
            RuleKind::Question { confidence, .. } => Some(confidence),
            _ => None,
        }
    }

    /// Default response of a question rule.
    pub fn default_response(&self) -> Option<&str> {
        match &self.kind {
            RuleKind::Question { default_response, .. } => Some(default_response),
            _ => None,
        }
    }

    /// Escalation priority of a confusion or error rule.
    pub fn priority(&self) -> Option<Priority> {
        match self.kind {
            RuleKind::Confusion { priority } | RuleKind::Error { priority } => Some(priority),
            RuleKind::Question { .. } => None,
        }
    }

    pub fn pattern(&self) -> &str {
        self.matcher.as_str()
    }

    /// The text matched by this rule, if any.
    pub fn find<'t>(&self, text: &'t str) -> Option<&'t str> {
        self.matcher.find(text).map(|m| m.as_str())
    }
}

fn question(response: &str, confidence: f64) -> RuleKind {
    RuleKind::Question {
        default_response: response.to_string(),
        confidence,
    }
}

/// (rule type, pattern, kind) for every built-in rule, in scan order.
fn builtin_specs() -> Vec<(&'static str, &'static str, RuleKind)> {
    use Priority::{High, Low, Medium};

    vec![
        // -- questions --
        (
            "claude_cli_full_options",
            r"(?s)\b1\.\s*Yes\b.*?\b2\.\s*Yes\b.*?\b3\.\s*No\b",
            question("1", 0.99),
        ),
        (
            "claude_cli_trust_folder",
            r"(?i)do you trust the files in this folder\?",
            question("1", 0.95),
        ),
        (
            "claude_cli_proceed",
            r"(?i)\b(?:shall|should|can|may) I (?:proceed|continue|go ahead)\b[^?\n]*\?|\bdo you want to proceed\?",
            question("1", 0.95),
        ),
        (
            "claude_cli_make_edit",
            r"(?i)\bdo you want to make this edit to\b",
            question("1", 0.95),
        ),
        (
            "claude_cli_create_file",
            r"(?i)\bdo you want to create\s+\S+",
            question("1", 0.95),
        ),
        (
            "claude_cli_run_command",
            r"(?i)\bdo you want to run this command\?",
            question("1", 0.85),
        ),
        (
            "yes_no_prompt",
            r"(?i)\[y/n\]|\(y/n\)|\[yes/no\]|\(yes/no\)",
            question("y", 0.9),
        ),
        (
            "press_enter",
            r"(?i)\bpress enter to continue\b",
            question("", 0.92),
        ),
        (
            "continue_question",
            r"(?i)\bwould you like (?:me )?to continue\?",
            question("yes", 0.9),
        ),
        (
            "trailing_proceed",
            r"(?im)\b(?:proceed|continue)\?\s*$",
            question("y", 0.8),
        ),
        // -- confusion --
        (
            "dont_understand",
            r"(?i)\bI (?:don'?t|do not) understand\b",
            RuleKind::Confusion { priority: High },
        ),
        (
            "unclear_instructions",
            r"(?i)\bI(?:'m| am) not sure (?:what|how|which|whether|if)\b",
            RuleKind::Confusion { priority: Medium },
        ),
        (
            "clarification_request",
            r"(?i)\bcould you (?:please )?(?:clarify|provide more (?:details|context|information))\b",
            RuleKind::Confusion { priority: Medium },
        ),
        (
            "missing_information",
            r"(?i)\bI (?:need|would need|require) more (?:information|context|details)\b",
            RuleKind::Confusion { priority: Medium },
        ),
        (
            "ambiguous_request",
            r"(?i)\b(?:ambiguous|unclear) (?:request|requirements?|instructions?)\b",
            RuleKind::Confusion { priority: Low },
        ),
        // -- errors --
        (
            "permission_error",
            r"(?i)\bpermission denied\b|\bEACCES\b|\boperation not permitted\b",
            RuleKind::Error { priority: High },
        ),
        (
            "rate_limit_error",
            r"(?i)\brate[ -]limit(?:ed)?\b|\btoo many requests\b",
            RuleKind::Error { priority: High },
        ),
        (
            "api_error",
            r"\bAPI Error\b",
            RuleKind::Error { priority: High },
        ),
        (
            "command_not_found",
            r"(?i)\bcommand not found\b|\bis not recognized as an internal or external command\b",
            RuleKind::Error { priority: Medium },
        ),
        (
            "module_not_found",
            r"(?i)\bcannot find module\b|\bmodule not found\b|\bModuleNotFoundError\b",
            RuleKind::Error { priority: Medium },
        ),
        (
            "network_error",
            r"\bECONNREFUSED\b|\bENOTFOUND\b|\bETIMEDOUT\b|(?i:\bnetwork error\b)",
            RuleKind::Error { priority: Medium },
        ),
        (
            "syntax_error",
            r"\bSyntaxError\b|(?i:\bsyntax error\b)",
            RuleKind::Error { priority: Medium },
        ),
        (
            "generic_error",
            r"(?m)^\s*(?:Error|ERROR|Fatal|FATAL)\b\s*[:!]",
            RuleKind::Error { priority: Low },
        ),
    ]
}

/// Ordered catalogue of rules, one list per category.
#[derive(Debug, Default)]
pub struct RuleTable {
    questions: Vec<Arc<Rule>>,
    confusion: Vec<Arc<Rule>>,
    errors: Vec<Arc<Rule>>,
}

impl RuleTable {
    /// An empty table. Mostly useful in tests.
    pub fn empty() -> Self {
        Self::default()
    }

    /// The built-in rules for the Claude CLI and common shell errors.
    pub fn builtin() -> Self {
        let mut table = Self::empty();
        for (rule_type, pattern, kind) in builtin_specs() {
            // Built-in patterns are constants covered by tests.
            let rule = Rule::new(rule_type, pattern, kind).expect("built-in rule pattern");
            table.push(rule);
        }
        table
    }

    /// The built-in rules followed by the valid user rules.
    pub fn with_custom(custom: &[CustomRuleConfig]) -> Self {
        let mut table = Self::builtin();
        for config in custom {
            if let Some(rule) = custom_rule(config) {
                table.push(rule);
            }
        }
        table
    }

    /// Append a rule to the end of its category.
    pub fn push(&mut self, rule: Rule) {
        let rule = Arc::new(rule);
        match rule.category() {
            Category::Question => self.questions.push(rule),
            Category::Confusion => self.confusion.push(rule),
            Category::Error => self.errors.push(rule),
        }
    }

    /// Rules of one category, in scan order.
    pub fn category(&self, category: Category) -> &[Arc<Rule>] {
        match category {
            Category::Question => &self.questions,
            Category::Confusion => &self.confusion,
            Category::Error => &self.errors,
        }
    }

    /// Every rule: questions, then confusion, then errors.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Rule>> {
        self.questions
            .iter()
            .chain(self.confusion.iter())
            .chain(self.errors.iter())
    }

    pub fn len(&self) -> usize {
        self.questions.len() + self.confusion.len() + self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn custom_rule(config: &CustomRuleConfig) -> Option<Rule> {
    let kind = match config.category {
        Category::Question => {
            let Some(response) = config.response.clone() else {
                warn!(rule = %config.rule_type, "skipping question rule without a response");
                return None;
            };
            RuleKind::Question {
                default_response: response,
                confidence: config.confidence.unwrap_or(0.0),
            }
        }
        Category::Confusion => RuleKind::Confusion {
            priority: config.priority.unwrap_or(Priority::Medium),
        },
        Category::Error => RuleKind::Error {
            priority: config.priority.unwrap_or(Priority::Medium),
        },
    };

    match Rule::new(config.rule_type.clone(), &config.regex, kind) {
        Ok(rule) => Some(rule),
        Err(e) => {
            warn!(rule = %config.rule_type, "skipping invalid rule pattern {:?}: {e}", config.regex);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn first_match<'a>(table: &'a RuleTable, category: Category, text: &str) -> Option<&'a str> {
        table
            .category(category)
            .iter()
            .find(|r| r.find(text).is_some())
            .map(|r| r.rule_type())
    }

    #[test]
    fn builtin_table_compiles_every_rule() {
        let table = RuleTable::builtin();
        assert_eq!(table.len(), builtin_specs().len());
        assert!(!table.category(Category::Question).is_empty());
        assert!(!table.category(Category::Confusion).is_empty());
        assert!(!table.category(Category::Error).is_empty());
    }

    #[test]
    fn rule_types_are_unique() {
        let table = RuleTable::builtin();
        let mut seen = std::collections::HashSet::new();
        for rule in table.iter() {
            assert!(seen.insert(rule.rule_type().to_string()), "duplicate {}", rule.rule_type());
        }
    }

    #[test]
    fn proceed_question() {
        let table = RuleTable::builtin();
        assert_eq!(
            first_match(&table, Category::Question, "Shall I proceed with creating the file?"),
            Some("claude_cli_proceed")
        );
        assert_eq!(
            first_match(&table, Category::Question, "Do you want to proceed?"),
            Some("claude_cli_proceed")
        );
    }

    #[test]
    fn full_menu_wins_over_proceed() {
        let table = RuleTable::builtin();
        let menu = "Do you want to proceed?\n❯ 1. Yes\n  2. Yes, and don't ask again this session\n  3. No, and tell Claude what to do differently (esc)";
        assert_eq!(
            first_match(&table, Category::Question, menu),
            Some("claude_cli_full_options")
        );
    }

    #[test]
    fn partial_menu_is_not_full_options() {
        let table = RuleTable::builtin();
        let menu = "❯ 1. Yes\n  2. Yes, and don't ask again";
        assert_ne!(
            first_match(&table, Category::Question, menu),
            Some("claude_cli_full_options")
        );
    }

    #[test]
    fn yes_no_brackets() {
        let table = RuleTable::builtin();
        assert_eq!(
            first_match(&table, Category::Question, "Overwrite config? [y/N]"),
            Some("yes_no_prompt")
        );
    }

    #[test]
    fn permission_error_before_generic_error() {
        let table = RuleTable::builtin();
        assert_eq!(
            first_match(&table, Category::Error, "Error: permission denied"),
            Some("permission_error")
        );
        assert_eq!(
            first_match(&table, Category::Error, "Error: something broke"),
            Some("generic_error")
        );
    }

    #[test]
    fn confusion_phrases() {
        let table = RuleTable::builtin();
        assert_eq!(
            first_match(&table, Category::Confusion, "I'm not sure which file you mean."),
            Some("unclear_instructions")
        );
        assert_eq!(
            first_match(&table, Category::Confusion, "Could you clarify the expected format?"),
            Some("clarification_request")
        );
    }

    #[test]
    fn ordinary_output_matches_nothing() {
        let table = RuleTable::builtin();
        for text in [
            "Compiling vigil-pilot v0.1.0",
            "test result: ok. 12 passed; 0 failed",
            "Reading src/main.rs",
            "",
        ] {
            assert!(table.iter().all(|r| r.find(text).is_none()), "{text:?} matched");
        }
    }

    #[test]
    fn question_accessors() {
        let table = RuleTable::builtin();
        let rule = &table.category(Category::Question)[0];
        assert_eq!(rule.rule_type(), "claude_cli_full_options");
        assert_eq!(rule.confidence(), Some(0.99));
        assert_eq!(rule.default_response(), Some("1"));
        assert_eq!(rule.priority(), None);
    }

    #[test]
    fn custom_rules_append_after_builtins() {
        let custom = vec![
            CustomRuleConfig {
                category: Category::Question,
                regex: r"(?i)overwrite\?".into(),
                rule_type: "overwrite".into(),
                response: Some("y".into()),
                confidence: Some(0.93),
                priority: None,
            },
            CustomRuleConfig {
                category: Category::Error,
                regex: "[broken".into(),
                rule_type: "broken".into(),
                response: None,
                confidence: None,
                priority: None,
            },
        ];
        let table = RuleTable::with_custom(&custom);
        assert_eq!(table.len(), builtin_specs().len() + 1);
        let last = table.category(Category::Question).last().unwrap();
        assert_eq!(last.rule_type(), "overwrite");
        assert!(table.iter().all(|r| r.rule_type() != "broken"));
    }

    #[test]
    fn custom_question_without_response_is_skipped() {
        let custom = vec![CustomRuleConfig {
            category: Category::Question,
            regex: "ok".into(),
            rule_type: "no_response".into(),
            response: None,
            confidence: Some(0.99),
            priority: None,
        }];
        let table = RuleTable::with_custom(&custom);
        assert_eq!(table.len(), builtin_specs().len());
    }
}
