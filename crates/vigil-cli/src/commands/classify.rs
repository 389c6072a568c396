//! `vigil classify TEXT`: dry-run the classifier on one chunk.

use std::path::Path;

use anyhow::Result;
use tokio::time::Instant;

use vigil_pilot::ansi::strip_ansi;
use vigil_pilot::{classify, Classification, LoopGuard, RuleTable};

use crate::commands::load_config;

pub fn run(config: Option<&Path>, text: &str) -> Result<()> {
    let config = load_config(config)?;
    let rules = RuleTable::with_custom(&config.rules);
    let guard = LoopGuard::new(&config.guard);
    println!("{}", report(&unescape(text), &rules, &guard));
    Ok(())
}

/// Expand the escapes a shell argument cannot easily carry.
fn unescape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('t') => out.push('\t'),
            Some('e') => out.push('\x1b'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

fn report(raw: &str, rules: &RuleTable, guard: &LoopGuard) -> String {
    let text = strip_ansi(raw.as_bytes());
    match classify(&text, rules, guard, Instant::now()) {
        Classification::None => "no detection".to_string(),
        Classification::Vetoed(veto) => format!("vetoed: {veto:?}"),
        Classification::Detected(detection) => {
            let mut out = format!(
                "category:  {}\nrule:      {}\nmatched:   {:?}",
                detection.category,
                detection.rule_type(),
                detection.matched_text
            );
            if let Some(response) = detection.rule.default_response() {
                out.push_str(&format!("\nresponse:  {response:?}"));
            }
            if let Some(confidence) = detection.confidence {
                out.push_str(&format!("\nconfidence: {confidence:.2}"));
            }
            if let Some(priority) = detection.priority() {
                out.push_str(&format!("\npriority:  {priority}"));
            }
            out
        }
    }
}
