//! `vigil rules`: print the effective rule table in scan order.

use std::path::Path;

use anyhow::Result;

use vigil_pilot::{Rule, RuleKind, RuleTable};

use crate::commands::load_config;

pub fn run(config: Option<&Path>) -> Result<()> {
    let config = load_config(config)?;
    let table = RuleTable::with_custom(&config.rules);
    print!("{}", render(&table));
    Ok(())
}

fn describe(rule: &Rule) -> String {
    match rule.kind() {
        RuleKind::Question {
            default_response,
            confidence,
        } => format!("{:?} @ {confidence:.2}", default_response),
        RuleKind::Confusion { priority } | RuleKind::Error { priority } => priority.to_string(),
    }
}

fn render(table: &RuleTable) -> String {
    let width = table
        .iter()
        .map(|rule| rule.rule_type().len())
        .max()
        .unwrap_or(0);
    let mut out = String::new();
    for rule in table.iter() {
        out.push_str(&format!(
            "{:<9} {:<width$}  {:<12}  {}\n",
            rule.category().to_string(),
            rule.rule_type(),
            describe(rule),
            rule.pattern(),
        ));
    }
    out.push_str(&format!("{} rules\n", table.len()));
    out
}
