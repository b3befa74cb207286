//! Terminal rendering for rule listings

use anyhow::Result;
use colored::*;
use sdx_rules::{LcRule, RuleDetails, RuleState, RuleSummary};

fn state_label(state: RuleState) -> ColoredString {
    match state {
        RuleState::Active => state.display_name().green(),
        RuleState::Inactive => state.display_name().yellow(),
        RuleState::Expired => state.display_name().dimmed(),
        RuleState::InsufficientPrivileges => state.display_name().red(),
    }
}

pub fn print_rules(rules: &[RuleSummary]) {
    if rules.is_empty() {
        println!("{}", "No rules".dimmed());
        return;
    }

    println!(
        "{:>6}  {:<14} {:<16} {:<24} {}",
        "HASH".bold(),
        "TYPE".bold(),
        "USER".bold(),
        "STATE".bold(),
        "RULE".bold()
    );
    for rule in rules {
        println!(
            "{:>6}  {:<14} {:<16} {:<24} {}",
            rule.hash,
            rule.rule_type,
            rule.user,
            state_label(rule.state),
            rule.json
        );
    }
    println!("{} rule(s)", rules.len());
}

pub fn print_details(details: &RuleDetails) -> Result<()> {
    println!("{} {}", "Rule".bold(), details.hash.to_string().cyan());
    println!("  type:  {}", details.rule_type);
    println!("  user:  {}", details.user);
    println!("  state: {}", state_label(details.state));
    println!("  rule:  {}", serde_json::to_string_pretty(&details.json)?);
    println!("  {}", "breakdown:".bold());
    for line in &details.breakdowns {
        println!("    {}", line);
    }
    Ok(())
}

pub fn print_lc_entries(lc: &str, entries: &[LcRule]) {
    if entries.is_empty() {
        println!("{}", format!("No entries for {}", lc).dimmed());
        return;
    }
    for entry in entries {
        println!("{}:{}", lc.cyan(), entry);
    }
}
