//! Verification of batches and of the live ruleset
//!
//! Two checks live here: parsing the diagnostics of an `iptables-restore
//! --test` run, and comparing what the kernel holds (as printed by
//! `iptables-save`) with what fwmgr would load. The second is the recovery
//! step after an apply timed out: the load is atomic, so the live state is
//! either the old or the new policy, and only a read tells which.

use crate::core::compiler::{Chain, DirectiveSet, Table};
use similar::{ChangeTag, TextDiff};
use std::fmt::Write;

/// Result of a batch verification (`iptables-restore --test`)
#[derive(Debug, Clone)]
pub struct VerifyResult {
    pub success: bool,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

impl VerifyResult {
    pub fn success() -> Self {
        Self {
            success: true,
            warnings: Vec::new(),
            errors: Vec::new(),
        }
    }

    pub fn failure(errors: Vec<String>) -> Self {
        Self {
            success: false,
            warnings: Vec::new(),
            errors,
        }
    }

    #[must_use]
    pub fn with_warnings(mut self, warnings: Vec<String>) -> Self {
        self.warnings = warnings;
        self
    }
}

/// Splits iptables-restore stderr into one message per line, without the
/// tool-name and `Error:` prefixes.
pub fn parse_restore_errors(stderr: &str) -> Vec<String> {
    stderr
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            line.trim_start_matches("iptables-restore: ")
                .trim_start_matches("Error: ")
                .to_string()
        })
        .collect()
}

/// Strips comments and zeroes packet/byte counters so two dumps of the same
/// ruleset compare equal.
pub fn normalize_save_output(output: &str) -> String {
    output
        .lines()
        .filter(|line| !line.trim_start().starts_with('#'))
        .map(normalize_counters)
        .collect::<Vec<_>>()
        .join("\n")
}

fn normalize_counters(line: &str) -> String {
    line.split_whitespace()
        .map(|token| if is_counter(token) { "[0:0]" } else { token })
        .collect::<Vec<_>>()
        .join(" ")
}

fn is_counter(token: &str) -> bool {
    token
        .strip_prefix('[')
        .and_then(|inner| inner.strip_suffix(']'))
        .and_then(|inner| inner.split_once(':'))
        .is_some_and(|(packets, bytes)| {
            !packets.is_empty()
                && !bytes.is_empty()
                && packets.chars().all(|c| c.is_ascii_digit())
                && bytes.chars().all(|c| c.is_ascii_digit())
        })
}

/// Rewrites one `-A` line into the form fwmgr renders.
///
/// iptables-save prints some matches differently from how they are loaded:
/// `/32` suffixes, implicit `-m tcp`/`-m udp`, `conntrack --ctstate` in place
/// of `state --state`, and states in its own order.
pub fn canonical_rule_line(line: &str) -> String {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let mut out: Vec<String> = Vec::with_capacity(tokens.len());
    let mut i = 0;

    while i < tokens.len() {
        let token = tokens[i];
        let next = tokens.get(i + 1).copied();
        match (token, next) {
            ("-m", Some("tcp" | "udp")) => i += 2,
            ("-m", Some("conntrack" | "state")) => {
                out.push("-m".to_string());
                out.push("state".to_string());
                i += 2;
            }
            ("--ctstate" | "--state", Some(states)) => {
                let mut list: Vec<&str> = states.split(',').collect();
                list.sort_unstable();
                out.push("--state".to_string());
                out.push(list.join(","));
                i += 2;
            }
            ("-s" | "-d", Some(addr)) => {
                out.push(token.to_string());
                out.push(addr.strip_suffix("/32").unwrap_or(addr).to_string());
                i += 2;
            }
            _ if is_counter(token) => i += 1,
            _ => {
                out.push(token.to_string());
                i += 1;
            }
        }
    }

    out.join(" ")
}

/// Extracts the canonical `-A` lines of the chains fwmgr owns from an
/// iptables-save dump, grouped as INPUT, FORWARD, POSTROUTING with each
/// chain in dump order.
pub fn owned_chain_lines(save_output: &str) -> Vec<String> {
    let mut table: Option<Table> = None;
    let mut input = Vec::new();
    let mut forward = Vec::new();
    let mut postrouting = Vec::new();

    for raw in normalize_save_output(save_output).lines() {
        let line = raw.trim();
        if let Some(name) = line.strip_prefix('*') {
            table = match name {
                "filter" => Some(Table::Filter),
                "nat" => Some(Table::Nat),
                _ => None,
            };
            continue;
        }
        if line == "COMMIT" {
            table = None;
            continue;
        }

        let canonical = canonical_rule_line(line);
        let Some(rest) = canonical.strip_prefix("-A ") else {
            continue;
        };
        let chain = rest.split_whitespace().next().unwrap_or_default();
        match (table, chain) {
            (Some(Table::Filter), "INPUT") => input.push(canonical),
            (Some(Table::Filter), "FORWARD") => forward.push(canonical),
            (Some(Table::Nat), "POSTROUTING") => postrouting.push(canonical),
            _ => {}
        }
    }

    input.into_iter().chain(forward).chain(postrouting).collect()
}

/// Canonical `-A` lines fwmgr would load for a compiled policy.
pub fn expected_chain_lines(set: &DirectiveSet) -> Vec<String> {
    [Chain::Input, Chain::Forward, Chain::Postrouting]
        .into_iter()
        .flat_map(|chain| {
            set.chain(chain)
                .into_iter()
                .map(move |spec| canonical_rule_line(&format!("-A {chain} {spec}")))
        })
        .collect()
}

/// Outcome of comparing the live ruleset with a compiled policy
#[derive(Debug, Clone)]
pub struct DriftReport {
    pub in_sync: bool,
    pub expected: usize,
    pub live: usize,
    /// `-` expected but missing, `+` present but not expected
    pub diff: String,
    /// Hostname destinations are resolved at load time and never match
    /// their live form textually
    pub hostname_rules: usize,
}

/// Compares the owned chains of an iptables-save dump with a compiled policy.
pub fn compare_live(set: &DirectiveSet, save_output: &str) -> DriftReport {
    let expected = expected_chain_lines(set);
    let live = owned_chain_lines(save_output);

    let hostname_rules = [Chain::Forward, Chain::Postrouting]
        .into_iter()
        .flat_map(|chain| set.chain(chain))
        .filter(|spec| {
            matches!(
                spec.destination,
                Some(crate::core::model::Destination::Host(_))
            )
        })
        .count();

    if expected == live {
        return DriftReport {
            in_sync: true,
            expected: expected.len(),
            live: live.len(),
            diff: String::new(),
            hostname_rules,
        };
    }

    let old_text = expected.join("\n") + "\n";
    let new_text = live.join("\n") + "\n";
    let diff = TextDiff::from_lines(&old_text, &new_text);
    let mut result = String::new();

    for change in diff.iter_all_changes() {
        let sign = match change.tag() {
            ChangeTag::Delete => "- ",
            ChangeTag::Insert => "+ ",
            ChangeTag::Equal => "  ",
        };
        let _ = write!(result, "{sign}{change}");
    }

    DriftReport {
        in_sync: false,
        expected: expected.len(),
        live: live.len(),
        diff: result,
        hostname_rules,
    }
}
