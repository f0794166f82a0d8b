//! iptables-restore batch rendering
//!
//! The batch is the single input of one atomic load: each table opens with
//! `*<table>`, lists its directives (flushes first, so reloading never
//! accumulates duplicates) and closes with `COMMIT`.

use crate::core::compiler::{DirectiveSet, Table};
use std::fmt::Write;

/// Renders a compiled policy as iptables-restore input.
///
/// The output is newline-terminated and byte-identical for identical input.
pub fn render_batch(set: &DirectiveSet) -> String {
    let mut out = String::with_capacity(64 * (set.len() + 4));

    for table in [Table::Filter, Table::Nat] {
        let _ = writeln!(out, "*{table}");
        for directive in set.table(table) {
            let _ = writeln!(out, "{directive}");
        }
        out.push_str("COMMIT\n");
    }

    out
}

/// SHA-256 of the rendered batch, hex encoded.
///
/// Recorded in the audit log and printed by dry runs so an operator can tell
/// whether two compilations would load the same ruleset.
pub fn batch_checksum(batch: &str) -> String {
    crate::utils::compute_checksum(batch)
}
