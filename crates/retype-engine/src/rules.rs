//! Attribute rename rule parsing.
//!
//! Rules are free text, one per line, `from => to`, `from: to` or `from = to`.
//! Parsing never fails: lines that do not yield a usable pair are skipped.

use tracing::debug;

use crate::AttributeRename;

/// Accepted separators. `=>` is listed first so it wins over `=` when both
/// start at the same position.
const SEPARATORS: [&str; 3] = ["=>", ":", "="];

/// Normalize a key the way the record store does: lowercase ASCII, keeping
/// only letters, digits, `_` and `-`.
pub fn normalize_key(raw: &str) -> String {
    raw.trim()
        .chars()
        .map(|c| c.to_ascii_lowercase())
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '_' || *c == '-')
        .collect()
}

/// Split a line at the earliest separator.
fn split_rule(line: &str) -> Option<(&str, &str)> {
    SEPARATORS
        .iter()
        .filter_map(|sep| line.find(sep).map(|pos| (pos, *sep)))
        // min_by_key keeps the first of equal positions, i.e. `=>` over `=`
        .min_by_key(|(pos, _)| *pos)
        .map(|(pos, sep)| (&line[..pos], &line[pos + sep.len()..]))
}

/// Parse rename rules from multi-line text.
///
/// A source key that appears on several lines keeps its first position and
/// takes the destination from the last line that names it.
pub fn parse_rename_rules(text: &str) -> Vec<AttributeRename> {
    let mut rules: Vec<AttributeRename> = Vec::new();

    for (line_no, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let Some((from, to)) = split_rule(line) else {
            debug!(line = line_no + 1, "skipping rule without separator");
            continue;
        };

        let from = normalize_key(from);
        let to = normalize_key(to);
        if from.is_empty() || to.is_empty() || from == to {
            debug!(line = line_no + 1, %from, %to, "skipping unusable rule");
            continue;
        }

        match rules.iter_mut().find(|rule| rule.from == from) {
            Some(existing) => existing.to = to,
            None => rules.push(AttributeRename { from, to }),
        }
    }

    rules
}
