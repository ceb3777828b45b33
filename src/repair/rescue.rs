//! Last-resort fixes applied once oscillation has been detected.
//!
//! Two oscillation sources are handled mechanically:
//!
//! - header fields flipping between values: every remembered field is pinned
//!   back to the value recorded in [`FixMemory`]
//! - sections moved back and forth: known sections are put into their
//!   canonical order
//!
//! The rescue runs at most once per document.

use regex::Regex;
use serde_yaml::Value;
use std::sync::LazyLock;

use crate::document::{ParsedDocument, Section, set_header_field};
use crate::repair::fix_memory::FixMemory;
use crate::repair::oscillation::OscillationReport;
use crate::review::issue::Issue;

static ORDER_ISSUE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)out of (expected )?order").expect("static regex is valid"));
static PLAIN_SCALAR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9 _./:-]*$").expect("static regex is valid")
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RescueOutcome {
    pub text: String,
    pub changed: bool,
    pub actions: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct OscillationRescue {
    section_order: Vec<String>,
}

impl OscillationRescue {
    pub fn new(section_order: Vec<String>) -> Self {
        Self { section_order }
    }

    pub fn apply(
        &self,
        text: &str,
        report: &OscillationReport,
        issues: &[Issue],
        memory: &FixMemory,
    ) -> RescueOutcome {
        let mut current = text.to_string();
        let mut actions = Vec::new();

        let doc = ParsedDocument::parse(&current);
        if !doc.header().is_invalid() {
            let snapshot = doc.snapshot();
            let mut pinned = Vec::new();
            for entry in memory.entries() {
                if entry.field_path.contains('.') {
                    continue;
                }
                let actual = snapshot.get(&entry.field_path).cloned().unwrap_or(Value::Null);
                if actual != entry.value && !entry.value.is_null() {
                    current = set_header_field(&current, &entry.field_path, &yaml_inline(&entry.value));
                    pinned.push(entry.field_path.clone());
                }
            }
            if !pinned.is_empty() {
                actions.push(format!("Pinned remembered header fields: {}", pinned.join(", ")));
            }
        }

        let order_problem = report.signatures.iter().any(|s| ORDER_ISSUE.is_match(s))
            || issues.iter().any(|i| ORDER_ISSUE.is_match(&i.message));
        if order_problem && !self.section_order.is_empty() {
            let reordered = reorder_sections(&current, &self.section_order);
            if reordered != current {
                current = reordered;
                actions.push(format!(
                    "Reordered sections to {}",
                    self.section_order.join(" → ")
                ));
            }
        }

        RescueOutcome {
            changed: current != text,
            text: current,
            actions,
        }
    }
}

/// Render a YAML value on one line, quoting strings that would otherwise
/// change type or break the header.
pub fn yaml_inline(value: &Value) -> String {
    if let Value::String(s) = value {
        let reparses_as_same = serde_yaml::from_str::<Value>(s)
            .map(|v| v == *value)
            .unwrap_or(false);
        if PLAIN_SCALAR.is_match(s) && reparses_as_same {
            return s.clone();
        }
    }
    serde_json::to_string(value).unwrap_or_else(|_| "null".to_string())
}

/// Put sections named in `order` into that order, keeping every other byte
/// in place.
pub fn reorder_sections(text: &str, order: &[String]) -> String {
    let doc = ParsedDocument::parse(text);
    let mut matched: Vec<(usize, &Section)> = Vec::new();
    for (rank, name) in order.iter().enumerate() {
        if let Some(section) = doc.find_section(name) {
            matched.push((rank, section));
        }
    }
    // A listed section that contains another listed section stays in place.
    let mut slots: Vec<(usize, &Section)> = matched
        .iter()
        .filter(|(_, outer)| {
            !matched.iter().any(|(_, inner)| {
                inner.start != outer.start && outer.start <= inner.start && inner.end <= outer.end
            })
        })
        .copied()
        .collect();
    slots.sort_by_key(|(_, s)| s.start);
    if slots.len() < 2 {
        return text.to_string();
    }

    let mut by_rank = slots.clone();
    by_rank.sort_by_key(|(rank, _)| *rank);

    let mut out = String::with_capacity(text.len() + slots.len());
    let mut cursor = 0;
    for ((_, slot), (_, replacement)) in slots.iter().zip(by_rank.iter()) {
        out.push_str(&text[cursor..slot.start]);
        let block = doc.section_text(replacement);
        out.push_str(block);
        if !block.ends_with('\n') {
            out.push('\n');
        }
        cursor = slot.end;
    }
    out.push_str(&text[cursor..]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn report(sigs: &[&str]) -> OscillationReport {
        OscillationReport {
            signatures: sigs.iter().map(|s| s.to_string()).collect::<BTreeSet<_>>(),
            windows: Vec::new(),
            explanation: String::new(),
        }
    }

    #[test]
    fn test_pins_remembered_fields() {
        let mut memory = FixMemory::new();
        memory
            .mark_fixed("updated", Value::String("2024-01-02".into()), 1, "")
            .unwrap();
        let text = "---\ncreated: 2024-01-01\nupdated: 2023-01-01\n---\nbody\n";
        let outcome = OscillationRescue::default().apply(
            text,
            &report(&["ERROR:'created' is after 'updated'"]),
            &[],
            &memory,
        );
        assert!(outcome.changed);
        assert_eq!(
            ParsedDocument::parse(&outcome.text).header_str("updated").as_deref(),
            Some("2024-01-02")
        );
        assert_eq!(outcome.actions, vec!["Pinned remembered header fields: updated".to_string()]);
    }

    #[test]
    fn test_reorders_sections_on_order_issue() {
        let text = "# Question\nQ\n## References\nR\n## Answer\nA\n";
        let rescue = OscillationRescue::new(vec![
            "Question".into(),
            "Answer".into(),
            "References".into(),
        ]);
        let outcome = rescue.apply(
            text,
            &report(&["WARNING:Headings appear out of expected order"]),
            &[],
            &FixMemory::new(),
        );
        assert_eq!(outcome.text, "# Question\nQ\n## Answer\nA\n## References\nR\n");
    }

    #[test]
    fn test_no_applicable_rescue_changes_nothing() {
        let text = "# Question\nQ\n";
        let outcome = OscillationRescue::new(vec!["Question".into()]).apply(
            text,
            &report(&["ERROR:Missing required section 'Answer'"]),
            &[],
            &FixMemory::new(),
        );
        assert!(!outcome.changed);
        assert!(outcome.actions.is_empty());
    }

    #[test]
    fn test_reorder_keeps_unlisted_text_in_place() {
        let text = "intro\n## B\nb\n## Other\no\n## A\na";
        let reordered = reorder_sections(text, &["A".into(), "B".into()]);
        assert_eq!(reordered, "intro\n## A\na\n## Other\no\n## B\nb\n");
    }

    #[test]
    fn test_yaml_inline_quotes_when_needed() {
        assert_eq!(yaml_inline(&Value::String("2024-01-01".into())), "2024-01-01");
        assert_eq!(yaml_inline(&Value::String("true".into())), "\"true\"");
        assert_eq!(yaml_inline(&Value::String("a: b".into())), "\"a: b\"");
        let seq = Value::Sequence(vec![Value::String("x".into()), Value::String("y".into())]);
        assert_eq!(yaml_inline(&seq), r#"["x","y"]"#);
    }
}
