//! Memory of header fields already corrected, and regression detection.
//!
//! Once a fix lands, its field and value are remembered together with the
//! iteration that produced it. Any later snapshot in which a remembered
//! field has a different value is a regression: some fixer undid earlier
//! work. Regressions veto the fix attempt that introduced them.
//!
//! Field paths use dot notation (`"source.url"`) for nested header mappings.

use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::collections::BTreeMap;
use std::fmt;

use crate::document::{HeaderSnapshot, display_value};
use crate::errors::FixMemoryError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixMemoryEntry {
    pub field_path: String,
    pub value: Value,
    pub iteration: u32,
    pub description: String,
}

/// A remembered field whose current value differs from the fixed value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Regression {
    pub field_path: String,
    pub expected: Value,
    pub actual: Value,
    pub fixed_in: u32,
    pub detected_in: u32,
}

impl fmt::Display for Regression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Field '{}' was fixed to '{}' in iteration {}, but is now '{}' (regression detected in iteration {})",
            self.field_path,
            display_value(&self.expected),
            self.fixed_in,
            display_value(&self.actual),
            self.detected_in
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FixMemory {
    entries: BTreeMap<String, FixMemoryEntry>,
    by_iteration: BTreeMap<u32, Vec<String>>,
}

impl FixMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `field_path` was set to `value` in `iteration`.
    ///
    /// Re-recording the same value is a no-op. A different value is only
    /// accepted from a strictly later iteration than the one on record.
    pub fn mark_fixed(
        &mut self,
        field_path: &str,
        value: Value,
        iteration: u32,
        description: impl Into<String>,
    ) -> Result<(), FixMemoryError> {
        if let Some(existing) = self.entries.get(field_path) {
            if existing.value == value {
                return Ok(());
            }
            if iteration <= existing.iteration {
                return Err(FixMemoryError::StaleOverwrite {
                    field: field_path.to_string(),
                    recorded_iteration: existing.iteration,
                    attempted_iteration: iteration,
                });
            }
            let previous = existing.iteration;
            if let Some(fields) = self.by_iteration.get_mut(&previous) {
                fields.retain(|f| f != field_path);
                if fields.is_empty() {
                    self.by_iteration.remove(&previous);
                }
            }
            tracing::debug!(
                field = field_path,
                from_iteration = previous,
                iteration,
                "re-fixing remembered field"
            );
        }

        self.entries.insert(
            field_path.to_string(),
            FixMemoryEntry {
                field_path: field_path.to_string(),
                value,
                iteration,
                description: description.into(),
            },
        );
        self.by_iteration
            .entry(iteration)
            .or_default()
            .push(field_path.to_string());
        Ok(())
    }

    pub fn is_fixed(&self, field_path: &str) -> bool {
        self.entries.contains_key(field_path)
    }

    pub fn get(&self, field_path: &str) -> Option<&FixMemoryEntry> {
        self.entries.get(field_path)
    }

    pub fn entries(&self) -> impl Iterator<Item = &FixMemoryEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn fixes_for_iteration(&self, iteration: u32) -> Vec<&FixMemoryEntry> {
        self.by_iteration
            .get(&iteration)
            .map(|fields| fields.iter().filter_map(|f| self.entries.get(f)).collect())
            .unwrap_or_default()
    }

    /// Compare remembered values from iterations before `iteration` with `current`.
    pub fn detect_regressions(&self, current: &HeaderSnapshot, iteration: u32) -> Vec<Regression> {
        let regressions: Vec<Regression> = self
            .entries
            .values()
            .filter(|entry| entry.iteration < iteration)
            .filter_map(|entry| {
                let actual = lookup(current, &entry.field_path);
                (actual != entry.value).then(|| Regression {
                    field_path: entry.field_path.clone(),
                    expected: entry.value.clone(),
                    actual,
                    fixed_in: entry.iteration,
                    detected_in: iteration,
                })
            })
            .collect();

        if !regressions.is_empty() {
            tracing::warn!(
                count = regressions.len(),
                iteration,
                "fix memory detected regressions"
            );
        }
        regressions
    }

    /// Remembered `fields` whose value in `current` differs from memory,
    /// whatever iteration fixed them.
    pub fn detect_overwrites(
        &self,
        current: &HeaderSnapshot,
        fields: &[String],
        iteration: u32,
    ) -> Vec<Regression> {
        fields
            .iter()
            .filter_map(|field| self.entries.get(field))
            .filter_map(|entry| {
                let actual = lookup(current, &entry.field_path);
                (actual != entry.value).then(|| Regression {
                    field_path: entry.field_path.clone(),
                    expected: entry.value.clone(),
                    actual,
                    fixed_in: entry.iteration,
                    detected_in: iteration,
                })
            })
            .collect()
    }

    /// Mark every top-level field that differs between two snapshots.
    ///
    /// Descriptions are taken from the first entry of `fix_descriptions`
    /// mentioning the field. Returns the changed field names.
    pub fn extract_fixes(
        &mut self,
        before: &HeaderSnapshot,
        after: &HeaderSnapshot,
        iteration: u32,
        fix_descriptions: &[String],
    ) -> Vec<String> {
        let mut changed = Vec::new();
        let keys: std::collections::BTreeSet<&String> = before.keys().chain(after.keys()).collect();
        for key in keys {
            let old = before.get(key).cloned().unwrap_or(Value::Null);
            let new = after.get(key).cloned().unwrap_or(Value::Null);
            if old == new {
                continue;
            }
            let description = infer_description(key, fix_descriptions);
            match self.mark_fixed(key, new, iteration, description) {
                Ok(()) => changed.push(key.clone()),
                Err(e) => tracing::warn!(error = %e, "fix memory refused overwrite"),
            }
        }
        changed
    }

    /// Prompt block telling a fixer which fields must stay as they are.
    pub fn context_for_fixer(&self, current_iteration: u32) -> String {
        let earlier: Vec<(&u32, &Vec<String>)> = self
            .by_iteration
            .iter()
            .filter(|(iteration, _)| **iteration < current_iteration)
            .collect();
        if earlier.is_empty() {
            return "No fields have been fixed yet in this session.".to_string();
        }

        let mut lines = vec![
            "PREVIOUSLY FIXED FIELDS (DO NOT MODIFY THESE):".to_string(),
            String::new(),
            "The following fields were already corrected in previous iterations.".to_string(),
            "Changing them again undoes earlier work and will be rejected.".to_string(),
            String::new(),
        ];
        for (iteration, fields) in earlier {
            lines.push(format!("Iteration {}:", iteration));
            for field in fields {
                if let Some(entry) = self.entries.get(field) {
                    let mut line = format!("  - {} = {}", field, display_value(&entry.value));
                    if !entry.description.is_empty() {
                        line.push_str(&format!(" ({})", entry.description));
                    }
                    lines.push(line);
                }
            }
            lines.push(String::new());
        }
        lines.join("\n")
    }

    pub fn summary(&self) -> String {
        if self.entries.is_empty() {
            return "No fields fixed yet".to_string();
        }
        let fields: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        format!(
            "FixMemory: {} field(s) fixed across {} iteration(s). Fields: {}",
            self.entries.len(),
            self.by_iteration.len(),
            fields.join(", ")
        )
    }

    /// Re-base every entry to iteration 0 so a new run treats them all as
    /// earlier fixes.
    pub fn carry_over(&mut self) {
        for entry in self.entries.values_mut() {
            entry.iteration = 0;
        }
        self.by_iteration.clear();
        if !self.entries.is_empty() {
            self.by_iteration
                .insert(0, self.entries.keys().cloned().collect());
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.by_iteration.clear();
    }
}

fn infer_description(field: &str, fix_descriptions: &[String]) -> String {
    let needle = field.to_lowercase();
    fix_descriptions
        .iter()
        .find(|d| d.to_lowercase().contains(&needle))
        .cloned()
        .unwrap_or_else(|| format!("Modified {} field", field))
}

/// Resolve a dot-notation path; missing paths read as null.
fn lookup(snapshot: &HeaderSnapshot, path: &str) -> Value {
    let mut parts = path.split('.');
    let Some(first) = parts.next() else {
        return Value::Null;
    };
    let mut current = match snapshot.get(first) {
        Some(v) => v,
        None => return Value::Null,
    };
    for part in parts {
        match current.get(part) {
            Some(v) => current = v,
            None => return Value::Null,
        }
    }
    current.clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(pairs: &[(&str, &str)]) -> HeaderSnapshot {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), Value::String(v.to_string())))
            .collect()
    }

    fn s(v: &str) -> Value {
        Value::String(v.to_string())
    }

    // =========================================
    // mark_fixed tests
    // =========================================

    #[test]
    fn test_mark_and_query() {
        let mut memory = FixMemory::new();
        memory
            .mark_fixed("created", s("2024-01-01"), 1, "Added created")
            .unwrap();
        assert!(memory.is_fixed("created"));
        assert_eq!(memory.get("created").unwrap().iteration, 1);
        assert_eq!(memory.fixes_for_iteration(1).len(), 1);
        assert!(memory.fixes_for_iteration(2).is_empty());
    }

    #[test]
    fn test_overwrite_requires_later_iteration() {
        let mut memory = FixMemory::new();
        memory.mark_fixed("updated", s("2024-01-01"), 2, "").unwrap();

        let same = memory.mark_fixed("updated", s("2024-05-05"), 2, "");
        assert!(matches!(
            same,
            Err(FixMemoryError::StaleOverwrite {
                recorded_iteration: 2,
                attempted_iteration: 2,
                ..
            })
        ));
        assert!(memory.mark_fixed("updated", s("2024-05-05"), 1, "").is_err());
        assert_eq!(memory.get("updated").unwrap().value, s("2024-01-01"));

        memory.mark_fixed("updated", s("2024-05-05"), 3, "").unwrap();
        assert_eq!(memory.get("updated").unwrap().iteration, 3);
        assert!(memory.fixes_for_iteration(2).is_empty());
        assert_eq!(memory.fixes_for_iteration(3).len(), 1);
    }

    #[test]
    fn test_same_value_is_idempotent() {
        let mut memory = FixMemory::new();
        memory.mark_fixed("title", s("Heaps"), 1, "").unwrap();
        assert!(memory.mark_fixed("title", s("Heaps"), 1, "").is_ok());
        assert_eq!(memory.get("title").unwrap().iteration, 1);
    }

    // =========================================
    // detect_regressions tests
    // =========================================

    #[test]
    fn test_regression_detected_only_for_earlier_iterations() {
        let mut memory = FixMemory::new();
        memory.mark_fixed("created", s("2024-01-01"), 1, "").unwrap();
        memory.mark_fixed("title", s("Heaps"), 2, "").unwrap();

        let current = snapshot(&[("created", "2023-12-31"), ("title", "Stacks")]);
        let regressions = memory.detect_regressions(&current, 2);
        assert_eq!(regressions.len(), 1);
        assert_eq!(regressions[0].field_path, "created");
        assert_eq!(
            regressions[0].to_string(),
            "Field 'created' was fixed to '2024-01-01' in iteration 1, but is now '2023-12-31' (regression detected in iteration 2)"
        );

        assert_eq!(memory.detect_regressions(&current, 3).len(), 2);
        assert!(memory.detect_regressions(&current, 1).is_empty());
    }

    #[test]
    fn test_unchanged_values_are_not_regressions() {
        let mut memory = FixMemory::new();
        memory.mark_fixed("created", s("2024-01-01"), 1, "").unwrap();
        let current = snapshot(&[("created", "2024-01-01")]);
        assert!(memory.detect_regressions(&current, 5).is_empty());
    }

    #[test]
    fn test_overwrite_of_same_iteration_fix_is_detected() {
        let mut memory = FixMemory::new();
        memory.mark_fixed("updated", s("2025-06-01"), 2, "").unwrap();
        memory.mark_fixed("title", s("Heaps"), 2, "").unwrap();

        let current = snapshot(&[("updated", "2001-01-01"), ("title", "Stacks")]);
        assert!(memory.detect_regressions(&current, 2).is_empty());

        let overwrites = memory.detect_overwrites(&current, &["updated".to_string()], 2);
        assert_eq!(overwrites.len(), 1);
        assert_eq!(overwrites[0].field_path, "updated");
        assert_eq!(overwrites[0].expected, s("2025-06-01"));
        assert_eq!(overwrites[0].fixed_in, 2);
        assert!(memory.detect_overwrites(&current, &["missing".to_string()], 2).is_empty());
    }

    #[test]
    fn test_removed_field_is_regression() {
        let mut memory = FixMemory::new();
        memory.mark_fixed("updated", s("2024-01-01"), 1, "").unwrap();
        let regressions = memory.detect_regressions(&HeaderSnapshot::new(), 2);
        assert_eq!(regressions[0].actual, Value::Null);
    }

    #[test]
    fn test_nested_paths() {
        let mut memory = FixMemory::new();
        memory
            .mark_fixed("source.url", s("https://example.org"), 1, "")
            .unwrap();
        let doc = crate::document::ParsedDocument::parse(
            "---\nsource:\n  url: https://example.com\n---\nbody\n",
        );
        let regressions = memory.detect_regressions(&doc.snapshot(), 2);
        assert_eq!(regressions.len(), 1);
        assert_eq!(regressions[0].actual, s("https://example.com"));
    }

    // =========================================
    // extract / context / summary tests
    // =========================================

    #[test]
    fn test_extract_fixes_marks_changed_fields() {
        let mut memory = FixMemory::new();
        let before = snapshot(&[("title", "x"), ("created", "2099-01-01")]);
        let after = snapshot(&[("title", "x"), ("created", "2024-01-01"), ("updated", "2024-01-02")]);
        let changed = memory.extract_fixes(
            &before,
            &after,
            1,
            &["Clamped created date to today".to_string()],
        );
        assert_eq!(changed, vec!["created".to_string(), "updated".to_string()]);
        assert_eq!(
            memory.get("created").unwrap().description,
            "Clamped created date to today"
        );
        assert_eq!(memory.get("updated").unwrap().description, "Modified updated field");
    }

    #[test]
    fn test_context_for_fixer_lists_earlier_iterations_only() {
        let mut memory = FixMemory::new();
        assert_eq!(
            memory.context_for_fixer(1),
            "No fields have been fixed yet in this session."
        );
        memory.mark_fixed("created", s("2024-01-01"), 1, "Added date").unwrap();
        memory.mark_fixed("title", s("Heaps"), 2, "").unwrap();

        let context = memory.context_for_fixer(2);
        assert!(context.starts_with("PREVIOUSLY FIXED FIELDS (DO NOT MODIFY THESE):"));
        assert!(context.contains("Iteration 1:"));
        assert!(context.contains("  - created = 2024-01-01 (Added date)"));
        assert!(!context.contains("title"));
    }

    #[test]
    fn test_summary() {
        let mut memory = FixMemory::new();
        assert_eq!(memory.summary(), "No fields fixed yet");
        memory.mark_fixed("updated", s("a"), 1, "").unwrap();
        memory.mark_fixed("created", s("b"), 2, "").unwrap();
        assert_eq!(
            memory.summary(),
            "FixMemory: 2 field(s) fixed across 2 iteration(s). Fields: created, updated"
        );
    }

    #[test]
    fn test_carry_over_rebases_entries() {
        let mut memory = FixMemory::new();
        memory.mark_fixed("created", s("2024-01-01"), 4, "").unwrap();
        memory.carry_over();
        assert_eq!(memory.get("created").unwrap().iteration, 0);
        assert_eq!(memory.fixes_for_iteration(0).len(), 1);
        let current = snapshot(&[("created", "2020-01-01")]);
        assert_eq!(memory.detect_regressions(&current, 1).len(), 1);
        memory.mark_fixed("created", s("2020-01-01"), 1, "").unwrap();
    }
}
