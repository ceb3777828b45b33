//! Choose which validators need to run for the next pass.
//!
//! The selector compares the text validated last time with the current text
//! and re-runs only the validators whose inputs changed. Results of
//! validators that are not re-run are carried over by the caller, so the
//! merged issue set matches what a full run would report.

use serde::Serialize;
use std::collections::BTreeSet;

use crate::collaborators::ValidatorKind;
use crate::document::ParsedDocument;

/// Which logical parts of a document changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ContentDiff {
    pub header_changed: bool,
    pub body_changed: bool,
    pub structure_changed: bool,
}

impl ContentDiff {
    pub fn between(previous: &str, current: &str) -> Self {
        if previous == current {
            return Self::default();
        }
        let before = ParsedDocument::parse(previous);
        let after = ParsedDocument::parse(current);
        Self {
            header_changed: before.header_raw() != after.header_raw()
                || before.header() != after.header(),
            body_changed: before.body() != after.body(),
            structure_changed: before.outline() != after.outline(),
        }
    }

    pub fn any(&self) -> bool {
        self.header_changed || self.body_changed || self.structure_changed
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Selection {
    pub kinds: BTreeSet<ValidatorKind>,
    pub reason: String,
}

impl Selection {
    pub fn is_full(&self) -> bool {
        ValidatorKind::ALL.iter().all(|k| self.kinds.contains(k))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ValidatorSelector {
    thorough: bool,
}

impl ValidatorSelector {
    pub fn new(thorough: bool) -> Self {
        Self { thorough }
    }

    /// `previous` is the text of the last validated snapshot, `None` before
    /// the first pass.
    pub fn select(&self, previous: Option<&str>, current: &str) -> Selection {
        let Some(previous) = previous else {
            return Selection {
                kinds: ValidatorKind::ALL.into_iter().collect(),
                reason: "first validation pass - running all validators".to_string(),
            };
        };
        if self.thorough {
            return Selection {
                kinds: ValidatorKind::ALL.into_iter().collect(),
                reason: "thorough profile - running all validators".to_string(),
            };
        }

        let diff = ContentDiff::between(previous, current);
        let mut kinds = BTreeSet::from([ValidatorKind::Sanity]);
        let mut changed = Vec::new();
        if diff.header_changed {
            kinds.insert(ValidatorKind::HeaderSchema);
            kinds.insert(ValidatorKind::Consistency);
            changed.push("header");
        }
        if diff.body_changed || diff.structure_changed {
            kinds.insert(ValidatorKind::Structural);
            kinds.insert(ValidatorKind::Consistency);
            changed.push(if diff.structure_changed {
                "structure"
            } else {
                "body"
            });
        }

        let reason = if changed.is_empty() {
            "no changes detected - running sanity check only".to_string()
        } else {
            format!("{} changed", changed.join(" and "))
        };
        Selection { kinds, reason }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = "---\ntitle: T\n---\n# Question\nWhat?\n## Answer\nThis.\n";

    fn kinds(list: &[ValidatorKind]) -> BTreeSet<ValidatorKind> {
        list.iter().copied().collect()
    }

    #[test]
    fn test_diff_detects_each_part() {
        let header = BASE.replace("title: T", "title: U");
        let d = ContentDiff::between(BASE, &header);
        assert!(d.header_changed && !d.body_changed && !d.structure_changed);

        let body = BASE.replace("This.", "That.");
        let d = ContentDiff::between(BASE, &body);
        assert!(!d.header_changed && d.body_changed && !d.structure_changed);

        let structure = BASE.replace("## Answer", "## Reply");
        let d = ContentDiff::between(BASE, &structure);
        assert!(d.body_changed && d.structure_changed);

        assert!(!ContentDiff::between(BASE, BASE).any());
    }

    #[test]
    fn test_first_pass_runs_everything() {
        let selection = ValidatorSelector::new(false).select(None, BASE);
        assert!(selection.is_full());
    }

    #[test]
    fn test_thorough_always_runs_everything() {
        let selection = ValidatorSelector::new(true).select(Some(BASE), BASE);
        assert!(selection.is_full());
        assert!(selection.reason.contains("thorough"));
    }

    #[test]
    fn test_no_change_runs_sanity_only() {
        let selection = ValidatorSelector::new(false).select(Some(BASE), BASE);
        assert_eq!(selection.kinds, kinds(&[ValidatorKind::Sanity]));
    }

    #[test]
    fn test_header_change_selects_header_validators() {
        let header = BASE.replace("title: T", "title: U");
        let selection = ValidatorSelector::new(false).select(Some(BASE), &header);
        assert_eq!(
            selection.kinds,
            kinds(&[
                ValidatorKind::HeaderSchema,
                ValidatorKind::Consistency,
                ValidatorKind::Sanity
            ])
        );
        assert_eq!(selection.reason, "header changed");
    }

    #[test]
    fn test_body_change_selects_structural_validators() {
        let body = BASE.replace("This.", "That.");
        let selection = ValidatorSelector::new(false).select(Some(BASE), &body);
        assert_eq!(
            selection.kinds,
            kinds(&[
                ValidatorKind::Structural,
                ValidatorKind::Consistency,
                ValidatorKind::Sanity
            ])
        );
        assert!(!selection.kinds.contains(&ValidatorKind::HeaderSchema));
    }
}
