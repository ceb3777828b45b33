//! The fix-validation gate.
//!
//! Every candidate edit, whether from the deterministic fixer or an external
//! collaborator, passes through [`FixValidationGate::check`] before it can
//! replace the current text. The gate refuses edits that:
//!
//! 1. break or remove a header that parsed before
//! 2. shrink the document by more than `max_shrink_ratio`
//! 3. drop required sections that were present (a few missing sections are
//!    spliced back from the prior text instead)
//! 4. introduce U+FFFD or control characters
//!
//! An unchanged candidate is always accepted.

use serde::{Deserialize, Serialize};

use crate::document::{Header, ParsedDocument, normalize_section_name};
use crate::errors::GateRejection;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateVerdict {
    Accepted { text: String, spliced: Vec<String> },
    Rejected(GateRejection),
}

impl GateVerdict {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixValidationGate {
    pub max_shrink_ratio: f64,
    pub required_sections: Vec<String>,
    pub max_splice_sections: usize,
}

impl Default for FixValidationGate {
    fn default() -> Self {
        Self {
            max_shrink_ratio: 0.30,
            required_sections: Vec::new(),
            max_splice_sections: 2,
        }
    }
}

impl FixValidationGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_required_sections(mut self, sections: Vec<String>) -> Self {
        self.required_sections = sections;
        self
    }

    pub fn with_max_shrink_ratio(mut self, ratio: f64) -> Self {
        self.max_shrink_ratio = ratio;
        self
    }

    pub fn with_max_splice_sections(mut self, max: usize) -> Self {
        self.max_splice_sections = max;
        self
    }

    pub fn check(&self, prior: &str, candidate: &str) -> GateVerdict {
        if prior == candidate {
            return GateVerdict::Accepted {
                text: candidate.to_string(),
                spliced: Vec::new(),
            };
        }

        let before = ParsedDocument::parse(prior);
        let after = ParsedDocument::parse(candidate);

        match (before.header(), after.header()) {
            (Header::Invalid(_), _) | (_, Header::Parsed(_)) | (Header::Absent, Header::Absent) => {}
            (_, Header::Invalid(reason)) => {
                return GateVerdict::Rejected(GateRejection::HeaderUnparseable(reason.clone()));
            }
            (Header::Parsed(_), Header::Absent) => {
                return GateVerdict::Rejected(GateRejection::HeaderUnparseable(
                    "header was removed".to_string(),
                ));
            }
        }

        let min_len = prior.len() as f64 * (1.0 - self.max_shrink_ratio);
        if !prior.is_empty() && (candidate.len() as f64) < min_len {
            return GateVerdict::Rejected(GateRejection::ExcessiveShrink {
                before: prior.len(),
                after: candidate.len(),
            });
        }

        let (text, spliced) = match self.restore_sections(&before, candidate) {
            Ok(result) => result,
            Err(rejection) => return GateVerdict::Rejected(rejection),
        };

        let introduced = suspicious_chars(&text);
        if introduced.len() > suspicious_chars(prior).len() {
            let offset = introduced.first().copied().unwrap_or(0);
            return GateVerdict::Rejected(GateRejection::InvalidEncoding { offset });
        }

        GateVerdict::Accepted { text, spliced }
    }

    /// Required sections present in `before` but missing from `candidate`,
    /// in `before`'s order.
    fn missing_sections(&self, before: &ParsedDocument<'_>, candidate: &str) -> Vec<String> {
        let after = ParsedDocument::parse(candidate);
        let mut missing: Vec<(usize, String)> = self
            .required_sections
            .iter()
            .filter_map(|name| before.find_section(name).map(|s| (s.start, name)))
            .filter(|(_, name)| !after.has_section(name))
            .map(|(pos, name)| (pos, normalize_section_name(name).to_string()))
            .collect();
        missing.sort();
        missing.into_iter().map(|(_, name)| name).collect()
    }

    fn restore_sections(
        &self,
        before: &ParsedDocument<'_>,
        candidate: &str,
    ) -> Result<(String, Vec<String>), GateRejection> {
        let missing = self.missing_sections(before, candidate);
        if missing.is_empty() {
            return Ok((candidate.to_string(), Vec::new()));
        }
        if missing.len() > self.max_splice_sections {
            return Err(GateRejection::MissingSections(missing));
        }

        let mut text = candidate.to_string();
        for name in &missing {
            text = splice_section(before, &text, name);
        }

        let still_missing = self.missing_sections(before, &text);
        if !still_missing.is_empty() {
            return Err(GateRejection::MissingSections(still_missing));
        }
        tracing::info!(sections = ?missing, "spliced missing sections back into candidate");
        Ok((text, missing))
    }
}

/// Reinsert section `name` from `before` into `text`, right after the own
/// content of the nearest preceding section that survived. Without one the
/// block goes before the first heading, or at the end.
fn splice_section(before: &ParsedDocument<'_>, text: &str, name: &str) -> String {
    let Some(section) = before.find_section(name) else {
        return text.to_string();
    };
    let current = ParsedDocument::parse(text);
    if current.find_section(name).is_some() {
        return text.to_string();
    }

    // Own content plus the subsections the candidate also lost.
    let source = before.text();
    let all = before.sections();
    let mut block = String::new();
    for (idx, s) in all.iter().enumerate() {
        let nested = s.start > section.start && s.start < section.end;
        if s.start != section.start && !(nested && current.find_section(&s.title).is_none()) {
            continue;
        }
        let own_end = all.get(idx + 1).map_or(section.end, |next| next.start.min(section.end));
        block.push_str(&source[s.start..own_end]);
    }
    if !block.ends_with('\n') {
        block.push('\n');
    }

    let survivors = current.sections();
    let preceding = before
        .sections()
        .iter()
        .filter(|s| s.start < section.start)
        .rev()
        .find_map(|s| survivors.iter().position(|c| c.title == s.title));
    let pos = match preceding {
        Some(idx) => survivors.get(idx + 1).map_or(text.len(), |next| next.start),
        None => survivors.first().map_or(text.len(), |first| first.start),
    };

    let mut out = String::with_capacity(text.len() + block.len() + 1);
    out.push_str(&text[..pos]);
    if !out.is_empty() && !out.ends_with('\n') {
        out.push('\n');
    }
    out.push_str(&block);
    out.push_str(&text[pos..]);
    out
}

/// Byte offsets of replacement characters and control characters other
/// than tab, CR and LF.
pub fn suspicious_chars(text: &str) -> Vec<usize> {
    text.char_indices()
        .filter(|(_, c)| *c == '\u{FFFD}' || (c.is_control() && !matches!(c, '\n' | '\r' | '\t')))
        .map(|(i, _)| i)
        .collect()
}
