//! The per-document repair state machine.
//!
//! ```text
//! PreFlight → InitialReview → RunValidators → Decide
//!   Decide → Fix → RunValidators
//!   Decide → TryOscillationRescue → RunValidators | SummarizeFailures
//!   Decide → QaVerify → Decide
//!   Decide → SummarizeFailures → Done
//!   Decide → Done
//! ```
//!
//! [`runner::ReviewOrchestrator`] drives one document through these steps;
//! [`state`] holds the state it owns while doing so.

pub mod runner;
pub mod state;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::collaborators::builtin::DocumentRules;
use crate::collaborators::retry::RetryPolicy;
use crate::document::{ParsedDocument, normalize_section_name};
use crate::repair::gate::{FixValidationGate, suspicious_chars};
use crate::review::completion::{CompletionMode, SeverityThresholds, ThresholdOverrides};
use crate::review::issue::Issue;

pub use runner::{Collaborators, ReviewOrchestrator, ReviewOutcome};
pub use state::{FixAttempt, FixResult, HistoryEntry, ReviewState, Step};

/// Preset trade-offs between speed and thoroughness.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReviewProfile {
    /// No initial review, incremental validation.
    Fast,
    /// Initial review, incremental validation.
    #[default]
    Balanced,
    /// Initial review, full validation every pass, two bonus iterations.
    Thorough,
}

impl ReviewProfile {
    pub fn bonus_iterations(&self) -> u32 {
        match self {
            Self::Thorough => 2,
            Self::Fast | Self::Balanced => 0,
        }
    }

    pub fn runs_initial_review(&self) -> bool {
        !matches!(self, Self::Fast)
    }

    pub fn full_validation(&self) -> bool {
        matches!(self, Self::Thorough)
    }
}

impl fmt::Display for ReviewProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fast => write!(f, "fast"),
            Self::Balanced => write!(f, "balanced"),
            Self::Thorough => write!(f, "thorough"),
        }
    }
}

impl std::str::FromStr for ReviewProfile {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "fast" => Ok(Self::Fast),
            "balanced" => Ok(Self::Balanced),
            "thorough" => Ok(Self::Thorough),
            _ => anyhow::bail!(
                "Invalid profile '{}'. Valid values: fast, balanced, thorough",
                s
            ),
        }
    }
}

/// Everything that tunes one document's run.
#[derive(Debug, Clone)]
pub struct ReviewSettings {
    pub max_iterations: u32,
    pub profile: ReviewProfile,
    pub completion_mode: CompletionMode,
    pub threshold_overrides: ThresholdOverrides,
    /// Run the selected validators concurrently.
    pub parallel_validators: bool,
    pub timeout: Option<Duration>,
    pub rules: DocumentRules,
    pub gate: FixValidationGate,
    pub retry: RetryPolicy,
}

impl Default for ReviewSettings {
    fn default() -> Self {
        Self {
            max_iterations: 5,
            profile: ReviewProfile::default(),
            completion_mode: CompletionMode::default(),
            threshold_overrides: ThresholdOverrides::default(),
            parallel_validators: true,
            timeout: None,
            rules: DocumentRules::default(),
            gate: FixValidationGate::default(),
            retry: RetryPolicy::default(),
        }
    }
}

impl ReviewSettings {
    /// Base maximum plus the profile's bonus iterations.
    pub fn effective_max_iterations(&self) -> u32 {
        self.max_iterations + self.profile.bonus_iterations()
    }

    pub fn thresholds(&self) -> SeverityThresholds {
        self.completion_mode
            .thresholds()
            .with_overrides(&self.threshold_overrides)
    }

    /// The gate, with the document's required sections.
    pub fn effective_gate(&self) -> FixValidationGate {
        self.gate
            .clone()
            .with_required_sections(self.rules.required_sections.clone())
    }
}

/// Rejects documents the loop cannot work on at all.
#[derive(Debug, Clone)]
pub struct PreflightCheck {
    required_sections: Vec<String>,
    min_body_chars: usize,
}

impl PreflightCheck {
    pub fn new(rules: &DocumentRules) -> Self {
        Self {
            required_sections: rules.required_sections.clone(),
            min_body_chars: rules.min_body_chars,
        }
    }

    /// Problems that make the document unprocessable; empty when it may proceed.
    pub fn check(&self, text: &str) -> Vec<Issue> {
        let mut problems = Vec::new();
        if let Some(offset) = suspicious_chars(text).first() {
            problems.push(Issue::critical(format!(
                "Document contains invalid encoding or control characters at byte {offset}"
            )));
        }

        let doc = ParsedDocument::parse(text);
        for name in &self.required_sections {
            if !doc.has_section(name) {
                problems.push(Issue::error(format!(
                    "Missing required section '{}'",
                    normalize_section_name(name)
                )));
            }
        }

        let body_chars = doc.body().trim().chars().count();
        if body_chars < self.min_body_chars {
            problems.push(Issue::error(format!(
                "Document body is too short ({body_chars} < {} characters)",
                self.min_body_chars
            )));
        }
        problems
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_properties() {
        assert_eq!(ReviewProfile::Thorough.bonus_iterations(), 2);
        assert_eq!(ReviewProfile::Balanced.bonus_iterations(), 0);
        assert!(!ReviewProfile::Fast.runs_initial_review());
        assert!(ReviewProfile::Balanced.runs_initial_review());
        assert!(ReviewProfile::Thorough.full_validation());
    }

    #[test]
    fn test_profile_from_str() {
        assert_eq!("THOROUGH".parse::<ReviewProfile>().unwrap(), ReviewProfile::Thorough);
        let err = "slow".parse::<ReviewProfile>().unwrap_err();
        assert!(err.to_string().contains("Valid values: fast, balanced, thorough"));
    }

    #[test]
    fn test_effective_max_includes_bonus() {
        let settings = ReviewSettings {
            max_iterations: 3,
            profile: ReviewProfile::Thorough,
            ..ReviewSettings::default()
        };
        assert_eq!(settings.effective_max_iterations(), 5);
    }

    #[test]
    fn test_preflight_rejects_unreadable_input() {
        let rules = DocumentRules {
            required_sections: vec!["## Answer".into()],
            min_body_chars: 10,
            ..DocumentRules::default()
        };
        let check = PreflightCheck::new(&rules);
        assert!(check.check("## Answer\nA long enough answer.\n").is_empty());

        let problems = check.check("# Question\nshort\u{FFFD}\n");
        let messages: Vec<&str> = problems.iter().map(|i| i.message.as_str()).collect();
        assert_eq!(messages.len(), 2);
        assert!(messages[0].starts_with("Document contains invalid encoding"));
        assert_eq!(messages[1], "Missing required section 'Answer'");

        let problems = check.check("## Answer\n");
        assert_eq!(problems.len(), 1);
        assert_eq!(problems[0].message, "Document body is too short (9 < 10 characters)");
    }
}
