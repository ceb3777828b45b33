//! Review state owned by the orchestrator for one document.
//!
//! Transition functions never mutate [`ReviewState`] directly. Each returns a
//! [`StateUpdate`] that [`ReviewState::apply`] merges, which is where the
//! invariants live:
//!
//! - `iteration` only grows, never past `max_iterations`
//! - `issue_history.len() == iteration`
//! - once `completed` or `error` is set, nothing changes anymore
//! - every applied update appends exactly one history entry

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use crate::collaborators::FailureReport;
use crate::errors::StateError;
use crate::repair::convergence::ConvergenceTracker;
use crate::review::decision::Decision;
use crate::review::issue::{Issue, IssueCounts};

/// State machine nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    PreFlight,
    InitialReview,
    RunValidators,
    Decide,
    Fix,
    TryOscillationRescue,
    QaVerify,
    SummarizeFailures,
    Done,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::PreFlight => "pre_flight",
            Self::InitialReview => "initial_review",
            Self::RunValidators => "run_validators",
            Self::Decide => "decide",
            Self::Fix => "fix",
            Self::TryOscillationRescue => "try_oscillation_rescue",
            Self::QaVerify => "qa_verify",
            Self::SummarizeFailures => "summarize_failures",
            Self::Done => "done",
        };
        write!(f, "{name}")
    }
}

/// One line of the run's audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub iteration: u32,
    pub node: Step,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<Decision>,
    /// Issue tally after this step, when the step changed the issue set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issues_after: Option<IssueCounts>,
}

impl HistoryEntry {
    pub fn new(iteration: u32, node: Step, message: impl Into<String>) -> Self {
        Self {
            iteration,
            node,
            message: message.into(),
            timestamp: Utc::now(),
            decision: None,
            issues_after: None,
        }
    }

    pub fn with_decision(mut self, decision: Decision) -> Self {
        self.decision = Some(decision);
        self
    }

    pub fn with_issues_after(mut self, counts: IssueCounts) -> Self {
        self.issues_after = Some(counts);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixResult {
    Success,
    Partial,
    Failed,
    Reverted,
}

impl fmt::Display for FixResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Partial => write!(f, "partial"),
            Self::Failed => write!(f, "failed"),
            Self::Reverted => write!(f, "reverted"),
        }
    }
}

/// One fix step's outcome. Appended to the state, never changed afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixAttempt {
    pub iteration: u32,
    pub issues_targeted: Vec<String>,
    pub fixes_applied: Vec<String>,
    pub result: FixResult,
    pub issues_remaining: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReviewState {
    pub document_id: String,
    pub original_text: String,
    pub current_text: String,
    pub issues: Vec<Issue>,
    pub iteration: u32,
    /// Base maximum plus any profile bonus.
    pub max_iterations: u32,
    pub changed: bool,
    pub completed: bool,
    pub error: Option<String>,
    pub requires_human_review: bool,
    pub qa_passed: Option<bool>,
    pub history: Vec<HistoryEntry>,
    pub issue_history: ConvergenceTracker,
    pub fix_attempts: Vec<FixAttempt>,
    pub failure_report: Option<FailureReport>,
}

impl ReviewState {
    pub fn new(document_id: impl Into<String>, text: impl Into<String>, max_iterations: u32) -> Self {
        let text = text.into();
        Self {
            document_id: document_id.into(),
            original_text: text.clone(),
            current_text: text,
            issues: Vec::new(),
            iteration: 0,
            max_iterations,
            changed: false,
            completed: false,
            error: None,
            requires_human_review: false,
            qa_passed: None,
            history: Vec::new(),
            issue_history: ConvergenceTracker::new(),
            fix_attempts: Vec::new(),
            failure_report: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.completed || self.error.is_some()
    }

    pub fn issue_counts(&self) -> IssueCounts {
        IssueCounts::from_issues(&self.issues)
    }

    /// Merge a transition's update.
    ///
    /// The whole update is checked before anything is written, so a refused
    /// update leaves the state untouched.
    pub fn apply(&mut self, update: StateUpdate) -> Result<(), StateError> {
        if self.is_terminal() {
            if !update.is_decision_record() {
                return Err(StateError::Terminal);
            }
            self.history.push(update.entry);
            return Ok(());
        }
        if update.validation_pass.is_some() && self.iteration >= self.max_iterations {
            return Err(StateError::IterationOverflow {
                attempted: self.iteration + 1,
                max: self.max_iterations,
            });
        }

        if let Some(text) = update.current_text {
            self.changed = text != self.original_text;
            self.current_text = text;
        }
        if let Some(issues) = update.issues {
            self.issues = issues;
        }
        if let Some(signatures) = update.validation_pass {
            self.issue_history.record_signatures(signatures);
            self.iteration += 1;
        }
        if let Some(qa_passed) = update.qa_passed {
            self.qa_passed = qa_passed;
        }
        if update.requires_human_review {
            self.requires_human_review = true;
        }
        if let Some(attempt) = update.fix_attempt {
            self.fix_attempts.push(attempt);
        }
        if let Some(report) = update.failure_report {
            self.failure_report = Some(report);
        }
        self.history.push(update.entry);
        if let Some(error) = update.error {
            self.error = Some(error);
        }
        if update.completed {
            self.completed = true;
        }
        Ok(())
    }
}

/// Changes one transition wants to make. Fields left at their default are
/// not touched.
#[derive(Debug, Clone)]
pub struct StateUpdate {
    pub entry: HistoryEntry,
    pub current_text: Option<String>,
    pub issues: Option<Vec<Issue>>,
    /// Signatures of a completed validation pass; advances the iteration.
    pub validation_pass: Option<BTreeSet<String>>,
    /// `Some(None)` resets QA to "not run".
    pub qa_passed: Option<Option<bool>>,
    pub requires_human_review: bool,
    pub error: Option<String>,
    pub completed: bool,
    pub fix_attempt: Option<FixAttempt>,
    pub failure_report: Option<FailureReport>,
}

impl StateUpdate {
    pub fn new(entry: HistoryEntry) -> Self {
        Self {
            entry,
            current_text: None,
            issues: None,
            validation_pass: None,
            qa_passed: None,
            requires_human_review: false,
            error: None,
            completed: false,
            fix_attempt: None,
            failure_report: None,
        }
    }

    /// A bare `Decide` entry that changes nothing but the history.
    pub fn is_decision_record(&self) -> bool {
        self.entry.node == Step::Decide
            && self.current_text.is_none()
            && self.issues.is_none()
            && self.validation_pass.is_none()
            && self.qa_passed.is_none()
            && !self.requires_human_review
            && self.error.is_none()
            && !self.completed
            && self.fix_attempt.is_none()
            && self.failure_report.is_none()
    }

    pub fn text(mut self, text: String) -> Self {
        self.current_text = Some(text);
        self
    }

    pub fn issues(mut self, issues: Vec<Issue>) -> Self {
        self.issues = Some(issues);
        self
    }

    pub fn validation_pass(mut self, signatures: BTreeSet<String>) -> Self {
        self.validation_pass = Some(signatures);
        self
    }

    pub fn qa(mut self, qa_passed: Option<bool>) -> Self {
        self.qa_passed = Some(qa_passed);
        self
    }

    pub fn human_review(mut self) -> Self {
        self.requires_human_review = true;
        self
    }

    pub fn error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn completed(mut self) -> Self {
        self.completed = true;
        self
    }

    pub fn attempt(mut self, attempt: FixAttempt) -> Self {
        self.fix_attempt = Some(attempt);
        self
    }

    pub fn report(mut self, report: FailureReport) -> Self {
        self.failure_report = Some(report);
        self
    }
}
