//! The decision engine: a pure function from loop state to the next action.
//!
//! Rules are evaluated top to bottom and the first match wins:
//!
//! 1. human review required → [`Decision::SummarizeFailures`]
//! 2. oscillation detected → [`Decision::SummarizeFailures`]
//! 3. at max iterations with issues left or QA failed → [`Decision::SummarizeFailures`]
//! 4. at max iterations otherwise → [`Decision::Done`]
//! 5. error recorded → [`Decision::Done`]
//! 6. completed → [`Decision::Done`]
//! 7. issues within thresholds, QA not run → [`Decision::QaVerify`]
//! 8. issues within thresholds, QA passed → [`Decision::Done`]
//! 9. anything else → [`Decision::Continue`]
//!
//! ## Example
//!
//! ```
//! use mender::review::decision::{decide, Decision, DecisionContext};
//! use mender::review::issue::Issue;
//!
//! let ctx = DecisionContext::new(1, 5).with_issues(vec![Issue::error("Missing title")]);
//! assert_eq!(decide(&ctx).decision, Decision::Continue);
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

use super::completion::{CompletionMode, SeverityThresholds};
use super::issue::Issue;
use crate::repair::oscillation::OscillationReport;

/// Next action of the control loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Continue,
    QaVerify,
    SummarizeFailures,
    Done,
}

impl Decision {
    /// Whether the loop stops after this decision (possibly via a summary).
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::SummarizeFailures | Self::Done)
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Continue => write!(f, "continue"),
            Self::QaVerify => write!(f, "qa_verify"),
            Self::SummarizeFailures => write!(f, "summarize_failures"),
            Self::Done => write!(f, "done"),
        }
    }
}

/// Which rule produced a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionRule {
    HumanReview,
    Oscillation,
    MaxIterationsUnresolved,
    MaxIterationsClean,
    Error,
    Completed,
    ReadyForQa,
    QaPassed,
    Blocking,
}

/// A decision with the reason it was taken.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionOutcome {
    pub decision: Decision,
    pub rule: DecisionRule,
    pub reason: String,
}

impl DecisionOutcome {
    fn new(decision: Decision, rule: DecisionRule, reason: impl Into<String>) -> Self {
        Self {
            decision,
            rule,
            reason: reason.into(),
        }
    }
}

/// Everything the decision engine looks at.
#[derive(Debug, Clone)]
pub struct DecisionContext {
    pub issues: Vec<Issue>,
    pub iteration: u32,
    pub max_iterations: u32,
    pub requires_human_review: bool,
    pub completed: bool,
    pub error: Option<String>,
    pub qa_passed: Option<bool>,
    pub oscillation: Option<OscillationReport>,
    pub completion_mode: CompletionMode,
    pub thresholds: SeverityThresholds,
}

impl DecisionContext {
    pub fn new(iteration: u32, max_iterations: u32) -> Self {
        Self {
            issues: Vec::new(),
            iteration,
            max_iterations,
            requires_human_review: false,
            completed: false,
            error: None,
            qa_passed: None,
            oscillation: None,
            completion_mode: CompletionMode::default(),
            thresholds: CompletionMode::default().thresholds(),
        }
    }

    pub fn with_issues(mut self, issues: Vec<Issue>) -> Self {
        self.issues = issues;
        self
    }

    pub fn with_human_review(mut self, required: bool) -> Self {
        self.requires_human_review = required;
        self
    }

    pub fn with_completed(mut self, completed: bool) -> Self {
        self.completed = completed;
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_qa(mut self, qa_passed: Option<bool>) -> Self {
        self.qa_passed = qa_passed;
        self
    }

    pub fn with_oscillation(mut self, report: Option<OscillationReport>) -> Self {
        self.oscillation = report;
        self
    }

    /// Set the mode and reset thresholds to that mode's table.
    pub fn with_mode(mut self, mode: CompletionMode) -> Self {
        self.completion_mode = mode;
        self.thresholds = mode.thresholds();
        self
    }

    pub fn with_thresholds(mut self, thresholds: SeverityThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }
}

/// Pick the next action. Pure: the same context always yields the same outcome.
pub fn decide(ctx: &DecisionContext) -> DecisionOutcome {
    if ctx.requires_human_review {
        return DecisionOutcome::new(
            Decision::SummarizeFailures,
            DecisionRule::HumanReview,
            format!(
                "Fix agent could not apply changes - escalating to human review \
                 (iteration {}/{}, {} unresolved issue(s))",
                ctx.iteration,
                ctx.max_iterations,
                ctx.issues.len()
            ),
        );
    }

    if let Some(report) = &ctx.oscillation {
        return DecisionOutcome::new(
            Decision::SummarizeFailures,
            DecisionRule::Oscillation,
            format!(
                "CIRCUIT BREAKER TRIGGERED: Oscillation detected - stopping iteration. {}",
                report.explanation
            ),
        );
    }

    if ctx.iteration >= ctx.max_iterations {
        if !ctx.issues.is_empty() || ctx.qa_passed == Some(false) {
            return DecisionOutcome::new(
                Decision::SummarizeFailures,
                DecisionRule::MaxIterationsUnresolved,
                format!(
                    "Max iterations ({}) reached with unresolved issues - triggering failure summarizer",
                    ctx.max_iterations
                ),
            );
        }
        return DecisionOutcome::new(
            Decision::Done,
            DecisionRule::MaxIterationsClean,
            format!("Stopping: max iterations ({}) reached", ctx.max_iterations),
        );
    }

    if let Some(error) = &ctx.error {
        return DecisionOutcome::new(
            Decision::Done,
            DecisionRule::Error,
            format!("Stopping: error occurred: {}", error),
        );
    }

    if ctx.completed {
        return DecisionOutcome::new(
            Decision::Done,
            DecisionRule::Completed,
            "Stopping: completed flag set",
        );
    }

    let check = ctx.thresholds.check(&ctx.issues, ctx.completion_mode);
    if !check.blocking {
        match ctx.qa_passed {
            None => {
                return DecisionOutcome::new(
                    Decision::QaVerify,
                    DecisionRule::ReadyForQa,
                    format!("{} - running QA verification", check.reason),
                );
            }
            Some(true) => {
                return DecisionOutcome::new(
                    Decision::Done,
                    DecisionRule::QaPassed,
                    format!("{} and QA verification passed", check.reason),
                );
            }
            Some(false) => {}
        }
    }

    let reason = if check.blocking {
        check.reason
    } else {
        format!("{}, but QA verification failed", check.reason)
    };
    DecisionOutcome::new(
        Decision::Continue,
        DecisionRule::Blocking,
        format!("Continuing to iteration {} ({})", ctx.iteration + 1, reason),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repair::oscillation::OscillationDetector;
    use crate::review::issue::Severity;
    use std::collections::BTreeSet;

    fn oscillation() -> OscillationReport {
        let a: BTreeSet<String> = ["ERROR:a".to_string()].into();
        OscillationDetector::new()
            .detect(&[a.clone(), BTreeSet::new(), a])
            .expect("oscillating history")
    }

    fn warnings(n: usize) -> Vec<Issue> {
        (0..n).map(|i| Issue::warning(format!("w{}", i))).collect()
    }

    // =========================================
    // Scenario tests
    // =========================================

    #[test]
    fn test_single_error_standard_continues() {
        let ctx = DecisionContext::new(1, 5).with_issues(vec![Issue::error("bad")]);
        let outcome = decide(&ctx);
        assert_eq!(outcome.decision, Decision::Continue);
        assert_eq!(outcome.rule, DecisionRule::Blocking);
        assert_eq!(
            outcome.reason,
            "Continuing to iteration 2 (Issues exceed standard mode thresholds: ERROR:1>0)"
        );
    }

    #[test]
    fn test_three_warnings_standard_goes_to_qa() {
        let ctx = DecisionContext::new(1, 5).with_issues(warnings(3));
        assert_eq!(decide(&ctx).decision, Decision::QaVerify);
    }

    #[test]
    fn test_max_iterations_clean_with_qa_passed_is_done() {
        let ctx = DecisionContext::new(5, 5).with_qa(Some(true));
        let outcome = decide(&ctx);
        assert_eq!(outcome.decision, Decision::Done);
        assert_eq!(outcome.reason, "Stopping: max iterations (5) reached");
    }

    #[test]
    fn test_max_iterations_with_issues_summarizes() {
        let ctx = DecisionContext::new(5, 5).with_issues(vec![Issue::info("x")]);
        let outcome = decide(&ctx);
        assert_eq!(outcome.decision, Decision::SummarizeFailures);
        assert_eq!(outcome.rule, DecisionRule::MaxIterationsUnresolved);
    }

    #[test]
    fn test_max_iterations_with_failed_qa_summarizes() {
        let ctx = DecisionContext::new(5, 5).with_qa(Some(false));
        assert_eq!(decide(&ctx).decision, Decision::SummarizeFailures);
    }

    #[test]
    fn test_qa_failed_within_thresholds_continues() {
        let ctx = DecisionContext::new(2, 5).with_qa(Some(false));
        let outcome = decide(&ctx);
        assert_eq!(outcome.decision, Decision::Continue);
        assert!(outcome.reason.contains("QA verification failed"));
    }

    #[test]
    fn test_qa_passed_within_thresholds_is_done() {
        let ctx = DecisionContext::new(2, 5)
            .with_issues(warnings(2))
            .with_qa(Some(true));
        assert_eq!(decide(&ctx).rule, DecisionRule::QaPassed);
    }

    // =========================================
    // Priority tests
    // =========================================

    #[test]
    fn test_human_review_outranks_oscillation_and_max_iterations() {
        let ctx = DecisionContext::new(5, 5)
            .with_issues(vec![Issue::error("bad")])
            .with_oscillation(Some(oscillation()))
            .with_human_review(true);
        let outcome = decide(&ctx);
        assert_eq!(outcome.rule, DecisionRule::HumanReview);
        assert!(outcome.reason.contains("iteration 5/5, 1 unresolved issue(s)"));
    }

    #[test]
    fn test_oscillation_outranks_max_iterations() {
        let ctx = DecisionContext::new(5, 5)
            .with_issues(vec![Issue::error("bad")])
            .with_oscillation(Some(oscillation()));
        let outcome = decide(&ctx);
        assert_eq!(outcome.rule, DecisionRule::Oscillation);
        assert!(outcome.reason.starts_with("CIRCUIT BREAKER TRIGGERED"));
    }

    #[test]
    fn test_oscillation_ignores_remaining_budget() {
        let ctx = DecisionContext::new(3, 10)
            .with_issues(vec![Issue::error("a")])
            .with_oscillation(Some(oscillation()));
        assert_eq!(decide(&ctx).decision, Decision::SummarizeFailures);
    }

    #[test]
    fn test_error_and_completed_stop() {
        let errored = DecisionContext::new(1, 5)
            .with_issues(vec![Issue::error("bad")])
            .with_error("fixer returned garbage");
        let outcome = decide(&errored);
        assert_eq!(outcome.decision, Decision::Done);
        assert_eq!(outcome.reason, "Stopping: error occurred: fixer returned garbage");

        let completed = DecisionContext::new(1, 5).with_completed(true);
        assert_eq!(decide(&completed).rule, DecisionRule::Completed);
    }

    #[test]
    fn test_zero_issues_never_continue_before_qa() {
        for iteration in 1..=6 {
            let ctx = DecisionContext::new(iteration, 5);
            assert_ne!(decide(&ctx).decision, Decision::Continue);
        }
    }

    #[test]
    fn test_oscillating_history_from_detector_summarizes() {
        let sig: BTreeSet<String> = ["ERROR:Missing section 'Answer'".to_string()].into();
        let history = vec![BTreeSet::new(), sig.clone(), BTreeSet::new(), sig];
        let report = OscillationDetector::new().detect(&history);
        let ctx = DecisionContext::new(4, 10)
            .with_issues(vec![Issue::error("Missing section 'Answer'")])
            .with_oscillation(report);
        let outcome = decide(&ctx);
        assert_eq!(outcome.decision, Decision::SummarizeFailures);
        assert!(outcome.reason.contains("Oscillation detected"));
    }

    #[test]
    fn test_mode_changes_blocking() {
        let two_errors = vec![Issue::error("a"), Issue::error("b")];
        let standard = DecisionContext::new(1, 5).with_issues(two_errors.clone());
        assert_eq!(decide(&standard).decision, Decision::Continue);

        let permissive = DecisionContext::new(1, 5)
            .with_issues(two_errors)
            .with_mode(CompletionMode::Permissive);
        assert_eq!(decide(&permissive).decision, Decision::QaVerify);
    }

    #[test]
    fn test_custom_thresholds_override_mode_table() {
        let ctx = DecisionContext::new(1, 5)
            .with_issues(vec![Issue::new(Severity::Warning, "w")])
            .with_mode(CompletionMode::Strict)
            .with_thresholds(SeverityThresholds::new(Some(0), Some(0), Some(1), None));
        assert_eq!(decide(&ctx).decision, Decision::QaVerify);
    }

    #[test]
    fn test_decision_display_and_terminal() {
        assert_eq!(Decision::QaVerify.to_string(), "qa_verify");
        assert!(Decision::SummarizeFailures.is_terminal());
        assert!(!Decision::Continue.is_terminal());
    }
}
