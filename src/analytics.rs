//! Per-document and per-batch run statistics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;

use crate::collaborators::ValidatorKind;
use crate::orchestrator::ReviewProfile;
use crate::repair::convergence::ConvergenceTrend;
use crate::review::decision::Decision;
use crate::review::issue::{Issue, IssueCounts};

/// Issue tally after one validation pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationStats {
    pub iteration: u32,
    pub validators: Vec<ValidatorKind>,
    pub counts: IssueCounts,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<Decision>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QaAttempt {
    pub iteration: u32,
    pub passed: bool,
    pub summary: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentAnalytics {
    pub document_id: String,
    pub profile: ReviewProfile,
    pub started_at: DateTime<Utc>,
    /// Wall time of the whole run
    #[serde(with = "duration_serde")]
    pub duration: Duration,
    pub iterations: u32,
    /// Issues found by the first validation pass
    pub initial_issue_count: Option<usize>,
    pub final_issue_count: usize,
    pub qa_passed: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub requires_human_review: bool,
    pub trend: ConvergenceTrend,
    pub decision_path: Vec<Decision>,
    pub iteration_stats: Vec<IterationStats>,
    pub qa_attempts: Vec<QaAttempt>,
}

impl DocumentAnalytics {
    pub fn new(document_id: impl Into<String>, profile: ReviewProfile) -> Self {
        Self {
            document_id: document_id.into(),
            profile,
            started_at: Utc::now(),
            duration: Duration::ZERO,
            iterations: 0,
            initial_issue_count: None,
            final_issue_count: 0,
            qa_passed: None,
            error: None,
            requires_human_review: false,
            trend: ConvergenceTrend::Unknown,
            decision_path: Vec::new(),
            iteration_stats: Vec::new(),
            qa_attempts: Vec::new(),
        }
    }

    pub fn record_iteration(
        &mut self,
        iteration: u32,
        validators: &BTreeSet<ValidatorKind>,
        issues: &[Issue],
    ) {
        if self.initial_issue_count.is_none() {
            self.initial_issue_count = Some(issues.len());
        }
        self.iteration_stats.push(IterationStats {
            iteration,
            validators: validators.iter().copied().collect(),
            counts: IssueCounts::from_issues(issues),
            decision: None,
        });
    }

    /// Attach a decision to the latest iteration and extend the path.
    pub fn record_decision(&mut self, decision: Decision) {
        if let Some(last) = self.iteration_stats.last_mut() {
            last.decision = Some(decision);
        }
        self.decision_path.push(decision);
    }

    pub fn record_qa(&mut self, iteration: u32, passed: bool, summary: &str) {
        self.qa_attempts.push(QaAttempt {
            iteration,
            passed,
            summary: summary.to_string(),
        });
    }

    /// Issues removed between the first pass and the final text.
    /// Negative when the run made things worse.
    pub fn issues_resolved(&self) -> Option<i64> {
        self.initial_issue_count
            .map(|initial| initial as i64 - self.final_issue_count as i64)
    }

    pub fn converged(&self) -> bool {
        self.error.is_none() && !self.requires_human_review
    }
}

/// Aggregate over every document of a batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub documents: usize,
    pub converged: usize,
    pub escalated: usize,
    pub errored: usize,
    pub changed: usize,
    pub avg_duration_secs: Option<f64>,
    pub avg_iterations: Option<f64>,
    pub avg_issues_resolved: Option<f64>,
}

impl BatchSummary {
    pub fn from_documents<'a>(
        documents: impl IntoIterator<Item = (&'a DocumentAnalytics, bool)>,
    ) -> Self {
        let mut summary = Self::default();
        let mut durations = Vec::new();
        let mut iterations = Vec::new();
        let mut resolved = Vec::new();
        for (doc, changed) in documents {
            summary.documents += 1;
            if doc.error.is_some() {
                summary.errored += 1;
            } else if doc.requires_human_review {
                summary.escalated += 1;
            } else {
                summary.converged += 1;
            }
            if changed {
                summary.changed += 1;
            }
            durations.push(doc.duration.as_secs_f64());
            iterations.push(doc.iterations as f64);
            if let Some(r) = doc.issues_resolved() {
                resolved.push(r as f64);
            }
        }
        summary.avg_duration_secs = mean(&durations);
        summary.avg_iterations = mean(&iterations);
        summary.avg_issues_resolved = mean(&resolved);
        summary
    }

    pub fn all_converged(&self) -> bool {
        self.converged == self.documents
    }
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

/// Serde helpers for Duration serialization.
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
