//! Collaborator traits consumed by the repair loop.
//!
//! The orchestrator never knows how a document is validated or fixed; it
//! talks to these traits and receives implementations by injection:
//!
//! | Trait                 | Role                                           |
//! |-----------------------|------------------------------------------------|
//! | [`Validator`]         | report issues for a document                   |
//! | [`Fixer`]             | propose a revised document for given issues    |
//! | [`QaVerifier`]        | final acceptance check once issues stop blocking |
//! | [`FailureSummarizer`] | explain a terminal escalation                  |
//! | [`InitialReviewer`]   | optional first pass before validation          |
//! | [`ReferenceResolver`] | optional auxiliary work during a fix step      |
//!
//! Built-in implementations live in [`builtin`]; [`command`] drives an
//! external agent process. Calls are wrapped in [`retry`] by the caller.

pub mod builtin;
pub mod command;
pub mod retry;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use crate::errors::CollaboratorError;
use crate::orchestrator::state::{FixAttempt, HistoryEntry};
use crate::review::issue::Issue;

/// The validation pass a validator implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidatorKind {
    HeaderSchema,
    Structural,
    Consistency,
    Sanity,
}

impl ValidatorKind {
    pub const ALL: [ValidatorKind; 4] = [
        ValidatorKind::HeaderSchema,
        ValidatorKind::Structural,
        ValidatorKind::Consistency,
        ValidatorKind::Sanity,
    ];
}

impl fmt::Display for ValidatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HeaderSchema => write!(f, "header_schema"),
            Self::Structural => write!(f, "structural"),
            Self::Consistency => write!(f, "consistency"),
            Self::Sanity => write!(f, "sanity"),
        }
    }
}

/// Reports issues for a document. Must be deterministic for the same input.
#[async_trait]
pub trait Validator: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> ValidatorKind;

    async fn validate(&self, document: &str) -> Result<Vec<Issue>, CollaboratorError>;
}

/// What a fixer is told besides the document and the issues.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FixContext {
    pub iteration: u32,
    pub max_iterations: u32,
    /// Rendered "previously fixed fields" block.
    pub memory_context: String,
    pub memory_summary: String,
    pub attempts: Vec<FixAttempt>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixOutput {
    pub revised_text: String,
    #[serde(default)]
    pub fixes_applied: Vec<String>,
    pub changed: bool,
}

impl FixOutput {
    pub fn unchanged(document: &str) -> Self {
        Self {
            revised_text: document.to_string(),
            fixes_applied: Vec::new(),
            changed: false,
        }
    }
}

#[async_trait]
pub trait Fixer: Send + Sync {
    fn name(&self) -> &str;

    async fn fix(
        &self,
        document: &str,
        issues: &[Issue],
        context: &FixContext,
    ) -> Result<FixOutput, CollaboratorError>;
}

#[derive(Debug, Clone, Copy)]
pub struct QaRequest<'a> {
    pub document: &'a str,
    pub iteration: u32,
    /// Issues still present; all within the completion thresholds.
    pub issues: &'a [Issue],
    pub issue_history: &'a [BTreeSet<String>],
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QaVerdict {
    pub acceptable: bool,
    #[serde(default)]
    pub problems: Vec<Issue>,
    #[serde(default)]
    pub summary: String,
}

#[async_trait]
pub trait QaVerifier: Send + Sync {
    fn name(&self) -> &str;

    async fn verify(&self, request: QaRequest<'_>) -> Result<QaVerdict, CollaboratorError>;
}

/// Structured explanation of why a document could not be finished.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReport {
    pub summary: String,
    #[serde(default)]
    pub root_causes: Vec<String>,
    #[serde(default)]
    pub recommendations: Vec<String>,
    #[serde(default)]
    pub unresolved: Vec<Issue>,
    /// Name of the collaborator that produced the report.
    #[serde(default)]
    pub produced_by: String,
}

#[async_trait]
pub trait FailureSummarizer: Send + Sync {
    fn name(&self) -> &str;

    async fn summarize(
        &self,
        document: &str,
        history: &[HistoryEntry],
        unresolved: &[Issue],
    ) -> Result<FailureReport, CollaboratorError>;
}

/// Optional review pass run once before the first validation.
#[async_trait]
pub trait InitialReviewer: Send + Sync {
    fn name(&self) -> &str;

    async fn review(&self, document: &str) -> Result<FixOutput, CollaboratorError>;
}

/// Creates resources a document refers to but that do not exist yet.
/// Returns a description of each resource it created.
#[async_trait]
pub trait ReferenceResolver: Send + Sync {
    fn name(&self) -> &str;

    async fn resolve(&self, document: &str) -> Result<Vec<String>, CollaboratorError>;
}

/// A fixer that never changes anything. Used when no agent is configured,
/// leaving the deterministic fixer as the only source of edits.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopFixer;

#[async_trait]
impl Fixer for NoopFixer {
    fn name(&self) -> &str {
        "noop-fixer"
    }

    async fn fix(
        &self,
        document: &str,
        _issues: &[Issue],
        _context: &FixContext,
    ) -> Result<FixOutput, CollaboratorError> {
        Ok(FixOutput::unchanged(document))
    }
}
