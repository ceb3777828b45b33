//! Built-in collaborators for markdown documents with a YAML header.
//!
//! The four validators split the checks by what part of the document they
//! read, which is what lets [`ValidatorSelector`](crate::repair::selector::ValidatorSelector)
//! skip the ones whose input did not change:
//!
//! | Validator                    | Reads            |
//! |------------------------------|------------------|
//! | [`HeaderSchemaValidator`]    | header           |
//! | [`StructuralValidator`]      | body structure   |
//! | [`ConsistencyValidator`]     | header and body  |
//! | [`SanityValidator`]          | raw text         |
//!
//! [`StrictQaVerifier`] and [`LocalSummarizer`] need no external process and
//! are used whenever no agent command is configured.

use async_trait::async_trait;
use chrono::{Local, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use super::{
    FailureReport, FailureSummarizer, QaRequest, QaVerdict, QaVerifier, Validator, ValidatorKind,
};
use crate::document::{Header, ParsedDocument, is_fence, normalize_section_name};
use crate::errors::CollaboratorError;
use crate::orchestrator::state::HistoryEntry;
use crate::repair::deterministic::{
    find_bare_type_name, find_unquoted_source_urls, has_trailing_whitespace, parse_date,
};
use crate::repair::gate::suspicious_chars;
use crate::review::issue::{Issue, Severity};

/// What a well-formed document must contain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRules {
    pub required_fields: Vec<String>,
    /// Section names in their expected order, e.g. `"## Answer"`.
    pub required_sections: Vec<String>,
    pub min_body_chars: usize,
    /// Identifiers that must be written as inline code in prose.
    pub type_names: Vec<String>,
    /// Fixed "today" for date checks; the local date when unset.
    #[serde(skip)]
    pub today: Option<NaiveDate>,
}

impl Default for DocumentRules {
    fn default() -> Self {
        Self {
            required_fields: vec!["title".into(), "created".into(), "updated".into()],
            required_sections: Vec::new(),
            min_body_chars: 20,
            type_names: Vec::new(),
            today: None,
        }
    }
}

impl DocumentRules {
    fn today(&self) -> NaiveDate {
        self.today.unwrap_or_else(|| Local::now().date_naive())
    }
}

/// All four built-in validators sharing one rule set.
pub fn validators(rules: DocumentRules) -> Vec<Arc<dyn Validator>> {
    let rules = Arc::new(rules);
    vec![
        Arc::new(HeaderSchemaValidator::new(rules.clone())),
        Arc::new(StructuralValidator::new(rules.clone())),
        Arc::new(ConsistencyValidator::new(rules.clone())),
        Arc::new(SanityValidator::new(rules)),
    ]
}

pub struct HeaderSchemaValidator {
    rules: Arc<DocumentRules>,
}

impl HeaderSchemaValidator {
    pub fn new(rules: Arc<DocumentRules>) -> Self {
        Self { rules }
    }

    pub fn check(&self, text: &str) -> Vec<Issue> {
        let doc = ParsedDocument::parse(text);
        match doc.header() {
            Header::Absent => {
                return vec![Issue::critical("Missing YAML header").with_field("header")];
            }
            Header::Invalid(reason) => {
                return vec![
                    Issue::critical(format!("YAML header could not be parsed: {reason}"))
                        .with_field("header"),
                ];
            }
            Header::Parsed(_) => {}
        }

        let mut issues = Vec::new();
        for field in &self.rules.required_fields {
            let present = doc
                .header_value(field)
                .is_some_and(|v| !v.is_null() && v.as_str().is_none_or(|s| !s.trim().is_empty()));
            if !present {
                issues.push(
                    Issue::error(format!("Missing required field '{field}'")).with_field(field),
                );
            }
        }

        let today = self.rules.today();
        let mut dates = BTreeMap::new();
        for field in ["created", "updated"] {
            let Some(raw) = doc.header_str(field) else {
                continue;
            };
            match parse_date(&raw) {
                Some(date) => {
                    if date > today {
                        issues.push(
                            Issue::warning(format!("'{field}' timestamp is in the future"))
                                .with_field(field),
                        );
                    }
                    dates.insert(field, date);
                }
                None => issues.push(
                    Issue::error(format!(
                        "Invalid date format for '{field}': expected YYYY-MM-DD, got '{raw}'"
                    ))
                    .with_field(field),
                ),
            }
        }
        if let (Some(created), Some(updated)) = (dates.get("created"), dates.get("updated")) {
            if created > updated {
                issues.push(Issue::error("'created' is after 'updated'").with_field("created"));
            }
        }
        for url in find_unquoted_source_urls(text) {
            issues.push(
                Issue::warning(format!("Unquoted URL in 'sources': {url}")).with_field("sources"),
            );
        }
        issues
    }
}

#[async_trait]
impl Validator for HeaderSchemaValidator {
    fn name(&self) -> &str {
        "header-schema"
    }

    fn kind(&self) -> ValidatorKind {
        ValidatorKind::HeaderSchema
    }

    async fn validate(&self, document: &str) -> Result<Vec<Issue>, CollaboratorError> {
        Ok(self.check(document))
    }
}

pub struct StructuralValidator {
    rules: Arc<DocumentRules>,
}

impl StructuralValidator {
    pub fn new(rules: Arc<DocumentRules>) -> Self {
        Self { rules }
    }

    pub fn check(&self, text: &str) -> Vec<Issue> {
        let doc = ParsedDocument::parse(text);
        let mut issues = Vec::new();

        let mut positions = Vec::new();
        for name in &self.rules.required_sections {
            match doc.find_section(name) {
                Some(section) => positions.push(section.start),
                None => issues.push(Issue::error(format!(
                    "Missing required section '{}'",
                    normalize_section_name(name)
                ))),
            }
        }
        if positions.windows(2).any(|w| w[0] > w[1]) {
            issues.push(Issue::warning("Headings appear out of expected order"));
        }

        let sections = doc.sections();
        for (idx, section) in sections.iter().enumerate() {
            let has_child = sections
                .get(idx + 1)
                .is_some_and(|next| next.start < section.end && next.level > section.level);
            let content = doc
                .section_text(section)
                .split_once('\n')
                .map_or("", |(_, rest)| rest);
            if !has_child && content.trim().is_empty() {
                issues.push(
                    Issue::warning(format!("Section '{}' is empty", section.title))
                        .with_line(section.line as u32),
                );
            }
        }

        let base = text[..doc.body_start()].matches('\n').count();
        let mut open_fence = None;
        for (idx, line) in doc.body().split_inclusive('\n').enumerate() {
            if is_fence(line) {
                open_fence = match open_fence {
                    Some(_) => None,
                    None => Some(base + idx + 1),
                };
            }
        }
        if let Some(line) = open_fence {
            issues.push(Issue::error("Unclosed code fence").with_line(line as u32));
        }

        for (idx, line) in text.split_inclusive('\n').enumerate() {
            if has_trailing_whitespace(line) {
                let line_no = idx as u32 + 1;
                issues.push(
                    Issue::info(format!("Trailing whitespace on line {line_no}"))
                        .with_line(line_no),
                );
            }
        }
        issues
    }
}

#[async_trait]
impl Validator for StructuralValidator {
    fn name(&self) -> &str {
        "structural"
    }

    fn kind(&self) -> ValidatorKind {
        ValidatorKind::Structural
    }

    async fn validate(&self, document: &str) -> Result<Vec<Issue>, CollaboratorError> {
        Ok(self.check(document))
    }
}

pub struct ConsistencyValidator {
    rules: Arc<DocumentRules>,
}

impl ConsistencyValidator {
    pub fn new(rules: Arc<DocumentRules>) -> Self {
        Self { rules }
    }

    pub fn check(&self, text: &str) -> Vec<Issue> {
        let doc = ParsedDocument::parse(text);
        let mut issues = Vec::new();

        let first_h1 = doc.sections().iter().find(|s| s.level == 1);
        if let (Some(title), Some(h1)) = (doc.header_str("title"), first_h1) {
            if !title.trim().eq_ignore_ascii_case(h1.title.trim()) {
                issues.push(
                    Issue::warning(format!(
                        "Header title '{}' does not match first heading '{}'",
                        title.trim(),
                        h1.title
                    ))
                    .with_field("title")
                    .with_line(h1.line as u32),
                );
            }
        }

        let mut seen = BTreeSet::new();
        for section in doc.sections() {
            if !seen.insert((section.level, section.title.to_lowercase())) {
                issues.push(
                    Issue::warning(format!("Duplicate heading '{}'", section.title))
                        .with_line(section.line as u32),
                );
            }
        }

        for name in &self.rules.type_names {
            if let Some(line) = find_bare_type_name(text, name).first() {
                issues.push(
                    Issue::warning(format!("Type name '{name}' found without backticks"))
                        .with_line(*line),
                );
            }
        }
        issues
    }
}

#[async_trait]
impl Validator for ConsistencyValidator {
    fn name(&self) -> &str {
        "consistency"
    }

    fn kind(&self) -> ValidatorKind {
        ValidatorKind::Consistency
    }

    async fn validate(&self, document: &str) -> Result<Vec<Issue>, CollaboratorError> {
        Ok(self.check(document))
    }
}

pub struct SanityValidator {
    rules: Arc<DocumentRules>,
}

impl SanityValidator {
    pub fn new(rules: Arc<DocumentRules>) -> Self {
        Self { rules }
    }

    pub fn check(&self, text: &str) -> Vec<Issue> {
        let mut issues = Vec::new();
        if let Some(offset) = suspicious_chars(text).first() {
            let line = text[..*offset].matches('\n').count() as u32 + 1;
            issues.push(
                Issue::critical("Document contains control or replacement characters")
                    .with_line(line),
            );
        }

        let doc = ParsedDocument::parse(text);
        let body_chars = doc.body().trim().chars().count();
        if body_chars == 0 {
            issues.push(Issue::error("Document body is empty"));
        } else if body_chars < self.rules.min_body_chars {
            issues.push(Issue::error(format!(
                "Document body is too short ({body_chars} < {} characters)",
                self.rules.min_body_chars
            )));
        }

        if !text.is_empty() && !text.ends_with('\n') {
            issues.push(Issue::info("Missing final newline"));
        }
        issues
    }
}

#[async_trait]
impl Validator for SanityValidator {
    fn name(&self) -> &str {
        "sanity"
    }

    fn kind(&self) -> ValidatorKind {
        ValidatorKind::Sanity
    }

    async fn validate(&self, document: &str) -> Result<Vec<Issue>, CollaboratorError> {
        Ok(self.check(document))
    }
}

/// Final quality gate that needs no external process.
///
/// Blocks on any ERROR or CRITICAL issue, on an issue count that grew in the
/// last iteration, on broken timestamps and on missing required fields.
/// Leftover warnings and long runs are noted in the summary only.
#[derive(Debug, Clone, Copy, Default)]
pub struct StrictQaVerifier;

impl StrictQaVerifier {
    pub fn evaluate(&self, request: QaRequest<'_>) -> QaVerdict {
        let mut problems = Vec::new();
        let mut warnings = Vec::new();

        for issue in request.issues.iter().filter(|i| i.severity.is_blocking()) {
            problems.push(Issue::error(format!(
                "ERROR-level issue remains: {}",
                issue.message
            )));
        }

        if let [.., previous, last] = request.issue_history {
            if last.len() > previous.len() {
                problems.push(Issue::critical(format!(
                    "Issue count increased in last iteration: {} → {}",
                    previous.len(),
                    last.len()
                )));
            }
        }

        for issue in request.issues {
            let about_timestamp = issue.message.to_lowercase().contains("timestamp")
                || issue
                    .field
                    .as_deref()
                    .is_some_and(|f| f.contains("created") || f.contains("updated"));
            if about_timestamp && issue.severity.is_blocking() {
                problems.push(Issue::error(format!("Invalid timestamp: {}", issue.message)));
            }
            if issue.message.to_lowercase().contains("missing required field") {
                problems.push(Issue::error(format!(
                    "Required field missing: {}",
                    issue.message
                )));
            }
        }

        let warning_count = request
            .issues
            .iter()
            .filter(|i| i.severity == Severity::Warning)
            .count();
        if warning_count > 0 {
            warnings.push(format!(
                "{warning_count} WARNING-level issue(s) remain (non-blocking)"
            ));
        }
        if request.iteration > 5 {
            warnings.push(format!(
                "Required {} iterations to complete",
                request.iteration
            ));
        }

        let problems = crate::review::issue::dedup_issues(problems);
        let acceptable = problems.is_empty();
        let summary = match (acceptable, warnings.is_empty()) {
            (true, true) => "QA PASS. Document is ready with no issues.".to_string(),
            (true, false) => format!(
                "QA PASS with {} warning(s): {}",
                warnings.len(),
                warnings.join("; ")
            ),
            (false, _) => format!(
                "QA FAIL. {} blocking issue(s) prevent completion.",
                problems.len()
            ),
        };
        QaVerdict {
            acceptable,
            problems,
            summary,
        }
    }
}

#[async_trait]
impl QaVerifier for StrictQaVerifier {
    fn name(&self) -> &str {
        "strict-qa"
    }

    async fn verify(&self, request: QaRequest<'_>) -> Result<QaVerdict, CollaboratorError> {
        Ok(self.evaluate(request))
    }
}

/// Builds a failure report from the run history alone.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalSummarizer;

impl LocalSummarizer {
    pub fn report(&self, history: &[HistoryEntry], unresolved: &[Issue]) -> FailureReport {
        let iterations = history.iter().map(|h| h.iteration).max().unwrap_or(0);
        let mut root_causes = Vec::new();
        let seen = |needle: &str| {
            history
                .iter()
                .any(|h| h.message.to_lowercase().contains(needle))
        };
        if seen("oscillat") {
            root_causes.push("Fixes kept reintroducing previously resolved issues".to_string());
        }
        if seen("regression") {
            root_causes.push("A fix reverted a field fixed in an earlier iteration".to_string());
        }
        if seen("rejected") {
            root_causes.push("Candidate edits were rejected by the validation gate".to_string());
        }
        if seen("could not apply") {
            root_causes.push("The fixer produced no changes".to_string());
        }
        if seen("pre-flight") {
            root_causes.push("The document failed pre-flight checks".to_string());
        }
        if seen("maximum iterations") || seen("max iterations") {
            root_causes.push("The iteration budget ran out".to_string());
        }

        let mut recommendations: Vec<String> = unresolved
            .iter()
            .filter(|i| i.severity.is_blocking())
            .map(|i| format!("Resolve manually: {}", i.message))
            .collect();
        if recommendations.is_empty() {
            recommendations.push("Review the document manually before publishing".to_string());
        }

        let counts = crate::review::issue::IssueCounts::from_issues(unresolved);
        FailureReport {
            summary: format!(
                "Automated repair stopped after {iterations} iteration(s) with {} unresolved issue(s) ({counts})",
                unresolved.len()
            ),
            root_causes,
            recommendations,
            unresolved: unresolved.to_vec(),
            produced_by: self.name().to_string(),
        }
    }
}

#[async_trait]
impl FailureSummarizer for LocalSummarizer {
    fn name(&self) -> &str {
        "local-summarizer"
    }

    async fn summarize(
        &self,
        _document: &str,
        history: &[HistoryEntry],
        unresolved: &[Issue],
    ) -> Result<FailureReport, CollaboratorError> {
        Ok(self.report(history, unresolved))
    }
}
