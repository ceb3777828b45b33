//! Validation issues produced by validators and QA.
//!
//! ## Types
//!
//! - [`Severity`]: ordered from most to least severe
//! - [`Issue`]: a single finding with optional field and line location
//! - [`IssueCounts`]: per-severity tally, ordered so that fewer severe
//!   issues compare as better
//!
//! ## Example
//!
//! ```
//! use mender::review::issue::{Issue, Severity};
//!
//! let issue = Issue::new(Severity::Error, "Missing required field 'created'")
//!     .with_field("created")
//!     .with_line(2);
//!
//! assert_eq!(issue.signature(), "ERROR:Missing required field 'created'");
//! assert!(issue.severity.is_blocking());
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Severity of a validation issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    #[serde(alias = "critical")]
    Critical,
    #[serde(alias = "error")]
    Error,
    #[serde(alias = "warning")]
    Warning,
    #[serde(alias = "info")]
    Info,
}

impl Severity {
    pub const ALL: [Severity; 4] = [
        Severity::Critical,
        Severity::Error,
        Severity::Warning,
        Severity::Info,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "CRITICAL",
            Self::Error => "ERROR",
            Self::Warning => "WARNING",
            Self::Info => "INFO",
        }
    }

    /// CRITICAL and ERROR issues are never acceptable in a finished document.
    pub fn is_blocking(&self) -> bool {
        matches!(self, Self::Critical | Self::Error)
    }

    /// Recover the severity from an issue signature.
    pub fn from_signature(signature: &str) -> Option<Self> {
        let (prefix, _) = signature.split_once(':')?;
        prefix.parse().ok()
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Severity {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "CRITICAL" => Ok(Self::Critical),
            "ERROR" => Ok(Self::Error),
            "WARNING" | "WARN" => Ok(Self::Warning),
            "INFO" => Ok(Self::Info),
            _ => anyhow::bail!(
                "Invalid severity '{}'. Valid values: critical, error, warning, info",
                s
            ),
        }
    }
}

/// A single validation finding.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Issue {
    pub severity: Severity,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
}

impl Issue {
    pub fn new(severity: Severity, message: impl Into<String>) -> Self {
        Self {
            severity,
            message: message.into(),
            field: None,
            line: None,
        }
    }

    pub fn critical(message: impl Into<String>) -> Self {
        Self::new(Severity::Critical, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(Severity::Error, message)
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self::new(Severity::Warning, message)
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::new(Severity::Info, message)
    }

    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    pub fn with_line(mut self, line: u32) -> Self {
        self.line = Some(line);
        self
    }

    /// Normalized identity used for convergence and oscillation tracking.
    ///
    /// Location is deliberately excluded: an issue that moves by a line is
    /// still the same issue.
    pub fn signature(&self) -> String {
        format!("{}:{}", self.severity, self.message.trim())
    }
}

impl fmt::Display for Issue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.severity, self.message)?;
        match (&self.field, self.line) {
            (Some(field), Some(line)) => write!(f, " (field: {}, line {})", field, line),
            (Some(field), None) => write!(f, " (field: {})", field),
            (None, Some(line)) => write!(f, " (line {})", line),
            (None, None) => Ok(()),
        }
    }
}

/// Signature set of a list of issues.
pub fn signatures(issues: &[Issue]) -> BTreeSet<String> {
    issues.iter().map(Issue::signature).collect()
}

/// Drop issues whose signature was already seen, keeping the first.
pub fn dedup_issues(issues: Vec<Issue>) -> Vec<Issue> {
    let mut seen = BTreeSet::new();
    issues
        .into_iter()
        .filter(|issue| seen.insert(issue.signature()))
        .collect()
}

/// Per-severity issue tally.
///
/// Field order makes the derived ordering rank documents: fewer CRITICAL
/// first, then fewer ERROR, and so on.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct IssueCounts {
    pub critical: u32,
    pub error: u32,
    pub warning: u32,
    pub info: u32,
}

impl IssueCounts {
    pub fn from_issues(issues: &[Issue]) -> Self {
        let mut counts = Self::default();
        for issue in issues {
            match issue.severity {
                Severity::Critical => counts.critical += 1,
                Severity::Error => counts.error += 1,
                Severity::Warning => counts.warning += 1,
                Severity::Info => counts.info += 1,
            }
        }
        counts
    }

    pub fn get(&self, severity: Severity) -> u32 {
        match severity {
            Severity::Critical => self.critical,
            Severity::Error => self.error,
            Severity::Warning => self.warning,
            Severity::Info => self.info,
        }
    }

    pub fn total(&self) -> u32 {
        self.critical + self.error + self.warning + self.info
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    pub fn blocking(&self) -> u32 {
        self.critical + self.error
    }
}

impl fmt::Display for IssueCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = Severity::ALL
            .iter()
            .filter(|s| self.get(**s) > 0)
            .map(|s| format!("{}:{}", s, self.get(*s)))
            .collect();
        if parts.is_empty() {
            write!(f, "none")
        } else {
            write!(f, "{}", parts.join(", "))
        }
    }
}
