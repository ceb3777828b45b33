//! Completion modes and severity thresholds.
//!
//! A completion mode decides how many issues of each severity a document may
//! keep and still be considered finished. Issues *block* completion when any
//! severity's observed count exceeds its allowed maximum.
//!
//! | mode        | CRITICAL | ERROR | WARNING | INFO |
//! |-------------|----------|-------|---------|------|
//! | strict      | 0        | 0     | 0       | ∞    |
//! | standard    | 0        | 0     | 3       | ∞    |
//! | permissive  | 0        | 2     | 10      | ∞    |

use serde::{Deserialize, Serialize};
use std::fmt;

use super::issue::{Issue, IssueCounts, Severity};

/// How strict the loop is about remaining issues.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompletionMode {
    Strict,
    #[default]
    Standard,
    Permissive,
}

impl CompletionMode {
    pub fn thresholds(&self) -> SeverityThresholds {
        match self {
            Self::Strict => SeverityThresholds::new(Some(0), Some(0), Some(0), None),
            Self::Standard => SeverityThresholds::new(Some(0), Some(0), Some(3), None),
            Self::Permissive => SeverityThresholds::new(Some(0), Some(2), Some(10), None),
        }
    }
}

impl fmt::Display for CompletionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Strict => write!(f, "strict"),
            Self::Standard => write!(f, "standard"),
            Self::Permissive => write!(f, "permissive"),
        }
    }
}

impl std::str::FromStr for CompletionMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "strict" => Ok(Self::Strict),
            "standard" => Ok(Self::Standard),
            "permissive" => Ok(Self::Permissive),
            _ => anyhow::bail!(
                "Invalid completion mode '{}'. Valid values: strict, standard, permissive",
                s
            ),
        }
    }
}

/// Maximum allowed count per severity; `None` means unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeverityThresholds {
    pub critical: Option<u32>,
    pub error: Option<u32>,
    pub warning: Option<u32>,
    pub info: Option<u32>,
}

impl Default for SeverityThresholds {
    fn default() -> Self {
        CompletionMode::default().thresholds()
    }
}

/// Result of checking issues against thresholds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThresholdCheck {
    pub blocking: bool,
    pub reason: String,
}

impl SeverityThresholds {
    pub fn new(
        critical: Option<u32>,
        error: Option<u32>,
        warning: Option<u32>,
        info: Option<u32>,
    ) -> Self {
        Self {
            critical,
            error,
            warning,
            info,
        }
    }

    pub fn limit(&self, severity: Severity) -> Option<u32> {
        match severity {
            Severity::Critical => self.critical,
            Severity::Error => self.error,
            Severity::Warning => self.warning,
            Severity::Info => self.info,
        }
    }

    /// Replace individual limits, leaving the others untouched.
    pub fn with_overrides(mut self, overrides: &ThresholdOverrides) -> Self {
        if let Some(v) = overrides.critical {
            self.critical = Some(v);
        }
        if let Some(v) = overrides.error {
            self.error = Some(v);
        }
        if let Some(v) = overrides.warning {
            self.warning = Some(v);
        }
        if let Some(v) = overrides.info {
            self.info = Some(v);
        }
        self
    }

    /// Check issues against these thresholds. `mode` only labels the reason.
    pub fn check(&self, issues: &[Issue], mode: CompletionMode) -> ThresholdCheck {
        let counts = IssueCounts::from_issues(issues);
        if counts.is_empty() {
            return ThresholdCheck {
                blocking: false,
                reason: "No issues remaining".to_string(),
            };
        }

        let exceeded: Vec<String> = Severity::ALL
            .iter()
            .filter_map(|sev| {
                let count = counts.get(*sev);
                match self.limit(*sev) {
                    Some(max) if count > max => Some(format!("{}:{}>{}", sev, count, max)),
                    _ => None,
                }
            })
            .collect();

        if exceeded.is_empty() {
            ThresholdCheck {
                blocking: false,
                reason: format!("Issues within {} mode thresholds: {}", mode, counts),
            }
        } else {
            ThresholdCheck {
                blocking: true,
                reason: format!(
                    "Issues exceed {} mode thresholds: {}",
                    mode,
                    exceeded.join(", ")
                ),
            }
        }
    }
}

/// Per-severity limit overrides read from configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThresholdOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub critical: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<u32>,
}

impl ThresholdOverrides {
    pub fn is_empty(&self) -> bool {
        self.critical.is_none() && self.error.is_none() && self.warning.is_none() && self.info.is_none()
    }
}

/// Whether `issues` block completion under `mode`'s default table.
pub fn should_issues_block_completion(issues: &[Issue], mode: CompletionMode) -> ThresholdCheck {
    mode.thresholds().check(issues, mode)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issues(counts: &[(Severity, usize)]) -> Vec<Issue> {
        counts.iter()
            .flat_map(|(sev, n)| (0..*n).map(move |i| Issue::new(*sev, format!("{} #{}", sev, i))))
            .collect()
    }

    #[test]
    fn test_mode_tables() {
        let strict = CompletionMode::Strict.thresholds();
        assert_eq!(strict.warning, Some(0));
        assert_eq!(strict.info, None);

        let standard = CompletionMode::Standard.thresholds();
        assert_eq!(standard.error, Some(0));
        assert_eq!(standard.warning, Some(3));

        let permissive = CompletionMode::Permissive.thresholds();
        assert_eq!(permissive.critical, Some(0));
        assert_eq!(permissive.error, Some(2));
        assert_eq!(permissive.warning, Some(10));
    }

    #[test]
    fn test_mode_from_str() {
        assert_eq!("STRICT".parse::<CompletionMode>().unwrap(), CompletionMode::Strict);
        let err = "lenient".parse::<CompletionMode>().unwrap_err();
        assert!(err.to_string().contains("strict, standard, permissive"));
    }

    #[test]
    fn test_no_issues_never_block() {
        for mode in [
            CompletionMode::Strict,
            CompletionMode::Standard,
            CompletionMode::Permissive,
        ] {
            let check = should_issues_block_completion(&[], mode);
            assert!(!check.blocking);
            assert_eq!(check.reason, "No issues remaining");
        }
    }

    #[test]
    fn test_standard_blocks_on_single_error() {
        let check = should_issues_block_completion(
            &issues(&[(Severity::Error, 1)]),
            CompletionMode::Standard,
        );
        assert!(check.blocking);
        assert_eq!(check.reason, "Issues exceed standard mode thresholds: ERROR:1>0");
    }

    #[test]
    fn test_standard_allows_three_warnings_but_not_four() {
        let three = issues(&[(Severity::Warning, 3)]);
        let four = issues(&[(Severity::Warning, 4)]);
        assert!(!should_issues_block_completion(&three, CompletionMode::Standard).blocking);
        assert!(should_issues_block_completion(&four, CompletionMode::Standard).blocking);
    }

    #[test]
    fn test_permissive_within_thresholds_reason() {
        let check = should_issues_block_completion(
            &issues(&[(Severity::Error, 2)]),
            CompletionMode::Permissive,
        );
        assert!(!check.blocking);
        assert_eq!(check.reason, "Issues within permissive mode thresholds: ERROR:2");
    }

    #[test]
    fn test_info_is_unlimited_everywhere() {
        let many = issues(&[(Severity::Info, 50)]);
        assert!(!should_issues_block_completion(&many, CompletionMode::Strict).blocking);
    }

    #[test]
    fn test_overrides_replace_single_limits() {
        let overrides = ThresholdOverrides {
            warning: Some(5),
            ..Default::default()
        };
        let t = CompletionMode::Standard.thresholds().with_overrides(&overrides);
        assert_eq!(t.warning, Some(5));
        assert_eq!(t.error, Some(0));
        let check = t.check(&issues(&[(Severity::Warning, 5)]), CompletionMode::Standard);
        assert!(!check.blocking);
    }
}
