//! Oscillation detection over issue signature history.
//!
//! A signature oscillates when, for some window of three consecutive
//! snapshots `(N, N+1, N+2)`, it is present at `N`, absent at `N+1` and
//! present again at `N+2`: the fixer resolved it and then reintroduced it.
//!
//! ```
//! use std::collections::BTreeSet;
//! use mender::repair::oscillation::OscillationDetector;
//!
//! let a: BTreeSet<String> = ["ERROR:Missing section 'Answer'".to_string()].into();
//! let history = vec![a.clone(), BTreeSet::new(), a];
//! let report = OscillationDetector::new().detect(&history).expect("oscillation");
//! assert_eq!(report.signatures.len(), 1);
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::review::issue::Severity;

/// One oscillating signature and the first window it was seen in.
///
/// Iterations are 1-based: snapshot `i` belongs to iteration `i + 1`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OscillationWindow {
    pub signature: String,
    pub present: u32,
    pub absent: u32,
    pub reappeared: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OscillationReport {
    pub signatures: BTreeSet<String>,
    pub windows: Vec<OscillationWindow>,
    pub explanation: String,
}

/// Detects resolved issues that come back.
///
/// By default every signature is considered. [`Self::with_min_severity`]
/// restricts detection to signatures at or above a severity, e.g. only
/// ERROR and CRITICAL.
#[derive(Debug, Clone, Copy)]
pub struct OscillationDetector {
    min_severity: Severity,
}

impl Default for OscillationDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl OscillationDetector {
    pub fn new() -> Self {
        Self {
            min_severity: Severity::Info,
        }
    }

    pub fn with_min_severity(mut self, severity: Severity) -> Self {
        self.min_severity = severity;
        self
    }

    fn considered(&self, signature: &str) -> bool {
        match Severity::from_signature(signature) {
            Some(sev) => sev <= self.min_severity,
            None => true,
        }
    }

    /// Scan every window of `history`. Returns `None` when nothing oscillates.
    pub fn detect(&self, history: &[BTreeSet<String>]) -> Option<OscillationReport> {
        self.detect_from(history, 0)
    }

    /// Like [`Self::detect`] but only over snapshots at index `start` and later.
    pub fn detect_from(
        &self,
        history: &[BTreeSet<String>],
        start: usize,
    ) -> Option<OscillationReport> {
        if history.len() < start + 3 {
            return None;
        }

        let mut signatures = BTreeSet::new();
        let mut windows = Vec::new();
        for n in start..history.len() - 2 {
            let (first, gap, third) = (&history[n], &history[n + 1], &history[n + 2]);
            for sig in first.intersection(third) {
                if gap.contains(sig) || !self.considered(sig) {
                    continue;
                }
                if signatures.insert(sig.clone()) {
                    windows.push(OscillationWindow {
                        signature: sig.clone(),
                        present: n as u32 + 1,
                        absent: n as u32 + 2,
                        reappeared: n as u32 + 3,
                    });
                }
            }
        }

        if signatures.is_empty() {
            return None;
        }

        let details: Vec<String> = windows
            .iter()
            .map(|w| {
                format!(
                    "'{}' (present in iteration {}, resolved in {}, back in {})",
                    w.signature, w.present, w.absent, w.reappeared
                )
            })
            .collect();
        let explanation = format!(
            "{} issue(s) reappeared after being resolved: {}",
            signatures.len(),
            details.join("; ")
        );

        Some(OscillationReport {
            signatures,
            windows,
            explanation,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snap(sigs: &[&str]) -> BTreeSet<String> {
        sigs.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_needs_three_snapshots() {
        let history = vec![snap(&["ERROR:a"]), snap(&[])];
        assert!(OscillationDetector::new().detect(&history).is_none());
    }

    #[test]
    fn test_present_absent_present_is_oscillation() {
        let history = vec![snap(&["ERROR:a"]), snap(&[]), snap(&["ERROR:a"])];
        let report = OscillationDetector::new().detect(&history).unwrap();
        assert!(report.signatures.contains("ERROR:a"));
        assert_eq!(
            report.windows[0],
            OscillationWindow {
                signature: "ERROR:a".into(),
                present: 1,
                absent: 2,
                reappeared: 3,
            }
        );
        assert!(report.explanation.contains("back in 3"));
    }

    #[test]
    fn test_persistent_issue_is_not_oscillation() {
        let history = vec![snap(&["ERROR:a"]), snap(&["ERROR:a"]), snap(&["ERROR:a"])];
        assert!(OscillationDetector::new().detect(&history).is_none());
    }

    #[test]
    fn test_later_windows_are_scanned() {
        let history = vec![
            snap(&[]),
            snap(&["ERROR:b"]),
            snap(&["WARNING:c"]),
            snap(&["ERROR:b"]),
        ];
        let report = OscillationDetector::new().detect(&history).unwrap();
        assert_eq!(report.signatures, snap(&["ERROR:b"]));
        assert_eq!(report.windows[0].present, 2);
    }

    #[test]
    fn test_severity_filter_ignores_warnings() {
        let history = vec![snap(&["WARNING:w"]), snap(&[]), snap(&["WARNING:w"])];
        assert!(OscillationDetector::new().detect(&history).is_some());
        assert!(
            OscillationDetector::new()
                .with_min_severity(Severity::Error)
                .detect(&history)
                .is_none()
        );
    }

    #[test]
    fn test_detect_from_skips_earlier_windows() {
        let history = vec![
            snap(&["ERROR:a"]),
            snap(&[]),
            snap(&["ERROR:a"]),
            snap(&["ERROR:a"]),
        ];
        let detector = OscillationDetector::new();
        assert!(detector.detect(&history).is_some());
        assert!(detector.detect_from(&history, 1).is_none());
        assert!(detector.detect_from(&history, 3).is_none());
    }
}
