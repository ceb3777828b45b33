//! Per-iteration issue signature snapshots.
//!
//! Each validation pass records the set of issue signatures it found.
//! Snapshot `i` belongs to iteration `i + 1`, so the tracker length always
//! equals the number of completed validation passes.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use crate::review::issue::{Issue, signatures};

/// Direction the issue count is moving in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConvergenceTrend {
    /// Fewer than two snapshots.
    Unknown,
    Improving,
    Stalled,
    Worsening,
}

impl fmt::Display for ConvergenceTrend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => write!(f, "unknown"),
            Self::Improving => write!(f, "improving"),
            Self::Stalled => write!(f, "stalled"),
            Self::Worsening => write!(f, "worsening"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConvergenceTracker {
    snapshots: Vec<BTreeSet<String>>,
}

impl ConvergenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, issues: &[Issue]) {
        self.snapshots.push(signatures(issues));
    }

    pub fn record_signatures(&mut self, snapshot: BTreeSet<String>) {
        self.snapshots.push(snapshot);
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    pub fn snapshots(&self) -> &[BTreeSet<String>] {
        &self.snapshots
    }

    pub fn last(&self) -> Option<&BTreeSet<String>> {
        self.snapshots.last()
    }

    pub fn previous(&self) -> Option<&BTreeSet<String>> {
        self.snapshots.iter().rev().nth(1)
    }

    /// Signatures present in the previous snapshot but gone from the last one.
    pub fn resolved_last_iteration(&self) -> BTreeSet<String> {
        match (self.previous(), self.last()) {
            (Some(prev), Some(last)) => prev.difference(last).cloned().collect(),
            _ => BTreeSet::new(),
        }
    }

    /// Signatures in the last snapshot that were absent from the previous one.
    pub fn introduced_last_iteration(&self) -> BTreeSet<String> {
        match (self.previous(), self.last()) {
            (Some(prev), Some(last)) => last.difference(prev).cloned().collect(),
            (None, Some(last)) => last.clone(),
            _ => BTreeSet::new(),
        }
    }

    /// Compare the last two snapshot sizes.
    pub fn trend(&self) -> ConvergenceTrend {
        match (self.previous(), self.last()) {
            (Some(prev), Some(last)) => match last.len().cmp(&prev.len()) {
                std::cmp::Ordering::Less => ConvergenceTrend::Improving,
                std::cmp::Ordering::Equal => ConvergenceTrend::Stalled,
                std::cmp::Ordering::Greater => ConvergenceTrend::Worsening,
            },
            _ => ConvergenceTrend::Unknown,
        }
    }

    /// True when the last `window` snapshots are identical and non-empty.
    pub fn is_stalled(&self, window: usize) -> bool {
        if window < 2 || self.snapshots.len() < window {
            return false;
        }
        let tail = &self.snapshots[self.snapshots.len() - window..];
        !tail[0].is_empty() && tail.iter().all(|s| *s == tail[0])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(rounds: &[&[Issue]]) -> ConvergenceTracker {
        let mut t = ConvergenceTracker::new();
        for issues in rounds {
            t.record(issues);
        }
        t
    }

    #[test]
    fn test_empty_tracker() {
        let t = ConvergenceTracker::new();
        assert!(t.is_empty());
        assert_eq!(t.trend(), ConvergenceTrend::Unknown);
        assert!(t.resolved_last_iteration().is_empty());
    }

    #[test]
    fn test_trend_follows_issue_counts() {
        let a = Issue::error("a");
        let b = Issue::error("b");
        let improving = tracker(&[&[a.clone(), b.clone()], &[a.clone()]]);
        assert_eq!(improving.trend(), ConvergenceTrend::Improving);

        let worsening = tracker(&[&[a.clone()], &[a.clone(), b.clone()]]);
        assert_eq!(worsening.trend(), ConvergenceTrend::Worsening);

        let stalled = tracker(&[&[a.clone()], &[b.clone()]]);
        assert_eq!(stalled.trend(), ConvergenceTrend::Stalled);
    }

    #[test]
    fn test_resolved_and_introduced() {
        let t = tracker(&[
            &[Issue::error("a"), Issue::warning("b")],
            &[Issue::warning("b"), Issue::info("c")],
        ]);
        assert_eq!(
            t.resolved_last_iteration().into_iter().collect::<Vec<_>>(),
            vec!["ERROR:a".to_string()]
        );
        assert_eq!(
            t.introduced_last_iteration().into_iter().collect::<Vec<_>>(),
            vec!["INFO:c".to_string()]
        );
    }

    #[test]
    fn test_stall_requires_identical_non_empty_tail() {
        let a = Issue::error("a");
        let t = tracker(&[&[], &[a.clone()], &[a.clone()], &[a.clone()]]);
        assert!(t.is_stalled(3));
        assert!(!t.is_stalled(4));

        let clean = tracker(&[&[], &[], &[]]);
        assert!(!clean.is_stalled(3));
    }

    #[test]
    fn test_serializes_as_plain_list() {
        let t = tracker(&[&[Issue::error("a")]]);
        assert_eq!(serde_json::to_string(&t).unwrap(), r#"[["ERROR:a"]]"#);
    }
}
