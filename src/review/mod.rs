//! Judging a document's state: what is wrong with it, when it is good
//! enough, and what the loop should do next.
//!
//! ## Components
//!
//! - [`issue`]: issues, severities and signatures
//! - [`completion`]: completion modes and per-severity thresholds
//! - [`decision`]: the ordered rules that pick the next step
//!
//! ## Example
//!
//! ```
//! use mender::review::{CompletionMode, Issue};
//!
//! let issues = vec![Issue::warning("Section 'Notes' is empty")];
//! let check = CompletionMode::Standard.thresholds().check(&issues, CompletionMode::Standard);
//! assert!(!check.blocking);
//!
//! let issues = vec![Issue::error("Missing required field 'title'")];
//! let check = CompletionMode::Standard.thresholds().check(&issues, CompletionMode::Standard);
//! assert!(check.blocking);
//! ```

pub mod completion;
pub mod decision;
pub mod issue;

pub use completion::{CompletionMode, SeverityThresholds, ThresholdOverrides};
pub use decision::{Decision, DecisionContext, DecisionOutcome, decide};
pub use issue::{Issue, IssueCounts, Severity};
