//! The machinery the loop uses to make progress and to notice when it is not.
//!
//! - [`convergence`]: issue-signature history and trend
//! - [`oscillation`]: detects issues that keep coming back
//! - [`fix_memory`]: header values already fixed, and regressions against them
//! - [`deterministic`]: rule-based fixes that need no collaborator
//! - [`selector`]: which validators must rerun after an edit
//! - [`gate`]: rejects or repairs destructive edits
//! - [`rescue`]: one-shot mechanical repair when the loop oscillates

pub mod convergence;
pub mod deterministic;
pub mod fix_memory;
pub mod gate;
pub mod oscillation;
pub mod rescue;
pub mod selector;
