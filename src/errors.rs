//! Typed error hierarchy for mender.
//!
//! One enum per failure surface of the repair loop:
//! - `CollaboratorError`: validator, fixer, QA and summarizer calls
//! - `GateRejection`: a candidate edit refused by the fix-validation gate
//! - `FixMemoryError`: an attempted overwrite of a remembered fix
//! - `StateError`: an update that would break a review state invariant
//! - `ConfigError`: an invalid configuration value
//! - `BatchError`: worker failures in the batch processor

use thiserror::Error;

/// Errors returned by external collaborators.
///
/// Only `Transient` is retried. `Schema` means the collaborator answered but
/// the answer could not be used, so asking again is pointless.
#[derive(Debug, Clone, Error)]
pub enum CollaboratorError {
    #[error("{collaborator} failed: {message}")]
    Transient {
        collaborator: String,
        message: String,
    },

    #[error("{collaborator} returned invalid output: {message}")]
    Schema {
        collaborator: String,
        message: String,
    },

    #[error("{collaborator} call cancelled")]
    Cancelled { collaborator: String },
}

impl CollaboratorError {
    pub fn transient(collaborator: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transient {
            collaborator: collaborator.into(),
            message: message.into(),
        }
    }

    pub fn schema(collaborator: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Schema {
            collaborator: collaborator.into(),
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    pub fn is_schema(&self) -> bool {
        matches!(self, Self::Schema { .. })
    }
}

/// Reasons the fix-validation gate refuses a candidate edit.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GateRejection {
    #[error("structural header no longer parses: {0}")]
    HeaderUnparseable(String),

    #[error("content shrank from {before} to {after} bytes")]
    ExcessiveShrink { before: usize, after: usize },

    #[error("required sections missing: {}", .0.join(", "))]
    MissingSections(Vec<String>),

    #[error("invalid encoding or control character introduced at byte {offset}")]
    InvalidEncoding { offset: usize },
}

/// Errors from the fix memory.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FixMemoryError {
    #[error(
        "field '{field}' was fixed in iteration {recorded_iteration}; \
         refusing overwrite from iteration {attempted_iteration}"
    )]
    StaleOverwrite {
        field: String,
        recorded_iteration: u32,
        attempted_iteration: u32,
    },
}

/// Attempts to break a [`ReviewState`](crate::orchestrator::state::ReviewState) invariant.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateError {
    #[error("review state is terminal; refusing further updates")]
    Terminal,

    #[error("iteration {attempted} exceeds the maximum of {max}")]
    IterationOverflow { attempted: u32, max: u32 },
}

/// Problems found while validating a loaded configuration.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("{field} must be at least {min}, got {value}")]
    TooSmall {
        field: &'static str,
        min: u64,
        value: u64,
    },

    #[error("{field} must be between {min} and {max}, got {value}")]
    OutOfRange {
        field: &'static str,
        min: f64,
        max: f64,
        value: f64,
    },

    #[error("{field} is enabled but agent.command is empty")]
    MissingAgentCommand { field: &'static str },
}

/// Errors from the batch worker pool.
#[derive(Debug, Error)]
pub enum BatchError {
    #[error("worker for document {document} panicked: {message}")]
    WorkerPanicked { document: String, message: String },

    #[error("failed to read document {}: {source}", path.display())]
    ReadFailed {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collaborator_error_transient_is_matchable() {
        let err = CollaboratorError::transient("fixer", "connection reset");
        match &err {
            CollaboratorError::Transient {
                collaborator,
                message,
            } => {
                assert_eq!(collaborator, "fixer");
                assert_eq!(message, "connection reset");
            }
            _ => panic!("Expected Transient variant"),
        }
        assert!(err.is_transient());
        assert!(!err.is_schema());
    }

    #[test]
    fn collaborator_error_schema_display_names_collaborator() {
        let err = CollaboratorError::schema("qa", "missing field `is_acceptable`");
        assert!(err.is_schema());
        assert_eq!(
            err.to_string(),
            "qa returned invalid output: missing field `is_acceptable`"
        );
    }

    #[test]
    fn gate_rejection_missing_sections_lists_names() {
        let err = GateRejection::MissingSections(vec!["Answer".into(), "References".into()]);
        assert_eq!(err.to_string(), "required sections missing: Answer, References");
    }

    #[test]
    fn gate_rejection_shrink_carries_sizes() {
        let err = GateRejection::ExcessiveShrink {
            before: 1000,
            after: 400,
        };
        match err {
            GateRejection::ExcessiveShrink { before, after } => {
                assert_eq!(before, 1000);
                assert_eq!(after, 400);
            }
            _ => panic!("Expected ExcessiveShrink"),
        }
    }

    #[test]
    fn fix_memory_error_mentions_both_iterations() {
        let err = FixMemoryError::StaleOverwrite {
            field: "updated".into(),
            recorded_iteration: 3,
            attempted_iteration: 2,
        };
        let msg = err.to_string();
        assert!(msg.contains("iteration 3"));
        assert!(msg.contains("iteration 2"));
    }

    #[test]
    fn config_error_names_field() {
        let err = ConfigError::TooSmall {
            field: "review.max_iterations",
            min: 1,
            value: 0,
        };
        assert_eq!(err.to_string(), "review.max_iterations must be at least 1, got 0");
    }

    #[test]
    fn batch_error_read_failed_carries_path() {
        use std::path::PathBuf;
        let path = PathBuf::from("/notes/q-001.md");
        let err = BatchError::ReadFailed {
            path: path.clone(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        };
        match &err {
            BatchError::ReadFailed { path: p, source } => {
                assert_eq!(p, &path);
                assert_eq!(source.kind(), std::io::ErrorKind::NotFound);
            }
            _ => panic!("Expected ReadFailed"),
        }
    }
}
