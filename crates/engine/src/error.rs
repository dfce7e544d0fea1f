//! Error types for the resource engine
//!
//! Registration errors are raised synchronously at startup; query, mutation
//! and subscription errors carry enough context (resource, step, hook) to
//! identify where they came from.

use resource_schema::ValidationErrors;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Error type returned by user-supplied hooks and computed fields
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Error, Debug, Clone)]
pub enum EngineError {
    #[error("Invalid resource definition '{resource}': {message}")]
    Registration { resource: String, message: String },

    #[error("Resource '{0}' is already registered")]
    DuplicateResource(String),

    #[error("Unresolved relationship targets: {}", .0.join(", "))]
    UnresolvedRelationships(Vec<String>),

    #[error("Unknown resource '{0}'")]
    UnknownResource(String),

    #[error("Unknown relationship '{relationship}' on resource '{resource}'")]
    UnknownRelationship {
        resource: String,
        relationship: String,
    },

    #[error("Invalid query: {0}")]
    Query(String),

    #[error("Validation failed for '{resource}': {errors}")]
    Validation {
        resource: String,
        errors: ValidationErrors,
    },

    #[error("{resource} '{id}' not found")]
    NotFound { resource: String, id: String },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Hook '{hook}' on '{resource}' failed: {message}")]
    Hook {
        resource: String,
        hook: String,
        message: String,
    },

    #[error("Computed field '{field}' on '{resource}' failed: {message}")]
    Computed {
        resource: String,
        field: String,
        message: String,
    },

    #[error("Step {index} ({resource}) failed: {message}")]
    StepFailed {
        index: usize,
        resource: String,
        message: String,
    },

    #[error("Step {index} aborted: dependency step {dependency} did not complete")]
    StepAborted { index: usize, dependency: usize },

    #[error("Step {index} timed out after {timeout:?}")]
    Timeout { index: usize, timeout: Duration },

    #[error("Event bus error: {0}")]
    Event(String),

    #[error("Subscription error: {0}")]
    Subscription(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl EngineError {
    pub fn registration(resource: &str, message: impl Into<String>) -> Self {
        Self::Registration {
            resource: resource.to_string(),
            message: message.into(),
        }
    }

    pub fn not_found(resource: &str, id: &str) -> Self {
        Self::NotFound {
            resource: resource.to_string(),
            id: id.to_string(),
        }
    }

    pub fn validation(resource: &str, errors: ValidationErrors) -> Self {
        Self::Validation {
            resource: resource.to_string(),
            errors,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unresolved_lists_every_target() {
        let err = EngineError::UnresolvedRelationships(vec![
            "message.conversation -> conversation".to_string(),
            "message.attachments -> attachment".to_string(),
        ]);
        let rendered = err.to_string();
        assert!(rendered.contains("conversation"));
        assert!(rendered.contains("attachment"));
    }

    #[test]
    fn test_step_errors_identify_step() {
        let err = EngineError::StepFailed {
            index: 2,
            resource: "comment".to_string(),
            message: "connection reset".to_string(),
        };
        assert_eq!(err.to_string(), "Step 2 (comment) failed: connection reset");
    }
}
