//! Error types for Browsecast Core
//!
//! This module defines the closed error taxonomy used throughout the crate.
//! Every failure surfaces as a machine-readable [`ErrorCode`] grouped into a
//! handling class; the class decides retry behavior and HTTP status mapping.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Machine-readable error codes, wire-stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Validation
    MalformedEnvelope,
    UnknownActionType,
    InvalidParams,
    PresignedUrlExpired,
    // Resolution
    ElementNotFound,
    ElementIndexStale,
    AmbiguousSelector,
    // Execution, transient
    DriverTemporarilyUnavailable,
    NetworkFlap,
    StreamUnavailable,
    // Execution, permanent
    NavigationFailed,
    SubmissionRejected,
    FileUploadFailed,
    ActionTimeout,
    // Session
    SessionNotFound,
    SessionAlreadyExists,
    SessionClosed,
    DriverCrashed,
    // Sequence
    SequenceGap,
    DuplicateCommand,
    // Workflow
    SchemaValidationFailed,
    IdempotencyConflict,
    CheckpointResume,
    // Lookup / infrastructure
    NotFound,
    FeatureDisabled,
    Internal,
}

impl ErrorCode {
    /// Whether a caller may retry the same request verbatim.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            Self::DriverTemporarilyUnavailable | Self::NetworkFlap | Self::StreamUnavailable
        )
    }

    /// HTTP status the gateway maps this code to.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::MalformedEnvelope
            | Self::UnknownActionType
            | Self::InvalidParams
            | Self::SchemaValidationFailed
            | Self::SequenceGap
            | Self::DuplicateCommand => 400,
            Self::PresignedUrlExpired => 410,
            Self::ElementNotFound
            | Self::SessionNotFound
            | Self::NotFound => 404,
            Self::SessionAlreadyExists | Self::IdempotencyConflict => 409,
            Self::FileUploadFailed => 502,
            Self::FeatureDisabled => 503,
            Self::DriverTemporarilyUnavailable
            | Self::NetworkFlap
            | Self::StreamUnavailable => 503,
            _ => 500,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = serde_json::to_string(self).unwrap_or_default();
        write!(f, "{}", s.trim_matches('"'))
    }
}

/// Handling class for an error: decides local recovery vs. surfacing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Validation,
    Resolution,
    Transient,
    Permanent,
    Session,
    Sequence,
    Workflow,
    Internal,
}

/// Main error type for Browsecast Core
#[derive(Error, Debug)]
pub enum Error {
    /// Rejected at the system boundary; never retried
    #[error("Validation error [{code}]: {message}")]
    Validation { code: ErrorCode, message: String },

    /// Target element could not be resolved; caller may refresh and retry
    #[error("Resolution error [{code}]: {message}")]
    Resolution { code: ErrorCode, message: String },

    /// Transient execution failure; retried with backoff
    #[error("Transient error [{code}]: {message}")]
    Transient { code: ErrorCode, message: String },

    /// Permanent execution failure; reported, not retried
    #[error("Permanent error [{code}]: {message}")]
    Permanent { code: ErrorCode, message: String },

    /// Session lifecycle errors
    #[error("Session error [{code}]: {message}")]
    Session { code: ErrorCode, message: String },

    /// Sequencing errors on the command stream
    #[error("Sequence error [{code}]: {message}")]
    Sequence { code: ErrorCode, message: String },

    /// Workflow/activity errors
    #[error("Workflow error [{code}]: {message}")]
    Workflow { code: ErrorCode, message: String },

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// HTTP request errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Create a validation error
    pub fn validation(code: ErrorCode, msg: impl Into<String>) -> Self {
        Self::Validation { code, message: msg.into() }
    }

    /// Create a resolution error
    pub fn resolution(code: ErrorCode, msg: impl Into<String>) -> Self {
        Self::Resolution { code, message: msg.into() }
    }

    /// Create a transient execution error
    pub fn transient(code: ErrorCode, msg: impl Into<String>) -> Self {
        Self::Transient { code, message: msg.into() }
    }

    /// Create a permanent execution error
    pub fn permanent(code: ErrorCode, msg: impl Into<String>) -> Self {
        Self::Permanent { code, message: msg.into() }
    }

    /// Create a session error
    pub fn session(code: ErrorCode, msg: impl Into<String>) -> Self {
        Self::Session { code, message: msg.into() }
    }

    /// Create a sequence error
    pub fn sequence(code: ErrorCode, msg: impl Into<String>) -> Self {
        Self::Sequence { code, message: msg.into() }
    }

    /// Create a workflow error
    pub fn workflow(code: ErrorCode, msg: impl Into<String>) -> Self {
        Self::Workflow { code, message: msg.into() }
    }

    /// Create an invalid-params validation error
    pub fn invalid_params(msg: impl Into<String>) -> Self {
        Self::validation(ErrorCode::InvalidParams, msg)
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Permanent { code: ErrorCode::Internal, message: msg.into() }
    }

    /// The machine-readable code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Validation { code, .. }
            | Self::Resolution { code, .. }
            | Self::Transient { code, .. }
            | Self::Permanent { code, .. }
            | Self::Session { code, .. }
            | Self::Sequence { code, .. }
            | Self::Workflow { code, .. } => *code,
            Self::Serialization(_) | Self::Yaml(_) => ErrorCode::MalformedEnvelope,
            Self::Http(_) => ErrorCode::NetworkFlap,
            Self::Io(_) => ErrorCode::Internal,
            Self::WithContext { source, .. } => source.code(),
        }
    }

    /// The handling class for this error.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Validation { .. } => ErrorClass::Validation,
            Self::Resolution { .. } => ErrorClass::Resolution,
            Self::Transient { .. } => ErrorClass::Transient,
            Self::Permanent { .. } => ErrorClass::Permanent,
            Self::Session { .. } => ErrorClass::Session,
            Self::Sequence { .. } => ErrorClass::Sequence,
            Self::Workflow { .. } => ErrorClass::Workflow,
            Self::Serialization(_) | Self::Yaml(_) => ErrorClass::Validation,
            Self::Http(_) => ErrorClass::Transient,
            Self::Io(_) => ErrorClass::Internal,
            Self::WithContext { source, .. } => source.class(),
        }
    }

    /// Whether retrying the same operation may succeed.
    pub fn retryable(&self) -> bool {
        self.code().retryable()
    }

    /// HTTP status for the gateway surface.
    pub fn http_status(&self) -> u16 {
        self.code().http_status()
    }

    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        Self::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Wire-shaped error body for RPC envelopes.
    pub fn to_body(&self) -> ErrorBody {
        ErrorBody {
            code: self.code(),
            message: self.to_string(),
            retryable: self.retryable(),
        }
    }
}

/// Structured error payload returned by RPC and REST surfaces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Machine-readable code
    pub code: ErrorCode,
    /// Human-readable message
    pub message: String,
    /// Whether the caller may retry verbatim
    pub retryable: bool,
}

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error
    fn context(self, context: impl Into<String>) -> Result<T>;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.with_context(context))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::session(ErrorCode::SessionNotFound, "room demo");
        assert!(err.to_string().contains("SESSION_NOT_FOUND"));
        assert!(err.to_string().contains("room demo"));
    }

    #[test]
    fn test_error_with_context() {
        let err = Error::invalid_params("missing index").with_context("execute_action");
        assert!(err.to_string().contains("execute_action"));
        assert_eq!(err.code(), ErrorCode::InvalidParams);
    }

    #[test]
    fn test_retryable_classes() {
        assert!(Error::transient(ErrorCode::NetworkFlap, "flap").retryable());
        assert!(!Error::permanent(ErrorCode::NavigationFailed, "nope").retryable());
        assert!(!Error::validation(ErrorCode::InvalidParams, "bad").retryable());
    }

    #[test]
    fn test_http_status_mapping() {
        assert_eq!(ErrorCode::InvalidParams.http_status(), 400);
        assert_eq!(ErrorCode::NotFound.http_status(), 404);
        assert_eq!(ErrorCode::PresignedUrlExpired.http_status(), 410);
        assert_eq!(ErrorCode::FileUploadFailed.http_status(), 502);
        assert_eq!(ErrorCode::FeatureDisabled.http_status(), 503);
    }

    #[test]
    fn test_error_body() {
        let body = Error::transient(ErrorCode::StreamUnavailable, "down").to_body();
        assert_eq!(body.code, ErrorCode::StreamUnavailable);
        assert!(body.retryable);
    }
}
