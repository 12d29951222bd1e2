//! Error types for the bounded executor
//!
//! Provides structured error handling with:
//! - Numeric error codes for machine parsing
//! - User-friendly messages with suggestions
//! - A submission error that hands the rejected task back to the caller

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for executor operations
pub type Result<T> = std::result::Result<T, Error>;

/// Numeric error codes for machine parsing and documentation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    // Configuration errors (1xx)
    ConfigNotFound = 100,
    ConfigParseError = 101,
    ConfigValidation = 102,

    // IO errors (2xx)
    IoRead = 200,
    IoPermission = 201,

    // Executor errors (3xx)
    ExecutorClosed = 300,

    // Logging errors (4xx)
    LoggingInit = 400,
}

impl ErrorCode {
    /// Get the string code (e.g., "E100")
    pub fn as_str(&self) -> String {
        format!("E{}", *self as u16)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Main error type for the executor crate
#[derive(Error, Debug)]
pub enum Error {
    // ─────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────

    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    ConfigNotFound {
        path: PathBuf,
        #[source]
        source: Option<std::io::Error>,
    },

    /// Configuration parse error
    #[error("Failed to parse configuration: {message}")]
    ConfigParse {
        message: String,
        #[source]
        source: Option<toml::de::Error>,
    },

    /// Configuration validation error
    #[error("Configuration validation failed: {message}")]
    ConfigValidation { message: String, field: Option<String> },

    // ─────────────────────────────────────────────────────────────
    // IO Errors
    // ─────────────────────────────────────────────────────────────

    /// Configuration file exists but could not be read
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // ─────────────────────────────────────────────────────────────
    // Executor Errors
    // ─────────────────────────────────────────────────────────────

    /// The executor was shut down and no longer accepts tasks
    #[error("Executor is shut down and no longer accepts tasks")]
    ExecutorClosed,

    // ─────────────────────────────────────────────────────────────
    // Logging Errors
    // ─────────────────────────────────────────────────────────────

    /// Logging subscriber could not be installed
    #[error("Logging error: {0}")]
    Logging(String),
}

impl Error {
    // ─────────────────────────────────────────────────────────────
    // Error Classification
    // ─────────────────────────────────────────────────────────────

    /// Get the numeric error code
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::ConfigNotFound { .. } => ErrorCode::ConfigNotFound,
            Error::ConfigParse { .. } => ErrorCode::ConfigParseError,
            Error::ConfigValidation { .. } => ErrorCode::ConfigValidation,

            Error::Io(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                ErrorCode::IoPermission
            }
            Error::Io(_) => ErrorCode::IoRead,

            Error::ExecutorClosed => ErrorCode::ExecutorClosed,
            Error::Logging(_) => ErrorCode::LoggingInit,
        }
    }

    /// Check if the error is fatal (the embedding application cannot continue)
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::ConfigNotFound { .. }
                | Error::ConfigParse { .. }
                | Error::ConfigValidation { .. }
                | Error::Io(_)
        )
    }

    /// Get a user-friendly suggestion for how to fix this error
    pub fn suggestion(&self) -> Option<&'static str> {
        match self {
            Error::ConfigNotFound { .. } => Some(
                "Pass an existing path or write one from bounded_executor::config::default_config_toml().",
            ),
            Error::ConfigParse { .. } => Some("Check your configuration file for TOML syntax errors."),
            Error::ConfigValidation { .. } => Some(
                "Review the configuration file and fix the invalid values. capacity must be at least 1.",
            ),
            Error::Io(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                Some("Check the permissions of the configuration file.")
            }
            Error::Io(_) => Some("Make sure the configuration path points to a regular, readable file."),
            Error::ExecutorClosed => Some(
                "The executor was shut down. Create a new executor to keep submitting tasks.",
            ),
            Error::Logging(_) => Some(
                "A global tracing subscriber is probably already installed. Initialize logging only once.",
            ),
        }
    }

    /// Format the error for logging (no colors)
    pub fn format_for_log(&self) -> String {
        format!("[{}] {}", self.code().as_str(), self)
    }

    /// Create a config not found error
    pub fn config_not_found(path: impl Into<PathBuf>) -> Self {
        Error::ConfigNotFound {
            path: path.into(),
            source: None,
        }
    }

    /// Create a config validation error with field name
    pub fn config_field_invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Error::ConfigValidation {
            message: message.into(),
            field: Some(field.into()),
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Submission Error
// ─────────────────────────────────────────────────────────────────

/// Returned by a submission made after the executor was shut down.
///
/// Carries the rejected task so the caller can retry it elsewhere.
#[derive(PartialEq, Eq, Clone, Copy)]
pub struct SubmitError<T>(pub T);

impl<T> SubmitError<T> {
    /// Take back the task that could not be submitted
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> fmt::Debug for SubmitError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubmitError").finish_non_exhaustive()
    }
}

impl<T> fmt::Display for SubmitError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "submission to a closed executor")
    }
}

impl<T> std::error::Error for SubmitError<T> {}

impl<T> From<SubmitError<T>> for Error {
    fn from(_: SubmitError<T>) -> Self {
        Error::ExecutorClosed
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
