//! Error types for virtbench.
//!
//! A single error enum covers control-plane calls, configuration, template
//! rendering and result persistence. Control-plane messages are kept verbatim
//! so that the retry engine can match them against its pattern vocabulary.

use std::borrow::Cow;
use std::path::PathBuf;
use thiserror::Error;

use crate::retry::RetryPolicy;

/// Result type alias for virtbench operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The main error type for virtbench.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Control Plane Errors
    // ========================================================================
    /// A control-plane call failed.
    #[error("{operation} failed for '{target}': {message}")]
    ControlPlane {
        /// Operation name (create, status, migrate, ...)
        operation: String,
        /// Target the call was made for
        target: String,
        /// Message reported by the control plane
        message: String,
    },

    /// The control plane answered with something we could not interpret.
    #[error("Unexpected response for '{target}': {message}")]
    UnexpectedResponse {
        /// Target the call was made for
        target: String,
        /// Error message
        message: String,
    },

    /// The operation is not supported by this controller.
    #[error("Operation '{0}' is not supported by this controller")]
    Unsupported(String),

    // ========================================================================
    // Lifecycle Errors
    // ========================================================================
    /// Retries were exhausted or a fatal error was returned.
    #[error("'{operation}' gave up after {attempts} attempt(s): {message}")]
    RetryExhausted {
        /// Operation label
        operation: String,
        /// Attempts performed
        attempts: u32,
        /// Last observed error
        message: String,
    },

    /// The run was cancelled.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid configuration value.
    #[error("Invalid configuration value for '{key}': {message}")]
    InvalidConfig {
        /// Configuration key
        key: String,
        /// Error message
        message: String,
    },

    /// Invalid argument supplied by the caller.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    // ========================================================================
    // Template Errors
    // ========================================================================
    /// Template rendering error.
    #[error("Template rendering failed for '{template}': {message}")]
    TemplateRender {
        /// Template name or path
        template: String,
        /// Error message
        message: String,
    },

    /// Template error.
    #[error("Template error: {0}")]
    Template(#[from] minijinja::Error),

    // ========================================================================
    // IO Errors
    // ========================================================================
    /// File not found.
    #[error("File not found: {0}")]
    FileNotFound(PathBuf),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // ========================================================================
    // Serialization Errors
    // ========================================================================
    /// YAML parsing error.
    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    /// JSON parsing error.
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    /// CSV output error.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    // ========================================================================
    // Other Errors
    // ========================================================================
    /// Generic error with source.
    #[error("{message}")]
    Other {
        /// Error message
        message: String,
        /// Source error
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl Error {
    /// Creates a new control-plane error.
    pub fn control_plane(
        operation: impl Into<String>,
        target: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::ControlPlane {
            operation: operation.into(),
            target: target.into(),
            message: message.into(),
        }
    }

    /// Creates a new unexpected-response error.
    pub fn unexpected(target: impl Into<String>, message: impl Into<String>) -> Self {
        Self::UnexpectedResponse {
            target: target.into(),
            message: message.into(),
        }
    }

    /// Creates a new template render error.
    pub fn template_render(template: impl Into<String>, message: impl Into<String>) -> Self {
        Self::TemplateRender {
            template: template.into(),
            message: message.into(),
        }
    }

    /// The part of the error the control plane produced, without the
    /// operation and target that [`Display`](std::fmt::Display) adds.
    pub fn retry_message(&self) -> Cow<'_, str> {
        match self {
            Error::ControlPlane { message, .. } | Error::UnexpectedResponse { message, .. } => {
                Cow::Borrowed(message.as_str())
            }
            other => Cow::Owned(other.to_string()),
        }
    }

    /// Returns true if this error is worth retrying under `policy`.
    ///
    /// Only the control-plane message is matched, so resource names never
    /// influence the classification.
    pub fn is_transient(&self, policy: &RetryPolicy) -> bool {
        match self {
            Error::ControlPlane { message, .. } => policy.is_retryable(message),
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
            ),
            _ => false,
        }
    }

    /// Returns the error code for CLI exit status.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Config(_) | Error::InvalidConfig { .. } | Error::InvalidArgument(_) => 2,
            Error::TemplateRender { .. } | Error::Template(_) => 2,
            Error::Cancelled(_) => 130,
            _ => 1,
        }
    }
}

/// Extension trait for adding context to errors.
pub trait ErrorContext<T> {
    /// Adds context to an error.
    fn context(self, message: impl Into<String>) -> Result<T>;

    /// Adds context with a closure that is only evaluated on error.
    fn with_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.map_err(|e| Error::Other {
            message: message.into(),
            source: Some(Box::new(e)),
        })
    }

    fn with_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>,
    {
        self.map_err(|e| Error::Other {
            message: f().into(),
            source: Some(Box::new(e)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_plane_message_is_kept_verbatim() {
        let err = Error::control_plane(
            "create",
            "bench-1/vm-1",
            "Internal error occurred: failed calling webhook",
        );
        assert_eq!(
            err.to_string(),
            "create failed for 'bench-1/vm-1': Internal error occurred: failed calling webhook"
        );
        assert!(err.is_transient(&RetryPolicy::default()));
    }

    #[test]
    fn forbidden_is_not_transient() {
        let err = Error::control_plane("create", "bench-1/vm-1", "forbidden: user cannot create");
        assert!(!err.is_transient(&RetryPolicy::default()));
    }

    #[test]
    fn target_name_does_not_make_error_transient() {
        let err = Error::control_plane("create", "timeout-lab-1/rhel-9-vm", "forbidden: quota exceeded");
        assert_eq!(err.retry_message(), "forbidden: quota exceeded");
        assert!(!err.is_transient(&RetryPolicy::default()));
    }

    #[test]
    fn policy_patterns_extend_transient_vocabulary() {
        let policy = RetryPolicy::builder().add_retryable_pattern("quota exceeded").build();
        let err = Error::control_plane("create", "bench-1/vm-1", "forbidden: Quota Exceeded");
        assert!(err.is_transient(&policy));
        assert!(!err.is_transient(&RetryPolicy::default()));
    }

    #[test]
    fn retry_message_falls_back_to_display() {
        let err = Error::Unsupported("snapshot".into());
        assert_eq!(err.retry_message(), err.to_string());
    }

    #[test]
    fn exit_codes() {
        assert_eq!(Error::Config("bad".into()).exit_code(), 2);
        assert_eq!(Error::Cancelled("ctrl-c".into()).exit_code(), 130);
        assert_eq!(Error::Unsupported("snapshot".into()).exit_code(), 1);
    }

    #[test]
    fn context_wraps_source() {
        let io: std::result::Result<(), std::io::Error> =
            Err(std::io::Error::new(std::io::ErrorKind::NotFound, "missing"));
        let err = io.context("reading template").unwrap_err();
        assert_eq!(err.to_string(), "reading template");
        assert!(std::error::Error::source(&err).is_some());
    }
}
