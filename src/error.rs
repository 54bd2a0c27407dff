//! Error types for streamline.
//!
//! Every error carries a stable code and belongs to one of three classes:
//! validation errors block the mutating operation, recoverable errors are
//! logged and execution continues, fatal errors halt the current instance.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for streamline operations.
pub type Result<T> = std::result::Result<T, Error>;

/// streamline error types.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Workflow error: {0}")]
    Workflow(String),

    #[error("Step error: {0}")]
    Step(String),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// How the engine treats an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Rejected input. Surfaced to the caller, nothing was mutated.
    Validation,
    /// Logged; the instance keeps going.
    Recoverable,
    /// Marks the step and instance `error` and halts advancement.
    Fatal,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorClass::Validation => write!(f, "validation"),
            ErrorClass::Recoverable => write!(f, "recoverable"),
            ErrorClass::Fatal => write!(f, "fatal"),
        }
    }
}

impl Error {
    /// Get the error code.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Workflow(_) => "WORKFLOW_ERROR",
            Error::Step(_) => "STEP_ERROR",
            Error::Execution(_) => "EXECUTION_ERROR",
            Error::Storage(_) => "STORAGE_ERROR",
            Error::Config(_) => "CONFIG_ERROR",
            Error::Parse(_) => "PARSE_ERROR",
            Error::Validation(_) => "VALIDATION_ERROR",
            Error::Timeout(_) => "TIMEOUT",
            Error::Internal(_) => "INTERNAL_ERROR",
            Error::Http(_) => "HTTP_ERROR",
            Error::Database(_) => "DATABASE_ERROR",
            Error::Yaml(_) => "YAML_ERROR",
            Error::Json(_) => "JSON_ERROR",
            Error::Io(_) => "IO_ERROR",
        }
    }

    /// Classify the error for the executor and the scheduler.
    ///
    /// Input problems are validation errors. Network failures are
    /// recoverable on their own; the executor escalates them to fatal when
    /// they happen inside a synchronous step.
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::Validation(_) | Error::Parse(_) | Error::Yaml(_) | Error::Json(_) => {
                ErrorClass::Validation
            }
            Error::Http(_) | Error::Timeout(_) => ErrorClass::Recoverable,
            Error::Workflow(_)
            | Error::Step(_)
            | Error::Execution(_)
            | Error::Storage(_)
            | Error::Config(_)
            | Error::Internal(_)
            | Error::Database(_)
            | Error::Io(_) => ErrorClass::Fatal,
        }
    }

    /// Get a sanitized error message safe for external consumers.
    pub fn external_message(&self) -> String {
        match self {
            Error::Workflow(msg) => format!("Workflow error: {}", msg),
            Error::Step(msg) => format!("Step error: {}", msg),
            Error::Execution(msg) => format!("Execution error: {}", msg),
            Error::Config(msg) => format!("Configuration error: {}", msg),
            Error::Parse(msg) => format!("Parse error: {}", msg),
            Error::Validation(msg) => format!("Validation error: {}", msg),
            Error::Timeout(msg) => format!("Timeout: {}", msg),

            // Internal errors - sanitize to avoid leaking details
            Error::Storage(_) => "A storage error occurred".to_string(),
            Error::Internal(_) => "An internal error occurred".to_string(),
            Error::Database(_) => "A database error occurred".to_string(),
            Error::Io(_) => "An I/O error occurred".to_string(),

            Error::Http(e) => {
                if let Some(status) = e.status() {
                    format!("HTTP request failed with status {}", status.as_u16())
                } else if e.is_timeout() {
                    "HTTP request timed out".to_string()
                } else if e.is_connect() {
                    "Failed to connect to remote server".to_string()
                } else {
                    "HTTP request failed".to_string()
                }
            }

            Error::Yaml(_) => "Invalid YAML format".to_string(),
            Error::Json(_) => "Invalid JSON format".to_string(),
        }
    }

    /// Convert to a JSON error body (includes full error details).
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "success": false,
            "error": {
                "code": self.code(),
                "class": self.class(),
                "message": self.to_string(),
            }
        })
    }
}

/// Error record attached to a halted step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepFailure {
    pub code: String,
    pub message: String,
    pub step_id: String,
}

impl StepFailure {
    pub fn new(step_id: &str, error: &Error) -> Self {
        Self {
            code: error.code().to_string(),
            message: error.to_string(),
            step_id: step_id.to_string(),
        }
    }
}

impl std::fmt::Display for StepFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] step '{}': {}", self.code, self.step_id, self.message)
    }
}
