use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Classification of a [`Diagnostic`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiagnosticKind {
    /// The source could not be parsed
    SyntaxError,
    /// The source uses a construct that could escape the sandbox
    SecurityViolation,
    /// The script threw a value nobody caught
    RuntimeThrow,
    /// The script did not finish within its wall-clock budget
    Timeout,
}

/// A structured validation or runtime error with location and message.
///
/// Lines and columns are 1-indexed. Runtime diagnostics may not know their
/// location, in which case both are `None`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    pub message: String,
    pub line: Option<u32>,
    pub column: Option<u32>,
}

impl Diagnostic {
    pub fn syntax(message: impl Into<String>, line: u32, column: u32) -> Self {
        Self {
            kind: DiagnosticKind::SyntaxError,
            message: message.into(),
            line: Some(line),
            column: Some(column),
        }
    }

    pub fn security(message: impl Into<String>, line: u32, column: u32) -> Self {
        Self {
            kind: DiagnosticKind::SecurityViolation,
            message: message.into(),
            line: Some(line),
            column: Some(column),
        }
    }

    pub fn runtime_throw(
        message: impl Into<String>,
        line: Option<u32>,
        column: Option<u32>,
    ) -> Self {
        Self {
            kind: DiagnosticKind::RuntimeThrow,
            message: message.into(),
            line,
            column,
        }
    }

    pub fn timeout(timeout_ms: u64) -> Self {
        Self {
            kind: DiagnosticKind::Timeout,
            message: format!("Script execution timed out after {}ms", timeout_ms),
            line: None,
            column: None,
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.line, self.column) {
            (Some(line), Some(column)) => write!(f, "[{}:{}]: {}", line, column, self.message),
            _ => f.write_str(&self.message),
        }
    }
}

/// Errors produced while validating, running, storing or dispatching
/// preflight scripts.
#[derive(Debug, Error)]
pub enum PreflightError {
    #[error("{0}")]
    Syntax(Diagnostic),

    #[error("{0}")]
    SecurityViolation(Diagnostic),

    #[error("Source code is too long: {actual} characters (max {max})")]
    SourceTooLong { actual: usize, max: usize },

    #[error("{name}: {message}")]
    RuntimeThrow { name: String, message: String },

    #[error("Script execution timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("InvalidValueKind: environment value for '{key}' must be a string, number, boolean or null (got {kind})")]
    InvalidValueKind { key: String, kind: String },

    #[error("Actor '{actor_id}' is not allowed to modify the preflight script of target '{target_id}'")]
    Unauthorized { actor_id: String, target_id: String },

    #[error("Concurrent save collided for target '{target_id}'")]
    PersistenceConflict { target_id: String },

    #[error("Persistence error: {message}")]
    Persistence { message: String },

    #[error("Script engine error: {message}")]
    Engine { message: String },

    #[error("Request dispatch failed: {message}")]
    Dispatch { message: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Script run was cancelled")]
    Cancelled,
}

pub type PreflightResult<T> = Result<T, PreflightError>;

impl PreflightError {
    /// Wrap analyzer output, keeping the first diagnostic as the reported one.
    pub fn from_diagnostics(mut diagnostics: Vec<Diagnostic>) -> Option<Self> {
        if diagnostics.is_empty() {
            return None;
        }
        let first = diagnostics.remove(0);
        Some(match first.kind {
            DiagnosticKind::SyntaxError => PreflightError::Syntax(first),
            _ => PreflightError::SecurityViolation(first),
        })
    }

    pub fn persistence(message: impl Into<String>) -> Self {
        Self::Persistence {
            message: message.into(),
        }
    }

    pub fn engine(message: impl Into<String>) -> Self {
        Self::Engine {
            message: message.into(),
        }
    }

    /// Stable machine-readable code for API surfaces
    pub fn code(&self) -> &'static str {
        match self {
            PreflightError::Syntax(_) => "SYNTAX_ERROR",
            PreflightError::SecurityViolation(_) => "SECURITY_VIOLATION",
            PreflightError::SourceTooLong { .. } => "SOURCE_TOO_LONG",
            PreflightError::RuntimeThrow { .. } => "RUNTIME_THROW",
            PreflightError::Timeout { .. } => "TIMEOUT",
            PreflightError::InvalidValueKind { .. } => "INVALID_VALUE_KIND",
            PreflightError::Unauthorized { .. } => "UNAUTHORIZED",
            PreflightError::PersistenceConflict { .. } => "PERSISTENCE_CONFLICT",
            PreflightError::Persistence { .. } => "PERSISTENCE_ERROR",
            PreflightError::Engine { .. } => "ENGINE_ERROR",
            PreflightError::Dispatch { .. } => "DISPATCH_ERROR",
            PreflightError::Config { .. } => "CONFIGURATION_ERROR",
            PreflightError::Cancelled => "CANCELLED",
        }
    }

    /// Validation failures block both persistence and execution
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            PreflightError::Syntax(_)
                | PreflightError::SecurityViolation(_)
                | PreflightError::SourceTooLong { .. }
        )
    }
}
