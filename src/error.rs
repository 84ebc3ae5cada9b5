//! Error types for the evaluation harness.
//!
//! Each pipeline stage has its own error enum so the runner can tag a failed
//! record with the kind of failure that ended it. [`EvalError`] wraps them all
//! for the surrounding tool (configuration, query loading, report files).

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias using our custom error.
pub type Result<T> = std::result::Result<T, EvalError>;

/// Errors that can occur anywhere in the harness.
#[derive(Error, Debug)]
pub enum EvalError {
    /// Missing or invalid settings. Fatal for the whole run.
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    Retrieval(#[from] RetrievalError),

    #[error(transparent)]
    Sanitization(#[from] SanitizationError),

    #[error(transparent)]
    Judge(#[from] JudgeInvocationError),

    /// Error reading or writing files.
    #[error("I/O error for path '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Error during serialization/deserialization.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The query file could not be understood.
    #[error("Query source error: {0}")]
    QuerySource(String),
}

impl EvalError {
    /// Create an I/O error with path context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }
}

impl From<serde_json::Error> for EvalError {
    fn from(err: serde_json::Error) -> Self {
        EvalError::Serialization(err.to_string())
    }
}

/// Failures talking to the search index.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RetrievalError {
    #[error("search backend unreachable: {0}")]
    Unreachable(String),

    #[error("search backend rejected credentials ({status}): {message}")]
    Unauthorized { status: u16, message: String },

    #[error("search index '{0}' does not exist")]
    IndexNotFound(String),

    #[error("search backend error ({status}): {message}")]
    Backend { status: u16, message: String },

    #[error("invalid retrieval request: {0}")]
    InvalidRequest(String),

    #[error("malformed search response: {0}")]
    MalformedResponse(String),
}

/// Failures cleaning retrieved text.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SanitizationError {
    #[error("document of {len} bytes exceeds the sanitizer limit of {limit} bytes")]
    InputTooLarge { len: usize, limit: usize },
}

/// Why a judge response could not be turned into a verdict.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum VerdictParseError {
    #[error("judge response is not a JSON object: {0}")]
    NotJson(String),

    #[error("judge response has no score field")]
    MissingScore,

    #[error("judge score '{0}' is not numeric")]
    NonNumericScore(String),

    #[error("judge score {0} is not a whole number")]
    NonIntegralScore(f64),

    #[error("judge score {0} is outside the 1-5 scale")]
    ScoreOutOfRange(f64),
}

/// Failures calling the judge service.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum JudgeInvocationError {
    #[error("judge rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("judge request timed out: {0}")]
    Timeout(String),

    #[error("judge network error: {0}")]
    Network(String),

    #[error("judge service unavailable ({status}): {message}")]
    Unavailable { status: u16, message: String },

    #[error("judge rejected credentials ({status}): {message}")]
    Unauthorized { status: u16, message: String },

    #[error("judge rejected request ({status}): {message}")]
    BadRequest { status: u16, message: String },

    /// The service answered, but not with a chat completion.
    #[error("malformed judge response: {0}")]
    MalformedResponse(String),

    /// The completion did not contain a usable verdict.
    #[error("invalid judge verdict: {0}")]
    InvalidVerdict(#[from] VerdictParseError),
}

impl JudgeInvocationError {
    /// Whether retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. } | Self::Timeout(_) | Self::Network(_) | Self::Unavailable { .. }
        )
    }

    /// Server-provided wait hint, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

impl From<reqwest::Error> for JudgeInvocationError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            JudgeInvocationError::Timeout(err.to_string())
        } else if err.is_decode() {
            JudgeInvocationError::MalformedResponse(err.to_string())
        } else {
            JudgeInvocationError::Network(err.to_string())
        }
    }
}

impl From<reqwest::Error> for RetrievalError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            RetrievalError::MalformedResponse(err.to_string())
        } else {
            RetrievalError::Unreachable(err.to_string())
        }
    }
}
