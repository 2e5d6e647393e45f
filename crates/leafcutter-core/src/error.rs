use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Serialisable classification of a [`ScrapeError`], used in run summaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    Transient,
    Blocked,
    NotFound,
    Paywalled,
    DocumentFormatError,
    MissingRequiredField,
    RetriesExhausted,
    Cancelled,
    InvalidRule,
    Config,
    Serialization,
    Io,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Transient => "transient",
            ErrorKind::Blocked => "blocked",
            ErrorKind::NotFound => "not-found",
            ErrorKind::Paywalled => "paywalled",
            ErrorKind::DocumentFormatError => "document-format-error",
            ErrorKind::MissingRequiredField => "missing-required-field",
            ErrorKind::RetriesExhausted => "retries-exhausted",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::InvalidRule => "invalid-rule",
            ErrorKind::Config => "config",
            ErrorKind::Serialization => "serialization",
            ErrorKind::Io => "io",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Engine-wide error type for Leafcutter.
#[derive(Error, Debug)]
pub enum ScrapeError {
    /// Timeout, 5xx, connection reset. Retryable.
    #[error("Transient fetch error: {0}")]
    Transient(String),

    /// The site answered 429. Retryable, classified as transient, and a
    /// signal for the rate limiter to slow down.
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// 403 / CAPTCHA / bot wall. Not retryable without a strategy change.
    #[error("Blocked: {0}")]
    Blocked(String),

    /// 404 and other terminal client errors for a page.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Content truncated behind a subscription wall.
    #[error("Paywalled: {0}")]
    Paywalled(String),

    /// Payload cannot be parsed by the strategy's rule evaluator.
    #[error("Document format error: {0}")]
    DocumentFormat(String),

    /// A required schema field produced no value.
    #[error("Missing required field: {0}")]
    MissingRequiredField(String),

    /// An extraction rule could not be compiled by the evaluator.
    #[error("Invalid rule '{rule}': {message}")]
    InvalidRule { rule: String, message: String },

    /// Transient failures persisted past the retry budget.
    #[error("Retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        last: Box<ScrapeError>,
    },

    /// The run-scoped cancellation token fired.
    #[error("Cancelled")]
    Cancelled,

    /// Invalid or inconsistent configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// CSV output failed.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ScrapeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ScrapeError::Transient(_) | ScrapeError::RateLimited(_) => ErrorKind::Transient,
            ScrapeError::Blocked(_) => ErrorKind::Blocked,
            ScrapeError::NotFound(_) => ErrorKind::NotFound,
            ScrapeError::Paywalled(_) => ErrorKind::Paywalled,
            ScrapeError::DocumentFormat(_) => ErrorKind::DocumentFormatError,
            ScrapeError::MissingRequiredField(_) => ErrorKind::MissingRequiredField,
            ScrapeError::InvalidRule { .. } => ErrorKind::InvalidRule,
            ScrapeError::RetriesExhausted { .. } => ErrorKind::RetriesExhausted,
            ScrapeError::Cancelled => ErrorKind::Cancelled,
            ScrapeError::Config(_) => ErrorKind::Config,
            ScrapeError::Serialization(_) | ScrapeError::Csv(_) => ErrorKind::Serialization,
            ScrapeError::Io(_) => ErrorKind::Io,
        }
    }

    /// Returns true if this error is transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ScrapeError::Transient(_) | ScrapeError::RateLimited(_))
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, ScrapeError::RateLimited(_))
    }

    /// Returns true for fetch-layer classifications that end a page without retry.
    pub fn is_terminal_fetch(&self) -> bool {
        matches!(
            self,
            ScrapeError::Blocked(_) | ScrapeError::NotFound(_) | ScrapeError::Paywalled(_)
        )
    }
}
