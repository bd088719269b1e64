//! Tagged error record shared by every stage of the anonymizer

use serde::Serialize;
use std::fmt;
use thiserror::Error;

use crate::patterns::Category;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorKind {
    #[serde(rename = "VALIDATION_ERROR")]
    Validation,
    #[serde(rename = "REGEX_ERROR")]
    Regex,
    #[serde(rename = "SANITIZE_ERROR")]
    Sanitize,
    /// The offload host lost its worker (panic, termination, dropped channel).
    #[serde(rename = "WORKER_ERROR")]
    Worker,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "VALIDATION_ERROR",
            ErrorKind::Regex => "REGEX_ERROR",
            ErrorKind::Sanitize => "SANITIZE_ERROR",
            ErrorKind::Worker => "WORKER_ERROR",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned by the pipeline, the sanitizer and the offload host.
///
/// Serializes as `{ "type": ..., "message": ..., "details"?: ... }` so callers
/// can branch on `type` without parsing the message.
#[derive(Debug, Clone, PartialEq, Error, Serialize)]
#[error("{kind}: {message}")]
pub struct AnonymizeError {
    #[serde(rename = "type")]
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    /// Set only by [`AnonymizeError::terminated`].
    #[serde(skip)]
    terminated: bool,
}

impl AnonymizeError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: None,
            terminated: false,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn sanitize(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Sanitize, message)
    }

    pub fn worker(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Worker, message)
    }

    /// A rule failure attributed to one category.
    pub fn regex(category: Category, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Regex, message).with_details(format!("category={}", category))
    }

    pub fn terminated() -> Self {
        Self {
            terminated: true,
            ..Self::worker("anonymization task was terminated before it produced a result")
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(r#"{{"type":"{}","message":"{}"}}"#, self.kind, self.message.replace('"', "'"))
        })
    }
}
