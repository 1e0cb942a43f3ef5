//! The contract between the dispatcher and the code performing the side effect.
use std::{borrow::Cow, error::Error};

use async_trait::async_trait;
use thiserror::Error;

use crate::envelope::EnvelopeId;

/// Performs the side effect for one kind of envelope.
///
/// The handler only receives the [`EnvelopeId`] and is responsible for loading whatever it needs
/// (typically through a shared [`crate::store::EnvelopeStore`] or its own repositories).
///
/// Delivery is at-least-once: a process crash after the handler succeeded but before the status
/// was recorded results in the handler being invoked again for the same envelope. Handlers
/// should therefore be idempotent.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn process(&self, envelope_id: EnvelopeId) -> ExecutionResult;
}

/// The result of a single handler invocation.
pub enum ExecutionResult {
    Done,
    Error { error: Box<dyn ExecutionError> },
}

impl<T> From<T> for ExecutionResult
where
    T: ExecutionError + 'static,
{
    fn from(value: T) -> Self {
        Self::Error {
            error: Box::new(value),
        }
    }
}

impl std::fmt::Debug for ExecutionResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Done => f.write_str("Done"),
            Self::Error { error } => f
                .debug_struct("Error")
                .field("error_type", &error.error_type())
                .field("permanent", &error.is_permanent())
                .field("message", &error.to_string())
                .finish(),
        }
    }
}

/// An error reported by a [`JobHandler`].
pub trait ExecutionError: Error + Send + Sync {
    /// A short machine readable classification, e.g. `"smtp"` or `"template"`.
    fn error_type(&self) -> &str;

    /// Permanent errors are never retried.
    fn is_permanent(&self) -> bool {
        false
    }
}

/// General purpose [`ExecutionError`] for handlers that do not need their own error type.
///
/// # Example
///
/// ```
/// # use liftqueue::prelude::*;
/// let error = HandlerError::transient("smtp", "mail server unavailable");
/// assert!(!error.is_permanent());
/// assert_eq!(error.to_string(), "mail server unavailable");
///
/// let result: ExecutionResult = HandlerError::permanent("recipient", "unknown recipient").into();
/// assert!(matches!(result, ExecutionResult::Error { .. }));
/// ```
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{detail}")]
pub struct HandlerError {
    error_type: Cow<'static, str>,
    detail: String,
    permanent: bool,
}

impl HandlerError {
    pub fn transient(error_type: impl Into<Cow<'static, str>>, detail: impl Into<String>) -> Self {
        Self {
            error_type: error_type.into(),
            detail: detail.into(),
            permanent: false,
        }
    }

    pub fn permanent(error_type: impl Into<Cow<'static, str>>, detail: impl Into<String>) -> Self {
        Self {
            error_type: error_type.into(),
            detail: detail.into(),
            permanent: true,
        }
    }
}

impl ExecutionError for HandlerError {
    fn error_type(&self) -> &str {
        &self.error_type
    }

    fn is_permanent(&self) -> bool {
        self.permanent
    }
}
