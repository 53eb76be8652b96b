use codeclass_common::types::InvalidTransition;
use thiserror::Error;

/// Message shown to students whenever grading could not run to completion.
pub const RETRY_MESSAGE: &str = "grading temporarily unavailable, please retry";

#[derive(Debug, Error)]
pub enum GradeError {
    /// Bad input from the caller. Nothing was executed.
    #[error("{0}")]
    Validation(String),

    /// The sandbox could not be started at all. Never a verdict.
    #[error("sandbox unavailable: {0}")]
    Infrastructure(String),

    #[error("ledger update kept conflicting after {attempts} attempts")]
    Concurrency { attempts: u32 },

    /// Admission control rejected the request.
    #[error("grading pool is saturated")]
    Busy,

    #[error(transparent)]
    Transition(#[from] InvalidTransition),
}

impl GradeError {
    /// Whether the same request may succeed if tried again later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GradeError::Infrastructure(_) | GradeError::Concurrency { .. } | GradeError::Busy
        )
    }

    pub fn user_message(&self) -> String {
        if self.is_retryable() {
            RETRY_MESSAGE.to_string()
        } else {
            self.to_string()
        }
    }
}

#[derive(Debug, Error)]
pub enum LedgerError {
    /// Contention or a connectivity blip; the operation is safe to retry.
    #[error("conflicting ledger update: {0}")]
    Conflict(String),

    #[error("ledger backend failure: {0}")]
    Backend(String),
}

impl From<LedgerError> for GradeError {
    fn from(err: LedgerError) -> Self {
        GradeError::Infrastructure(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors_hide_details() {
        let err = GradeError::Infrastructure("docker daemon not reachable".into());
        assert!(err.is_retryable());
        assert_eq!(err.user_message(), RETRY_MESSAGE);

        let err = GradeError::Validation("code is required".into());
        assert!(!err.is_retryable());
        assert_eq!(err.user_message(), "code is required");
    }
}
