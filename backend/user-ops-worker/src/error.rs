use thiserror::Error;

/// Errors raised by a user store while a job's transaction is open
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),
}

/// Errors from handling a single job
#[derive(Debug, Error)]
pub enum JobError {
    #[error("Unknown job type: {0}")]
    UnknownJobType(String),

    #[error("Invalid payload: {0}")]
    InvalidPayload(#[from] serde_json::Error),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl JobError {
    /// Short label used in logs and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            JobError::UnknownJobType(_) => "unknown_job_type",
            JobError::InvalidPayload(_) => "invalid_payload",
            JobError::Store(_) => "store",
        }
    }

    /// Whether redelivering the same job can succeed
    ///
    /// Dispatch and payload errors repeat identically on every delivery.
    pub fn is_retryable(&self) -> bool {
        matches!(self, JobError::Store(_))
    }
}

/// Invalid worker configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("Database configuration error: {0}")]
    Database(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_error_classification() {
        let unknown = JobError::UnknownJobType("bulk-delete".into());
        assert_eq!(unknown.kind(), "unknown_job_type");
        assert!(!unknown.is_retryable());

        let invalid: JobError = serde_json::from_str::<u32>("{").unwrap_err().into();
        assert_eq!(invalid.kind(), "invalid_payload");
        assert!(!invalid.is_retryable());

        let store: JobError = StoreError::ConstraintViolation("users_email_key".into()).into();
        assert_eq!(store.kind(), "store");
        assert!(store.is_retryable());
        assert_eq!(store.to_string(), "Constraint violation: users_email_key");
    }
}
