use thiserror::Error;

/// Caller-visible failure taxonomy for engine operations.
///
/// Stage-local recoverable failures (symbol extraction, per-candidate
/// lookups, per-field parse fallbacks) are absorbed inside the pipeline
/// and never surface through this enum.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("missing required field: {0}")]
    InvalidInput(&'static str),
    #[error("user must be authenticated")]
    Unauthenticated,
    #[error("storage not available")]
    StorageUnavailable(#[source] anyhow::Error),
    #[error("trial limit reached: 1 image total")]
    TrialQuotaExhausted,
    #[error("daily limit reached: 1 image per day")]
    DailyQuotaExhausted,
    #[error("rate limit exceeded for '{0}'")]
    RateLimited(String),
    #[error("internal failure")]
    Internal(#[from] anyhow::Error),
}

impl WorkflowError {
    /// Stable machine-readable code, one per variant.
    pub fn code(&self) -> &'static str {
        match self {
            WorkflowError::InvalidInput(_) => "invalid-argument",
            WorkflowError::Unauthenticated => "unauthenticated",
            WorkflowError::StorageUnavailable(_) => "failed-precondition",
            WorkflowError::TrialQuotaExhausted | WorkflowError::DailyQuotaExhausted => {
                "resource-exhausted"
            }
            WorkflowError::RateLimited(_) => "rate-limited",
            WorkflowError::Internal(_) => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::WorkflowError;

    #[test]
    fn quota_variants_stay_distinguishable() {
        let trial = WorkflowError::TrialQuotaExhausted;
        let daily = WorkflowError::DailyQuotaExhausted;
        assert_eq!(trial.code(), daily.code());
        assert!(matches!(trial, WorkflowError::TrialQuotaExhausted));
        assert!(matches!(daily, WorkflowError::DailyQuotaExhausted));
        assert_ne!(trial.to_string(), daily.to_string());
    }

    #[test]
    fn internal_wraps_anyhow_source() {
        let err: WorkflowError = anyhow::anyhow!("boom").into();
        assert_eq!(err.code(), "internal");
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn invalid_input_names_the_field() {
        let err = WorkflowError::InvalidInput("dream_text");
        assert_eq!(err.to_string(), "missing required field: dream_text");
        assert_eq!(err.code(), "invalid-argument");
    }
}
