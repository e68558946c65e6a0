use service_core::error::AppError;
use thiserror::Error;

use crate::models::developer_key::WorkflowTransitionError;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Storage error: {0}")]
    Storage(anyhow::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal server error: {0}")]
    Internal(#[from] anyhow::Error),

    #[error("{0} not found")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(#[from] validator::ValidationErrors),

    #[error("The default developer key cannot be modified")]
    ProtectedKey,

    #[error(transparent)]
    Transition(#[from] WorkflowTransitionError),

    #[error("Token error: {0}")]
    Token(#[from] jsonwebtoken::errors::Error),

    #[error("Conflict: {0}")]
    Conflict(String),
}

impl ServiceError {
    /// Whether a background job hitting this error should be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ServiceError::Storage(_) | ServiceError::Redis(_) | ServiceError::Internal(_)
        )
    }
}

impl From<ServiceError> for AppError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::Storage(e) => AppError::StorageError(e),
            ServiceError::Redis(e) => AppError::CacheError(e),
            ServiceError::Serialization(e) => AppError::InternalError(anyhow::Error::new(e)),
            ServiceError::Internal(e) => AppError::InternalError(e),
            ServiceError::NotFound(what) => AppError::NotFound(anyhow::anyhow!("{} not found", what)),
            ServiceError::Validation(e) => AppError::ValidationError(e),
            ServiceError::ProtectedKey => AppError::Forbidden(anyhow::anyhow!(
                "The default developer key cannot be modified"
            )),
            ServiceError::Transition(e) => AppError::Conflict(anyhow::Error::new(e)),
            ServiceError::Token(e) => AppError::TokenError(e),
            ServiceError::Conflict(e) => AppError::Conflict(anyhow::anyhow!(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_infrastructure_errors_are_retryable() {
        assert!(ServiceError::Storage(anyhow::anyhow!("timeout")).is_retryable());
        assert!(!ServiceError::NotFound("DeveloperKey 1".into()).is_retryable());
        assert!(!ServiceError::ProtectedKey.is_retryable());
    }

    #[test]
    fn test_protected_key_maps_to_forbidden() {
        let err: AppError = ServiceError::ProtectedKey.into();
        assert!(matches!(err, AppError::Forbidden(_)));
    }
}
