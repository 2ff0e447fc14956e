use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::ValidatorError;

/// Answer from the authentication backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionValidation {
    pub is_valid: bool,
}

/// Authority on whether the signed-in session is still valid.
#[async_trait]
pub trait SessionValidator: Send + Sync {
    /// Ask the backend whether the current session is valid.
    ///
    /// # Errors
    ///
    /// Returns `ValidatorError` if the backend cannot be reached.
    async fn validate_session(&self) -> Result<SessionValidation, ValidatorError>;
}

/// Validator with a fixed, switchable answer.
///
/// Used by the binary (which has no auth backend) and by tests.
#[derive(Debug)]
pub struct StaticSessionValidator {
    valid: AtomicBool,
    reachable: AtomicBool,
}

impl StaticSessionValidator {
    #[must_use]
    pub fn new(valid: bool) -> Self {
        Self {
            valid: AtomicBool::new(valid),
            reachable: AtomicBool::new(true),
        }
    }

    pub fn set_valid(&self, valid: bool) {
        self.valid.store(valid, Ordering::SeqCst);
    }

    /// While unreachable, every call fails with `ValidatorError::Unreachable`.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }
}

#[async_trait]
impl SessionValidator for StaticSessionValidator {
    async fn validate_session(&self) -> Result<SessionValidation, ValidatorError> {
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(ValidatorError::Unreachable("static validator offline".into()));
        }
        Ok(SessionValidation {
            is_valid: self.valid.load(Ordering::SeqCst),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn answers_follow_toggles() {
        let validator = StaticSessionValidator::new(true);
        assert!(validator.validate_session().await.unwrap().is_valid);

        validator.set_valid(false);
        assert!(!validator.validate_session().await.unwrap().is_valid);

        validator.set_reachable(false);
        assert!(validator.validate_session().await.is_err());
    }
}
