//! Attempt error taxonomy.
//!
//! Every failure a dispatch attempt can hit maps to one of four classes,
//! and the class alone decides what the scheduler does next: retry the
//! target, skip it permanently, or suspend the account. Attempt errors are
//! data consumed by the scheduler loop, never unwound through it.

use thiserror::Error;

/// Broad failure class, used for retry and account-health policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Browser or proxy could not be brought up. Retried once on another
    /// proxy inside the driver, then fatal for the attempt.
    Infrastructure,
    /// Challenge or lockout. The account is suspended; never auto-retried.
    Authentication,
    /// The target itself cannot be messaged. Permanently skipped, no
    /// account-health penalty.
    TargetStructural,
    /// Timeout or navigation hiccup. Retried up to the attempt ceiling.
    Transient,
}

/// Failure of a single dispatch attempt.
#[derive(Debug, Error)]
pub enum AttemptError {
    #[error("browser launch failed: {0}")]
    Launch(String),

    #[error("proxy unusable: {0}")]
    Proxy(String),

    #[error("security challenge presented during login")]
    Challenge,

    #[error("account is locked out")]
    Locked,

    #[error("target profile unavailable")]
    TargetUnavailable,

    #[error("target has no messaging surface")]
    UnsupportedTarget,

    #[error("timed out waiting for {0}")]
    Timeout(String),

    #[error("navigation failed: {0}")]
    Navigation(String),

    #[error("webdriver protocol error: {0}")]
    Protocol(String),
}

impl AttemptError {
    pub fn class(&self) -> ErrorClass {
        match self {
            AttemptError::Launch(_) | AttemptError::Proxy(_) => ErrorClass::Infrastructure,
            AttemptError::Challenge | AttemptError::Locked => ErrorClass::Authentication,
            AttemptError::TargetUnavailable | AttemptError::UnsupportedTarget => {
                ErrorClass::TargetStructural
            }
            AttemptError::Timeout(_) | AttemptError::Navigation(_) | AttemptError::Protocol(_) => {
                ErrorClass::Transient
            }
        }
    }

    /// Whether the scheduler should requeue the target for another try.
    pub fn retryable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// Whether this failure counts toward the account's consecutive-failure
    /// tally. Target-structural failures say nothing about the account.
    pub fn penalizes_account(&self) -> bool {
        !matches!(self.class(), ErrorClass::TargetStructural)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_class_mapping() {
        assert_eq!(
            AttemptError::Launch("no chrome".into()).class(),
            ErrorClass::Infrastructure
        );
        assert_eq!(AttemptError::Challenge.class(), ErrorClass::Authentication);
        assert_eq!(
            AttemptError::TargetUnavailable.class(),
            ErrorClass::TargetStructural
        );
        assert_eq!(
            AttemptError::Timeout("composer".into()).class(),
            ErrorClass::Transient
        );
    }

    #[test]
    fn test_retry_policy() {
        assert!(AttemptError::Timeout("login".into()).retryable());
        assert!(AttemptError::Navigation("dns".into()).retryable());
        assert!(!AttemptError::Challenge.retryable());
        assert!(!AttemptError::UnsupportedTarget.retryable());
        assert!(!AttemptError::Launch("boom".into()).retryable());
    }

    #[test]
    fn test_account_penalty() {
        assert!(!AttemptError::TargetUnavailable.penalizes_account());
        assert!(!AttemptError::UnsupportedTarget.penalizes_account());
        assert!(AttemptError::Timeout("send".into()).penalizes_account());
        assert!(AttemptError::Challenge.penalizes_account());
    }
}
