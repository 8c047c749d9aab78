//! Error code to category mapping as seen through the façade

use corpreg::auth::providers::ProviderCall;
use corpreg::error::codes;
use corpreg::{ErrorCategory, ErrorClass};

use crate::test_harness::TestEnvironment;

#[test]
fn test_code_table() {
    let table = [
        (codes::EMAIL_ALREADY_IN_USE, ErrorCategory::AlreadyInUse),
        (codes::INVALID_EMAIL, ErrorCategory::InvalidEmail),
        (codes::OPERATION_NOT_ALLOWED, ErrorCategory::DisabledFeature),
        (codes::WEAK_PASSWORD, ErrorCategory::WeakPassword),
        (codes::USER_DISABLED, ErrorCategory::UserDisabled),
        (codes::USER_NOT_FOUND, ErrorCategory::NotFound),
        (codes::WRONG_PASSWORD, ErrorCategory::WrongPassword),
        (codes::INVALID_CREDENTIAL, ErrorCategory::WrongPassword),
        (codes::TOO_MANY_REQUESTS, ErrorCategory::RateLimited),
        (codes::REQUIRES_RECENT_LOGIN, ErrorCategory::RequiresRecentLogin),
        (codes::USER_TOKEN_EXPIRED, ErrorCategory::RequiresRecentLogin),
        (codes::INVALID_USER_TOKEN, ErrorCategory::RequiresRecentLogin),
        (codes::NETWORK_REQUEST_FAILED, ErrorCategory::Unavailable),
        (codes::UNAVAILABLE, ErrorCategory::Unavailable),
        (codes::DEADLINE_EXCEEDED, ErrorCategory::Unavailable),
        (codes::PERMISSION_DENIED, ErrorCategory::PermissionDenied),
        (codes::NO_CURRENT_USER, ErrorCategory::PreconditionFailed),
        ("auth/something-new", ErrorCategory::Unknown),
        ("", ErrorCategory::Unknown),
    ];

    for (code, category) in table {
        assert_eq!(ErrorCategory::from_code(code), category, "code {code:?}");
    }
}

#[test]
fn test_retry_advice() {
    assert!(ErrorCategory::RateLimited.class().is_retryable());
    assert!(ErrorCategory::Unavailable.class().is_retryable());
    assert!(!ErrorCategory::WrongPassword.class().is_retryable());
    assert_eq!(
        ErrorCategory::RequiresRecentLogin.class(),
        ErrorClass::AuthorizationStale
    );
    assert_eq!(
        ErrorCategory::PreconditionFailed.class(),
        ErrorClass::PreconditionFailed
    );
}

#[tokio::test]
async fn test_unmapped_code_reaches_caller_as_unknown() {
    let env = TestEnvironment::new().await;
    env.provider
        .fail_next(ProviderCall::PasswordReset, "auth/quota-exceeded");

    let result = env.app.auth_service.send_password_reset("ada@example.com").await;

    assert!(!result.is_success());
    assert_eq!(result.category(), Some(ErrorCategory::Unknown));
    assert_eq!(result.code(), Some("auth/quota-exceeded"));
    assert_eq!(result.message(), "Failed to send password reset email.");
}
