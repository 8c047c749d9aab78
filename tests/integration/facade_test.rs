//! Integration tests for the authentication façade
use corpreg::auth::outcome::NO_CURRENT_USER_MESSAGE;
use corpreg::auth::providers::memory::OutboundEmail;
use corpreg::auth::providers::ProviderCall;
use corpreg::error::codes;
use corpreg::{ErrorCategory, NoticeKind, PersistenceMode, ProfileUpdate};

use crate::test_harness::{TestEnvironment, EMAIL, PASSWORD};

#[tokio::test]
async fn test_signed_out_operations_fail_without_provider_calls() {
    let env = TestEnvironment::new().await;
    let auth = &env.app.auth_service;

    let results = vec![
        auth.update_profile(&ProfileUpdate::display_name("Ada")).await,
        auth.update_email("new@example.com").await,
        auth.update_password("An0ther!pw").await,
        auth.delete_account().await,
        auth.resend_verification().await,
    ];

    for result in results {
        assert!(!result.is_success(), "{} should fail", result.operation());
        assert_eq!(result.category(), Some(ErrorCategory::PreconditionFailed));
        assert_eq!(result.message(), NO_CURRENT_USER_MESSAGE);
        assert!(result.code().is_none());
    }

    assert!(auth.get_token(false).await.is_none());
    assert!(auth.get_token(true).await.is_none());
    assert_eq!(env.provider.network_calls(), 0);
}

#[tokio::test]
async fn test_register_with_failed_verification_is_degraded_success() {
    let env = TestEnvironment::new().await;
    env.provider
        .fail_next(ProviderCall::SendVerification, codes::TOO_MANY_REQUESTS);

    let result = env
        .app
        .auth_service
        .register("new@x.com", "Str0ng!pw", Some("Ada"))
        .await;

    assert!(result.is_success());
    assert!(result.category().is_none());
    assert!(result.is_degraded());
    assert_eq!(result.degraded().len(), 1);
    assert_eq!(result.degraded()[0].step, "send_verification");
    assert_eq!(result.degraded()[0].category, ErrorCategory::RateLimited);
    assert!(result.message().contains("verification email could not be sent"));
    assert_eq!(result.notice().kind, NoticeKind::Success);

    // The account exists, is signed in and carries the display name
    let user = env.app.auth_service.current_user().expect("signed in");
    assert_eq!(user.email, "new@x.com");
    assert_eq!(user.display_name.as_deref(), Some("Ada"));
    assert!(!env.app.auth_service.is_email_verified());
    assert!(env.provider.outbox().is_empty());
}

#[tokio::test]
async fn test_register_with_failed_display_name_is_degraded_success() {
    let env = TestEnvironment::new().await;
    env.provider
        .fail_next(ProviderCall::UpdateProfile, codes::NETWORK_REQUEST_FAILED);

    let result = env
        .app
        .auth_service
        .register("new@x.com", "Str0ng!pw", Some("Ada"))
        .await;

    assert!(result.is_success());
    assert!(result.category().is_none());
    assert_eq!(result.degraded().len(), 1);
    assert_eq!(result.degraded()[0].step, "set_display_name");
    assert_eq!(result.degraded()[0].category, ErrorCategory::Unavailable);
    assert_eq!(
        result.message(),
        "Registration successful, but your display name could not be saved. \
         Please check your email for verification."
    );

    // Verification still went out for the new account
    let user = env.app.auth_service.current_user().expect("signed in");
    assert_eq!(user.display_name, None);
    assert_eq!(
        env.provider.outbox(),
        vec![OutboundEmail::Verification {
            to: "new@x.com".to_string()
        }]
    );
}

#[tokio::test]
async fn test_register_with_both_trailing_steps_failed() {
    let env = TestEnvironment::new().await;
    env.provider
        .fail_next(ProviderCall::UpdateProfile, codes::NETWORK_REQUEST_FAILED);
    env.provider
        .fail_next(ProviderCall::SendVerification, codes::TOO_MANY_REQUESTS);

    let result = env
        .app
        .auth_service
        .register("new@x.com", "Str0ng!pw", Some("Ada"))
        .await;

    assert!(result.is_success());
    let steps: Vec<&str> = result.degraded().iter().map(|d| d.step.as_str()).collect();
    assert_eq!(steps, vec!["set_display_name", "send_verification"]);
    assert!(result.message().contains("display name could not be saved"));
    assert!(result.message().contains("verification email could not be sent"));
    assert!(env.app.auth_service.is_logged_in());
    assert!(env.provider.outbox().is_empty());
}

#[tokio::test]
async fn test_register_happy_path_sends_verification() {
    let env = TestEnvironment::new().await;

    let result = env
        .app
        .auth_service
        .register("new@x.com", "Str0ng!pw", Some("Ada"))
        .await;

    assert!(result.is_success());
    assert!(!result.is_degraded());
    assert_eq!(
        result.message(),
        "Registration successful. Please check your email for verification."
    );
    assert_eq!(
        env.provider.outbox(),
        vec![OutboundEmail::Verification {
            to: "new@x.com".to_string()
        }]
    );
    assert_eq!(
        env.seen().last().cloned().flatten().as_deref(),
        Some("new@x.com")
    );
}

#[tokio::test]
async fn test_register_failures_use_register_wording() {
    let env = TestEnvironment::new().await;
    env.provider.add_account(EMAIL, PASSWORD);
    let auth = &env.app.auth_service;

    let taken = auth.register(EMAIL, PASSWORD, None).await;
    assert_eq!(taken.category(), Some(ErrorCategory::AlreadyInUse));
    assert_eq!(taken.message(), "This email is already registered.");

    let weak = auth.register("bob@example.com", "123", None).await;
    assert_eq!(weak.category(), Some(ErrorCategory::WeakPassword));
    assert_eq!(weak.message(), "Password is too weak.");

    env.provider.set_sign_up_enabled(false);
    let disabled = auth.register("bob@example.com", PASSWORD, None).await;
    assert_eq!(disabled.category(), Some(ErrorCategory::DisabledFeature));
    assert_eq!(disabled.message(), "Email/password accounts are not enabled.");

    assert!(!auth.is_logged_in());
}

#[tokio::test]
async fn test_login_failures() {
    let env = TestEnvironment::new().await;
    env.provider.add_account(EMAIL, PASSWORD);
    let auth = &env.app.auth_service;
    let mode = PersistenceMode::SessionScoped;

    let missing = auth.login("nobody@example.com", PASSWORD, mode).await;
    assert_eq!(missing.category(), Some(ErrorCategory::NotFound));
    assert_eq!(missing.message(), "No account found with this email.");

    let wrong = auth.login(EMAIL, "wrong-password", mode).await;
    assert_eq!(wrong.category(), Some(ErrorCategory::WrongPassword));
    assert_eq!(wrong.message(), "Incorrect password.");
    assert_eq!(wrong.notice().kind, NoticeKind::Error);

    let invalid = auth.login("not-an-email", PASSWORD, mode).await;
    assert_eq!(invalid.category(), Some(ErrorCategory::InvalidEmail));

    env.provider.add_account("eve@example.com", PASSWORD);
    env.provider.disable_account("eve@example.com");
    let disabled = auth.login("eve@example.com", PASSWORD, mode).await;
    assert_eq!(disabled.message(), "This account has been disabled.");

    assert!(!auth.is_logged_in());
    assert_eq!(env.seen(), vec![None]);
}

#[tokio::test]
async fn test_repeated_bad_passwords_are_rate_limited() {
    let env = TestEnvironment::new().await;
    env.provider.add_account(EMAIL, PASSWORD);
    let auth = &env.app.auth_service;

    for _ in 0..5 {
        let result = auth
            .login(EMAIL, "wrong-password", PersistenceMode::SessionScoped)
            .await;
        assert_eq!(result.category(), Some(ErrorCategory::WrongPassword));
    }

    let locked = auth
        .login(EMAIL, PASSWORD, PersistenceMode::SessionScoped)
        .await;
    assert_eq!(locked.category(), Some(ErrorCategory::RateLimited));
    assert_eq!(
        locked.message(),
        "Too many failed attempts. Please try again later."
    );
    assert!(locked.category().map(|c| c.class().is_retryable()).unwrap_or(false));
}

#[tokio::test]
async fn test_login_then_sensitive_operations() {
    let env = TestEnvironment::signed_in().await;
    let auth = &env.app.auth_service;

    // Session is visible straight after login returns
    assert_eq!(auth.current_user().map(|u| u.email).as_deref(), Some(EMAIL));

    let renamed = auth.update_profile(&ProfileUpdate::display_name("Ada")).await;
    assert!(renamed.is_success());
    assert_eq!(renamed.message(), "Profile updated successfully.");
    assert_eq!(
        auth.current_user().and_then(|u| u.display_name).as_deref(),
        Some("Ada")
    );

    let moved = auth.update_email("ada@new.example.com").await;
    assert!(moved.is_success());
    assert_eq!(
        moved.message(),
        "Email updated successfully. A verification email has been sent."
    );
    assert_eq!(
        auth.current_user().map(|u| u.email).as_deref(),
        Some("ada@new.example.com")
    );

    let taken_by = "grace@example.com";
    env.provider.add_account(taken_by, PASSWORD);
    let clash = auth.update_email(taken_by).await;
    assert_eq!(clash.category(), Some(ErrorCategory::AlreadyInUse));
    assert_eq!(
        clash.message(),
        "This email is already in use by another account."
    );

    let password = auth.update_password("An0ther!pw").await;
    assert!(password.is_success());
}

#[tokio::test]
async fn test_stale_login_requires_reauthentication() {
    let env = TestEnvironment::signed_in().await;
    let auth = &env.app.auth_service;
    env.provider.backdate_sign_in(3600);

    let email = auth.update_email("ada@new.example.com").await;
    assert_eq!(email.category(), Some(ErrorCategory::RequiresRecentLogin));
    assert_eq!(email.message(), "Please log in again to update your email.");

    let password = auth.update_password("An0ther!pw").await;
    assert_eq!(password.message(), "Please log in again to update your password.");

    let delete = auth.delete_account().await;
    assert_eq!(delete.message(), "Please log in again to delete your account.");

    // Still signed in: a stale login is not a sign-out
    assert!(auth.is_logged_in());
}

#[tokio::test]
async fn test_logout_and_delete_reach_listeners() {
    let env = TestEnvironment::signed_in().await;
    let auth = &env.app.auth_service;

    let logout = auth.logout().await;
    assert!(logout.is_success());
    assert_eq!(logout.message(), "Logged out successfully.");
    assert!(!auth.is_logged_in());
    assert_eq!(
        env.seen(),
        vec![None, Some(EMAIL.to_string()), None]
    );

    auth.login(EMAIL, PASSWORD, PersistenceMode::SessionScoped).await;
    let deleted = auth.delete_account().await;
    assert!(deleted.is_success());
    assert_eq!(deleted.message(), "Account deleted successfully.");
    assert!(auth.current_user().is_none());

    let again = auth.login(EMAIL, PASSWORD, PersistenceMode::SessionScoped).await;
    assert_eq!(again.category(), Some(ErrorCategory::NotFound));
}

#[tokio::test]
async fn test_provider_outage_is_unavailable_and_not_retried() {
    let env = TestEnvironment::signed_in().await;
    let auth = &env.app.auth_service;
    env.provider
        .fail_next(ProviderCall::SignOut, codes::NETWORK_REQUEST_FAILED);

    let result = auth.logout().await;
    assert!(!result.is_success());
    assert_eq!(result.category(), Some(ErrorCategory::Unavailable));
    assert_eq!(result.message(), "Logout failed. Please try again.");
    assert_eq!(env.provider.calls(ProviderCall::SignOut), 1);

    // Failed sign-out leaves the session in place
    assert!(auth.is_logged_in());
}

#[tokio::test]
async fn test_password_reset_and_resend_verification() {
    let env = TestEnvironment::signed_in().await;
    let auth = &env.app.auth_service;

    let reset = auth.send_password_reset(EMAIL).await;
    assert_eq!(
        reset.message(),
        "Password reset email sent. Please check your inbox."
    );

    let unknown = auth.send_password_reset("nobody@example.com").await;
    assert_eq!(unknown.category(), Some(ErrorCategory::NotFound));
    assert_eq!(unknown.message(), "No account found with this email.");

    let verify = auth.resend_verification().await;
    assert!(verify.is_success());
    assert_eq!(
        env.provider.outbox(),
        vec![
            OutboundEmail::PasswordReset {
                to: EMAIL.to_string()
            },
            OutboundEmail::Verification {
                to: EMAIL.to_string()
            },
        ]
    );
}

#[tokio::test]
async fn test_token_cached_until_forced_and_errors_become_none() {
    let env = TestEnvironment::signed_in().await;
    let auth = &env.app.auth_service;

    let first = auth.get_token(false).await.expect("token");
    assert_eq!(auth.get_token(false).await.as_deref(), Some(first.as_str()));

    let forced = auth.get_token(true).await.expect("token");
    assert_ne!(first, forced);

    env.provider
        .fail_next(ProviderCall::IdToken, codes::NETWORK_REQUEST_FAILED);
    assert!(auth.get_token(true).await.is_none());
}
