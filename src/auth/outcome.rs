use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::auth::session::Session;
use crate::error::ErrorCategory;

/// How long a notice stays on screen before dismissing itself
pub const NOTICE_DISMISS_AFTER: Duration = Duration::from_secs(5);

/// Message used whenever an operation needs a signed-in user and there is none
pub const NO_CURRENT_USER_MESSAGE: &str = "No user is currently logged in.";

/// The façade operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Register,
    Login,
    Logout,
    SendPasswordReset,
    UpdateProfile,
    UpdateEmail,
    UpdatePassword,
    DeleteAccount,
    ResendVerification,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Register => "register",
            Operation::Login => "login",
            Operation::Logout => "logout",
            Operation::SendPasswordReset => "send_password_reset",
            Operation::UpdateProfile => "update_profile",
            Operation::UpdateEmail => "update_email",
            Operation::UpdatePassword => "update_password",
            Operation::DeleteAccount => "delete_account",
            Operation::ResendVerification => "resend_verification",
        }
    }

    pub fn success_message(&self) -> &'static str {
        match self {
            Operation::Register => {
                "Registration successful. Please check your email for verification."
            }
            Operation::Login => "Login successful.",
            Operation::Logout => "Logged out successfully.",
            Operation::SendPasswordReset => "Password reset email sent. Please check your inbox.",
            Operation::UpdateProfile => "Profile updated successfully.",
            Operation::UpdateEmail => {
                "Email updated successfully. A verification email has been sent."
            }
            Operation::UpdatePassword => "Password updated successfully.",
            Operation::DeleteAccount => "Account deleted successfully.",
            Operation::ResendVerification => "Verification email sent. Please check your inbox.",
        }
    }

    /// Message for failures the operation has no specific wording for
    pub fn failure_message(&self) -> &'static str {
        match self {
            Operation::Register => "Registration failed. Please try again.",
            Operation::Login => "Login failed. Please try again.",
            Operation::Logout => "Logout failed. Please try again.",
            Operation::SendPasswordReset => "Failed to send password reset email.",
            Operation::UpdateProfile => "Failed to update profile.",
            Operation::UpdateEmail => "Failed to update email.",
            Operation::UpdatePassword => "Failed to update password.",
            Operation::DeleteAccount => "Failed to delete account.",
            Operation::ResendVerification => "Failed to send verification email.",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// User-facing message for a failed operation.
///
/// Pure: the same operation and category always give the same text.
pub fn message_for(operation: Operation, category: ErrorCategory) -> &'static str {
    use ErrorCategory as C;
    use Operation as Op;

    match (operation, category) {
        (_, C::PreconditionFailed) => NO_CURRENT_USER_MESSAGE,

        (Op::Register, C::AlreadyInUse) => "This email is already registered.",
        (Op::Register, C::InvalidEmail) => "Invalid email address.",
        (Op::Register, C::DisabledFeature) => "Email/password accounts are not enabled.",
        (Op::Register, C::WeakPassword) => "Password is too weak.",

        (Op::Login, C::InvalidEmail) => "Invalid email address.",
        (Op::Login, C::UserDisabled) => "This account has been disabled.",
        (Op::Login, C::NotFound) => "No account found with this email.",
        (Op::Login, C::WrongPassword) => "Incorrect password.",
        (Op::Login, C::RateLimited) => "Too many failed attempts. Please try again later.",

        (Op::SendPasswordReset, C::NotFound) => "No account found with this email.",
        (Op::SendPasswordReset, C::InvalidEmail) => "Invalid email address.",

        (Op::UpdateEmail, C::RequiresRecentLogin) => "Please log in again to update your email.",
        (Op::UpdateEmail, C::InvalidEmail) => "Invalid email address.",
        (Op::UpdateEmail, C::AlreadyInUse) => "This email is already in use by another account.",

        (Op::UpdatePassword, C::RequiresRecentLogin) => {
            "Please log in again to update your password."
        }
        (Op::UpdatePassword, C::WeakPassword) => "Password is too weak.",

        (Op::DeleteAccount, C::RequiresRecentLogin) => {
            "Please log in again to delete your account."
        }

        (operation, _) => operation.failure_message(),
    }
}

/// A trailing step of an operation that failed after the main step succeeded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DegradedStep {
    /// Short name of the step, e.g. `set_display_name`
    pub step: String,
    pub category: ErrorCategory,
    /// Raw provider code
    pub code: String,
}

/// Outcome of one façade operation.
///
/// A category is only ever present on failure; the constructors keep it
/// that way.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationResult {
    operation: Operation,
    success: bool,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    category: Option<ErrorCategory>,
    /// Raw provider code behind the category, when the provider reported one
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    session: Option<Session>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    degraded: Vec<DegradedStep>,
}

impl OperationResult {
    /// Successful result with the operation's standard message
    pub fn succeeded(operation: Operation) -> Self {
        Self {
            operation,
            success: true,
            message: operation.success_message().to_string(),
            category: None,
            code: None,
            session: None,
            degraded: Vec::new(),
        }
    }

    /// Failed result for a provider code
    pub fn failed(operation: Operation, code: &str) -> Self {
        let category = ErrorCategory::from_code(code);
        Self {
            operation,
            success: false,
            message: message_for(operation, category).to_string(),
            category: Some(category),
            code: Some(code.to_string()),
            session: None,
            degraded: Vec::new(),
        }
    }

    /// Failed because no user is signed in; the provider was never called
    pub fn no_current_user(operation: Operation) -> Self {
        Self {
            operation,
            success: false,
            message: NO_CURRENT_USER_MESSAGE.to_string(),
            category: Some(ErrorCategory::PreconditionFailed),
            code: None,
            session: None,
            degraded: Vec::new(),
        }
    }

    pub fn with_session(mut self, session: Session) -> Self {
        self.session = Some(session);
        self
    }

    /// Record a trailing step that failed. Only meaningful on success.
    pub fn with_degraded(mut self, step: &str, code: &str) -> Self {
        debug_assert!(self.success, "degraded steps only apply to successful results");
        self.degraded.push(DegradedStep {
            step: step.to_string(),
            category: ErrorCategory::from_code(code),
            code: code.to_string(),
        });
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn operation(&self) -> Operation {
        self.operation
    }

    pub fn is_success(&self) -> bool {
        self.success
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn category(&self) -> Option<ErrorCategory> {
        self.category
    }

    pub fn code(&self) -> Option<&str> {
        self.code.as_deref()
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    /// Trailing steps that failed after the main step succeeded
    pub fn degraded(&self) -> &[DegradedStep] {
        &self.degraded
    }

    /// Succeeded, but at least one trailing step did not
    pub fn is_degraded(&self) -> bool {
        self.success && !self.degraded.is_empty()
    }

    /// Presentation hint for the UI layer
    pub fn notice(&self) -> Notice {
        Notice {
            kind: if self.success {
                NoticeKind::Success
            } else {
                NoticeKind::Error
            },
            message: self.message.clone(),
            dismiss_after: NOTICE_DISMISS_AFTER,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeKind {
    Success,
    Error,
}

/// Non-blocking, self-dismissing notification describing a result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notice {
    pub kind: NoticeKind,
    pub message: String,
    pub dismiss_after: Duration,
}

impl Notice {
    /// Replace the message of a success notice, e.g. with page-specific wording.
    /// Error notices keep the failure text.
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        if self.kind == NoticeKind::Success {
            self.message = message.into();
        }
        self
    }
}
