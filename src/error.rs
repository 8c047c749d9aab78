use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Stable provider error codes understood by the façade.
///
/// Providers report failures using these strings; anything not listed here
/// still reaches the façade and is mapped to [`ErrorCategory::Unknown`].
pub mod codes {
    pub const EMAIL_ALREADY_IN_USE: &str = "auth/email-already-in-use";
    pub const INVALID_EMAIL: &str = "auth/invalid-email";
    pub const OPERATION_NOT_ALLOWED: &str = "auth/operation-not-allowed";
    pub const WEAK_PASSWORD: &str = "auth/weak-password";
    pub const USER_DISABLED: &str = "auth/user-disabled";
    pub const USER_NOT_FOUND: &str = "auth/user-not-found";
    pub const WRONG_PASSWORD: &str = "auth/wrong-password";
    pub const INVALID_CREDENTIAL: &str = "auth/invalid-credential";
    pub const TOO_MANY_REQUESTS: &str = "auth/too-many-requests";
    pub const REQUIRES_RECENT_LOGIN: &str = "auth/requires-recent-login";
    pub const USER_TOKEN_EXPIRED: &str = "auth/user-token-expired";
    pub const INVALID_USER_TOKEN: &str = "auth/invalid-user-token";
    pub const NETWORK_REQUEST_FAILED: &str = "auth/network-request-failed";
    pub const INTERNAL_ERROR: &str = "auth/internal-error";
    pub const PERMISSION_DENIED: &str = "permission-denied";
    pub const UNAVAILABLE: &str = "unavailable";
    pub const DEADLINE_EXCEEDED: &str = "deadline-exceeded";

    /// Raised locally when an operation needs a signed-in user and there is none
    pub const NO_CURRENT_USER: &str = "corpreg/no-current-user";
}

/// Closed set of failure categories reported at the façade boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCategory {
    AlreadyInUse,
    InvalidEmail,
    /// Email/password sign-up is switched off at the provider
    DisabledFeature,
    WeakPassword,
    UserDisabled,
    NotFound,
    WrongPassword,
    RateLimited,
    RequiresRecentLogin,
    PermissionDenied,
    Unavailable,
    /// No signed-in user when one is required; never reaches the provider
    PreconditionFailed,
    /// Fallback for provider codes without a mapping
    Unknown,
}

impl ErrorCategory {
    /// Map a provider error code onto a category.
    ///
    /// Pure: the same code always yields the same category.
    pub fn from_code(code: &str) -> Self {
        match code {
            codes::EMAIL_ALREADY_IN_USE => Self::AlreadyInUse,
            codes::INVALID_EMAIL => Self::InvalidEmail,
            codes::OPERATION_NOT_ALLOWED => Self::DisabledFeature,
            codes::WEAK_PASSWORD => Self::WeakPassword,
            codes::USER_DISABLED => Self::UserDisabled,
            codes::USER_NOT_FOUND => Self::NotFound,
            codes::WRONG_PASSWORD | codes::INVALID_CREDENTIAL => Self::WrongPassword,
            codes::TOO_MANY_REQUESTS => Self::RateLimited,
            codes::REQUIRES_RECENT_LOGIN
            | codes::USER_TOKEN_EXPIRED
            | codes::INVALID_USER_TOKEN => Self::RequiresRecentLogin,
            codes::NETWORK_REQUEST_FAILED | codes::UNAVAILABLE | codes::DEADLINE_EXCEEDED => {
                Self::Unavailable
            }
            codes::PERMISSION_DENIED => Self::PermissionDenied,
            codes::NO_CURRENT_USER => Self::PreconditionFailed,
            _ => Self::Unknown,
        }
    }

    /// Coarse failure class this category belongs to
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::AlreadyInUse
            | Self::InvalidEmail
            | Self::DisabledFeature
            | Self::WeakPassword
            | Self::WrongPassword
            | Self::UserDisabled
            | Self::PermissionDenied => ErrorClass::InputRejected,
            Self::RequiresRecentLogin => ErrorClass::AuthorizationStale,
            Self::NotFound => ErrorClass::NotFound,
            Self::RateLimited => ErrorClass::RateLimited,
            Self::Unavailable | Self::Unknown => ErrorClass::Unavailable,
            Self::PreconditionFailed => ErrorClass::PreconditionFailed,
        }
    }

    /// Kebab-case name, identical to the serialized form
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AlreadyInUse => "already-in-use",
            Self::InvalidEmail => "invalid-email",
            Self::DisabledFeature => "disabled-feature",
            Self::WeakPassword => "weak-password",
            Self::UserDisabled => "user-disabled",
            Self::NotFound => "not-found",
            Self::WrongPassword => "wrong-password",
            Self::RateLimited => "rate-limited",
            Self::RequiresRecentLogin => "requires-recent-login",
            Self::PermissionDenied => "permission-denied",
            Self::Unavailable => "unavailable",
            Self::PreconditionFailed => "precondition-failed",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure taxonomy used to decide how a caller should react
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Malformed or conflicting input - not retryable without input changes
    InputRejected,
    /// A fresh sign-in is needed before the action can go through
    AuthorizationStale,
    /// No matching account
    NotFound,
    /// Provider throttled the caller - retryable later
    RateLimited,
    /// Network trouble or an unclassified provider failure
    Unavailable,
    /// Invoked without a signed-in user; raised locally
    PreconditionFailed,
}

impl ErrorClass {
    /// Returns true if retrying the same request later might succeed.
    ///
    /// Advisory only; nothing in this crate retries on its own.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimited | Self::Unavailable => true,
            Self::InputRejected
            | Self::AuthorizationStale
            | Self::NotFound
            | Self::PreconditionFailed => false,
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorClass::InputRejected => write!(f, "InputRejected"),
            ErrorClass::AuthorizationStale => write!(f, "AuthorizationStale"),
            ErrorClass::NotFound => write!(f, "NotFound"),
            ErrorClass::RateLimited => write!(f, "RateLimited"),
            ErrorClass::Unavailable => write!(f, "Unavailable"),
            ErrorClass::PreconditionFailed => write!(f, "PreconditionFailed"),
        }
    }
}

/// Structured error returned by an identity provider
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct ProviderError {
    /// Stable machine-readable code, e.g. `auth/weak-password`
    pub code: String,
    /// Provider supplied detail, for logs only
    pub message: String,
}

impl ProviderError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Transport level failure talking to the provider
    pub fn network(reason: impl fmt::Display) -> Self {
        Self::new(codes::NETWORK_REQUEST_FAILED, reason.to_string())
    }

    /// Provider answered with something we could not interpret
    pub fn internal(reason: impl fmt::Display) -> Self {
        Self::new(codes::INTERNAL_ERROR, reason.to_string())
    }

    pub fn category(&self) -> ErrorCategory {
        ErrorCategory::from_code(&self.code)
    }
}

/// Errors raised by configuration loading and session storage
#[derive(Error, Debug)]
pub enum CorpregError {
    #[error("Missing required provider config field: {field}")]
    ConfigMissing { field: &'static str },

    #[error("Invalid configuration: {reason}")]
    ConfigInvalid { reason: String },

    #[error("Session store integrity check failed for '{key}'")]
    StoreIntegrity { key: String },

    #[error("Session store I/O failed: {0}")]
    StoreIo(#[from] std::io::Error),

    #[error("Session store payload is malformed: {0}")]
    StoreFormat(#[from] serde_json::Error),
}

impl CorpregError {
    pub fn config_invalid(reason: impl fmt::Display) -> Self {
        CorpregError::ConfigInvalid {
            reason: reason.to_string(),
        }
    }
}
