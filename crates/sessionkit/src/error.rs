//! Error types for sessionkit
//!
//! Every failure carries a machine-readable [`ErrorCode`] plus a human-readable
//! description. The variants follow the failure taxonomy of the engine:
//!
//! - Input validation: blank or missing arguments, never retried
//! - Token validation: parse, signature, expiry and missing-key failures
//! - Key resolution: the remote key-set fetch failed (not cached, retried later)
//! - Remote: network/HTTP failures, with server error details when available
//! - Timeout / Cancelled: I/O aborted, never conflated with validation failures

use std::fmt;

use thiserror::Error;

/// Result type for sessionkit operations
pub type AuthResult<T> = std::result::Result<T, AuthError>;

/// Machine-readable error code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// A required argument was blank
    EmptyInput,
    /// Both session and refresh tokens were blank
    BothEmpty,
    /// Session validation failed and no refresh token was supplied
    RefreshRequired,
    /// Project id missing at construction time
    MissingProjectId,
    /// Authenticator invoked without a request
    MissingRequest,
    /// Token failed parsing, signature or expiry checks
    InvalidToken,
    /// Session token rejected
    SessionInvalid,
    /// Refresh token rejected
    RefreshInvalid,
    /// Token returned by the identity provider could not be validated
    RefreshParseError,
    /// No signing key published for the requested key id
    KeyNotFound,
    /// Key-set fetch failed
    KeyFetchFailed,
    /// Remote call failed
    RemoteCall,
    /// Remote call timed out
    Timeout,
    /// Remote call cancelled
    Cancelled,
    /// Invalid client configuration
    Configuration,
}

impl ErrorCode {
    /// Stable string form of the code
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::EmptyInput => "empty_input",
            Self::BothEmpty => "both_empty",
            Self::RefreshRequired => "refresh_required",
            Self::MissingProjectId => "missing_project_id",
            Self::MissingRequest => "missing_request",
            Self::InvalidToken => "invalid_token",
            Self::SessionInvalid => "session_invalid",
            Self::RefreshInvalid => "refresh_invalid",
            Self::RefreshParseError => "refresh_parse_error",
            Self::KeyNotFound => "key_not_found",
            Self::KeyFetchFailed => "key_fetch_failed",
            Self::RemoteCall => "remote_call",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::Configuration => "configuration",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Main error type for sessionkit
///
/// `Clone` so that one failed key fetch can be handed to every caller waiting
/// on the same single-flight slot.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum AuthError {
    /// Blank or missing required argument
    #[error("Invalid input ({code}): {message}")]
    InvalidInput { code: ErrorCode, message: String },

    /// Token parse, signature, expiry or key lookup failure
    ///
    /// The underlying cryptographic error is never carried here.
    #[error("Token validation failed ({code}): {message}")]
    TokenValidation { code: ErrorCode, message: String },

    /// The signing key set could not be fetched
    #[error("Key resolution failed: {message}")]
    KeyResolution { message: String },

    /// Remote identity provider call failed
    ///
    /// `code`, `description` and `message` come from the structured error
    /// body when the server sends one, otherwise `code` is `HTTP{status}`.
    #[error("Remote call failed ({code}): {description}")]
    Remote {
        status: Option<u16>,
        code: String,
        description: String,
        message: Option<String>,
    },

    /// Remote call exceeded the configured timeout
    #[error("Timeout: {operation} did not complete in time")]
    Timeout { operation: String },

    /// Remote call aborted through the cancellation token
    #[error("Cancelled: {operation}")]
    Cancelled { operation: String },

    /// Invalid client configuration
    #[error("Configuration error: {message}")]
    Configuration { message: String },
}

impl AuthError {
    /// Create an input validation error
    pub fn invalid_input(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::InvalidInput {
            code,
            message: message.into(),
        }
    }

    /// Create an empty-input error for the named argument
    pub fn empty_input(argument: &str) -> Self {
        Self::invalid_input(ErrorCode::EmptyInput, format!("{argument} is required"))
    }

    /// Create a token validation error with an explicit code
    pub fn token_validation(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::TokenValidation {
            code,
            message: message.into(),
        }
    }

    /// Create a generic invalid-token error
    pub fn invalid_token(message: impl Into<String>) -> Self {
        Self::token_validation(ErrorCode::InvalidToken, message)
    }

    /// Create a key-not-found error
    pub fn key_not_found(key_id: &str) -> Self {
        Self::token_validation(
            ErrorCode::KeyNotFound,
            format!("no signing key published for kid '{key_id}'"),
        )
    }

    /// Create a key resolution error
    pub fn key_resolution(message: impl Into<String>) -> Self {
        Self::KeyResolution {
            message: message.into(),
        }
    }

    /// Create a remote error synthesized from an HTTP status
    pub fn http_status(status: u16, description: impl Into<String>) -> Self {
        Self::Remote {
            status: Some(status),
            code: format!("HTTP{status}"),
            description: description.into(),
            message: None,
        }
    }

    /// Create a remote error for a failure that produced no HTTP status
    pub fn network(description: impl Into<String>) -> Self {
        Self::Remote {
            status: None,
            code: "NETWORK".to_string(),
            description: description.into(),
            message: None,
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>) -> Self {
        Self::Timeout {
            operation: operation.into(),
        }
    }

    /// Create a cancellation error
    pub fn cancelled(operation: impl Into<String>) -> Self {
        Self::Cancelled {
            operation: operation.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Machine-readable code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidInput { code, .. } | Self::TokenValidation { code, .. } => *code,
            Self::KeyResolution { .. } => ErrorCode::KeyFetchFailed,
            Self::Remote { .. } => ErrorCode::RemoteCall,
            Self::Timeout { .. } => ErrorCode::Timeout,
            Self::Cancelled { .. } => ErrorCode::Cancelled,
            Self::Configuration { .. } => ErrorCode::Configuration,
        }
    }

    /// Whether this is a local token validation failure
    pub fn is_token_validation(&self) -> bool {
        matches!(self, Self::TokenValidation { .. })
    }

    /// Re-tag a token validation failure with a lifecycle-specific code.
    ///
    /// Every other kind of error passes through untouched.
    pub(crate) fn retag_validation(self, code: ErrorCode) -> Self {
        match self {
            Self::TokenValidation { message, .. } => Self::TokenValidation { code, message },
            other => other,
        }
    }

    /// HTTP status returned by the identity provider, if any
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Remote { status, .. } => *status,
            _ => None,
        }
    }
}
