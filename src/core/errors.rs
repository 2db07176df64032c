use std::collections::HashMap;
use thiserror::Error;

/// Error type for every fallible operation in the client runtime.
///
/// Recoverable conditions (expired access token, stale CSRF token) are resolved
/// inside the request pipeline and never surface here. Callers are expected to
/// branch on the variant or on [`ClientError::status`], not on message text.
#[derive(Error, Debug)]
pub enum ClientError {
    /// The credential is invalid or expired and silent re-authentication
    /// failed. Terminal for the current session; the caller must re-login.
    #[error("authentication expired; sign in again")]
    AuthenticationExpired,

    /// Login or registration itself was rejected. Never retried; the message
    /// is surfaced verbatim to the user.
    #[error("authentication rejected: {0}")]
    AuthenticationRejected(String),

    /// A state-changing request was still rejected after a forced CSRF token
    /// refresh. Transient; the user should retry the action.
    #[error("request rejected by CSRF protection")]
    CsrfRejected,

    /// Authorization failure (403 without a CSRF signal). Never retried.
    #[error("access denied: {0}")]
    AccessDenied(String),

    /// 4xx with structured per-field errors, for field-level display.
    #[error("validation failed: {message}")]
    ValidationFailed {
        status: u16,
        message: String,
        errors: HashMap<String, Vec<String>>,
    },

    /// Any other non-2xx response with a parseable or raw-text message.
    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// Transport-level failure; no response was received.
    #[error("network error: {0}")]
    Network(String),

    /// A 2xx response whose body could not be parsed as expected. Treated as
    /// a server-contract violation.
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    /// Real-time channel failure outside the automatic-reconnect path.
    #[error("channel error: {0}")]
    Channel(String),

    /// The channel was asked to connect without a usable credential, or the
    /// session store could not produce one.
    #[error("credential error: {0}")]
    Credential(String),

    #[error("configuration error: {0}")]
    Config(#[from] crate::core::config::ConfigError),
}

impl ClientError {
    /// The HTTP status attached to this error, when one exists.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::AuthenticationExpired | Self::AuthenticationRejected(_) => Some(401),
            Self::CsrfRejected | Self::AccessDenied(_) => Some(403),
            Self::ValidationFailed { status, .. } | Self::Api { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Whether this error should send the user back to the sign-in entry point.
    pub fn requires_login(&self) -> bool {
        matches!(self, Self::AuthenticationExpired)
    }

    /// Whether this is a connectivity problem rather than a server-returned
    /// error, so the UI can show a retryable banner instead of a failure page.
    pub fn is_network(&self) -> bool {
        matches!(self, Self::Network(_))
    }
}
