//! Gateway error taxonomy.

use serde::Serialize;
use thiserror::Error;

use crate::store::StoreError;

/// Close code used when the client presented no credential.
pub const CLOSE_UNAUTHENTICATED: u16 = 4001;
/// Close code used when the credential did not resolve to a session.
pub const CLOSE_INVALID_SESSION: u16 = 4002;
/// Close code used when the account is suspended.
pub const CLOSE_ACCOUNT_SUSPENDED: u16 = 4003;
/// Close code used when the auth collaborator could not be reached.
pub const CLOSE_UNKNOWN_ERROR: u16 = 4000;
/// Close code used when the connection left a liveness ping unanswered.
pub const CLOSE_SESSION_TIMEOUT: u16 = 4009;

/// Every failure the gateway can report, either as a close reason or as a
/// scoped error event.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    #[error("Authentication required")]
    Unauthenticated,
    #[error("Invalid or expired session")]
    InvalidSession,
    #[error("Account suspended")]
    AccountSuspended,
    #[error("{0}")]
    AccessDenied(String),
    #[error("Rate limit exceeded")]
    RateLimitExceeded,
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    Persistence(String),
}

impl GatewayError {
    pub fn access_denied(message: impl Into<String>) -> Self {
        Self::AccessDenied(message.into())
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Stable wire code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unauthenticated => "UNAUTHENTICATED",
            Self::InvalidSession => "INVALID_SESSION",
            Self::AccountSuspended => "ACCOUNT_SUSPENDED",
            Self::AccessDenied(_) => "ACCESS_DENIED",
            Self::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::Persistence(_) => "PERSISTENCE_FAILURE",
        }
    }

    /// WebSocket close code for errors that terminate the connection.
    pub fn close_code(&self) -> u16 {
        match self {
            Self::Unauthenticated => CLOSE_UNAUTHENTICATED,
            Self::InvalidSession => CLOSE_INVALID_SESSION,
            Self::AccountSuspended => CLOSE_ACCOUNT_SUSPENDED,
            _ => CLOSE_UNKNOWN_ERROR,
        }
    }

    /// Build the body of a scoped error event.
    pub fn to_body(&self, event: &str) -> ErrorBody {
        ErrorBody {
            code: self.code().to_string(),
            message: self.to_string(),
            event: event.to_string(),
        }
    }
}

impl From<StoreError> for GatewayError {
    fn from(err: StoreError) -> Self {
        tracing::error!(?err, "persistence collaborator error");
        Self::Persistence("An internal error occurred".to_string())
    }
}

/// Payload of `error`, `messageError` and `streamError` events.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    /// The client event that failed.
    pub event: String,
}
