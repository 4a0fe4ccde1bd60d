use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Codes the session server attaches to rejected operations. The
/// presenter-authority codes mirror the client's own optimistic checks;
/// the server remains the enforcement authority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Unauthorized,
    NotHost,
    NotPresenter,
    TargetOffline,
    SelfHandOff,
    WrongPhase,
    NotFound,
    Validation,
    RateLimited,
    Internal,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unauthorized => "unauthorized",
            Self::NotHost => "not_host",
            Self::NotPresenter => "not_presenter",
            Self::TargetOffline => "target_offline",
            Self::SelfHandOff => "self_hand_off",
            Self::WrongPhase => "wrong_phase",
            Self::NotFound => "not_found",
            Self::Validation => "validation",
            Self::RateLimited => "rate_limited",
            Self::Internal => "internal",
        }
    }

    /// Codes worth retrying as-is; everything else needs a changed
    /// request or an operator decision.
    pub fn is_transient(self) -> bool {
        matches!(self, Self::RateLimited | Self::Internal)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wire form of a rejected operation, delivered both as an HTTP error
/// body and as an `error` message over the live connection.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}
