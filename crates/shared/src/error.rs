use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Offline,
    Timeout,
    Network,
    Expired,
    Unknown,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::Offline => "offline",
            ErrorCode::Timeout => "timeout",
            ErrorCode::Network => "network",
            ErrorCode::Expired => "expired",
            ErrorCode::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classified terminal failure of a reconciliation pass.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct CartError {
    pub code: ErrorCode,
    pub message: String,
}

impl CartError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn offline() -> Self {
        Self::new(ErrorCode::Offline, "network unavailable; waiting to reconnect")
    }

    pub fn is_offline(&self) -> bool {
        self.code == ErrorCode::Offline
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_serialize_as_snake_case() {
        let err = CartError::new(ErrorCode::Timeout, "deadline exceeded");
        let json = serde_json::to_value(&err).expect("serialize");
        assert_eq!(json["code"], "timeout");
        assert_eq!(err.to_string(), "timeout: deadline exceeded");
    }

    #[test]
    fn offline_constructor_is_classified() {
        assert!(CartError::offline().is_offline());
        assert!(!CartError::new(ErrorCode::Network, "reset").is_offline());
    }
}
