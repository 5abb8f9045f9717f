//! API error kinds that cross the wire as the `error` field of a failed response.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable machine-readable error code, serialized as the `code` field of
/// an `ApiError`. Values never change meaning once shipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    ConfigInvalid,
    NoSuchDevice,
    Ambiguous,
    AlreadyAttached,
    NotAttached,
    VmUnreachable,
    ProtocolError,
    Unsupported,
    Timeout,
    SourceLost,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ConfigInvalid => "config_invalid",
            ErrorCode::NoSuchDevice => "no_such_device",
            ErrorCode::Ambiguous => "ambiguous",
            ErrorCode::AlreadyAttached => "already_attached",
            ErrorCode::NotAttached => "not_attached",
            ErrorCode::VmUnreachable => "vm_unreachable",
            ErrorCode::ProtocolError => "protocol_error",
            ErrorCode::Unsupported => "unsupported",
            ErrorCode::Timeout => "timeout",
            ErrorCode::SourceLost => "source_lost",
        }
    }
}

/// An error returned to an API client as part of a `"result":"failed"` response.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("{message}")]
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

    pub fn config_invalid(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ConfigInvalid, message)
    }

    pub fn no_such_device(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NoSuchDevice, message)
    }

    pub fn ambiguous(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Ambiguous, message)
    }

    pub fn already_attached(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::AlreadyAttached, message)
    }

    pub fn not_attached(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotAttached, message)
    }

    pub fn vm_unreachable(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::VmUnreachable, message)
    }

    pub fn protocol_error(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ProtocolError, message)
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unsupported, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Timeout, message)
    }

    pub fn source_lost(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::SourceLost, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_code_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorCode::NoSuchDevice).unwrap();
        assert_eq!(json, "\"no_such_device\"");
    }

    #[test]
    fn api_error_round_trips() {
        let err = ApiError::ambiguous("2 devices match vid=046d");
        let json = serde_json::to_string(&err).unwrap();
        let parsed: ApiError = serde_json::from_str(&json).unwrap();
        assert_eq!(err.code, parsed.code);
        assert_eq!(err.message, parsed.message);
    }

    #[test]
    fn as_str_matches_serde_rename() {
        for code in [
            ErrorCode::ConfigInvalid,
            ErrorCode::NoSuchDevice,
            ErrorCode::Ambiguous,
            ErrorCode::AlreadyAttached,
            ErrorCode::NotAttached,
            ErrorCode::VmUnreachable,
            ErrorCode::ProtocolError,
            ErrorCode::Unsupported,
            ErrorCode::Timeout,
            ErrorCode::SourceLost,
        ] {
            let json = serde_json::to_string(&code).unwrap();
            assert_eq!(json, format!("\"{}\"", code.as_str()));
        }
    }
}
