//! Error types for the protocol crate.

use thiserror::Error;

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Result type for remote round trips.
pub type RemoteResult<T> = Result<T, RemoteError>;

/// Errors that can occur while encoding or decoding protocol payloads.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Failed to encode a value.
    #[error("encoding failed: {message}")]
    EncodingFailed {
        /// Description of the encoding error.
        message: String,
    },

    /// Failed to decode bytes.
    #[error("decoding failed: {message}")]
    DecodingFailed {
        /// Description of the decoding error.
        message: String,
    },

    /// The length prefix disagrees with the payload.
    #[error("length prefix {declared} does not match payload of {actual} bytes")]
    LengthMismatch {
        /// Length declared by the prefix.
        declared: usize,
        /// Bytes actually present after the prefix.
        actual: usize,
    },
}

impl CodecError {
    /// Create an encoding failed error.
    pub fn encoding_failed(message: impl Into<String>) -> Self {
        Self::EncodingFailed {
            message: message.into(),
        }
    }

    /// Create a decoding failed error.
    pub fn decoding_failed(message: impl Into<String>) -> Self {
        Self::DecodingFailed {
            message: message.into(),
        }
    }
}

/// Error codes reported by the remote record store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteErrorCode {
    /// The device has no network connection.
    NetworkUnavailable,
    /// The connection dropped mid-request.
    NetworkFailure,
    /// The service is temporarily unavailable.
    ServiceUnavailable,
    /// The client is sending requests too quickly.
    RequestRateLimited,
    /// The zone does not exist.
    ZoneNotFound,
    /// The user deleted the zone through another device or settings.
    UserDeletedZone,
    /// The request carried too many items or bytes.
    LimitExceeded,
    /// The server copy changed since the client last fetched it.
    ServerRecordChanged,
    /// The change token is no longer valid.
    ChangeTokenExpired,
    /// The referenced operation or item is unknown.
    UnknownItem,
    /// The account storage quota is exhausted.
    QuotaExceeded,
    /// The request was cancelled before completion.
    OperationCancelled,
    /// Any other server-side failure.
    Internal,
}

/// An error reported by the remote record store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{code:?}: {message}")]
pub struct RemoteError {
    /// Machine readable error code.
    pub code: RemoteErrorCode,
    /// Human readable detail.
    pub message: String,
}

impl RemoteError {
    /// Creates a remote error.
    pub fn new(code: RemoteErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Returns true if the zone no longer exists on the server.
    pub fn is_zone_deleted(&self) -> bool {
        matches!(
            self.code,
            RemoteErrorCode::ZoneNotFound | RemoteErrorCode::UserDeletedZone
        )
    }

    /// Returns true if the request must be split before it can succeed.
    pub fn is_limit_exceeded(&self) -> bool {
        self.code == RemoteErrorCode::LimitExceeded
    }

    /// Returns true if an optimistic save lost against a newer server copy.
    pub fn is_conflict(&self) -> bool {
        self.code == RemoteErrorCode::ServerRecordChanged
    }

    /// Returns true if the same request may succeed later unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.code,
            RemoteErrorCode::NetworkUnavailable
                | RemoteErrorCode::NetworkFailure
                | RemoteErrorCode::ServiceUnavailable
                | RemoteErrorCode::RequestRateLimited
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zone_deleted_codes() {
        assert!(RemoteError::new(RemoteErrorCode::ZoneNotFound, "gone").is_zone_deleted());
        assert!(RemoteError::new(RemoteErrorCode::UserDeletedZone, "gone").is_zone_deleted());
        assert!(!RemoteError::new(RemoteErrorCode::UnknownItem, "gone").is_zone_deleted());
    }

    #[test]
    fn retryable_codes() {
        assert!(RemoteError::new(RemoteErrorCode::NetworkFailure, "reset").is_retryable());
        assert!(!RemoteError::new(RemoteErrorCode::ServerRecordChanged, "tag").is_retryable());
        assert!(!RemoteError::new(RemoteErrorCode::LimitExceeded, "big").is_retryable());
    }

    #[test]
    fn error_display() {
        let err = RemoteError::new(RemoteErrorCode::LimitExceeded, "too many records");
        assert_eq!(err.to_string(), "LimitExceeded: too many records");

        let err = CodecError::LengthMismatch {
            declared: 8,
            actual: 3,
        };
        assert!(err.to_string().contains('8'));
        assert!(err.to_string().contains('3'));
    }
}
