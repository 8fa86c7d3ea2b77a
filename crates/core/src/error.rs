//! Shared error model: core validation errors and the wire-level error codes.

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type used by the value types in this crate.
pub type CoreResult<T> = Result<T, CoreError>;

/// Error raised while constructing or validating core values.
///
/// These are deterministic input failures; storage and lease failures live in
/// the infrastructure layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// A value failed validation (e.g. revision 0, empty name).
    #[error("validation failed: {0}")]
    Validation(String),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),
}

impl CoreError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }
}

/// Coarse error category, used to decide retry and status behaviour.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed request or out-of-range parameter. Never retried.
    Validation,
    /// Duplicate revision or duplicate enqueue key.
    Conflict,
    /// Lease failures a worker decides to retry or abandon.
    Lease,
    /// Lookup of something that does not exist.
    NotFound,
    /// Anything unexpected.
    Unknown,
}

/// Error codes carried in `{ code, message }` error bodies.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    TokenMismatch,
    RequestMalformed,
    ItemNotFound,
    ItemNotLocked,
    ItemAlreadyQueued,
    RevisionAlreadyExists,
    RevisionGap,
    AggregateIdentifierMalformed,
    NotFound,
    UnknownError,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::TokenMismatch => "ETOKENMISMATCH",
            ErrorCode::RequestMalformed => "EREQUESTMALFORMED",
            ErrorCode::ItemNotFound => "EITEMNOTFOUND",
            ErrorCode::ItemNotLocked => "EITEMNOTLOCKED",
            ErrorCode::ItemAlreadyQueued => "EITEMALREADYQUEUED",
            ErrorCode::RevisionAlreadyExists => "EREVISIONALREADYEXISTS",
            ErrorCode::RevisionGap => "EREVISIONGAP",
            ErrorCode::AggregateIdentifierMalformed => "EAGGREGATEIDENTIFIERMALFORMED",
            ErrorCode::NotFound => "ENOTFOUND",
            ErrorCode::UnknownError => "EUNKNOWNERROR",
        }
    }

    pub fn kind(self) -> ErrorKind {
        match self {
            ErrorCode::RequestMalformed
            | ErrorCode::RevisionGap
            | ErrorCode::AggregateIdentifierMalformed => ErrorKind::Validation,
            ErrorCode::ItemAlreadyQueued | ErrorCode::RevisionAlreadyExists => ErrorKind::Conflict,
            ErrorCode::TokenMismatch | ErrorCode::ItemNotFound | ErrorCode::ItemNotLocked => {
                ErrorKind::Lease
            }
            ErrorCode::NotFound => ErrorKind::NotFound,
            ErrorCode::UnknownError => ErrorKind::Unknown,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorCode {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let code = match s {
            "ETOKENMISMATCH" => ErrorCode::TokenMismatch,
            "EREQUESTMALFORMED" => ErrorCode::RequestMalformed,
            "EITEMNOTFOUND" => ErrorCode::ItemNotFound,
            "EITEMNOTLOCKED" => ErrorCode::ItemNotLocked,
            "EITEMALREADYQUEUED" => ErrorCode::ItemAlreadyQueued,
            "EREVISIONALREADYEXISTS" => ErrorCode::RevisionAlreadyExists,
            "EREVISIONGAP" => ErrorCode::RevisionGap,
            "EAGGREGATEIDENTIFIERMALFORMED" => ErrorCode::AggregateIdentifierMalformed,
            "ENOTFOUND" => ErrorCode::NotFound,
            "EUNKNOWNERROR" => ErrorCode::UnknownError,
            other => return Err(CoreError::validation(format!("unknown error code '{other}'"))),
        };
        Ok(code)
    }
}

impl Serialize for ErrorCode {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ErrorCode {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip_through_strings() {
        for code in [
            ErrorCode::TokenMismatch,
            ErrorCode::RequestMalformed,
            ErrorCode::ItemNotFound,
            ErrorCode::ItemNotLocked,
            ErrorCode::ItemAlreadyQueued,
            ErrorCode::RevisionAlreadyExists,
            ErrorCode::RevisionGap,
            ErrorCode::AggregateIdentifierMalformed,
            ErrorCode::NotFound,
            ErrorCode::UnknownError,
        ] {
            assert_eq!(code.as_str().parse::<ErrorCode>().unwrap(), code);
        }
    }

    #[test]
    fn lease_codes_are_lease_errors() {
        assert_eq!(ErrorCode::TokenMismatch.kind(), ErrorKind::Lease);
        assert_eq!(ErrorCode::ItemNotLocked.kind(), ErrorKind::Lease);
        assert_eq!(ErrorCode::RevisionAlreadyExists.kind(), ErrorKind::Conflict);
    }

    #[test]
    fn serializes_as_wire_string() {
        let json = serde_json::to_string(&ErrorCode::ItemNotLocked).unwrap();
        assert_eq!(json, "\"EITEMNOTLOCKED\"");
    }
}
