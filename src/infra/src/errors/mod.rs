// Copyright 2025 Datapunk Contributors.
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

use config::utils::json;
use thiserror::Error as ThisError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(ThisError, Debug)]
pub enum Error {
    #[error("IoError# {0}")]
    IoError(#[from] std::io::Error),
    #[error("SerdeJsonError# {0}")]
    SerdeJsonError(#[from] json::Error),
    #[error("MsgPackEncodeError# {0}")]
    MsgPackEncodeError(#[from] rmp_serde::encode::Error),
    #[error("MsgPackDecodeError# {0}")]
    MsgPackDecodeError(#[from] rmp_serde::decode::Error),
    #[error("RedisError# {0}")]
    RedisError(#[from] redis::RedisError),
    #[error("WalError# {0}")]
    WalError(#[from] wal::Error),
    #[error("ObjectStoreError# {0}")]
    ObjectStoreError(#[from] object_store::Error),
    #[error("Error# {0}")]
    Message(String),
    #[error("ErrorCode# {0}")]
    ErrorCode(ErrorCodes),
    #[error("Not implemented")]
    NotImplemented,
    #[error("Unknown error")]
    Unknown,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::ErrorCode(code) => code.kind(),
            Error::SerdeJsonError(_) | Error::MsgPackDecodeError(_) => ErrorKind::Input,
            Error::RedisError(_) => ErrorKind::Transient,
            Error::WalError(wal::Error::ChecksumMismatch { .. }) => ErrorKind::Corrupt,
            _ => ErrorKind::Internal,
        }
    }

    /// only transient failures of idempotent operations may be retried
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    pub fn http_status(&self) -> u16 {
        match self {
            Error::ErrorCode(code) => code.http_status(),
            _ => self.kind().default_http_status(),
        }
    }
}

/// the error taxonomy, every surfaced failure belongs to exactly one kind
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    Input,
    Policy,
    NotFound,
    Conflict,
    Transient,
    Corrupt,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Input => "input",
            ErrorKind::Policy => "policy",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Transient => "transient",
            ErrorKind::Corrupt => "corrupt",
            ErrorKind::Internal => "internal",
        }
    }

    pub fn default_http_status(&self) -> u16 {
        match self {
            ErrorKind::Input => 400,
            ErrorKind::Policy => 403,
            ErrorKind::NotFound => 404,
            ErrorKind::Conflict => 409,
            ErrorKind::Transient => 503,
            ErrorKind::Corrupt => 500,
            ErrorKind::Internal => 500,
        }
    }
}

#[derive(ThisError, Debug)]
pub enum ErrorCodes {
    ServerInternalError(String),
    InvalidRequest(String),
    QueryParseError(String),
    QueryValidationError(String),
    AuthFailed,
    Forbidden(String),
    QuotaExceeded(String),
    RateLimited(String),
    PartitionNotFound(String),
    NodeNotFound(String),
    SourceNotFound(String),
    StrategyNotFound(String),
    VersionConflict(String),
    DuplicateId(String),
    Timeout(String),
    PeerUnreachable(String),
    CircuitOpen(String),
    QueryCancelled(String),
    ChecksumMismatch(String),
    LogTruncated(String),
}

impl std::fmt::Display for ErrorCodes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            r#"{{"error_code": {}, "error_msg": "{}"}}"#,
            self.get_code(),
            self.get_message()
        )
    }
}

impl ErrorCodes {
    pub fn get_code(&self) -> u16 {
        match self {
            ErrorCodes::ServerInternalError(_) => 10001,
            ErrorCodes::InvalidRequest(_) => 20001,
            ErrorCodes::QueryParseError(_) => 20002,
            ErrorCodes::QueryValidationError(_) => 20003,
            ErrorCodes::AuthFailed => 30001,
            ErrorCodes::Forbidden(_) => 30002,
            ErrorCodes::QuotaExceeded(_) => 30003,
            ErrorCodes::RateLimited(_) => 30004,
            ErrorCodes::PartitionNotFound(_) => 40001,
            ErrorCodes::NodeNotFound(_) => 40002,
            ErrorCodes::SourceNotFound(_) => 40003,
            ErrorCodes::StrategyNotFound(_) => 40004,
            ErrorCodes::VersionConflict(_) => 50001,
            ErrorCodes::DuplicateId(_) => 50002,
            ErrorCodes::Timeout(_) => 60001,
            ErrorCodes::PeerUnreachable(_) => 60002,
            ErrorCodes::CircuitOpen(_) => 60003,
            ErrorCodes::QueryCancelled(_) => 60004,
            ErrorCodes::ChecksumMismatch(_) => 70001,
            ErrorCodes::LogTruncated(_) => 70002,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ErrorCodes::ServerInternalError(_) => ErrorKind::Internal,
            ErrorCodes::InvalidRequest(_)
            | ErrorCodes::QueryParseError(_)
            | ErrorCodes::QueryValidationError(_) => ErrorKind::Input,
            ErrorCodes::AuthFailed
            | ErrorCodes::Forbidden(_)
            | ErrorCodes::QuotaExceeded(_)
            | ErrorCodes::RateLimited(_) => ErrorKind::Policy,
            ErrorCodes::PartitionNotFound(_)
            | ErrorCodes::NodeNotFound(_)
            | ErrorCodes::SourceNotFound(_)
            | ErrorCodes::StrategyNotFound(_) => ErrorKind::NotFound,
            ErrorCodes::VersionConflict(_) | ErrorCodes::DuplicateId(_) => ErrorKind::Conflict,
            ErrorCodes::Timeout(_)
            | ErrorCodes::PeerUnreachable(_)
            | ErrorCodes::CircuitOpen(_)
            | ErrorCodes::QueryCancelled(_) => ErrorKind::Transient,
            ErrorCodes::ChecksumMismatch(_) | ErrorCodes::LogTruncated(_) => ErrorKind::Corrupt,
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            ErrorCodes::AuthFailed => 401,
            ErrorCodes::QuotaExceeded(_) | ErrorCodes::RateLimited(_) => 429,
            ErrorCodes::QueryValidationError(_) => 422,
            ErrorCodes::Timeout(_) => 504,
            other => other.kind().default_http_status(),
        }
    }

    pub fn get_message(&self) -> String {
        match self {
            ErrorCodes::ServerInternalError(_) => "Server Internal Error".to_string(),
            ErrorCodes::InvalidRequest(msg) => format!("Invalid request: {msg}"),
            ErrorCodes::QueryParseError(_) => "Query parse error".to_string(),
            ErrorCodes::QueryValidationError(_) => "Query validation error".to_string(),
            ErrorCodes::AuthFailed => "Authentication failed".to_string(),
            ErrorCodes::Forbidden(resource) => format!("Access denied: {resource}"),
            ErrorCodes::QuotaExceeded(tenant) => format!("Quota exceeded for tenant: {tenant}"),
            ErrorCodes::RateLimited(_) => "Too many requests".to_string(),
            ErrorCodes::PartitionNotFound(p) => format!("Partition not found: {p}"),
            ErrorCodes::NodeNotFound(n) => format!("Node not found: {n}"),
            ErrorCodes::SourceNotFound(s) => format!("Data source not found: {s}"),
            ErrorCodes::StrategyNotFound(s) => format!("Partition strategy not found: {s}"),
            ErrorCodes::VersionConflict(_) => "Version conflict".to_string(),
            ErrorCodes::DuplicateId(id) => format!("Duplicate id: {id}"),
            ErrorCodes::Timeout(_) => "Operation timed out".to_string(),
            ErrorCodes::PeerUnreachable(peer) => format!("Peer unreachable: {peer}"),
            ErrorCodes::CircuitOpen(target) => format!("Circuit open for: {target}"),
            ErrorCodes::QueryCancelled(_) => "Query was cancelled".to_string(),
            ErrorCodes::ChecksumMismatch(what) => format!("Checksum mismatch: {what}"),
            ErrorCodes::LogTruncated(what) => format!("Log truncated: {what}"),
        }
    }

    pub fn get_inner_message(&self) -> String {
        match self {
            ErrorCodes::AuthFailed => "".to_string(),
            ErrorCodes::ServerInternalError(msg)
            | ErrorCodes::InvalidRequest(msg)
            | ErrorCodes::QueryParseError(msg)
            | ErrorCodes::QueryValidationError(msg)
            | ErrorCodes::Forbidden(msg)
            | ErrorCodes::QuotaExceeded(msg)
            | ErrorCodes::RateLimited(msg)
            | ErrorCodes::PartitionNotFound(msg)
            | ErrorCodes::NodeNotFound(msg)
            | ErrorCodes::SourceNotFound(msg)
            | ErrorCodes::StrategyNotFound(msg)
            | ErrorCodes::VersionConflict(msg)
            | ErrorCodes::DuplicateId(msg)
            | ErrorCodes::Timeout(msg)
            | ErrorCodes::PeerUnreachable(msg)
            | ErrorCodes::CircuitOpen(msg)
            | ErrorCodes::QueryCancelled(msg)
            | ErrorCodes::ChecksumMismatch(msg)
            | ErrorCodes::LogTruncated(msg) => msg.to_owned(),
        }
    }

    pub fn to_json(&self) -> String {
        let mut map = json::Map::new();
        map.insert("code".to_string(), json::Value::from(self.get_code()));
        map.insert("kind".to_string(), json::Value::from(self.kind().as_str()));
        map.insert("message".to_string(), json::Value::from(self.get_message()));
        map.insert(
            "inner".to_string(),
            json::Value::from(self.get_inner_message()),
        );
        json::Value::Object(map).to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::Message("Ni! Try again.".to_string());
        assert_eq!("Error# Ni! Try again.", &err.to_string());
    }

    #[test]
    fn test_error_kind_mapping() {
        let err = Error::ErrorCode(ErrorCodes::RateLimited("tenant t1".to_string()));
        assert_eq!(err.kind(), ErrorKind::Policy);
        assert_eq!(err.http_status(), 429);
        assert!(!err.is_retryable());

        let err = Error::ErrorCode(ErrorCodes::PeerUnreachable("n2".to_string()));
        assert!(err.is_retryable());
        assert_eq!(err.http_status(), 503);

        let err = Error::ErrorCode(ErrorCodes::Timeout("sub-plan 3".to_string()));
        assert_eq!(err.http_status(), 504);
    }

    #[test]
    fn test_corrupt_is_not_retryable() {
        let err = Error::ErrorCode(ErrorCodes::ChecksumMismatch("p1.bak".to_string()));
        assert_eq!(err.kind(), ErrorKind::Corrupt);
        assert!(!err.is_retryable());
    }
}
