//! Error types for resource pool management

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for resource pool operations
pub type Result<T> = std::result::Result<T, Error>;

/// Resource manager errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    // Allocation errors
    #[error("Pool {pool} exhausted")]
    Exhausted { pool: String },

    #[error("Pool {pool} is empty")]
    PoolEmpty { pool: String },

    #[error("Requested {value} not available in pool {pool}")]
    NotAvailable { pool: String, value: String },

    #[error("Requested subnet is too big. Available prefix lengths: {}", format_prefixes(.available))]
    MaskTooNarrow { pool: String, available: Vec<u8> },

    #[error("{value} is not allocated from pool {pool}")]
    NotAllocated { pool: String, value: String },

    // Sync group errors
    #[error("Conflicting id requests for {key}: requested {first} does not match requested {second}")]
    ConflictingRequest { key: String, first: u64, second: u64 },

    // Configuration errors
    #[error("Invalid netmask: {0}")]
    InvalidNetmask(String),

    #[error("Invalid range: {0}")]
    InvalidRange(String),

    #[error("Can't split subnet {0} further")]
    CannotSplit(String),

    #[error("Pool not found: {0}")]
    PoolNotFound(String),

    #[error("Pool already exists: {0}")]
    PoolAlreadyExists(String),

    #[error("No request {key} in pool {pool}")]
    RequestNotFound { pool: String, key: String },

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Error classification written back to the requester
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Exhausted,
    NotAvailable,
    MaskTooNarrow,
    NotAllocated,
    ConflictingRequest,
    InvalidNetmask,
    InvalidRange,
    PoolNotFound,
    Config,
}

impl Error {
    /// Map the error onto the kind reported in allocation responses
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Exhausted { .. } | Error::PoolEmpty { .. } => ErrorKind::Exhausted,
            Error::NotAvailable { .. } => ErrorKind::NotAvailable,
            Error::MaskTooNarrow { .. } => ErrorKind::MaskTooNarrow,
            Error::NotAllocated { .. } => ErrorKind::NotAllocated,
            Error::ConflictingRequest { .. } => ErrorKind::ConflictingRequest,
            Error::InvalidNetmask(_) | Error::CannotSplit(_) => ErrorKind::InvalidNetmask,
            Error::InvalidRange(_) => ErrorKind::InvalidRange,
            Error::PoolNotFound(_) | Error::RequestNotFound { .. } => ErrorKind::PoolNotFound,
            Error::PoolAlreadyExists(_) | Error::Config(_) => ErrorKind::Config,
        }
    }

    /// Per-request errors leave unrelated state untouched and may be retried
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Exhausted
                | ErrorKind::NotAvailable
                | ErrorKind::MaskTooNarrow
                | ErrorKind::NotAllocated
        )
    }
}

fn format_prefixes(prefixes: &[u8]) -> String {
    prefixes
        .iter()
        .map(|p| p.to_string())
        .collect::<Vec<_>>()
        .join(" ")
}

impl From<ipnet::PrefixLenError> for Error {
    fn from(e: ipnet::PrefixLenError) -> Self {
        Error::InvalidNetmask(e.to_string())
    }
}

impl From<std::net::AddrParseError> for Error {
    fn from(e: std::net::AddrParseError) -> Self {
        Error::InvalidNetmask(e.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::Config(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Config(e.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Config(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        let empty = Error::PoolEmpty {
            pool: "p".to_string(),
        };
        assert_eq!(empty.kind(), ErrorKind::Exhausted);
        assert!(empty.is_recoverable());

        let split = Error::CannotSplit("10.0.0.1/32".to_string());
        assert_eq!(split.kind(), ErrorKind::InvalidNetmask);
        assert!(!split.is_recoverable());
    }

    #[test]
    fn test_mask_too_narrow_message() {
        let err = Error::MaskTooNarrow {
            pool: "lan".to_string(),
            available: vec![24, 25],
        };
        assert_eq!(
            err.to_string(),
            "Requested subnet is too big. Available prefix lengths: 24 25"
        );
    }
}
