//! Error types for the common crate
//!
//! This module defines the error taxonomy shared by the cache, the fetchers
//! and the device allocator. Every error is `Clone` because the outcome of a
//! single shared fetch is handed to each of its waiters.

use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use crate::types::DeviceKind;
use crate::types::DeviceId;

/// Result type for Model Serve operations
pub type Result<T> = std::result::Result<T, Error>;

/// Why a fetch from a remote source failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchErrorKind {
    /// The artifact does not exist at the source
    NotFound,
    /// Credentials were missing or rejected
    Unauthorized,
    /// Connection, timeout or server-side failure
    TransientNetwork,
    /// The transfer ended before all bytes were written
    PartialWrite,
}

impl fmt::Display for FetchErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchErrorKind::NotFound => write!(f, "not found"),
            FetchErrorKind::Unauthorized => write!(f, "unauthorized"),
            FetchErrorKind::TransientNetwork => write!(f, "transient network error"),
            FetchErrorKind::PartialWrite => write!(f, "partial write"),
        }
    }
}

/// Failure of a single-attempt fetch
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("fetch failed ({kind}): {message}")]
pub struct FetchError {
    /// Failure classification
    pub kind: FetchErrorKind,
    /// Human readable detail
    pub message: String,
}

impl FetchError {
    pub fn new(kind: FetchErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(FetchErrorKind::NotFound, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(FetchErrorKind::Unauthorized, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(FetchErrorKind::TransientNetwork, message)
    }

    pub fn partial_write(message: impl Into<String>) -> Self {
        Self::new(FetchErrorKind::PartialWrite, message)
    }

    /// Classifies an HTTP status code returned by a remote source
    pub fn from_status(status: u16, context: &str) -> Self {
        match status {
            404 | 410 => Self::not_found(format!("{}: HTTP {}", context, status)),
            401 | 403 => Self::unauthorized(format!("{}: HTTP {}", context, status)),
            _ => Self::transient(format!("{}: HTTP {}", context, status)),
        }
    }
}

/// Cache bookkeeping failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// A single artifact is larger than the whole cache budget
    #[error("artifact {cache_path} ({size_bytes} bytes) exceeds the cache budget of {budget_bytes} bytes")]
    BudgetExceededUnrecoverable {
        cache_path: String,
        size_bytes: u64,
        budget_bytes: u64,
    },

    /// An entry could not be removed from disk
    #[error("eviction of {cache_path} blocked: {reason}")]
    EvictionBlocked { cache_path: String, reason: String },
}

/// Device allocation failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AllocationError {
    /// No device of the requested kind has enough free memory
    #[error("insufficient capacity: {requested_bytes} bytes requested on {}", kind_label(.kind))]
    InsufficientCapacity {
        requested_bytes: u64,
        kind: Option<DeviceKind>,
    },

    /// The device id is not part of the discovered device table
    #[error("unknown device: {0}")]
    UnknownDevice(DeviceId),
}

fn kind_label(kind: &Option<DeviceKind>) -> String {
    match kind {
        Some(kind) => kind.to_string(),
        None => "any device".to_string(),
    }
}

/// Common error type for Model Serve operations
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// Remote fetch error
    #[error(transparent)]
    Fetch(#[from] FetchError),

    /// Cache error
    #[error(transparent)]
    Cache(#[from] CacheError),

    /// Allocation error
    #[error(transparent)]
    Allocation(#[from] AllocationError),

    /// IO error
    #[error("IO error: {0}")]
    Io(Arc<std::io::Error>),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid argument error
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Not found error
    #[error("Not found: {0}")]
    NotFound(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(Arc::new(err))
    }
}

impl Error {
    /// Returns true if the error is a not found error, local or remote
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound(_) => true,
            Error::Fetch(err) => err.kind == FetchErrorKind::NotFound,
            _ => false,
        }
    }

    /// Returns the fetch error kind, if this is a fetch error
    pub fn fetch_kind(&self) -> Option<FetchErrorKind> {
        match self {
            Error::Fetch(err) => Some(err.kind),
            _ => None,
        }
    }

    /// Returns true if the error is an allocation capacity error
    pub fn is_insufficient_capacity(&self) -> bool {
        matches!(
            self,
            Error::Allocation(AllocationError::InsufficientCapacity { .. })
        )
    }
}
