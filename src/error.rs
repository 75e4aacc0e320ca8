//! Error handling for the shmap library
//!
//! This module provides the crate-wide error type covering shared-memory
//! lifecycle failures. Data-plane misses (key not found, duplicate key,
//! exhausted pool) are not errors; they surface as `Ok(false)` or
//! `Ok(None)` from the map operations.

use thiserror::Error;

/// Main error type for the shmap library
#[derive(Error, Debug)]
pub enum ShmapError {
    /// I/O related errors (heap file creation, mapping)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration or parameter errors
    #[error("Invalid configuration: {message}")]
    Configuration {
        /// Configuration error message
        message: String,
    },

    /// Heap or directory exhaustion during region reservation
    #[error("Region exhausted: {message}")]
    RegionExhausted {
        /// What ran out and by how much
        message: String,
    },

    /// A region name is already present in the heap directory
    #[error("Region name already reserved: {name}")]
    DuplicateRegion {
        /// The conflicting region name
        name: String,
    },

    /// A named region or heap was not found on attach
    #[error("Region not found: {name}")]
    RegionNotFound {
        /// The missing region name
        name: String,
    },

    /// The mapped bytes are not a valid heap (bad magic, truncated, or
    /// the creator has not finished initialization)
    #[error("Invalid heap: {message}")]
    InvalidHeap {
        /// What failed to validate
        message: String,
    },

    /// An operation was invoked before a successful `create_or_attach`
    #[error("Map is not attached")]
    NotAttached,
}

impl ShmapError {
    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a region-exhausted error
    pub fn region_exhausted<S: Into<String>>(message: S) -> Self {
        Self::RegionExhausted {
            message: message.into(),
        }
    }

    /// Create a duplicate-region error
    pub fn duplicate_region<S: Into<String>>(name: S) -> Self {
        Self::DuplicateRegion { name: name.into() }
    }

    /// Create a region-not-found error
    pub fn region_not_found<S: Into<String>>(name: S) -> Self {
        Self::RegionNotFound { name: name.into() }
    }

    /// Create an invalid-heap error
    pub fn invalid_heap<S: Into<String>>(message: S) -> Self {
        Self::InvalidHeap {
            message: message.into(),
        }
    }

    /// Create an I/O error from a message
    pub fn io_error<S: Into<String>>(message: S) -> Self {
        Self::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            message.into(),
        ))
    }

    /// Check if this is a recoverable error
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Io(_) => true,
            Self::RegionExhausted { .. } => true,
            Self::Configuration { .. } => false,
            Self::DuplicateRegion { .. } => false,
            Self::RegionNotFound { .. } => true,
            Self::InvalidHeap { .. } => false,
            Self::NotAttached => false,
        }
    }

    /// Get the error category for logging/metrics
    pub fn category(&self) -> &'static str {
        match self {
            Self::Io(_) => "io",
            Self::Configuration { .. } => "config",
            Self::RegionExhausted { .. } => "exhausted",
            Self::DuplicateRegion { .. } => "duplicate",
            Self::RegionNotFound { .. } => "not_found",
            Self::InvalidHeap { .. } => "invalid_heap",
            Self::NotAttached => "not_attached",
        }
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, ShmapError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = ShmapError::configuration("buckets must be non-zero");
        assert_eq!(err.category(), "config");
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_error_display() {
        let err = ShmapError::duplicate_region("bucket_array");
        let display = format!("{}", err);
        assert!(display.contains("already reserved"));
        assert!(display.contains("bucket_array"));

        let err = ShmapError::region_exhausted("need 4096 bytes, 128 left");
        let display = format!("{}", err);
        assert!(display.contains("Region exhausted"));
    }

    #[test]
    fn test_from_io_error() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "no such heap");
        let err: ShmapError = io_error.into();

        assert_eq!(err.category(), "io");
        assert!(err.is_recoverable());
        assert!(format!("{}", err).contains("I/O error"));
    }

    #[test]
    fn test_error_categories() {
        assert_eq!(ShmapError::NotAttached.category(), "not_attached");
        assert_eq!(
            ShmapError::region_not_found("HT_flows").category(),
            "not_found"
        );
        assert_eq!(
            ShmapError::invalid_heap("bad magic 0xdead").category(),
            "invalid_heap"
        );
    }

    #[test]
    fn test_recoverable_split() {
        assert!(ShmapError::region_exhausted("full").is_recoverable());
        assert!(ShmapError::region_not_found("x").is_recoverable());
        assert!(!ShmapError::NotAttached.is_recoverable());
        assert!(!ShmapError::invalid_heap("x").is_recoverable());
        assert!(!ShmapError::duplicate_region("x").is_recoverable());
    }
}
