//! Error types for the tiered cache

use thiserror::Error;

use crate::cache::Status;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while operating a cache or its stores
#[derive(Error, Debug)]
pub enum Error {
    /// Operation attempted on a cache that is not alive
    #[error("The {name} Cache is not alive (status: {status})")]
    IllegalState { name: String, status: Status },

    /// Invalid configuration or lifecycle argument
    #[error("Illegal argument for cache {name}: {reason}")]
    IllegalArgument { name: String, reason: String },

    /// Caches are identity objects and cannot be cloned
    #[error("Cache {name} cannot be cloned")]
    CloneNotSupported { name: String },

    /// I/O error with a description of what was being attempted
    #[error("I/O error while {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// Element or index (de)serialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// On-disk index could not be trusted
    #[error("Index corruption: {0}")]
    IndexCorruption(String),
}

impl Error {
    /// Wrap an I/O error with the operation that produced it
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Returns true for errors the caches recover from locally
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Serialization(_) | Self::IndexCorruption(_))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_illegal_state_message_names_cache_and_status() {
        let err = Error::IllegalState {
            name: "sampleCache".to_string(),
            status: Status::Shutdown,
        };
        let msg = err.to_string();
        assert!(msg.contains("sampleCache"));
        assert!(msg.contains("SHUTDOWN"));
    }

    #[test]
    fn test_io_context() {
        let err = Error::io(
            "creating disk directory",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        assert!(err.to_string().contains("creating disk directory"));
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_recoverable_errors() {
        assert!(Error::IndexCorruption("bad magic".to_string()).is_recoverable());
    }
}
