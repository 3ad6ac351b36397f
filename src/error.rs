//! Error types for GPU telemetry (gputel)

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// Result type alias for gputel operations
pub type Result<T> = std::result::Result<T, Error>;

/// Last error seen per device label (or per backend key) in one sampling cycle
pub type ErrorMap = HashMap<String, Arc<Error>>;

/// Main error type
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error on a specific path
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// File content could not be parsed
    #[error("Parse error in {}: {message}", path.display())]
    Parse { path: PathBuf, message: String },

    /// Duration string could not be parsed or is not positive
    #[error("Invalid duration: {0}")]
    InvalidDuration(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Discovery found no devices
    #[error("No devices found: {0}")]
    NoDevicesFound(String),

    /// A sensor file or directory is missing on a discovered device
    #[error("Sensor unavailable: {0}")]
    SensorUnavailable(String),

    /// Native device query failed
    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// Value read successfully but unusable
    #[error("Invalid value: {0}")]
    InvalidValue(String),

    /// Device ID database could not be loaded
    #[error("ID table unavailable: {0}")]
    IdTableUnavailable(String),

    /// Sampler thread could not be started
    #[error("Failed to spawn sampler for {key}: {source}")]
    Spawn {
        key: String,
        #[source]
        source: io::Error,
    },


    /// NVML error (NVIDIA GPUs)
    #[cfg(feature = "nvidia")]
    #[error("NVML error: {0}")]
    Nvml(#[from] nvml_wrapper::error::NvmlError),
}

impl Error {
    /// Attach a path to an I/O error
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }

    /// Build a parse error for a path
    pub fn parse(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Error::Parse {
            path: path.into(),
            message: message.into(),
        }
    }

    /// True when the underlying cause is a missing file or directory
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Io { source, .. } if source.kind() == io::ErrorKind::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_names_path() {
        let err = Error::io(
            "/sys/class/drm",
            io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
        );
        let msg = err.to_string();
        assert!(msg.contains("/sys/class/drm"));
        assert!(!err.is_not_found());
    }

    #[test]
    fn test_not_found_detection() {
        let err = Error::io("/nope", io::Error::from(io::ErrorKind::NotFound));
        assert!(err.is_not_found());
        assert!(!Error::Config("x".into()).is_not_found());
    }
}
