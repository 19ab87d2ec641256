//! Error types for qdb operations.

use std::error::Error;
use std::fmt;
use std::path::PathBuf;

/// qdb error types with per-variant context.
#[derive(Debug, Clone)]
pub enum QdbError {
    /// I/O operation failed
    Io {
        /// The file path where the error occurred
        path: Option<PathBuf>,
        /// The underlying I/O error kind
        kind: std::io::ErrorKind,
        /// Human-readable description
        message: String,
    },

    /// An index snapshot file failed structural validation
    CorruptSnapshot {
        /// Path to the rejected snapshot file
        path: PathBuf,
        /// What the validation found
        reason: String,
    },

    /// Value length exceeds what a locator can address
    OversizedValue {
        /// Size of the rejected value
        size: u64,
        /// Maximum allowed size
        max: u64,
    },

    /// Configuration rejected by validation
    Config(String),

    /// Operation attempted after close()
    Closed,
}

impl fmt::Display for QdbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QdbError::Io { path, kind, message } => {
                if let Some(path) = path {
                    write!(f, "I/O error in {}: {} ({})", path.display(), message, kind)
                } else {
                    write!(f, "I/O error: {} ({})", message, kind)
                }
            }

            QdbError::CorruptSnapshot { path, reason } => {
                write!(f, "corrupt index snapshot {}: {}", path.display(), reason)
            }

            QdbError::OversizedValue { size, max } => {
                write!(f, "value too large: {} bytes exceeds limit of {} bytes", size, max)
            }

            QdbError::Config(msg) => write!(f, "invalid configuration: {}", msg),

            QdbError::Closed => write!(f, "store is closed"),
        }
    }
}

impl Error for QdbError {}

impl From<std::io::Error> for QdbError {
    fn from(err: std::io::Error) -> Self {
        QdbError::Io {
            path: None,
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Result type alias for qdb operations.
pub type QdbResult<T> = Result<T, QdbError>;

/// Attach a path and a description to an I/O error.
pub(crate) fn io_error(path: &std::path::Path, what: &str, e: std::io::Error) -> QdbError {
    QdbError::Io {
        path: Some(path.to_path_buf()),
        kind: e.kind(),
        message: format!("{}: {}", what, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = QdbError::CorruptSnapshot {
            path: PathBuf::from("/tmp/qdb.0"),
            reason: "trailer mismatch".to_string(),
        };
        let display = format!("{}", err);
        assert!(display.contains("qdb.0"));
        assert!(display.contains("trailer mismatch"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: QdbError = io_err.into();
        match err {
            QdbError::Io { kind, .. } => assert_eq!(kind, std::io::ErrorKind::NotFound),
            _ => panic!("Expected Io error"),
        }
    }

    #[test]
    fn test_oversized_display() {
        let err = QdbError::OversizedValue { size: 5_000_000_000, max: u32::MAX as u64 };
        assert!(format!("{}", err).contains("5000000000"));
    }
}
