//! Error types for CadBridge.
//!
//! Library crates use [`CadBridgeError`] via `thiserror`.
//! The CLI app wraps this with `color-eyre` for rich diagnostics.
//!
//! Per-file conversion failures (missing source, missing result, root
//! document removed) are not represented here — they accumulate on the
//! file's `ConvResult` and never abort a run.

use std::path::PathBuf;

/// Top-level error type for all CadBridge operations.
#[derive(Debug, thiserror::Error)]
pub enum CadBridgeError {
    /// Configuration loading or validation error. Fatal before the run starts.
    #[error("config error: {message}")]
    Config { message: String },

    /// The project update lock could not be acquired within the timeout.
    #[error("lock contention: {0}")]
    LockContention(String),

    /// A converter backend failed (nonzero exit or spawn failure). Aborts the run.
    #[error("converter backend error: {0}")]
    Backend(String),

    /// Non-success response from the document index service. Aborts the run.
    #[error("sink error: {0}")]
    Sink(String),

    /// Two conversion jobs declared the same relative artifact path.
    #[error("artifact path conflict: {path}")]
    ArtifactConflict { path: String },

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (malformed document, invalid input, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, CadBridgeError>;

impl CadBridgeError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = CadBridgeError::config("missing project id");
        assert_eq!(err.to_string(), "config error: missing project id");

        let err = CadBridgeError::ArtifactConflict {
            path: "part.artifact".into(),
        };
        assert!(err.to_string().contains("part.artifact"));
    }
}
