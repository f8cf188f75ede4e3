//! Error types and exit codes for hotmod

use std::path::PathBuf;
use std::process::ExitCode;
use thiserror::Error;

/// Main error type for hotmod operations
#[derive(Error, Debug)]
pub enum HmrError {
    #[error("Failed to parse module {file}: {message}")]
    Parse { file: String, message: String },

    #[error("Import resolution failed in {file}: {message}")]
    Analysis { file: String, message: String },

    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Module graph invariant violated: {message}")]
    InvariantViolation { message: String },

    #[error("Transport error: {message}")]
    Transport { message: String },

    #[error("Client apply failed for {file}: {message}")]
    ClientApply { file: String, message: String },

    #[error("Invalid configuration: {message}")]
    Config { message: String },
}

impl HmrError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Convert error to the daemon's exit code:
    /// - 0: Success
    /// - 1: IO error
    /// - 3: Parse / analysis failure
    /// - 4: Internal failure (invariant, client apply)
    /// - 6: Configuration error
    /// - 7: Transport error
    pub fn exit_code(&self) -> ExitCode {
        match self {
            Self::Io { .. } => ExitCode::from(1),
            Self::Parse { .. } => ExitCode::from(3),
            Self::Analysis { .. } => ExitCode::from(3),
            Self::InvariantViolation { .. } => ExitCode::from(4),
            Self::ClientApply { .. } => ExitCode::from(4),
            Self::Config { .. } => ExitCode::from(6),
            Self::Transport { .. } => ExitCode::from(7),
        }
    }

    /// Whether this error is surfaced to clients as an `error` protocol
    /// message rather than rejecting the update job.
    pub fn is_user_visible(&self) -> bool {
        matches!(
            self,
            Self::Parse { .. } | Self::Analysis { .. } | Self::Io { .. }
        )
    }
}

/// Result type alias for hotmod operations
pub type Result<T> = std::result::Result<T, HmrError>;
