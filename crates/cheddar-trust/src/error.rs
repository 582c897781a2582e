//! Error types for trust and proxy operations.

use thiserror::Error;

/// Errors produced while talking to the OS trust store or proxy settings.
///
/// Nothing in this crate lets one of these escape the [`TrustService`]
/// boundary; they are logged and turned into status values or booleans there.
///
/// [`TrustService`]: crate::TrustService
#[derive(Debug, Error)]
pub enum TrustError {
    /// The external program could not be started.
    #[error("{program} is not available: {source}")]
    ToolUnavailable {
        /// Program that failed to spawn.
        program: String,
        /// Underlying spawn error.
        #[source]
        source: std::io::Error,
    },

    /// The program ran but reported failure.
    #[error("{program} exited with {code:?}: {stderr}")]
    NonZeroExit {
        /// Program that failed.
        program: String,
        /// Exit code, if the process exited normally.
        code: Option<i32>,
        /// Trimmed standard error.
        stderr: String,
    },

    /// Tool output did not have the expected shape.
    #[error("unexpected tool output: {0}")]
    ParseFailure(String),

    /// The operation needs elevation that was declined or failed.
    #[error("elevation required: {0}")]
    ElevationRequired(String),

    /// The in-process host trust channel is not wired up.
    #[error("host trust integration unavailable")]
    HostIntegrationUnavailable,

    /// The current platform has no implementation for this operation.
    #[error("unsupported on this platform: {0}")]
    Unsupported(String),

    /// IO error while preparing scratch files.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TrustError {
    /// Returns true for failures that mean "could not determine" rather than
    /// a definite answer from the OS.
    pub fn is_soft(&self) -> bool {
        matches!(
            self,
            Self::ToolUnavailable { .. }
                | Self::ParseFailure(_)
                | Self::HostIntegrationUnavailable
                | Self::Unsupported(_)
        )
    }
}

/// Errors reported by the proxy engine collaborator.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The engine refused to start.
    #[error("failed to start proxy engine: {0}")]
    Start(String),

    /// The engine refused to stop.
    #[error("failed to stop proxy engine: {0}")]
    Stop(String),

    /// The engine status could not be read.
    #[error("failed to read proxy engine status: {0}")]
    Status(String),

    /// Another start/stop request is still running.
    #[error("a recording toggle is already in progress")]
    Busy,
}

/// Result type for trust operations.
pub type Result<T> = std::result::Result<T, TrustError>;
