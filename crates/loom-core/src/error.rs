//! Error types for loom-core.

use thiserror::Error;

/// Result type for loom-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in loom-core.
#[derive(Debug, Error)]
pub enum Error {
    /// The execution host did not come up within the startup timeout.
    #[error("execution host did not start within {timeout_ms} ms")]
    HostStartTimeout { timeout_ms: u64 },

    /// The execution host reported a failure while starting.
    #[error("execution host failed to start: {0}")]
    HostStartError(String),

    /// A single evaluation call failed at the host level.
    #[error("evaluation failed: {0}")]
    Evaluation(String),

    /// The operation was cancelled by a newer pass or by disposal.
    #[error("operation cancelled")]
    Cancelled,

    /// The document instance has already been disposed.
    #[error("document has been disposed")]
    Disposed,

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Invalid operation (e.g., appending a block out of order).
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether this error only signals cancellation and should not be shown.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// Format the error together with a recovery hint, if one applies.
    pub fn with_hint(&self) -> String {
        let hint = match self {
            Error::HostStartTimeout { .. } => Some(
                "increase `host.startup_timeout_ms` in loom.toml or check that the host program starts on its own",
            ),
            Error::HostStartError(_) => {
                Some("check `host.program` and `host.args` in loom.toml")
            }
            Error::Config(_) => Some("check the keys and value types in loom.toml"),
            _ => None,
        };

        match hint {
            Some(hint) => format!("{}\n  hint: {}", self, hint),
            None => self.to_string(),
        }
    }
}
