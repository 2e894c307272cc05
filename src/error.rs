//! Custom error types for the engine.
//!
//! `RunError` is the single error type threaded through the crate. The
//! variants follow the engine's recovery policy rather than the shape of the
//! underlying failures:
//!
//! - **`DeviceIo`**: a transport failure on a device channel. A broken
//!   device link is unrecoverable for this process's purpose, so callers
//!   treat this as fatal (best-effort stop, then exit).
//! - **`CommandPending`**: a command was issued on a channel that still
//!   awaits a terminal response. The send is rejected rather than silently
//!   replacing the outstanding bookkeeping.
//! - **`ExternalTool`**: a helper program could not be launched or tracked.
//!   The owning pipeline marks its request Failed and the main loop
//!   continues.
//! - **`Signal`**: the shutdown signal handlers could not be installed.
//!   Startup-only and fatal.

use thiserror::Error;

use crate::bus::DeviceId;

/// Convenience alias for results using the engine error type.
pub type RunResult<T> = std::result::Result<T, RunError>;

#[derive(Error, Debug)]
pub enum RunError {
    #[error("device i/o error on {channel}: {source}")]
    DeviceIo {
        channel: DeviceId,
        source: std::io::Error,
    },

    #[error("command already pending on {0}")]
    CommandPending(DeviceId),

    #[error("external tool error: {0}")]
    ExternalTool(String),

    #[error("signal handler registration failed: {0}")]
    Signal(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RunError::ExternalTool("calimage: No such file or directory".into());
        assert_eq!(
            err.to_string(),
            "external tool error: calimage: No such file or directory"
        );
    }

    #[test]
    fn test_pending_names_channel() {
        let err = RunError::CommandPending(DeviceId::Telescope);
        assert!(err.to_string().contains("Tel"));
    }
}
