//! Error taxonomy for GPU partition assignment and guest provisioning.
//!
//! Lower-level components return these typed failures; the orchestrator
//! catches all of them, runs cleanup and turns them into a single
//! human-readable outcome string.

use std::time::Duration;

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    /// Guest not powered off, credentials missing, unknown device.
    #[error("precondition failed: {0}")]
    Precondition(String),

    /// Upload or download failure. Never resumed partially.
    #[error("transfer of {path} failed: {reason}")]
    Transfer { path: String, reason: String },

    /// Remote command exited with a non-zero status.
    #[error("command `{command}` exited with status {exit_code}: {stderr}")]
    Command {
        command: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("command `{command}` timed out after {}s", timeout.as_secs())]
    Timeout { command: String, timeout: Duration },

    /// Offline registry hive patch failed. The hive is still unloaded.
    #[error("offline registry patch failed: {0}")]
    OfflineHive(String),

    /// Guest disk could not be mounted or is not a system partition.
    #[error("{0}")]
    Disk(String),

    #[error("guest {host}:{port} did not come back online within {}s", timeout.as_secs())]
    GuestUnreachable {
        host: String,
        port: u16,
        timeout: Duration,
    },

    #[error("operation cancelled")]
    Cancelled,

    /// Failure reported by a host collaborator (management shell, inventory).
    #[error(transparent)]
    Host(#[from] anyhow::Error),
}

impl Error {
    /// Timeout-class failures are the only ones the retry policy re-runs.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }

    pub fn transfer(path: impl std::fmt::Display, reason: impl std::fmt::Display) -> Self {
        Error::Transfer {
            path: path.to_string(),
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_timeouts_are_retryable() {
        let timeout = Error::Timeout {
            command: "make".into(),
            timeout: Duration::from_secs(3),
        };
        let failed = Error::Command {
            command: "make".into(),
            exit_code: 2,
            stderr: "boom".into(),
        };
        assert!(timeout.is_timeout());
        assert!(!failed.is_timeout());
        assert!(!Error::Cancelled.is_timeout());
    }

    #[test]
    fn command_error_carries_exit_code_and_stderr() {
        let err = Error::Command {
            command: "ls /nope".into(),
            exit_code: 2,
            stderr: "No such file".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("status 2"), "got: {msg}");
        assert!(msg.contains("No such file"), "got: {msg}");
    }
}
