//! SSH transport contract
//!
//! The core only requires command execution and file transfer; the
//! concrete SSH library is external. [`GuardedTransport`] is the
//! safety-enforcing decorator every execution path goes through:
//! forbidden commands are refused before they reach the wire.

use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

mod guarded;
mod local;
mod ssh_cli;

pub use guarded::GuardedTransport;
pub use local::LocalTransport;
pub use ssh_cli::SshCliTransport;

use crate::safety::ValidationContext;

/// Raw output of one remote command
#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub duration_ms: u64,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Transport failure kinds
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Command timed out after {0:?}")]
    Timeout(Duration),

    /// Refused by the safety validator; never executed on the wire
    #[error("Command rejected by safety policy: {reason}")]
    Rejected { command: String, reason: String },

    #[error("File transfer failed: {0}")]
    Transfer(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// What the core requires from an SSH transport.
///
/// The validation context is opaque to the transport except that
/// implementations behind [`GuardedTransport`] refuse forbidden commands
/// with [`TransportError::Rejected`].
#[async_trait]
pub trait SshTransport: Send + Sync {
    async fn connect(&self) -> Result<(), TransportError>;

    async fn execute_command(
        &self,
        command: &str,
        timeout: Duration,
        context: Option<&ValidationContext>,
    ) -> Result<ExecOutput, TransportError>;

    async fn upload_file(&self, local: &Path, remote: &str) -> Result<(), TransportError>;

    async fn download_file(&self, remote: &str, local: &Path) -> Result<(), TransportError>;

    async fn disconnect(&self) -> Result<(), TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exec_output_success() {
        let out = ExecOutput {
            exit_code: 0,
            ..ExecOutput::default()
        };
        assert!(out.success());

        let out = ExecOutput {
            exit_code: 1,
            ..ExecOutput::default()
        };
        assert!(!out.success());
    }

    #[test]
    fn test_rejected_error_display() {
        let err = TransportError::Rejected {
            command: "rm -rf /".to_string(),
            reason: "forbidden".to_string(),
        };
        assert!(err.to_string().contains("safety policy"));
    }
}
