//! Local shell transport
//!
//! Runs commands on the local machine through `sh -c`. Used for
//! development against localhost profiles and in tests; file transfer is
//! a plain filesystem copy.

use async_trait::async_trait;
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::debug;

use super::{ExecOutput, SshTransport, TransportError};
use crate::safety::ValidationContext;

/// Transport that executes against the local host
#[derive(Debug, Default)]
pub struct LocalTransport;

impl LocalTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SshTransport for LocalTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn execute_command(
        &self,
        command: &str,
        timeout: Duration,
        _context: Option<&ValidationContext>,
    ) -> Result<ExecOutput, TransportError> {
        let start = Instant::now();

        let output = tokio::time::timeout(
            timeout,
            tokio::process::Command::new("sh").arg("-c").arg(command).output(),
        )
        .await
        .map_err(|_| TransportError::Timeout(timeout))??;

        let duration_ms = start.elapsed().as_millis() as u64;
        debug!(command = %command, exit = output.status.code().unwrap_or(-1), duration_ms, "local exec");

        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code().unwrap_or(-1),
            duration_ms,
        })
    }

    async fn upload_file(&self, local: &Path, remote: &str) -> Result<(), TransportError> {
        tokio::fs::copy(local, remote).await?;
        Ok(())
    }

    async fn download_file(&self, remote: &str, local: &Path) -> Result<(), TransportError> {
        tokio::fs::copy(remote, local).await?;
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        Ok(())
    }
}
