//! OpenSSH client adapter
//!
//! Shells out to the system `ssh`/`scp` binaries. Key-based auth only;
//! this keeps the binary usable against real hosts without binding an
//! SSH library into the core.

use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tracing::debug;

use super::{ExecOutput, SshTransport, TransportError};
use crate::config::{AuthMethod, ServerConfig};
use crate::safety::ValidationContext;

/// Transport backed by the OpenSSH command-line client
pub struct SshCliTransport {
    host: String,
    port: u16,
    username: String,
    key_path: String,
    connect_timeout_secs: u64,
}

impl SshCliTransport {
    pub fn from_config(config: &ServerConfig) -> Result<Self, TransportError> {
        if config.auth_method != AuthMethod::Key {
            return Err(TransportError::Auth(
                "the OpenSSH adapter supports key authentication only".to_string(),
            ));
        }
        let key_path = config
            .key_path
            .clone()
            .ok_or_else(|| TransportError::Auth("key_path is required".to_string()))?;

        Ok(Self {
            host: config.host.clone(),
            port: config.port,
            username: config.username.clone(),
            key_path,
            connect_timeout_secs: config.timeout,
        })
    }

    fn destination(&self) -> String {
        format!("{}@{}", self.username, self.host)
    }

    fn base_args(&self) -> Vec<String> {
        vec![
            "-p".to_string(),
            self.port.to_string(),
            "-i".to_string(),
            self.key_path.clone(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout_secs),
        ]
    }

    async fn run_ssh(&self, command: &str, timeout: Duration) -> Result<ExecOutput, TransportError> {
        let start = Instant::now();

        let mut cmd = tokio::process::Command::new("ssh");
        cmd.args(self.base_args())
            .arg(self.destination())
            .arg(command)
            .stdin(Stdio::null());

        let output = tokio::time::timeout(timeout, cmd.output())
            .await
            .map_err(|_| TransportError::Timeout(timeout))??;

        let exit_code = output.status.code().unwrap_or(-1);
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        // ssh itself exits 255 on connection/auth problems
        if exit_code == 255 {
            return Err(TransportError::Connect(stderr));
        }

        let duration_ms = start.elapsed().as_millis() as u64;
        debug!(command = %command, exit_code, duration_ms, "ssh exec");

        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr,
            exit_code,
            duration_ms,
        })
    }
}

#[async_trait]
impl SshTransport for SshCliTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        let timeout = Duration::from_secs(self.connect_timeout_secs.max(1));
        self.run_ssh("true", timeout).await.map(|_| ())
    }

    async fn execute_command(
        &self,
        command: &str,
        timeout: Duration,
        _context: Option<&ValidationContext>,
    ) -> Result<ExecOutput, TransportError> {
        self.run_ssh(command, timeout).await
    }

    async fn upload_file(&self, local: &Path, remote: &str) -> Result<(), TransportError> {
        let target = format!("{}:{}", self.destination(), remote);
        let output = tokio::process::Command::new("scp")
            .arg("-P")
            .arg(self.port.to_string())
            .arg("-i")
            .arg(&self.key_path)
            .arg(local)
            .arg(&target)
            .output()
            .await?;

        if !output.status.success() {
            return Err(TransportError::Transfer(
                String::from_utf8_lossy(&output.stderr).to_string(),
            ));
        }
        Ok(())
    }

    async fn download_file(&self, remote: &str, local: &Path) -> Result<(), TransportError> {
        let source = format!("{}:{}", self.destination(), remote);
        let output = tokio::process::Command::new("scp")
            .arg("-P")
            .arg(self.port.to_string())
            .arg("-i")
            .arg(&self.key_path)
            .arg(&source)
            .arg(local)
            .output()
            .await?;

        if !output.status.success() {
            return Err(TransportError::Transfer(
                String::from_utf8_lossy(&output.stderr).to_string(),
            ));
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        Ok(())
    }
}
