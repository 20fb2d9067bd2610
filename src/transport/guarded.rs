//! Safety-enforcing transport decorator

use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use super::{ExecOutput, SshTransport, TransportError};
use crate::safety::{SafetyValidator, ValidationContext};

/// Wraps any transport and consults the safety validator before every
/// execute. Forbidden (or otherwise invalid) commands never reach the
/// inner transport.
pub struct GuardedTransport {
    inner: Arc<dyn SshTransport>,
    validator: Arc<SafetyValidator>,
}

impl GuardedTransport {
    pub fn new(inner: Arc<dyn SshTransport>, validator: Arc<SafetyValidator>) -> Self {
        Self { inner, validator }
    }

    pub fn validator(&self) -> &Arc<SafetyValidator> {
        &self.validator
    }
}

#[async_trait]
impl SshTransport for GuardedTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        self.inner.connect().await
    }

    async fn execute_command(
        &self,
        command: &str,
        timeout: Duration,
        context: Option<&ValidationContext>,
    ) -> Result<ExecOutput, TransportError> {
        let verdict = self.validator.validate(command, context);
        if !verdict.valid {
            let reason = verdict.errors.join("; ");
            warn!(command = %command, reason = %reason, "refusing command");
            return Err(TransportError::Rejected {
                command: command.to_string(),
                reason,
            });
        }

        self.inner.execute_command(command, timeout, context).await
    }

    async fn upload_file(&self, local: &Path, remote: &str) -> Result<(), TransportError> {
        self.inner.upload_file(local, remote).await
    }

    async fn download_file(&self, remote: &str, local: &Path) -> Result<(), TransportError> {
        self.inner.download_file(remote, local).await
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.inner.disconnect().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SecurityConfig;
    use crate::test_utils::ScriptedTransport;

    fn guarded(inner: Arc<ScriptedTransport>) -> GuardedTransport {
        let validator = Arc::new(SafetyValidator::new(&SecurityConfig::default(), &[]));
        GuardedTransport::new(inner, validator)
    }

    #[tokio::test]
    async fn test_forbidden_command_never_reaches_wire() {
        let inner = Arc::new(ScriptedTransport::new());
        let transport = guarded(inner.clone());

        let result = transport
            .execute_command("rm -rf /", Duration::from_secs(5), None)
            .await;

        assert!(matches!(result, Err(TransportError::Rejected { .. })));
        assert!(inner.calls().is_empty());
        assert_eq!(transport.validator().stats().forbidden_attempts, 1);
    }

    #[tokio::test]
    async fn test_safe_command_passes_through() {
        let inner = Arc::new(ScriptedTransport::new());
        inner.respond("echo ok", 0, "ok", "");
        let transport = guarded(inner.clone());

        let out = transport
            .execute_command("echo ok", Duration::from_secs(5), None)
            .await
            .unwrap();

        assert_eq!(out.exit_code, 0);
        assert_eq!(inner.calls(), vec!["echo ok"]);
    }

    #[tokio::test]
    async fn test_dangerous_command_still_executes() {
        // Dangerous is a warning level, not a refusal
        let inner = Arc::new(ScriptedTransport::new());
        inner.respond("systemctl stop nginx", 0, "", "");
        let transport = guarded(inner.clone());

        let out = transport
            .execute_command("systemctl stop nginx", Duration::from_secs(5), None)
            .await
            .unwrap();
        assert!(out.success());
    }
}
