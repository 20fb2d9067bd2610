//! Autocorrection engine
//!
//! Rewrites failing commands using pattern-directed strategies, testing
//! each rewrite over the transport before accepting it. The loop is
//! bounded by `autocorrection_max_attempts` and breaks on cyclic or
//! no-change rewrites.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::ExecutorConfig;
use crate::domain::{CommandResult, ExecutionContext};

/// One command-rewriting strategy keyed on an error pattern
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrectionStrategy {
    PermissionFix,
    CommandSubstitution,
    PackageUpdate,
    ServiceRestart,
    NetworkCheck,
    PathCorrection,
    SyntaxCheck,
    AlternativeFlags,
}

impl std::fmt::Display for CorrectionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PermissionFix => write!(f, "permission_fix"),
            Self::CommandSubstitution => write!(f, "command_substitution"),
            Self::PackageUpdate => write!(f, "package_update"),
            Self::ServiceRestart => write!(f, "service_restart"),
            Self::NetworkCheck => write!(f, "network_check"),
            Self::PathCorrection => write!(f, "path_correction"),
            Self::SyntaxCheck => write!(f, "syntax_check"),
            Self::AlternativeFlags => write!(f, "alternative_flags"),
        }
    }
}

/// One tested rewrite
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrectionAttempt {
    pub original_command: String,
    pub corrected_command: String,
    pub strategy: CorrectionStrategy,
    pub success: bool,
    pub error_message: Option<String>,
}

/// Outcome of one correction run, carrying the full attempt trace
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutocorrectionResult {
    pub success: bool,
    pub final_command: Option<String>,
    pub attempts: Vec<CorrectionAttempt>,
    pub total_attempts: u32,
    pub error_message: Option<String>,
}

/// Base commands that usually need sudo
const SUDO_COMMANDS: &[&str] = &[
    "apt", "apt-get", "systemctl", "service", "docker", "chmod", "chown", "mkdir", "rm", "cp", "mv", "ln", "mount",
    "umount",
];

/// Legacy-to-modern command substitutions. `ps aux` must precede shorter
/// patterns so the two-word form wins.
const SUBSTITUTIONS: &[(&str, &str)] = &[
    ("ps aux", "ps -ef"),
    ("chkconfig", "systemctl"),
    ("service", "systemctl"),
    ("iptables", "ufw"),
    ("ifconfig", "ip"),
    ("netstat", "ss"),
    ("killall", "pkill"),
];

/// Alternative flags per base command: (default group, fallback group)
const ALTERNATIVE_FLAGS: &[(&str, &[&str], &[&str])] = &[
    ("ls", &["-la", "-l", "-a", "-lh"], &["-1", "-F"]),
    ("grep", &["-r", "-i", "-n", "-v"], &["-E", "-F"]),
    ("find", &["-name", "-type", "-size"], &["-iname", "-path"]),
    ("systemctl", &["start", "stop", "restart", "status"], &["reload", "try-restart"]),
    ("docker", &["run", "start", "stop", "ps"], &["exec", "logs"]),
    ("apt", &["install", "update", "upgrade", "remove"], &["autoremove", "purge"]),
];

struct ErrorPatterns {
    permission: Regex,
    command_not_found: Regex,
    package_not_found: Regex,
    service_not_found: Regex,
    network: Regex,
    file_not_found: Regex,
    syntax: Regex,
}

impl ErrorPatterns {
    fn new() -> Self {
        Self {
            permission: Regex::new(r"permission denied|access denied|operation not permitted").unwrap(),
            command_not_found: Regex::new(r"command not found").unwrap(),
            package_not_found: Regex::new(r"package.*not found|unable to locate package").unwrap(),
            service_not_found: Regex::new(r"service.*not found|unit.*not found").unwrap(),
            network: Regex::new(r"connection refused|timed out|unreachable|name or service not known").unwrap(),
            file_not_found: Regex::new(r"no such file or directory").unwrap(),
            syntax: Regex::new(r"syntax error|invalid option|unrecognized option").unwrap(),
        }
    }
}

/// Drives the local rewrite-and-retest loop for one failed command
pub struct AutocorrectionEngine {
    max_attempts: u32,
    test_timeout: Duration,
    enable_syntax: bool,
    enable_permission: bool,
    enable_network: bool,
    enable_service: bool,
    enable_package: bool,
    enable_substitution: bool,
    patterns: ErrorPatterns,
}

impl AutocorrectionEngine {
    pub fn new(config: &ExecutorConfig) -> Self {
        Self {
            max_attempts: config.autocorrection_max_attempts,
            test_timeout: Duration::from_secs(config.autocorrection_timeout),
            enable_syntax: config.enable_syntax_correction,
            enable_permission: config.enable_permission_correction,
            enable_network: config.enable_network_correction,
            enable_service: config.enable_service_correction,
            enable_package: config.enable_package_correction,
            enable_substitution: config.enable_command_substitution,
            patterns: ErrorPatterns::new(),
        }
    }

    /// Attempt to correct a failed command.
    ///
    /// Each accepted rewrite is tested over the transport with a short
    /// timeout; on test failure the loop continues from the rewrite and
    /// its stderr.
    pub async fn correct(&self, failed: &CommandResult, ctx: &ExecutionContext) -> AutocorrectionResult {
        let original = failed.command.clone();
        let mut current_command = original.clone();
        let mut current_error = failed
            .error_message
            .clone()
            .unwrap_or_else(|| failed.stderr.clone());

        info!(command = %original, "starting autocorrection");

        let mut attempts = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        seen.insert(current_command.clone());

        for attempt_num in 1..=self.max_attempts {
            let Some(strategy) = self.classify(&current_command, &current_error) else {
                debug!("no applicable correction strategy");
                break;
            };

            let Some(corrected) = self.apply(strategy, &current_command, ctx).await else {
                debug!(strategy = %strategy, "strategy produced no rewrite");
                break;
            };

            if corrected == current_command || !seen.insert(corrected.clone()) {
                debug!(strategy = %strategy, "rewrite did not change the command, stopping");
                break;
            }

            let test = self.test_rewrite(&corrected, ctx).await;

            attempts.push(CorrectionAttempt {
                original_command: current_command.clone(),
                corrected_command: corrected.clone(),
                strategy,
                success: test.success,
                error_message: test.error_message.clone(),
            });

            if test.success {
                info!(
                    original = %original,
                    corrected = %corrected,
                    strategy = %strategy,
                    attempts = attempt_num,
                    "autocorrection succeeded"
                );
                return AutocorrectionResult {
                    success: true,
                    final_command: Some(corrected),
                    total_attempts: attempt_num,
                    attempts,
                    error_message: None,
                };
            }

            current_error = test.error_message.unwrap_or(test.stderr);
            current_command = corrected;
        }

        warn!(command = %original, attempts = attempts.len(), "autocorrection exhausted");
        AutocorrectionResult {
            success: false,
            final_command: None,
            total_attempts: attempts.len() as u32,
            attempts,
            error_message: Some("all correction attempts exhausted".to_string()),
        }
    }

    /// Pick the strategy for an error message, honoring enable flags
    fn classify(&self, command: &str, error: &str) -> Option<CorrectionStrategy> {
        let error = error.to_lowercase();
        let command_lower = command.to_lowercase();

        if self.enable_permission && self.patterns.permission.is_match(&error) {
            return Some(CorrectionStrategy::PermissionFix);
        }
        if self.enable_substitution && self.patterns.command_not_found.is_match(&error) {
            return Some(CorrectionStrategy::CommandSubstitution);
        }
        if self.enable_package && self.patterns.package_not_found.is_match(&error) {
            return Some(CorrectionStrategy::PackageUpdate);
        }
        if self.enable_service && self.patterns.service_not_found.is_match(&error) {
            return Some(CorrectionStrategy::ServiceRestart);
        }
        if self.enable_network && self.patterns.network.is_match(&error) {
            return Some(CorrectionStrategy::NetworkCheck);
        }
        if self.patterns.file_not_found.is_match(&error) {
            return Some(CorrectionStrategy::PathCorrection);
        }
        if self.patterns.syntax.is_match(&error) {
            let base = base_command(&command_lower);
            if ALTERNATIVE_FLAGS.iter().any(|(cmd, _, _)| *cmd == base) {
                return Some(CorrectionStrategy::AlternativeFlags);
            }
            if self.enable_syntax {
                return Some(CorrectionStrategy::SyntaxCheck);
            }
            return None;
        }
        if self.enable_service && command_lower.contains("systemctl") && error.contains("failed") {
            return Some(CorrectionStrategy::ServiceRestart);
        }
        if self.enable_syntax {
            return Some(CorrectionStrategy::SyntaxCheck);
        }
        None
    }

    async fn apply(&self, strategy: CorrectionStrategy, command: &str, ctx: &ExecutionContext) -> Option<String> {
        match strategy {
            CorrectionStrategy::PermissionFix => fix_permissions(command),
            CorrectionStrategy::CommandSubstitution => substitute_command(command),
            CorrectionStrategy::PackageUpdate => fix_package_index(command),
            CorrectionStrategy::ServiceRestart => fix_service(command),
            CorrectionStrategy::NetworkCheck => self.fix_network(command, ctx).await,
            CorrectionStrategy::PathCorrection => fix_paths(command),
            CorrectionStrategy::SyntaxCheck => fix_syntax(command),
            CorrectionStrategy::AlternativeFlags => try_alternative_flags(command),
        }
    }

    /// Probe connectivity first; only guard the command when the network
    /// itself answers.
    async fn fix_network(&self, command: &str, ctx: &ExecutionContext) -> Option<String> {
        let probe = "ping -c 1 8.8.8.8";
        let reachable = match ctx
            .transport
            .execute_command(probe, self.test_timeout, None)
            .await
        {
            Ok(out) => out.success(),
            Err(_) => false,
        };

        if !reachable {
            debug!("network probe failed, giving up on network correction");
            return None;
        }

        Some(format!("ping -c 1 8.8.8.8 > /dev/null 2>&1 && {}", command))
    }

    async fn test_rewrite(&self, command: &str, ctx: &ExecutionContext) -> CommandResult {
        match ctx.transport.execute_command(command, self.test_timeout, None).await {
            Ok(out) => CommandResult::completed(command, out.exit_code, out.stdout, out.stderr, out.duration_ms),
            Err(e) => CommandResult::failed(command, e.to_string(), 0),
        }
    }
}

fn base_command(command: &str) -> &str {
    command.split_whitespace().next().unwrap_or("")
}

fn fix_permissions(command: &str) -> Option<String> {
    if command.starts_with("sudo ") {
        return None;
    }
    let base = base_command(command);
    if SUDO_COMMANDS.contains(&base) {
        Some(format!("sudo {}", command))
    } else {
        None
    }
}

fn substitute_command(command: &str) -> Option<String> {
    for (old, new) in SUBSTITUTIONS {
        if command.contains(old) {
            return Some(command.replacen(old, new, 1));
        }
    }
    None
}

fn fix_package_index(command: &str) -> Option<String> {
    if command.contains("apt") && command.contains("install") {
        Some(format!("sudo apt update && {}", command))
    } else {
        None
    }
}

fn fix_service(command: &str) -> Option<String> {
    if !command.contains("systemctl") {
        return None;
    }
    let service = command.split_whitespace().last()?;
    if service == "systemctl" {
        return None;
    }
    Some(format!(
        "sudo systemctl daemon-reload && sudo systemctl restart {}",
        service
    ))
}

fn fix_paths(command: &str) -> Option<String> {
    if command.starts_with("mkdir") && !command.contains("sudo") {
        return Some(format!("sudo {}", command));
    }
    if command.contains("./") && !command.starts_with("./") {
        return Some(command.replace("./", "/"));
    }
    None
}

fn fix_syntax(command: &str) -> Option<String> {
    let mut corrected = command.trim().to_string();

    // Collapse repeated whitespace
    let collapsed: String = corrected.split_whitespace().collect::<Vec<_>>().join(" ");
    corrected = collapsed;

    // Smart quotes from copy-pasted docs
    corrected = corrected
        .replace(['\u{201c}', '\u{201d}'], "\"")
        .replace(['\u{2018}', '\u{2019}'], "'");

    // Windows-style separators
    if corrected.contains('\\') && !corrected.contains('/') {
        corrected = corrected.replace('\\', "/");
    }

    if corrected == command { None } else { Some(corrected) }
}

fn try_alternative_flags(command: &str) -> Option<String> {
    let mut parts = command.split_whitespace();
    let base = parts.next()?;
    let rest: Vec<&str> = parts.collect();
    if rest.is_empty() {
        return None;
    }

    let (_, defaults, fallbacks) = ALTERNATIVE_FLAGS.iter().find(|(cmd, _, _)| *cmd == base)?;

    for flag in defaults.iter().chain(fallbacks.iter()) {
        if !command.contains(flag) {
            return Some(format!("{} {} {}", base, flag, rest.join(" ")));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ServerFacts, Subtask};
    use crate::test_utils::ScriptedTransport;
    use std::sync::Arc;

    fn engine() -> AutocorrectionEngine {
        AutocorrectionEngine::new(&ExecutorConfig::default())
    }

    fn context(transport: Arc<ScriptedTransport>) -> ExecutionContext {
        ExecutionContext::new(Subtask::new("t", "d"), transport, ServerFacts::default())
    }

    fn failed(command: &str, stderr: &str) -> CommandResult {
        CommandResult::completed(command, 1, String::new(), stderr.to_string(), 5)
    }

    #[tokio::test]
    async fn test_permission_fix_scenario() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.respond("sudo apt install nginx", 0, "ok", "");
        let ctx = context(transport);

        let result = engine()
            .correct(&failed("apt install nginx", "E: permission denied"), &ctx)
            .await;

        assert!(result.success);
        assert_eq!(result.final_command.as_deref(), Some("sudo apt install nginx"));
        assert_eq!(result.attempts[0].strategy, CorrectionStrategy::PermissionFix);
        assert_eq!(result.total_attempts, 1);
    }

    #[tokio::test]
    async fn test_service_tool_substitution_scenario() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.respond("systemctl", 0, "", "");
        let ctx = context(transport);

        let result = engine()
            .correct(&failed("service nginx start", "bash: service: command not found"), &ctx)
            .await;

        assert!(result.success);
        assert!(result.final_command.unwrap().contains("systemctl"));
        assert_eq!(result.attempts[0].strategy, CorrectionStrategy::CommandSubstitution);
    }

    #[tokio::test]
    async fn test_package_update_rewrite() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.respond("apt update", 0, "", "");
        let ctx = context(transport);

        let result = engine()
            .correct(
                &failed("apt install htop", "E: Unable to locate package htop"),
                &ctx,
            )
            .await;

        assert!(result.success);
        assert_eq!(
            result.final_command.as_deref(),
            Some("sudo apt update && apt install htop")
        );
    }

    #[tokio::test]
    async fn test_service_restart_rewrite() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.respond("daemon-reload", 0, "", "");
        let ctx = context(transport);

        let result = engine()
            .correct(&failed("systemctl start myapp", "Unit myapp.service not found"), &ctx)
            .await;

        assert!(result.success);
        assert_eq!(
            result.final_command.as_deref(),
            Some("sudo systemctl daemon-reload && sudo systemctl restart myapp")
        );
    }

    #[tokio::test]
    async fn test_network_check_gives_up_when_probe_fails() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.respond("ping -c 1 8.8.8.8", 1, "", "network is unreachable");
        let ctx = context(transport);

        let result = engine()
            .correct(&failed("curl http://example.com", "connection refused"), &ctx)
            .await;

        assert!(!result.success);
        assert!(result.attempts.is_empty());
    }

    #[tokio::test]
    async fn test_network_check_guards_command() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.respond("ping -c 1 8.8.8.8 > /dev/null", 0, "", "");
        transport.respond("ping -c 1 8.8.8.8", 0, "1 received", "");
        let ctx = context(transport);

        let result = engine()
            .correct(&failed("curl http://example.com", "connection timed out"), &ctx)
            .await;

        assert!(result.success);
        assert!(result.final_command.unwrap().starts_with("ping -c 1 8.8.8.8"));
    }

    #[tokio::test]
    async fn test_alternative_flags_for_known_command() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.respond("ls", 0, "", "");
        let ctx = context(transport);

        let result = engine()
            .correct(&failed("ls --wrong /tmp", "ls: unrecognized option '--wrong'"), &ctx)
            .await;

        assert!(result.success);
        assert_eq!(result.attempts[0].strategy, CorrectionStrategy::AlternativeFlags);
        assert!(result.final_command.unwrap().starts_with("ls -la"));
    }

    #[tokio::test]
    async fn test_syntax_normalization() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.respond("echo", 0, "", "");
        let ctx = context(transport);

        let result = engine()
            .correct(&failed("echo  \u{201c}hi\u{201d}", "sh: syntax error"), &ctx)
            .await;

        assert!(result.success);
        assert_eq!(result.final_command.as_deref(), Some("echo \"hi\""));
    }

    #[tokio::test]
    async fn test_attempts_bounded_by_max() {
        // Every rewrite keeps failing with a permission error; each
        // iteration prepends sudo only once, so the loop stops early on
        // the unchanged command.
        let transport = Arc::new(ScriptedTransport::new());
        transport.respond("sudo chmod 600 /etc/app.conf", 1, "", "permission denied");
        let ctx = context(transport);

        let result = engine()
            .correct(&failed("chmod 600 /etc/app.conf", "permission denied"), &ctx)
            .await;

        assert!(!result.success);
        assert!(result.total_attempts <= ExecutorConfig::default().autocorrection_max_attempts);
    }

    #[tokio::test]
    async fn test_no_strategy_for_unknown_base() {
        // Permission error on a command outside the sudo set produces no
        // rewrite at all.
        let transport = Arc::new(ScriptedTransport::new());
        let ctx = context(transport.clone());

        let result = engine()
            .correct(&failed("whoami", "operation not permitted"), &ctx)
            .await;

        assert!(!result.success);
        assert_eq!(result.total_attempts, 0);
        assert!(transport.calls().is_empty());
    }

    #[tokio::test]
    async fn test_disabled_strategy_is_skipped() {
        let config = ExecutorConfig {
            enable_permission_correction: false,
            enable_syntax_correction: false,
            ..ExecutorConfig::default()
        };
        let engine = AutocorrectionEngine::new(&config);
        let transport = Arc::new(ScriptedTransport::new());
        let ctx = context(transport);

        let result = engine
            .correct(&failed("apt install nginx", "permission denied"), &ctx)
            .await;

        assert!(!result.success);
        assert!(result.attempts.is_empty());
    }

    #[test]
    fn test_ps_aux_substitution_wins_over_shorter() {
        assert_eq!(substitute_command("ps aux | grep nginx").unwrap(), "ps -ef | grep nginx");
    }

    #[test]
    fn test_fix_permissions_respects_existing_sudo() {
        assert!(fix_permissions("sudo apt update").is_none());
        assert_eq!(fix_permissions("mkdir /opt/app").unwrap(), "sudo mkdir /opt/app");
    }
}
