//! Idempotency system
//!
//! Wraps mutating commands in guarded `precondition || action` forms,
//! probes target state before execution so already-satisfied commands can
//! be skipped, and keeps per-task state snapshots that drive rollback.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::IdempotencyConfig;
use crate::domain::CommandResult;
use crate::transport::SshTransport;

/// What a precondition probe verifies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckType {
    FileExists,
    DirectoryExists,
    ServiceRunning,
    ServiceEnabled,
    PackageInstalled,
    UserExists,
    GroupExists,
    PortOpen,
    ProcessRunning,
    ConfigExists,
    Custom,
}

impl std::fmt::Display for CheckType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::FileExists => "file_exists",
            Self::DirectoryExists => "directory_exists",
            Self::ServiceRunning => "service_running",
            Self::ServiceEnabled => "service_enabled",
            Self::PackageInstalled => "package_installed",
            Self::UserExists => "user_exists",
            Self::GroupExists => "group_exists",
            Self::PortOpen => "port_open",
            Self::ProcessRunning => "process_running",
            Self::ConfigExists => "config_exists",
            Self::Custom => "custom",
        };
        write!(f, "{}", name)
    }
}

/// Mutation kinds the wrapper knows how to guard
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationKind {
    InstallPackage,
    CreateFile,
    CreateDirectory,
    StartService,
    EnableService,
    CreateUser,
    CreateGroup,
    OpenPort,
}

/// A precondition probe
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyCheck {
    pub check_type: CheckType,

    /// The object being probed (path, service, package, ...)
    pub target: String,

    pub expected_state: bool,

    /// Shell command whose exit 0 means the state holds
    pub probe_command: String,

    /// Optional regex the probe's stdout must also match
    pub success_pattern: Option<String>,

    pub description: String,

    pub timeout_secs: u64,

    pub retry_count: u32,
}

impl IdempotencyCheck {
    fn new(check_type: CheckType, target: &str, probe_command: String, description: String) -> Self {
        Self {
            check_type,
            target: target.to_string(),
            expected_state: true,
            probe_command,
            success_pattern: None,
            description,
            timeout_secs: 30,
            retry_count: 3,
        }
    }
}

/// Result of running one probe
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckOutcome {
    pub check: IdempotencyCheck,

    /// The target state already holds
    pub satisfied: bool,

    pub current_state: Option<String>,

    pub error: Option<String>,

    pub checked_at: DateTime<Utc>,
}

/// Record of the mutations performed since a named baseline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub snapshot_id: String,
    pub created_at: DateTime<Utc>,
    pub system_info: HashMap<String, String>,
    pub packages_installed: Vec<String>,
    pub services_started: Vec<String>,
    pub services_enabled: Vec<String>,
    pub files_created: Vec<String>,
    pub files_modified: Vec<String>,
    pub users_created: Vec<String>,
    pub groups_created: Vec<String>,
}

impl StateSnapshot {
    fn new(snapshot_id: String) -> Self {
        Self {
            snapshot_id,
            created_at: Utc::now(),
            system_info: HashMap::new(),
            packages_installed: Vec::new(),
            services_started: Vec::new(),
            services_enabled: Vec::new(),
            files_created: Vec::new(),
            files_modified: Vec::new(),
            users_created: Vec::new(),
            groups_created: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.packages_installed.is_empty()
            && self.services_started.is_empty()
            && self.services_enabled.is_empty()
            && self.files_created.is_empty()
            && self.files_modified.is_empty()
            && self.users_created.is_empty()
            && self.groups_created.is_empty()
    }
}

struct InferencePatterns {
    package: Regex,
    file_touch: Regex,
    file_redirect: Regex,
    directory: Regex,
    service_start: Regex,
    service_start_legacy: Regex,
    service_enable: Regex,
    user: Regex,
    group: Regex,
}

impl InferencePatterns {
    fn new() -> Self {
        Self {
            package: Regex::new(r"(?:apt-get|apt|yum|dnf)\s+install\s+(?:-y\s+)?([a-zA-Z0-9._+-]+)").unwrap(),
            file_touch: Regex::new(r"touch\s+(\S+)").unwrap(),
            file_redirect: Regex::new(r"echo\s+.*>>?\s*(\S+)").unwrap(),
            directory: Regex::new(r"mkdir\s+(?:-p\s+)?(\S+)").unwrap(),
            service_start: Regex::new(r"systemctl\s+start\s+(\S+)").unwrap(),
            service_start_legacy: Regex::new(r"service\s+(\S+)\s+start").unwrap(),
            service_enable: Regex::new(r"systemctl\s+enable\s+(\S+)").unwrap(),
            user: Regex::new(r"useradd\s+(?:-\S+\s+)*(\S+)").unwrap(),
            group: Regex::new(r"groupadd\s+(?:-\S+\s+)*(\S+)").unwrap(),
        }
    }
}

/// The idempotency system: wrap generation, probe cache, snapshots,
/// and rollback. One instance lives inside the orchestrator per task.
pub struct IdempotencySystem {
    transport: Arc<dyn SshTransport>,
    config: IdempotencyConfig,
    snapshots: Mutex<HashMap<String, StateSnapshot>>,
    snapshot_order: Mutex<Vec<String>>,
    current_snapshot: Mutex<Option<String>>,
    cache: Mutex<HashMap<String, CheckOutcome>>,
    patterns: InferencePatterns,
}

impl IdempotencySystem {
    pub fn new(transport: Arc<dyn SshTransport>, config: IdempotencyConfig) -> Self {
        Self {
            transport,
            config,
            snapshots: Mutex::new(HashMap::new()),
            snapshot_order: Mutex::new(Vec::new()),
            current_snapshot: Mutex::new(None),
            cache: Mutex::new(HashMap::new()),
            patterns: InferencePatterns::new(),
        }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// Create a snapshot for a task, recording baseline system info.
    /// Oldest snapshots are evicted past `max_snapshots`.
    pub async fn create_snapshot(&self, task_id: &str, collect_system_info: bool) -> StateSnapshot {
        let snapshot_id = format!("{}_{}", task_id, Utc::now().format("%Y%m%d_%H%M%S"));
        let mut snapshot = StateSnapshot::new(snapshot_id.clone());

        if collect_system_info {
            snapshot.system_info = self.collect_system_info().await;
        }

        {
            let mut snapshots = self.snapshots.lock().unwrap();
            let mut order = self.snapshot_order.lock().unwrap();
            snapshots.insert(snapshot_id.clone(), snapshot.clone());
            order.push(snapshot_id.clone());
            while order.len() > self.config.max_snapshots {
                let oldest = order.remove(0);
                snapshots.remove(&oldest);
            }
        }
        *self.current_snapshot.lock().unwrap() = Some(snapshot_id.clone());

        info!(snapshot_id = %snapshot_id, "created state snapshot");
        snapshot
    }

    /// Append a successful mutation to the current snapshot's log
    pub fn record_mutation(&self, kind: MutationKind, target: &str) {
        let current = self.current_snapshot.lock().unwrap().clone();
        let Some(snapshot_id) = current else { return };

        let mut snapshots = self.snapshots.lock().unwrap();
        let Some(snapshot) = snapshots.get_mut(&snapshot_id) else {
            return;
        };

        let list = match kind {
            MutationKind::InstallPackage => &mut snapshot.packages_installed,
            MutationKind::CreateFile => &mut snapshot.files_created,
            MutationKind::CreateDirectory => &mut snapshot.files_created,
            MutationKind::StartService => &mut snapshot.services_started,
            MutationKind::EnableService => &mut snapshot.services_enabled,
            MutationKind::CreateUser => &mut snapshot.users_created,
            MutationKind::CreateGroup => &mut snapshot.groups_created,
            MutationKind::OpenPort => return,
        };
        if !list.contains(&target.to_string()) {
            list.push(target.to_string());
        }
    }

    pub fn snapshot(&self, snapshot_id: &str) -> Option<StateSnapshot> {
        self.snapshots.lock().unwrap().get(snapshot_id).cloned()
    }

    pub fn current_snapshot_id(&self) -> Option<String> {
        self.current_snapshot.lock().unwrap().clone()
    }

    /// Wrap a mutation in its guarded no-op-when-satisfied form
    pub fn generate_idempotent(&self, kind: MutationKind, target: &str) -> (String, Vec<IdempotencyCheck>) {
        let (command, check) = match kind {
            MutationKind::InstallPackage => (
                format!("dpkg -l | grep -q '^ii  {t}' || apt-get install -y {t}", t = target),
                self.package_check(target),
            ),
            MutationKind::CreateFile => (
                format!("test -f {t} || (mkdir -p $(dirname {t}) && touch {t})", t = target),
                self.file_check(target),
            ),
            MutationKind::CreateDirectory => (
                format!("test -d {t} || mkdir -p {t}", t = target),
                self.directory_check(target),
            ),
            MutationKind::StartService => (
                format!("systemctl is-active --quiet {t} || systemctl start {t}", t = target),
                self.service_check(target),
            ),
            MutationKind::EnableService => (
                format!("systemctl is-enabled --quiet {t} || systemctl enable {t}", t = target),
                self.service_enabled_check(target),
            ),
            MutationKind::CreateUser => (
                format!("id {t} >/dev/null 2>&1 || useradd {t}", t = target),
                self.user_check(target),
            ),
            MutationKind::CreateGroup => (
                format!("getent group {t} >/dev/null 2>&1 || groupadd {t}", t = target),
                self.group_check(target),
            ),
            MutationKind::OpenPort => (
                format!(
                    "netstat -tuln | grep -q ':{t} ' || iptables -A INPUT -p tcp --dport {t} -j ACCEPT",
                    t = target
                ),
                self.port_check(target),
            ),
        };

        debug!(kind = ?kind, target = %target, "generated idempotent wrap");
        (command, vec![check])
    }

    /// Infer the mutation a raw command performs, for skip probing and
    /// snapshot bookkeeping. Returns `None` for non-mutating commands.
    pub fn infer_mutation(&self, command: &str) -> Option<(MutationKind, String)> {
        let command = command.trim().strip_prefix("sudo ").unwrap_or(command.trim());

        if let Some(c) = self.patterns.package.captures(command) {
            return Some((MutationKind::InstallPackage, c[1].to_string()));
        }
        if let Some(c) = self.patterns.directory.captures(command) {
            return Some((MutationKind::CreateDirectory, c[1].to_string()));
        }
        if let Some(c) = self.patterns.service_start.captures(command) {
            return Some((MutationKind::StartService, c[1].to_string()));
        }
        if let Some(c) = self.patterns.service_start_legacy.captures(command) {
            return Some((MutationKind::StartService, c[1].to_string()));
        }
        if let Some(c) = self.patterns.service_enable.captures(command) {
            return Some((MutationKind::EnableService, c[1].to_string()));
        }
        if let Some(c) = self.patterns.user.captures(command) {
            return Some((MutationKind::CreateUser, c[1].to_string()));
        }
        if let Some(c) = self.patterns.group.captures(command) {
            return Some((MutationKind::CreateGroup, c[1].to_string()));
        }
        if let Some(c) = self.patterns.file_touch.captures(command) {
            return Some((MutationKind::CreateFile, c[1].to_string()));
        }
        if let Some(c) = self.patterns.file_redirect.captures(command) {
            return Some((MutationKind::CreateFile, c[1].to_string()));
        }
        None
    }

    /// Extract precondition probes for a raw command, honoring the
    /// per-check-type enable flags.
    pub fn infer_checks(&self, command: &str) -> Vec<IdempotencyCheck> {
        if !self.config.enabled {
            return Vec::new();
        }
        let Some((kind, target)) = self.infer_mutation(command) else {
            return Vec::new();
        };

        let check = match kind {
            MutationKind::InstallPackage if self.config.check_packages => self.package_check(&target),
            MutationKind::CreateFile if self.config.check_files => self.file_check(&target),
            MutationKind::CreateDirectory if self.config.check_directories => self.directory_check(&target),
            MutationKind::StartService if self.config.check_services => self.service_check(&target),
            MutationKind::EnableService if self.config.check_services => self.service_enabled_check(&target),
            MutationKind::CreateUser if self.config.check_users => self.user_check(&target),
            MutationKind::CreateGroup if self.config.check_groups => self.group_check(&target),
            MutationKind::OpenPort if self.config.check_ports => self.port_check(&target),
            _ => return Vec::new(),
        };
        vec![check]
    }

    /// Run probes, consulting the TTL cache first. A probe failure at the
    /// transport level is treated as "state not met".
    pub async fn check(&self, checks: &[IdempotencyCheck]) -> Vec<CheckOutcome> {
        let mut outcomes = Vec::with_capacity(checks.len());

        for check in checks {
            let key = cache_key(check);

            let cached = {
                let cache = self.cache.lock().unwrap();
                cache.get(&key).filter(|o| self.cache_valid(o)).cloned()
            };
            if let Some(outcome) = cached {
                debug!(target = %check.target, "probe served from cache");
                outcomes.push(outcome);
                continue;
            }

            let outcome = self.run_probe(check).await;
            self.cache.lock().unwrap().insert(key, outcome.clone());
            outcomes.push(outcome);
        }

        if self.config.log_checks {
            debug!(
                total = checks.len(),
                satisfied = outcomes.iter().filter(|o| o.satisfied).count(),
                "idempotency checks complete"
            );
        }
        outcomes
    }

    /// A command can be skipped when it has probes and all of them report
    /// the target state already holds.
    pub async fn should_skip(&self, command: &str, checks: &[IdempotencyCheck]) -> bool {
        if checks.is_empty() {
            return false;
        }
        let outcomes = self.check(checks).await;
        let skip = outcomes.iter().all(|o| o.satisfied);
        if skip {
            info!(command = %command, "command skipped, state already achieved");
        }
        skip
    }

    /// Synthesize the inverse command sequence for a snapshot, in reverse
    /// mutation order: stop services, disable services, remove packages,
    /// delete files, prune empty parents, delete users and groups.
    pub fn rollback_commands(&self, snapshot: &StateSnapshot) -> Vec<String> {
        let mut commands = Vec::new();

        for service in snapshot.services_started.iter().rev() {
            commands.push(format!("systemctl stop {}", service));
        }
        for service in snapshot.services_enabled.iter().rev() {
            commands.push(format!("systemctl disable {}", service));
        }
        for package in snapshot.packages_installed.iter().rev() {
            commands.push(format!("apt-get remove -y {}", package));
        }
        for file in snapshot.files_created.iter().rev() {
            commands.push(format!("rm -f {}", file));
        }
        for file in snapshot.files_created.iter().rev() {
            if let Some(parent) = file.rsplit_once('/').map(|(dir, _)| dir)
                && !parent.is_empty()
            {
                commands.push(format!("rmdir {} 2>/dev/null || true", parent));
            }
        }
        for user in snapshot.users_created.iter().rev() {
            commands.push(format!("userdel -r {}", user));
        }
        for group in snapshot.groups_created.iter().rev() {
            commands.push(format!("groupdel {}", group));
        }

        commands
    }

    /// Issue a snapshot's rollback sequence best-effort: a failing step is
    /// logged and the loop continues.
    pub async fn execute_rollback(&self, snapshot_id: &str) -> eyre::Result<Vec<CommandResult>> {
        let snapshot = self
            .snapshot(snapshot_id)
            .ok_or_else(|| eyre::eyre!("Snapshot not found: {}", snapshot_id))?;

        let commands = self.rollback_commands(&snapshot);
        let timeout = Duration::from_secs(self.config.rollback_timeout);
        let mut results = Vec::with_capacity(commands.len());

        for command in &commands {
            match self.transport.execute_command(command, timeout, None).await {
                Ok(out) => {
                    if !out.success() && self.config.log_rollbacks {
                        warn!(command = %command, exit = out.exit_code, "rollback step failed");
                    }
                    results.push(CommandResult::completed(
                        command.clone(),
                        out.exit_code,
                        out.stdout,
                        out.stderr,
                        out.duration_ms,
                    ));
                }
                Err(e) => {
                    warn!(command = %command, error = %e, "rollback step errored");
                    results.push(CommandResult::failed(command.clone(), e.to_string(), 0));
                }
            }
        }

        if self.config.log_rollbacks {
            info!(
                snapshot_id = %snapshot_id,
                executed = results.len(),
                succeeded = results.iter().filter(|r| r.success).count(),
                "rollback complete"
            );
        }
        Ok(results)
    }

    /// Drop snapshots unless configured to preserve them
    pub fn finish_task(&self) {
        if self.config.preserve_snapshots {
            return;
        }
        if let Some(snapshot_id) = self.current_snapshot.lock().unwrap().take() {
            self.snapshots.lock().unwrap().remove(&snapshot_id);
            self.snapshot_order.lock().unwrap().retain(|id| *id != snapshot_id);
        }
    }

    pub fn status(&self) -> HashMap<String, serde_json::Value> {
        let mut status = HashMap::new();
        status.insert(
            "snapshots_count".to_string(),
            serde_json::json!(self.snapshots.lock().unwrap().len()),
        );
        status.insert(
            "current_snapshot".to_string(),
            serde_json::json!(self.current_snapshot.lock().unwrap().clone()),
        );
        status.insert(
            "cache_size".to_string(),
            serde_json::json!(self.cache.lock().unwrap().len()),
        );
        status.insert("cache_ttl".to_string(), serde_json::json!(self.config.cache_ttl));
        status
    }

    fn package_check(&self, package: &str) -> IdempotencyCheck {
        IdempotencyCheck::new(
            CheckType::PackageInstalled,
            package,
            format!("dpkg -l | grep -q '^ii  {}'", package),
            format!("package {} is installed", package),
        )
    }

    fn file_check(&self, path: &str) -> IdempotencyCheck {
        IdempotencyCheck::new(
            CheckType::FileExists,
            path,
            format!("test -f {}", path),
            format!("file {} exists", path),
        )
    }

    fn directory_check(&self, path: &str) -> IdempotencyCheck {
        IdempotencyCheck::new(
            CheckType::DirectoryExists,
            path,
            format!("test -d {}", path),
            format!("directory {} exists", path),
        )
    }

    fn service_check(&self, service: &str) -> IdempotencyCheck {
        IdempotencyCheck::new(
            CheckType::ServiceRunning,
            service,
            format!("systemctl is-active --quiet {}", service),
            format!("service {} is running", service),
        )
    }

    fn service_enabled_check(&self, service: &str) -> IdempotencyCheck {
        IdempotencyCheck::new(
            CheckType::ServiceEnabled,
            service,
            format!("systemctl is-enabled --quiet {}", service),
            format!("service {} is enabled", service),
        )
    }

    fn user_check(&self, username: &str) -> IdempotencyCheck {
        IdempotencyCheck::new(
            CheckType::UserExists,
            username,
            format!("id {} >/dev/null 2>&1", username),
            format!("user {} exists", username),
        )
    }

    fn group_check(&self, group: &str) -> IdempotencyCheck {
        IdempotencyCheck::new(
            CheckType::GroupExists,
            group,
            format!("getent group {} >/dev/null 2>&1", group),
            format!("group {} exists", group),
        )
    }

    fn port_check(&self, port: &str) -> IdempotencyCheck {
        IdempotencyCheck::new(
            CheckType::PortOpen,
            port,
            format!("netstat -tuln | grep -q ':{} '", port),
            format!("port {} is open", port),
        )
    }

    async fn run_probe(&self, check: &IdempotencyCheck) -> CheckOutcome {
        let timeout = Duration::from_secs(self.config.check_timeout.min(check.timeout_secs.max(1)));

        match self.transport.execute_command(&check.probe_command, timeout, None).await {
            Ok(out) => {
                let mut satisfied = out.success();
                if satisfied
                    && let Some(pattern) = &check.success_pattern
                    && let Ok(re) = Regex::new(pattern)
                {
                    satisfied = re.is_match(&out.stdout);
                }
                CheckOutcome {
                    check: check.clone(),
                    satisfied,
                    current_state: if satisfied { Some(out.stdout) } else { None },
                    error: if satisfied { None } else { Some(out.stderr) },
                    checked_at: Utc::now(),
                }
            }
            Err(e) => CheckOutcome {
                check: check.clone(),
                satisfied: false,
                current_state: None,
                error: Some(e.to_string()),
                checked_at: Utc::now(),
            },
        }
    }

    async fn collect_system_info(&self) -> HashMap<String, String> {
        let mut info = HashMap::new();
        for (key, command) in [("uname", "uname -a"), ("disk_usage", "df -h"), ("memory", "free -h")] {
            match self
                .transport
                .execute_command(command, Duration::from_secs(10), None)
                .await
            {
                Ok(out) if out.success() => {
                    info.insert(key.to_string(), out.stdout.trim().to_string());
                }
                Ok(_) => {}
                Err(e) => warn!(command = %command, error = %e, "system info probe failed"),
            }
        }
        info
    }

    fn cache_valid(&self, outcome: &CheckOutcome) -> bool {
        let age = Utc::now().signed_duration_since(outcome.checked_at);
        age.num_seconds() >= 0 && (age.num_seconds() as u64) < self.config.cache_ttl
    }
}

fn cache_key(check: &IdempotencyCheck) -> String {
    let mut hasher = Sha256::new();
    hasher.update(check.check_type.to_string());
    hasher.update(":");
    hasher.update(&check.target);
    hasher.update(":");
    hasher.update(&check.probe_command);
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::ScriptedTransport;

    fn system(transport: Arc<ScriptedTransport>) -> IdempotencySystem {
        IdempotencySystem::new(transport, IdempotencyConfig::default())
    }

    #[test]
    fn test_wrap_forms() {
        let sys = system(Arc::new(ScriptedTransport::new()));

        let (cmd, checks) = sys.generate_idempotent(MutationKind::InstallPackage, "nginx");
        assert_eq!(cmd, "dpkg -l | grep -q '^ii  nginx' || apt-get install -y nginx");
        assert_eq!(checks[0].check_type, CheckType::PackageInstalled);

        let (cmd, _) = sys.generate_idempotent(MutationKind::CreateDirectory, "/opt/app");
        assert_eq!(cmd, "test -d /opt/app || mkdir -p /opt/app");

        let (cmd, _) = sys.generate_idempotent(MutationKind::StartService, "nginx");
        assert_eq!(cmd, "systemctl is-active --quiet nginx || systemctl start nginx");

        let (cmd, _) = sys.generate_idempotent(MutationKind::CreateUser, "deploy");
        assert_eq!(cmd, "id deploy >/dev/null 2>&1 || useradd deploy");

        let (cmd, _) = sys.generate_idempotent(MutationKind::OpenPort, "8080");
        assert!(cmd.starts_with("netstat -tuln | grep -q ':8080 '"));
    }

    #[test]
    fn test_wrap_is_deterministic() {
        let sys = system(Arc::new(ScriptedTransport::new()));
        let (wrapped, _) = sys.generate_idempotent(MutationKind::CreateDirectory, "/opt/app");
        let (rewrapped, _) = sys.generate_idempotent(MutationKind::CreateDirectory, "/opt/app");
        assert_eq!(wrapped, rewrapped);
    }

    #[test]
    fn test_infer_mutation_table() {
        let sys = system(Arc::new(ScriptedTransport::new()));

        assert_eq!(
            sys.infer_mutation("sudo apt-get install -y nginx"),
            Some((MutationKind::InstallPackage, "nginx".to_string()))
        );
        assert_eq!(
            sys.infer_mutation("yum install httpd"),
            Some((MutationKind::InstallPackage, "httpd".to_string()))
        );
        assert_eq!(
            sys.infer_mutation("mkdir -p /var/www/app"),
            Some((MutationKind::CreateDirectory, "/var/www/app".to_string()))
        );
        assert_eq!(
            sys.infer_mutation("systemctl start nginx"),
            Some((MutationKind::StartService, "nginx".to_string()))
        );
        assert_eq!(
            sys.infer_mutation("service nginx start"),
            Some((MutationKind::StartService, "nginx".to_string()))
        );
        assert_eq!(
            sys.infer_mutation("systemctl enable nginx"),
            Some((MutationKind::EnableService, "nginx".to_string()))
        );
        assert_eq!(
            sys.infer_mutation("useradd deploy"),
            Some((MutationKind::CreateUser, "deploy".to_string()))
        );
        assert_eq!(
            sys.infer_mutation("groupadd web"),
            Some((MutationKind::CreateGroup, "web".to_string()))
        );
        assert_eq!(
            sys.infer_mutation("touch /etc/app.conf"),
            Some((MutationKind::CreateFile, "/etc/app.conf".to_string()))
        );
        assert_eq!(sys.infer_mutation("cat /etc/passwd"), None);
    }

    #[tokio::test]
    async fn test_should_skip_when_all_satisfied() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.respond("dpkg -l", 0, "", "");
        let sys = system(transport.clone());

        let checks = sys.infer_checks("apt-get install nginx");
        assert_eq!(checks.len(), 1);
        assert!(sys.should_skip("apt-get install nginx", &checks).await);
        assert_eq!(transport.call_count(), 1);
    }

    #[tokio::test]
    async fn test_should_not_skip_when_state_missing() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.respond("dpkg -l", 1, "", "");
        let sys = system(transport);

        let checks = sys.infer_checks("apt-get install nginx");
        assert!(!sys.should_skip("apt-get install nginx", &checks).await);
    }

    #[tokio::test]
    async fn test_should_skip_empty_checks() {
        let sys = system(Arc::new(ScriptedTransport::new()));
        assert!(!sys.should_skip("cat /etc/passwd", &[]).await);
    }

    #[tokio::test]
    async fn test_probe_failure_means_state_not_met() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.timeout_on("test -f");
        let sys = system(transport);

        let checks = sys.infer_checks("touch /etc/app.conf");
        let outcomes = sys.check(&checks).await;
        assert!(!outcomes[0].satisfied);
        assert!(outcomes[0].error.is_some());
    }

    #[tokio::test]
    async fn test_check_cache_bypasses_probe() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.respond("test -d", 0, "", "");
        let sys = system(transport.clone());

        let checks = sys.infer_checks("mkdir -p /opt/app");
        sys.check(&checks).await;
        sys.check(&checks).await;
        // Second call served from cache
        assert_eq!(transport.call_count(), 1);
    }

    #[tokio::test]
    async fn test_check_type_flags_disable_inference() {
        let transport = Arc::new(ScriptedTransport::new());
        let config = IdempotencyConfig {
            check_packages: false,
            ..IdempotencyConfig::default()
        };
        let sys = IdempotencySystem::new(transport, config);
        assert!(sys.infer_checks("apt-get install nginx").is_empty());
        assert!(!sys.infer_checks("mkdir /tmp/x").is_empty());
    }

    #[tokio::test]
    async fn test_rollback_ordering() {
        let transport = Arc::new(ScriptedTransport::new());
        let sys = system(transport);
        sys.create_snapshot("task-1", false).await;

        sys.record_mutation(MutationKind::InstallPackage, "nginx");
        sys.record_mutation(MutationKind::StartService, "nginx");
        sys.record_mutation(MutationKind::CreateFile, "/etc/nginx/nginx.conf");

        let snapshot = sys.snapshot(&sys.current_snapshot_id().unwrap()).unwrap();
        let commands = sys.rollback_commands(&snapshot);

        let stop = commands.iter().position(|c| c == "systemctl stop nginx").unwrap();
        let remove = commands.iter().position(|c| c == "apt-get remove -y nginx").unwrap();
        let rm = commands
            .iter()
            .position(|c| c == "rm -f /etc/nginx/nginx.conf")
            .unwrap();
        assert!(stop < remove);
        assert!(remove < rm);
    }

    #[tokio::test]
    async fn test_execute_rollback_best_effort() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.respond("systemctl stop", 1, "", "unit not loaded");
        transport.respond("apt-get remove", 0, "", "");
        let sys = system(transport.clone());

        sys.create_snapshot("task-2", false).await;
        sys.record_mutation(MutationKind::InstallPackage, "nginx");
        sys.record_mutation(MutationKind::StartService, "nginx");

        let results = sys
            .execute_rollback(&sys.current_snapshot_id().unwrap())
            .await
            .unwrap();

        // The failing stop did not halt the remove
        assert_eq!(results.len(), 2);
        assert!(!results[0].success);
        assert!(results[1].success);
    }

    #[tokio::test]
    async fn test_execute_rollback_unknown_snapshot() {
        let sys = system(Arc::new(ScriptedTransport::new()));
        assert!(sys.execute_rollback("missing").await.is_err());
    }

    #[tokio::test]
    async fn test_snapshot_eviction() {
        let config = IdempotencyConfig {
            max_snapshots: 2,
            preserve_snapshots: true,
            ..IdempotencyConfig::default()
        };
        let sys = IdempotencySystem::new(Arc::new(ScriptedTransport::new()), config);

        let first = sys.create_snapshot("t1", false).await;
        sys.create_snapshot("t2", false).await;
        sys.create_snapshot("t3", false).await;

        assert!(sys.snapshot(&first.snapshot_id).is_none());
        assert_eq!(sys.status()["snapshots_count"], serde_json::json!(2));
    }

    #[tokio::test]
    async fn test_finish_task_drops_snapshot() {
        let sys = system(Arc::new(ScriptedTransport::new()));
        let snapshot = sys.create_snapshot("t1", false).await;
        sys.finish_task();
        assert!(sys.snapshot(&snapshot.snapshot_id).is_none());
        assert!(sys.current_snapshot_id().is_none());
    }

    #[test]
    fn test_cache_key_distinguishes_targets() {
        let sys = system(Arc::new(ScriptedTransport::new()));
        let a = cache_key(&sys.package_check("nginx"));
        let b = cache_key(&sys.package_check("redis"));
        assert_ne!(a, b);
    }
}
