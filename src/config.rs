//! Configuration types and loading
//!
//! One YAML document configures the agent (LLM, planners, executor, error
//! handling, idempotency, security, logging); a second per-target document
//! describes the server profile. Ranges are validated at load time.

use eyre::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::domain::ServerFacts;

/// Placeholder the LLM api_key must never equal
const API_KEY_PLACEHOLDER: &str = "your-api-key";

/// Main agent configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub llm: LlmConfig,
    pub taskmaster: TaskmasterConfig,
    pub task_agent: TaskAgentConfig,
    pub subtask_agent: SubtaskAgentConfig,
    pub executor: ExecutorConfig,
    pub error_handler: ErrorHandlerConfig,
    pub idempotency: IdempotencyConfig,
    pub security: SecurityConfig,
    pub logging: LoggingConfig,
}

impl AgentConfig {
    /// Load configuration with fallback chain: explicit path, then
    /// `./opsagent.yml`, then `~/.config/opsagent/opsagent.yml`, then defaults.
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        let local_config = PathBuf::from("opsagent.yml");
        if local_config.exists() {
            return Self::load_from_file(&local_config);
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("opsagent").join("opsagent.yml");
            if user_config.exists() {
                return Self::load_from_file(&user_config);
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;
        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;
        config.validate().context("Invalid configuration")?;
        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }

    /// Validate every section's ranges
    pub fn validate(&self) -> Result<()> {
        self.llm.validate()?;
        self.task_agent.validate()?;
        self.subtask_agent.validate()?;
        self.executor.validate()?;
        self.error_handler.validate()?;
        self.logging.validate()?;
        Ok(())
    }
}

/// LLM provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub api_key: String,

    pub base_url: String,

    pub model: String,

    /// "openai" or "gemini"
    pub provider: String,

    pub temperature: f32,

    pub max_tokens: u32,

    /// Request timeout in seconds
    pub timeout: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4".to_string(),
            provider: "openai".to_string(),
            temperature: 0.7,
            max_tokens: 4000,
            timeout: 60,
        }
    }
}

impl LlmConfig {
    pub fn validate(&self) -> Result<()> {
        if self.api_key == API_KEY_PLACEHOLDER {
            bail!("llm.api_key is still the placeholder value");
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            bail!("llm.temperature must be in [0, 2], got {}", self.temperature);
        }
        if !(1..=8000).contains(&self.max_tokens) {
            bail!("llm.max_tokens must be in [1, 8000], got {}", self.max_tokens);
        }
        if !matches!(self.provider.as_str(), "openai" | "gemini") {
            bail!("llm.provider must be 'openai' or 'gemini', got '{}'", self.provider);
        }
        Ok(())
    }

    pub fn timeout_duration(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }
}

/// Optional prompt-improvement helper configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskmasterConfig {
    pub enabled: bool,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for TaskmasterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            model: "gpt-4".to_string(),
            temperature: 0.7,
            max_tokens: 1000,
        }
    }
}

/// Task planner configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskAgentConfig {
    pub model: String,
    pub temperature: f32,
    pub max_steps: usize,
    pub max_tokens: u32,
}

impl Default for TaskAgentConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4".to_string(),
            temperature: 0.3,
            max_steps: 10,
            max_tokens: 2000,
        }
    }
}

impl TaskAgentConfig {
    pub fn validate(&self) -> Result<()> {
        if !(1..=50).contains(&self.max_steps) {
            bail!("task_agent.max_steps must be in [1, 50], got {}", self.max_steps);
        }
        Ok(())
    }
}

/// Subtask planner configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SubtaskAgentConfig {
    pub model: String,
    pub temperature: f32,
    pub max_subtasks: usize,
    pub max_tokens: u32,
}

impl Default for SubtaskAgentConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4".to_string(),
            temperature: 0.1,
            max_subtasks: 20,
            max_tokens: 3000,
        }
    }
}

impl SubtaskAgentConfig {
    pub fn validate(&self) -> Result<()> {
        if !(1..=100).contains(&self.max_subtasks) {
            bail!("subtask_agent.max_subtasks must be in [1, 100], got {}", self.max_subtasks);
        }
        Ok(())
    }
}

/// Command executor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub max_retries_per_command: u32,

    pub auto_correction_enabled: bool,

    pub dry_run_mode: bool,

    /// Per-command timeout in seconds
    pub command_timeout: u64,

    pub autocorrection_max_attempts: u32,

    /// Timeout for autocorrection test runs, in seconds
    pub autocorrection_timeout: u64,

    pub enable_syntax_correction: bool,
    pub enable_permission_correction: bool,
    pub enable_network_correction: bool,
    pub enable_service_correction: bool,
    pub enable_package_correction: bool,
    pub enable_command_substitution: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_retries_per_command: 2,
            auto_correction_enabled: true,
            dry_run_mode: false,
            command_timeout: 30,
            autocorrection_max_attempts: 3,
            autocorrection_timeout: 30,
            enable_syntax_correction: true,
            enable_permission_correction: true,
            enable_network_correction: true,
            enable_service_correction: true,
            enable_package_correction: true,
            enable_command_substitution: true,
        }
    }
}

impl ExecutorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_retries_per_command > 10 {
            bail!(
                "executor.max_retries_per_command must be in [0, 10], got {}",
                self.max_retries_per_command
            );
        }
        if !(1..=300).contains(&self.command_timeout) {
            bail!("executor.command_timeout must be in [1, 300], got {}", self.command_timeout);
        }
        if !(1..=10).contains(&self.autocorrection_max_attempts) {
            bail!(
                "executor.autocorrection_max_attempts must be in [1, 10], got {}",
                self.autocorrection_max_attempts
            );
        }
        Ok(())
    }

    /// A zero timeout means "use the default"
    pub fn command_timeout_for(&self, subtask_timeout_secs: u64) -> Duration {
        if subtask_timeout_secs == 0 {
            Duration::from_secs(self.command_timeout)
        } else {
            Duration::from_secs(subtask_timeout_secs)
        }
    }
}

/// Error tracking and escalation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorHandlerConfig {
    /// Consecutive failures before escalating to the planner
    pub error_threshold_per_step: u32,

    pub send_to_planner_after_threshold: bool,

    /// Consecutive failures before escalating to the operator
    pub human_escalation_threshold: u32,

    /// Consecutive failures before arming emergency stop
    pub emergency_stop_threshold: u32,

    /// Minutes during which a repeated escalation signal is suppressed
    pub escalation_cooldown_minutes: u64,

    /// Days to keep per-step error records
    pub max_retention_days: i64,
}

impl Default for ErrorHandlerConfig {
    fn default() -> Self {
        Self {
            error_threshold_per_step: 3,
            send_to_planner_after_threshold: true,
            human_escalation_threshold: 5,
            emergency_stop_threshold: 8,
            escalation_cooldown_minutes: 5,
            max_retention_days: 7,
        }
    }
}

impl ErrorHandlerConfig {
    pub fn validate(&self) -> Result<()> {
        if !(1..=20).contains(&self.error_threshold_per_step) {
            bail!(
                "error_handler.error_threshold_per_step must be in [1, 20], got {}",
                self.error_threshold_per_step
            );
        }
        if self.human_escalation_threshold < self.error_threshold_per_step {
            bail!("error_handler.human_escalation_threshold must be >= error_threshold_per_step");
        }
        if self.emergency_stop_threshold < self.human_escalation_threshold {
            bail!("error_handler.emergency_stop_threshold must be >= human_escalation_threshold");
        }
        if !(1..=60).contains(&self.escalation_cooldown_minutes) {
            bail!(
                "error_handler.escalation_cooldown_minutes must be in [1, 60], got {}",
                self.escalation_cooldown_minutes
            );
        }
        if !(1..=30).contains(&self.max_retention_days) {
            bail!(
                "error_handler.max_retention_days must be in [1, 30], got {}",
                self.max_retention_days
            );
        }
        Ok(())
    }
}

/// Idempotency system configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdempotencyConfig {
    pub enabled: bool,

    /// Probe-cache TTL in seconds
    pub cache_ttl: u64,

    pub max_snapshots: usize,

    /// Run rollback automatically when a task fails or is cancelled
    pub auto_rollback: bool,

    /// Probe timeout in seconds
    pub check_timeout: u64,

    pub check_packages: bool,
    pub check_files: bool,
    pub check_directories: bool,
    pub check_services: bool,
    pub check_users: bool,
    pub check_groups: bool,
    pub check_ports: bool,

    pub rollback_on_failure: bool,

    /// Per-rollback-command timeout in seconds
    pub rollback_timeout: u64,

    /// Keep snapshots after the task completes
    pub preserve_snapshots: bool,

    pub log_checks: bool,
    pub log_rollbacks: bool,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cache_ttl: 300,
            max_snapshots: 10,
            auto_rollback: false,
            check_timeout: 30,
            check_packages: true,
            check_files: true,
            check_directories: true,
            check_services: true,
            check_users: true,
            check_groups: true,
            check_ports: true,
            rollback_on_failure: true,
            rollback_timeout: 60,
            preserve_snapshots: false,
            log_checks: true,
            log_rollbacks: true,
        }
    }
}

/// Security configuration for the command validator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub validate_commands: bool,
    pub log_forbidden_attempts: bool,
    pub require_confirmation_for_dangerous: bool,
    pub allowed_commands_only: bool,
    pub allowed_commands: Vec<String>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            validate_commands: true,
            log_forbidden_attempts: true,
            require_confirmation_for_dangerous: true,
            allowed_commands_only: false,
            allowed_commands: Vec::new(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub log_file: String,
    pub error_file: String,
    pub max_file_size_mb: u64,
    pub retention_days: u32,
    pub compression: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_file: "logs/opsagent.log".to_string(),
            error_file: "logs/errors.log".to_string(),
            max_file_size_mb: 10,
            retention_days: 7,
            compression: true,
        }
    }
}

impl LoggingConfig {
    pub fn validate(&self) -> Result<()> {
        if !matches!(
            self.level.to_lowercase().as_str(),
            "debug" | "info" | "warning" | "error" | "critical"
        ) {
            bail!("logging.level must be one of debug/info/warning/error/critical");
        }
        Ok(())
    }
}

/// SSH authentication method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AuthMethod {
    #[default]
    Key,
    Password,
}

/// Target operating system family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OsType {
    #[default]
    Ubuntu,
    Centos,
    Debian,
    Rhel,
    Fedora,
}

impl std::fmt::Display for OsType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ubuntu => write!(f, "ubuntu"),
            Self::Centos => write!(f, "centos"),
            Self::Debian => write!(f, "debian"),
            Self::Rhel => write!(f, "rhel"),
            Self::Fedora => write!(f, "fedora"),
        }
    }
}

/// One target host profile
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,

    pub port: u16,

    pub username: String,

    pub auth_method: AuthMethod,

    pub key_path: Option<String>,

    pub password: Option<String>,

    /// Connect timeout in seconds
    pub timeout: u64,

    pub os_type: OsType,

    /// Merged into the validator's forbidden set
    pub forbidden_commands: Vec<String>,

    pub installed_services: Vec<String>,

    pub installed_packages: Vec<String>,

    /// Minimum free disk space in MB
    pub disk_space_threshold_mb: u64,

    /// Minimum free memory in MB
    pub memory_threshold_mb: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 22,
            username: "root".to_string(),
            auth_method: AuthMethod::Key,
            key_path: None,
            password: None,
            timeout: 30,
            os_type: OsType::Ubuntu,
            forbidden_commands: Vec::new(),
            installed_services: Vec::new(),
            installed_packages: Vec::new(),
            disk_space_threshold_mb: 1024,
            memory_threshold_mb: 512,
        }
    }
}

impl ServerConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .context(format!("Failed to read server profile {}", path.as_ref().display()))?;
        let config: Self = serde_yaml::from_str(&content).context("Failed to parse server profile")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            bail!("server.host must not be empty");
        }
        if self.port == 0 {
            bail!("server.port must be in [1, 65535]");
        }
        if self.username.trim().is_empty() {
            bail!("server.username must not be empty");
        }
        if self.username.len() > 32 || !self.username.chars().all(|c| c.is_ascii_alphanumeric() || "._-".contains(c)) {
            bail!("server.username contains invalid characters or is too long");
        }
        match self.auth_method {
            AuthMethod::Key if self.key_path.is_none() => {
                bail!("server.key_path is required when auth_method is 'key'")
            }
            AuthMethod::Password if self.password.is_none() => {
                bail!("server.password is required when auth_method is 'password'")
            }
            _ => Ok(()),
        }
    }

    /// Baseline facts known before the first command runs
    pub fn server_facts(&self) -> ServerFacts {
        ServerFacts {
            os_type: self.os_type.to_string(),
            installed_packages: self.installed_packages.clone(),
            installed_services: self.installed_services.clone(),
            ..ServerFacts::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = AgentConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.llm.provider, "openai");
        assert_eq!(config.executor.command_timeout, 30);
        assert_eq!(config.subtask_agent.max_subtasks, 20);
    }

    #[test]
    fn test_placeholder_api_key_rejected() {
        let config = AgentConfig {
            llm: LlmConfig {
                api_key: "your-api-key".to_string(),
                ..LlmConfig::default()
            },
            ..AgentConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_temperature_range() {
        let mut llm = LlmConfig::default();
        llm.temperature = 2.5;
        assert!(llm.validate().is_err());
        llm.temperature = 2.0;
        assert!(llm.validate().is_ok());
    }

    #[test]
    fn test_unknown_provider_rejected() {
        let llm = LlmConfig {
            provider: "anthropic".to_string(),
            ..LlmConfig::default()
        };
        assert!(llm.validate().is_err());
    }

    #[test]
    fn test_executor_ranges() {
        let mut exec = ExecutorConfig::default();
        exec.command_timeout = 0;
        assert!(exec.validate().is_err());
        exec.command_timeout = 301;
        assert!(exec.validate().is_err());
        exec.command_timeout = 300;
        assert!(exec.validate().is_ok());
    }

    #[test]
    fn test_zero_timeout_uses_default() {
        let exec = ExecutorConfig::default();
        assert_eq!(exec.command_timeout_for(0), Duration::from_secs(30));
        assert_eq!(exec.command_timeout_for(90), Duration::from_secs(90));
    }

    #[test]
    fn test_error_handler_threshold_ordering() {
        let config = ErrorHandlerConfig {
            error_threshold_per_step: 5,
            human_escalation_threshold: 3,
            ..ErrorHandlerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_deserialize_partial_yaml() {
        let yaml = r#"
llm:
  api_key: sk-test
  model: gpt-4o
executor:
  dry_run_mode: true
  command_timeout: 60
"#;
        let config: AgentConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.llm.model, "gpt-4o");
        assert!(config.executor.dry_run_mode);
        assert_eq!(config.executor.command_timeout, 60);
        // Defaults for unspecified sections
        assert_eq!(config.subtask_agent.max_subtasks, 20);
        assert!(config.security.validate_commands);
    }

    #[test]
    fn test_server_config_auth_validation() {
        let config = ServerConfig {
            host: "10.0.0.5".to_string(),
            username: "deploy".to_string(),
            auth_method: AuthMethod::Key,
            key_path: None,
            ..ServerConfig::default()
        };
        assert!(config.validate().is_err());

        let config = ServerConfig {
            key_path: Some("/home/deploy/.ssh/id_ed25519".to_string()),
            ..config
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_server_config_username_charset() {
        let config = ServerConfig {
            username: "bad user!".to_string(),
            key_path: Some("/k".to_string()),
            ..ServerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_server_facts() {
        let config = ServerConfig {
            os_type: OsType::Debian,
            installed_services: vec!["docker".to_string()],
            ..ServerConfig::default()
        };
        let facts = config.server_facts();
        assert_eq!(facts.os_type, "debian");
        assert_eq!(facts.installed_services, vec!["docker"]);
    }

    #[test]
    fn test_server_config_yaml() {
        let yaml = r#"
host: web-1.example.com
port: 2222
username: deploy
auth_method: key
key_path: /home/deploy/.ssh/id_ed25519
os_type: debian
forbidden_commands:
  - docker system prune
"#;
        let config: ServerConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.port, 2222);
        assert_eq!(config.os_type, OsType::Debian);
        assert_eq!(config.forbidden_commands.len(), 1);
        assert!(config.validate().is_ok());
    }
}
