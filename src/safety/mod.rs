//! Safety validator
//!
//! Classifies commands as safe, dangerous, or forbidden before they reach
//! the wire. The transport consults this validator and refuses forbidden
//! commands; the dry-run simulator consults it for plan validation.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tracing::{debug, warn};

use crate::config::SecurityConfig;

/// Security classification of one command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SecurityLevel {
    #[default]
    Safe,
    Dangerous,
    Forbidden,
}

impl std::fmt::Display for SecurityLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Safe => write!(f, "safe"),
            Self::Dangerous => write!(f, "dangerous"),
            Self::Forbidden => write!(f, "forbidden"),
        }
    }
}

/// Output of validating one command
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub command: String,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub security_level: SecurityLevel,
    pub requires_confirmation: bool,
}

impl ValidationResult {
    fn ok(command: &str) -> Self {
        Self {
            valid: true,
            command: command.to_string(),
            errors: Vec::new(),
            warnings: Vec::new(),
            security_level: SecurityLevel::Safe,
            requires_confirmation: false,
        }
    }
}

/// Context attached to a validation, for the forbidden-attempt audit log
#[derive(Debug, Clone, Default)]
pub struct ValidationContext {
    pub task_id: Option<String>,
    pub step_id: Option<String>,
    pub subtask_id: Option<String>,
    pub command_index: Option<usize>,
    pub user: Option<String>,
}

/// Per-instance validation counters
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ValidationStats {
    pub total_validations: u64,
    pub forbidden_attempts: u64,
    pub dangerous_detected: u64,
    pub allowed_commands: u64,
    pub rejected_commands: u64,
}

impl ValidationStats {
    pub fn success_rate(&self) -> f64 {
        if self.total_validations == 0 {
            0.0
        } else {
            self.allowed_commands as f64 / self.total_validations as f64 * 100.0
        }
    }
}

/// Patterns that make a command forbidden outright. Matched
/// case-insensitively against the trimmed, lowercased command.
const DEFAULT_FORBIDDEN_PATTERNS: &[&str] = &[
    r"rm\s+-[rf]{2}\s+/\s*$",
    r"rm\s+-[rf]{2}\s+/\s+--no-preserve-root",
    r"dd\s+if=/dev/(zero|random|urandom)",
    r"mkfs(\.\w+)?\s",
    r"fdisk\s+/dev/",
    r"parted\s+/dev/",
    r"wipefs",
    r"\bshutdown\b",
    r"\breboot\b",
    r"\bhalt\b",
    r"\bpoweroff\b",
    r"\binit\s+[06]\b",
    r"\btelinit\s+[06]\b",
    r":\(\)\s*\{\s*:\|:\s*&\s*\}\s*;\s*:",
    r">\s*/dev/sd[a-z]",
    r"cat\s+/dev/(zero|random|urandom)\s*>",
    r"chmod\s+(-R\s+)?(777|666)\s+/\s*$",
    r"chown\s+(-R\s+)?root(:root)?\s+/\s*$",
    r"crontab\s+-r",
    r"umount\s+/\s*$",
];

/// Patterns that mark a command as dangerous but not forbidden. Each hit
/// adds a warning; any hit drops the level to dangerous.
const DEFAULT_DANGEROUS_PATTERNS: &[&str] = &[
    r"rm\s+-[rf]{2}\s+",
    r"\bdd\s+if=",
    r"chmod\s+(777|666)\b",
    r"chown\s+-R\b",
    r"systemctl\s+stop\b",
    r"service\s+\w+\s+stop\b",
    r"\bkillall\b",
    r"pkill\s+-9\b",
    r"\biptables\b",
    r"\bufw\b",
    r">\s*/dev/",
    r"nohup\s+.*&",
    r"\buserdel\b",
    r"\bgroupdel\b",
    r"passwd\s+root\b",
];

struct PatternSet {
    /// (source, compiled) pairs; source kept for dynamic removal
    forbidden: Vec<(String, Regex)>,
    dangerous: Vec<(String, Regex)>,
}

/// Validates commands against forbidden and dangerous pattern tables.
///
/// Patterns can be added or removed at runtime; counters are per-instance.
pub struct SafetyValidator {
    patterns: Mutex<PatternSet>,
    allowed_commands: Vec<String>,
    validate_commands: bool,
    log_forbidden_attempts: bool,
    require_confirmation_for_dangerous: bool,
    allowed_commands_only: bool,
    stats: Mutex<ValidationStats>,
}

impl SafetyValidator {
    /// Build a validator from the security config, merging any extra
    /// forbidden entries (e.g. from a server profile) into the defaults.
    pub fn new(config: &SecurityConfig, extra_forbidden: &[String]) -> Self {
        let mut forbidden: Vec<(String, Regex)> = DEFAULT_FORBIDDEN_PATTERNS
            .iter()
            .filter_map(|p| compile(p).map(|re| (p.to_string(), re)))
            .collect();

        // Server-profile entries are literals, not regexes
        for entry in extra_forbidden {
            let source = regex::escape(&entry.to_lowercase());
            if let Some(re) = compile(&source) {
                forbidden.push((source, re));
            }
        }

        let dangerous = DEFAULT_DANGEROUS_PATTERNS
            .iter()
            .filter_map(|p| compile(p).map(|re| (p.to_string(), re)))
            .collect();

        Self {
            patterns: Mutex::new(PatternSet { forbidden, dangerous }),
            allowed_commands: config.allowed_commands.iter().map(|c| c.to_lowercase()).collect(),
            validate_commands: config.validate_commands,
            log_forbidden_attempts: config.log_forbidden_attempts,
            require_confirmation_for_dangerous: config.require_confirmation_for_dangerous,
            allowed_commands_only: config.allowed_commands_only,
            stats: Mutex::new(ValidationStats::default()),
        }
    }

    /// Validate one command.
    ///
    /// Order: empty check, allow-list check, forbidden scan, dangerous scan.
    pub fn validate(&self, command: &str, context: Option<&ValidationContext>) -> ValidationResult {
        {
            let mut stats = self.stats.lock().unwrap();
            stats.total_validations += 1;
        }

        let mut result = ValidationResult::ok(command);

        if command.trim().is_empty() {
            result.valid = false;
            result.errors.push("Command must not be empty".to_string());
            self.stats.lock().unwrap().rejected_commands += 1;
            return result;
        }

        if !self.validate_commands {
            self.stats.lock().unwrap().allowed_commands += 1;
            return result;
        }

        let lowered = command.trim().to_lowercase();

        if self.allowed_commands_only && !self.is_allowed(&lowered) {
            result.valid = false;
            result
                .errors
                .push(format!("Command is not in the allow-list: {}", command));
            self.log_forbidden(command, "not_in_allow_list", context);
            self.stats.lock().unwrap().rejected_commands += 1;
            return result;
        }

        let patterns = self.patterns.lock().unwrap();

        if patterns.forbidden.iter().any(|(_, re)| re.is_match(&lowered)) {
            result.valid = false;
            result.security_level = SecurityLevel::Forbidden;
            result.errors.push(format!("Command is forbidden: {}", command));
            drop(patterns);
            self.log_forbidden(command, "forbidden_command", context);
            let mut stats = self.stats.lock().unwrap();
            stats.forbidden_attempts += 1;
            stats.rejected_commands += 1;
            return result;
        }

        for (source, re) in &patterns.dangerous {
            if re.is_match(&lowered) {
                result.warnings.push(format!("Dangerous pattern matched: {}", source));
            }
        }
        drop(patterns);

        if !result.warnings.is_empty() {
            result.security_level = SecurityLevel::Dangerous;
            result.requires_confirmation = self.require_confirmation_for_dangerous;
            self.stats.lock().unwrap().dangerous_detected += 1;
        }

        self.stats.lock().unwrap().allowed_commands += 1;
        debug!(command = %command, level = %result.security_level, "command validated");
        result
    }

    /// A command is safe iff it is valid and classified safe
    pub fn is_safe(&self, command: &str) -> bool {
        let result = self.validate(command, None);
        result.valid && result.security_level == SecurityLevel::Safe
    }

    /// Add a forbidden command (treated as a literal)
    pub fn add_forbidden_command(&self, command: &str) {
        let source = regex::escape(&command.to_lowercase());
        let mut patterns = self.patterns.lock().unwrap();
        if patterns.forbidden.iter().any(|(s, _)| *s == source) {
            return;
        }
        if let Some(re) = compile(&source) {
            patterns.forbidden.push((source, re));
        }
    }

    /// Remove a previously-added forbidden command
    pub fn remove_forbidden_command(&self, command: &str) {
        let source = regex::escape(&command.to_lowercase());
        self.patterns.lock().unwrap().forbidden.retain(|(s, _)| *s != source);
    }

    /// Add a dangerous pattern (a regex over the lowercased command)
    pub fn add_dangerous_pattern(&self, pattern: &str) {
        let mut patterns = self.patterns.lock().unwrap();
        if patterns.dangerous.iter().any(|(s, _)| s == pattern) {
            return;
        }
        if let Some(re) = compile(pattern) {
            patterns.dangerous.push((pattern.to_string(), re));
        }
    }

    /// Remove a dangerous pattern by its source text
    pub fn remove_dangerous_pattern(&self, pattern: &str) {
        self.patterns.lock().unwrap().dangerous.retain(|(s, _)| s != pattern);
    }

    pub fn stats(&self) -> ValidationStats {
        *self.stats.lock().unwrap()
    }

    pub fn reset_stats(&self) {
        *self.stats.lock().unwrap() = ValidationStats::default();
    }

    fn is_allowed(&self, lowered: &str) -> bool {
        self.allowed_commands.iter().any(|a| lowered.starts_with(a.as_str()))
    }

    fn log_forbidden(&self, command: &str, reason: &str, context: Option<&ValidationContext>) {
        if !self.log_forbidden_attempts {
            return;
        }
        let ctx = context.cloned().unwrap_or_default();
        warn!(
            command = %command,
            reason = %reason,
            task_id = ctx.task_id.as_deref().unwrap_or("-"),
            step_id = ctx.step_id.as_deref().unwrap_or("-"),
            user = ctx.user.as_deref().unwrap_or("unknown"),
            "forbidden command attempt"
        );
    }
}

fn compile(pattern: &str) -> Option<Regex> {
    match Regex::new(pattern) {
        Ok(re) => Some(re),
        Err(e) => {
            warn!(pattern = %pattern, error = %e, "skipping invalid safety pattern");
            None
        }
    }
}
