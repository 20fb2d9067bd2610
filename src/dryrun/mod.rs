//! Dry-run simulator
//!
//! Analyzes a command list, scores risk, and emits a validation report
//! without side effects. Performs no transport calls: every result is
//! synthesized from the command's classified type and risk.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::domain::{CommandResult, ExecutionStatus};
use crate::safety::{SafetyValidator, SecurityLevel};

/// What a command does, as classified by the pattern tables
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandType {
    Install,
    Configure,
    StartService,
    StopService,
    CreateFile,
    DeleteFile,
    CreateUser,
    DeleteUser,
    Network,
    System,
    Unknown,
}

impl std::fmt::Display for CommandType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Install => "install",
            Self::Configure => "configure",
            Self::StartService => "start_service",
            Self::StopService => "stop_service",
            Self::CreateFile => "create_file",
            Self::DeleteFile => "delete_file",
            Self::CreateUser => "create_user",
            Self::DeleteUser => "delete_user",
            Self::Network => "network",
            Self::System => "system",
            Self::Unknown => "unknown",
        };
        write!(f, "{}", name)
    }
}

/// Risk scale with weights 1 through 4
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn weight(self) -> u32 {
        match self {
            Self::Low => 1,
            Self::Medium => 2,
            Self::High => 3,
            Self::Critical => 4,
        }
    }
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// Analysis of one command
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandAnalysis {
    pub command: String,
    pub command_type: CommandType,
    pub risk_level: RiskLevel,
    pub potential_issues: Vec<String>,
    pub dependencies: Vec<String>,
    pub side_effects: Vec<String>,
    pub estimated_duration_secs: f64,
    pub requires_confirmation: bool,
}

/// Risk counts by level
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct RiskBreakdown {
    pub critical: usize,
    pub high: usize,
    pub medium: usize,
    pub low: usize,
}

/// Plan-level risk summary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskSummary {
    pub overall_risk: RiskLevel,
    pub risk_percentage: f64,
    pub total_risk_score: u32,
    pub risk_breakdown: RiskBreakdown,
    pub requires_confirmation: bool,
}

/// Plan-level execution summary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub total_commands: usize,
    pub successful_commands: usize,
    pub failed_commands: usize,
    pub success_rate: f64,
    pub command_types: HashMap<String, usize>,
    pub estimated_total_duration_secs: f64,
    pub requires_confirmation: bool,
}

/// Validation verdict over the whole plan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanValidationResult {
    /// False iff any command is forbidden by the safety validator
    pub valid: bool,
    pub issues: Vec<String>,
    pub warnings: Vec<String>,
    pub estimated_duration_secs: f64,
    pub recommendations: Vec<String>,
}

/// Full output of one simulation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DryRunResult {
    pub success: bool,
    pub simulated_commands: Vec<CommandResult>,
    pub commands_analysis: Vec<CommandAnalysis>,
    pub validation_result: PlanValidationResult,
    pub execution_summary: ExecutionSummary,
    pub risk_summary: RiskSummary,
    pub recommendations: Vec<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Report output formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportFormat {
    Text,
    Json,
    Markdown,
}

struct TypeTable {
    entries: Vec<(CommandType, Vec<Regex>)>,
}

struct RiskTable {
    entries: Vec<(RiskLevel, Vec<Regex>)>,
}

fn compile_all(patterns: &[&str]) -> Vec<Regex> {
    patterns.iter().filter_map(|p| Regex::new(p).ok()).collect()
}

impl TypeTable {
    fn new() -> Self {
        let entries = vec![
            (
                CommandType::Install,
                compile_all(&[
                    r"apt-get install",
                    r"apt install",
                    r"yum install",
                    r"dnf install",
                    r"pip install",
                    r"npm install",
                    r"gem install",
                ]),
            ),
            (
                CommandType::StartService,
                compile_all(&[r"systemctl start", r"service \S+ start", r"systemctl enable"]),
            ),
            (
                CommandType::StopService,
                compile_all(&[r"systemctl stop", r"service \S+ stop", r"systemctl disable"]),
            ),
            (CommandType::DeleteFile, compile_all(&[r"\brm\s", r"\bunlink\b", r"\brmdir\b"])),
            (
                CommandType::CreateFile,
                compile_all(&[r"\btouch\b", r"echo\s.*>", r"cat\s.*>", r"\btee\b"]),
            ),
            (
                CommandType::CreateUser,
                compile_all(&[r"\buseradd\b", r"\badduser\b", r"\bgroupadd\b", r"\baddgroup\b"]),
            ),
            (
                CommandType::DeleteUser,
                compile_all(&[r"\buserdel\b", r"\bdeluser\b", r"\bgroupdel\b", r"\bdelgroup\b"]),
            ),
            (
                CommandType::Network,
                compile_all(&[r"\biptables\b", r"\bufw\b", r"\bfirewall", r"\bnetstat\b", r"\bss\b"]),
            ),
            (
                CommandType::System,
                compile_all(&[r"\breboot\b", r"\bshutdown\b", r"\bhalt\b", r"\bpoweroff\b", r"\binit\b"]),
            ),
            (
                CommandType::Configure,
                compile_all(&[r"\bconfigure\b", r"\bconfig\b", r"\bsetup\b", r"\bupdate\b", r"\bmodify\b"]),
            ),
        ];
        Self { entries }
    }

    fn classify(&self, command: &str) -> CommandType {
        for (command_type, patterns) in &self.entries {
            if patterns.iter().any(|re| re.is_match(command)) {
                return *command_type;
            }
        }
        CommandType::Unknown
    }
}

impl RiskTable {
    fn new() -> Self {
        let entries = vec![
            (
                RiskLevel::Critical,
                compile_all(&[
                    r"rm\s+-[rf]{2}\s+/\s*$",
                    r"dd\s+if=/dev/zero",
                    r"\bmkfs\b",
                    r"\bfdisk\b",
                    r"\bparted\b",
                    r">\s*/dev/sd[a-z]",
                    r"chmod\s+777\s+/\s*$",
                    r"chown\s+-R\s+root:root\s+/\s*$",
                    r"passwd\s+root",
                    r"\bhalt\b",
                    r"\bpoweroff\b",
                    r"\breboot\b",
                    r"\bshutdown\b",
                ]),
            ),
            (
                RiskLevel::High,
                compile_all(&[
                    r"rm\s+-[rf]{2}\s",
                    r"\bdd\s",
                    r"chmod\s+777",
                    r"chown\s+-R",
                    r"\buserdel\b",
                    r"\bgroupdel\b",
                    r"\bkillall\b",
                    r"pkill\s+-9",
                    r"systemctl\s+stop",
                    r"service\s+\S+\s+stop",
                ]),
            ),
            (
                RiskLevel::Medium,
                compile_all(&[
                    r"\brm\s",
                    r"\bmv\s",
                    r"\bcp\s",
                    r"\bchmod\b",
                    r"\bchown\b",
                    r"\bsystemctl\b",
                    r"\bservice\b",
                    r"\biptables\b",
                    r"\bufw\b",
                ]),
            ),
        ];
        Self { entries }
    }

    fn classify(&self, command: &str) -> RiskLevel {
        for (risk, patterns) in &self.entries {
            if patterns.iter().any(|re| re.is_match(command)) {
                return *risk;
            }
        }
        RiskLevel::Low
    }
}

/// Simulates execution of a plan without touching the transport
pub struct DryRunSimulator {
    validator: Arc<SafetyValidator>,
    types: TypeTable,
    risks: RiskTable,
}

impl DryRunSimulator {
    pub fn new(validator: Arc<SafetyValidator>) -> Self {
        Self {
            validator,
            types: TypeTable::new(),
            risks: RiskTable::new(),
        }
    }

    /// Simulate a command list and produce the full report payload
    pub fn simulate(&self, commands: &[String]) -> DryRunResult {
        info!(commands = commands.len(), "starting dry-run simulation");

        let commands_analysis: Vec<CommandAnalysis> =
            commands.iter().map(|c| self.analyze_command(c)).collect();
        let simulated: Vec<CommandResult> = commands_analysis.iter().map(|a| self.simulate_result(a)).collect();

        let validation_result = self.validate_plan(commands, &commands_analysis);
        let risk_summary = self.risk_summary(&commands_analysis);
        let execution_summary = self.execution_summary(&simulated, &commands_analysis);
        let recommendations = self.recommendations(&commands_analysis, &validation_result);

        DryRunResult {
            success: true,
            simulated_commands: simulated,
            commands_analysis,
            validation_result,
            execution_summary,
            risk_summary,
            recommendations,
            metadata: HashMap::new(),
        }
    }

    /// Classify and assess one command
    pub fn analyze_command(&self, command: &str) -> CommandAnalysis {
        let lowered = command.trim().to_lowercase();
        let command_type = self.types.classify(&lowered);

        // A forbidden command is critical regardless of the risk table
        let verdict = self.validator.validate(command, None);
        let risk_level = if verdict.security_level == SecurityLevel::Forbidden {
            RiskLevel::Critical
        } else {
            self.risks.classify(&lowered)
        };

        let requires_confirmation = matches!(risk_level, RiskLevel::High | RiskLevel::Critical);

        debug!(command = %command, command_type = %command_type, risk = %risk_level, "analyzed");

        CommandAnalysis {
            command: command.to_string(),
            potential_issues: potential_issues(&lowered, command_type, risk_level),
            dependencies: dependencies(command_type),
            side_effects: side_effects(command_type),
            estimated_duration_secs: estimated_duration(command_type),
            command_type,
            risk_level,
            requires_confirmation,
        }
    }

    /// Simulate one command, for the executor's dry-run path
    pub fn simulate_command(&self, command: &str) -> CommandResult {
        let analysis = self.analyze_command(command);
        self.simulate_result(&analysis)
    }

    /// Synthesize the result one command would produce
    fn simulate_result(&self, analysis: &CommandAnalysis) -> CommandResult {
        let success = analysis.risk_level != RiskLevel::Critical;

        let (stdout, stderr) = if success {
            let message = match analysis.command_type {
                CommandType::Install => "[DRY-RUN] package would be installed".to_string(),
                CommandType::StartService => "[DRY-RUN] service would be started".to_string(),
                CommandType::CreateFile => "[DRY-RUN] file would be created".to_string(),
                CommandType::CreateUser => "[DRY-RUN] user would be created".to_string(),
                _ => format!("[DRY-RUN] '{}' would execute successfully", analysis.command),
            };
            (message, String::new())
        } else {
            (
                String::new(),
                format!("[DRY-RUN] critical command blocked: {}", analysis.command),
            )
        };

        let mut result = CommandResult::completed(
            analysis.command.clone(),
            if success { 0 } else { 1 },
            stdout,
            stderr,
            (analysis.estimated_duration_secs * 1000.0) as u64,
        );
        result.status = if success {
            ExecutionStatus::Completed
        } else {
            ExecutionStatus::Failed
        };
        result.set_flag("dry_run", true);
        result.metadata.insert(
            "command_type".to_string(),
            serde_json::json!(analysis.command_type.to_string()),
        );
        result.metadata.insert(
            "risk_level".to_string(),
            serde_json::json!(analysis.risk_level.to_string()),
        );
        result
    }

    fn validate_plan(&self, commands: &[String], analysis: &[CommandAnalysis]) -> PlanValidationResult {
        let mut issues = Vec::new();
        let mut warnings = Vec::new();
        let mut recommendations = Vec::new();

        // Forbidden commands invalidate the plan
        for command in commands {
            let verdict = self.validator.validate(command, None);
            if !verdict.valid {
                issues.push(format!("Forbidden command in plan: {}", command));
            }
        }

        let critical = analysis.iter().filter(|a| a.risk_level == RiskLevel::Critical).count();
        if critical > 0 {
            warnings.push(format!("{} critical-risk command(s) detected", critical));
            recommendations.push("Critical commands require manual confirmation".to_string());
        }

        let high = analysis.iter().filter(|a| a.risk_level == RiskLevel::High).count();
        if high > 0 {
            warnings.push(format!("{} high-risk command(s) detected", high));
            recommendations.push("Review high-risk commands before execution".to_string());
        }

        // Ordering: a service start before the last install is suspicious
        let install_indices: Vec<usize> = analysis
            .iter()
            .enumerate()
            .filter(|(_, a)| a.command_type == CommandType::Install)
            .map(|(i, _)| i)
            .collect();
        let start_indices: Vec<usize> = analysis
            .iter()
            .enumerate()
            .filter(|(_, a)| a.command_type == CommandType::StartService)
            .map(|(i, _)| i)
            .collect();

        if let Some(last_install) = install_indices.last()
            && start_indices.iter().any(|s| s < last_install)
        {
            warnings.push("some services may start before their packages are installed".to_string());
            recommendations.push("Install packages before starting their services".to_string());
        }

        PlanValidationResult {
            valid: issues.is_empty(),
            issues,
            warnings,
            estimated_duration_secs: analysis.iter().map(|a| a.estimated_duration_secs).sum(),
            recommendations,
        }
    }

    fn risk_summary(&self, analysis: &[CommandAnalysis]) -> RiskSummary {
        let breakdown = RiskBreakdown {
            critical: analysis.iter().filter(|a| a.risk_level == RiskLevel::Critical).count(),
            high: analysis.iter().filter(|a| a.risk_level == RiskLevel::High).count(),
            medium: analysis.iter().filter(|a| a.risk_level == RiskLevel::Medium).count(),
            low: analysis.iter().filter(|a| a.risk_level == RiskLevel::Low).count(),
        };

        let total_risk_score: u32 = analysis.iter().map(|a| a.risk_level.weight()).sum();
        let max_possible = (analysis.len() as u32) * RiskLevel::Critical.weight();
        let risk_percentage = if max_possible > 0 {
            total_risk_score as f64 / max_possible as f64 * 100.0
        } else {
            0.0
        };

        let overall_risk = if breakdown.critical > 0 {
            RiskLevel::Critical
        } else if breakdown.high > 0 {
            RiskLevel::High
        } else if breakdown.medium > 0 {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        };

        RiskSummary {
            overall_risk,
            risk_percentage,
            total_risk_score,
            risk_breakdown: breakdown,
            requires_confirmation: breakdown.critical > 0 || breakdown.high > 0,
        }
    }

    fn execution_summary(&self, simulated: &[CommandResult], analysis: &[CommandAnalysis]) -> ExecutionSummary {
        let total = simulated.len();
        let successful = simulated.iter().filter(|r| r.success).count();

        let mut command_types: HashMap<String, usize> = HashMap::new();
        for a in analysis {
            *command_types.entry(a.command_type.to_string()).or_insert(0) += 1;
        }

        ExecutionSummary {
            total_commands: total,
            successful_commands: successful,
            failed_commands: total - successful,
            success_rate: if total > 0 {
                successful as f64 / total as f64 * 100.0
            } else {
                0.0
            },
            command_types,
            estimated_total_duration_secs: analysis.iter().map(|a| a.estimated_duration_secs).sum(),
            requires_confirmation: analysis.iter().any(|a| a.requires_confirmation),
        }
    }

    fn recommendations(&self, analysis: &[CommandAnalysis], validation: &PlanValidationResult) -> Vec<String> {
        let mut recommendations = validation.recommendations.clone();

        if analysis.len() > 10 {
            recommendations.push("Large command list; consider splitting into stages".to_string());
        }
        if analysis.iter().any(|a| a.command_type == CommandType::Install) {
            recommendations.push("Verify free disk space before installing packages".to_string());
        }
        if analysis
            .iter()
            .any(|a| matches!(a.command_type, CommandType::StartService | CommandType::StopService))
        {
            recommendations.push("Check service dependencies before start/stop".to_string());
        }
        recommendations
    }

    /// Render a simulation report
    pub fn render_report(&self, result: &DryRunResult, format: ReportFormat) -> String {
        match format {
            ReportFormat::Json => serde_json::to_string_pretty(result).unwrap_or_default(),
            ReportFormat::Markdown => self.render_markdown(result),
            ReportFormat::Text => self.render_text(result),
        }
    }

    fn render_text(&self, result: &DryRunResult) -> String {
        let mut lines = vec![
            "=".repeat(60),
            "DRY-RUN REPORT".to_string(),
            "=".repeat(60),
            format!("Commands: {}", result.execution_summary.total_commands),
            format!(
                "Success rate: {:.1}% ({} ok, {} blocked)",
                result.execution_summary.success_rate,
                result.execution_summary.successful_commands,
                result.execution_summary.failed_commands
            ),
            format!(
                "Estimated duration: {:.1}s",
                result.execution_summary.estimated_total_duration_secs
            ),
            String::new(),
            format!(
                "Overall risk: {} ({:.1}%)",
                result.risk_summary.overall_risk, result.risk_summary.risk_percentage
            ),
            format!(
                "Risk breakdown: critical={} high={} medium={} low={}",
                result.risk_summary.risk_breakdown.critical,
                result.risk_summary.risk_breakdown.high,
                result.risk_summary.risk_breakdown.medium,
                result.risk_summary.risk_breakdown.low
            ),
            format!(
                "Requires confirmation: {}",
                if result.risk_summary.requires_confirmation { "yes" } else { "no" }
            ),
            String::new(),
            format!("Plan valid: {}", if result.validation_result.valid { "yes" } else { "no" }),
        ];

        for issue in &result.validation_result.issues {
            lines.push(format!("  ISSUE: {}", issue));
        }
        for warning in &result.validation_result.warnings {
            lines.push(format!("  WARNING: {}", warning));
        }

        if !result.recommendations.is_empty() {
            lines.push(String::new());
            lines.push("Recommendations:".to_string());
            for rec in &result.recommendations {
                lines.push(format!("  - {}", rec));
            }
        }

        lines.push(String::new());
        lines.push("Commands:".to_string());
        for (i, r) in result.simulated_commands.iter().enumerate() {
            let marker = if r.success { "ok" } else { "BLOCKED" };
            lines.push(format!("  {}. [{}] {}", i + 1, marker, r.command));
        }

        lines.push("=".repeat(60));
        lines.join("\n")
    }

    fn render_markdown(&self, result: &DryRunResult) -> String {
        let mut md = String::from("# Dry-run report\n\n");
        md.push_str(&format!(
            "- Commands: {}\n- Overall risk: **{}**\n- Plan valid: {}\n- Requires confirmation: {}\n\n",
            result.execution_summary.total_commands,
            result.risk_summary.overall_risk,
            result.validation_result.valid,
            result.risk_summary.requires_confirmation
        ));

        if !result.validation_result.issues.is_empty() {
            md.push_str("## Issues\n\n");
            for issue in &result.validation_result.issues {
                md.push_str(&format!("- {}\n", issue));
            }
            md.push('\n');
        }
        if !result.validation_result.warnings.is_empty() {
            md.push_str("## Warnings\n\n");
            for warning in &result.validation_result.warnings {
                md.push_str(&format!("- {}\n", warning));
            }
            md.push('\n');
        }

        md.push_str("## Commands\n\n| # | Command | Type | Risk |\n|---|---------|------|------|\n");
        for (i, a) in result.commands_analysis.iter().enumerate() {
            md.push_str(&format!(
                "| {} | `{}` | {} | {} |\n",
                i + 1,
                a.command,
                a.command_type,
                a.risk_level
            ));
        }
        md
    }
}

fn potential_issues(lowered: &str, command_type: CommandType, risk_level: RiskLevel) -> Vec<String> {
    let mut issues = Vec::new();
    if risk_level == RiskLevel::Critical {
        issues.push("Command can cause critical damage to the system".to_string());
    }
    if command_type == CommandType::DeleteFile {
        issues.push("Possible data loss".to_string());
    }
    if command_type == CommandType::StopService {
        issues.push("May interrupt dependent services".to_string());
    }
    if command_type == CommandType::System {
        issues.push("May reboot or power off the host".to_string());
    }
    if lowered.contains("rm -rf") {
        issues.push("Recursive delete carries a high data-loss risk".to_string());
    }
    if lowered.contains("chmod 777") {
        issues.push("World-writable permissions are a security hazard".to_string());
    }
    issues
}

fn dependencies(command_type: CommandType) -> Vec<String> {
    match command_type {
        CommandType::Install => vec![
            "Package repository reachable".to_string(),
            "Free disk space".to_string(),
        ],
        CommandType::StartService => vec![
            "Service package installed".to_string(),
            "Valid service configuration".to_string(),
        ],
        CommandType::CreateUser => vec![
            "Administrative privileges".to_string(),
            "Unique user name".to_string(),
        ],
        _ => Vec::new(),
    }
}

fn side_effects(command_type: CommandType) -> Vec<String> {
    match command_type {
        CommandType::Install => vec![
            "Disk usage increases".to_string(),
            "Possible package conflicts".to_string(),
        ],
        CommandType::StartService => vec![
            "System resources consumed".to_string(),
            "Network ports opened".to_string(),
        ],
        CommandType::CreateUser => vec![
            "Home directory created".to_string(),
            "System account files modified".to_string(),
        ],
        _ => Vec::new(),
    }
}

fn estimated_duration(command_type: CommandType) -> f64 {
    match command_type {
        CommandType::Install => 5.0,
        CommandType::StartService => 2.0,
        CommandType::System => 10.0,
        _ => 1.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SecurityConfig;

    fn simulator() -> DryRunSimulator {
        DryRunSimulator::new(Arc::new(SafetyValidator::new(&SecurityConfig::default(), &[])))
    }

    #[test]
    fn test_type_classification() {
        let sim = simulator();
        assert_eq!(sim.analyze_command("apt-get install nginx").command_type, CommandType::Install);
        assert_eq!(
            sim.analyze_command("systemctl start nginx").command_type,
            CommandType::StartService
        );
        assert_eq!(
            sim.analyze_command("systemctl stop nginx").command_type,
            CommandType::StopService
        );
        assert_eq!(sim.analyze_command("touch /tmp/x").command_type, CommandType::CreateFile);
        assert_eq!(sim.analyze_command("rm /tmp/x").command_type, CommandType::DeleteFile);
        assert_eq!(sim.analyze_command("useradd deploy").command_type, CommandType::CreateUser);
        assert_eq!(sim.analyze_command("uptime").command_type, CommandType::Unknown);
    }

    #[test]
    fn test_risk_classification() {
        let sim = simulator();
        assert_eq!(sim.analyze_command("apt update").risk_level, RiskLevel::Low);
        assert_eq!(sim.analyze_command("chmod 644 /etc/app.conf").risk_level, RiskLevel::Medium);
        assert_eq!(sim.analyze_command("rm -rf /tmp/test").risk_level, RiskLevel::High);
        assert_eq!(sim.analyze_command("rm -rf /").risk_level, RiskLevel::Critical);
        assert_eq!(sim.analyze_command("shutdown -h now").risk_level, RiskLevel::Critical);
    }

    #[test]
    fn test_risk_summary_scenario() {
        // The five-command scenario: mixed risk with one forbidden entry
        let sim = simulator();
        let commands: Vec<String> = [
            "apt update",
            "rm -rf /tmp/test",
            "chmod 777 /var/www",
            "rm -rf /",
            "systemctl stop nginx",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        let result = sim.simulate(&commands);

        assert_eq!(result.risk_summary.overall_risk, RiskLevel::Critical);
        assert!(result.risk_summary.risk_breakdown.critical >= 1);
        assert!(result.risk_summary.requires_confirmation);
        // Invalid because of the fourth command
        assert!(!result.validation_result.valid);
        assert!(
            result
                .validation_result
                .issues
                .iter()
                .any(|i| i.contains("rm -rf /"))
        );
    }

    #[test]
    fn test_validity_tracks_forbidden_only() {
        let sim = simulator();

        // High risk but nothing forbidden: valid with warnings
        let result = sim.simulate(&["rm -rf /tmp/cache".to_string(), "systemctl stop nginx".to_string()]);
        assert!(result.validation_result.valid);
        assert!(!result.validation_result.warnings.is_empty());

        // A forbidden command invalidates the plan
        let result = sim.simulate(&["rm -rf /".to_string()]);
        assert!(!result.validation_result.valid);
    }

    #[test]
    fn test_service_start_before_install_warning() {
        let sim = simulator();
        let result = sim.simulate(&[
            "systemctl start nginx".to_string(),
            "apt-get install nginx".to_string(),
        ]);

        assert!(
            result
                .validation_result
                .warnings
                .iter()
                .any(|w| w.contains("services may start before"))
        );
    }

    #[test]
    fn test_install_before_start_no_warning() {
        let sim = simulator();
        let result = sim.simulate(&[
            "apt-get install nginx".to_string(),
            "systemctl start nginx".to_string(),
        ]);

        assert!(
            !result
                .validation_result
                .warnings
                .iter()
                .any(|w| w.contains("services may start before"))
        );
    }

    #[test]
    fn test_simulated_results_marked_dry_run() {
        let sim = simulator();
        let result = sim.simulate(&["apt-get install nginx".to_string()]);

        let r = &result.simulated_commands[0];
        assert!(r.success);
        assert!(r.flag("dry_run"));
        assert!(r.stdout.contains("[DRY-RUN]"));
    }

    #[test]
    fn test_critical_command_simulates_failure() {
        let sim = simulator();
        let result = sim.simulate(&["rm -rf /".to_string()]);

        let r = &result.simulated_commands[0];
        assert!(!r.success);
        assert!(r.stderr.contains("critical"));
    }

    #[test]
    fn test_empty_plan() {
        let sim = simulator();
        let result = sim.simulate(&[]);
        assert!(result.validation_result.valid);
        assert_eq!(result.execution_summary.total_commands, 0);
        assert_eq!(result.risk_summary.overall_risk, RiskLevel::Low);
    }

    #[test]
    fn test_text_report_renders() {
        let sim = simulator();
        let result = sim.simulate(&["apt-get install nginx".to_string(), "rm -rf /".to_string()]);
        let report = sim.render_report(&result, ReportFormat::Text);

        assert!(report.contains("DRY-RUN REPORT"));
        assert!(report.contains("Overall risk: critical"));
        assert!(report.contains("BLOCKED"));
    }

    #[test]
    fn test_json_report_parses() {
        let sim = simulator();
        let result = sim.simulate(&["apt update".to_string()]);
        let report = sim.render_report(&result, ReportFormat::Json);

        let value: serde_json::Value = serde_json::from_str(&report).unwrap();
        assert!(value["risk_summary"]["overall_risk"].is_string());
    }

    #[test]
    fn test_markdown_report_renders() {
        let sim = simulator();
        let result = sim.simulate(&["apt update".to_string()]);
        let report = sim.render_report(&result, ReportFormat::Markdown);
        assert!(report.starts_with("# Dry-run report"));
        assert!(report.contains("| 1 |"));
    }
}
