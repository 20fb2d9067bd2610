//! opsagent CLI entry point

use clap::Parser;
use colored::Colorize;
use eyre::{Context, Result};
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use opsagent::cli::{Cli, Command, ConfigAction};
use opsagent::config::{AgentConfig, ServerConfig};
use opsagent::llm::create_provider_with_fallback;
use opsagent::orchestrator::{ExecuteOptions, HistoryEntry, Orchestrator, TaskExecutionResult};
use opsagent::transport::{LocalTransport, SshCliTransport, SshTransport};

fn setup_logging(verbose: bool) {
    let default_level = if verbose { tracing::Level::DEBUG } else { tracing::Level::INFO };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("opsagent")
}

fn history_path() -> PathBuf {
    data_dir().join("history.jsonl")
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let runtime = tokio::runtime::Runtime::new().context("Failed to start async runtime")?;
    let exit_code = runtime.block_on(run(cli))?;
    std::process::exit(exit_code);
}

async fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Command::Init => init(),
        Command::Config { action } => config_command(action, cli.config.as_ref(), cli.server.as_ref()),
        Command::Status => status(cli.config.as_ref()).await,
        Command::Execute { goal, dry_run } => {
            execute(&goal, dry_run, cli.config.as_ref(), cli.server.as_ref()).await
        }
        Command::History { limit } => history(limit),
        Command::Cleanup { days } => cleanup(days),
        Command::Interactive => interactive(cli.config.as_ref(), cli.server.as_ref()).await,
    }
}

fn init() -> Result<i32> {
    let config_path = PathBuf::from("opsagent.yml");
    if config_path.exists() {
        println!("{} opsagent.yml already exists", "skip".yellow());
    } else {
        let config = AgentConfig::default();
        std::fs::write(&config_path, serde_yaml::to_string(&config)?)?;
        println!("{} wrote opsagent.yml", "ok".green());
    }

    let server_path = PathBuf::from("server.yml");
    if server_path.exists() {
        println!("{} server.yml already exists", "skip".yellow());
    } else {
        let server = ServerConfig::default();
        std::fs::write(&server_path, serde_yaml::to_string(&server)?)?;
        println!("{} wrote server.yml", "ok".green());
    }

    println!("Edit both files, set llm.api_key, then run: opsagent execute \"<goal>\"");
    Ok(0)
}

fn config_command(action: ConfigAction, config_path: Option<&PathBuf>, server_path: Option<&PathBuf>) -> Result<i32> {
    match action {
        ConfigAction::Show => {
            let mut config = AgentConfig::load(config_path)?;
            if !config.llm.api_key.is_empty() {
                config.llm.api_key = "***".to_string();
            }
            println!("{}", serde_yaml::to_string(&config)?);
            Ok(0)
        }
        ConfigAction::Validate => {
            match AgentConfig::load(config_path).and_then(|c| c.validate()) {
                Ok(()) => println!("{} agent config is valid", "ok".green()),
                Err(e) => {
                    println!("{} agent config: {:#}", "error".red(), e);
                    return Ok(1);
                }
            }
            if let Some(path) = server_path {
                match ServerConfig::load(path) {
                    Ok(_) => println!("{} server profile is valid", "ok".green()),
                    Err(e) => {
                        println!("{} server profile: {:#}", "error".red(), e);
                        return Ok(1);
                    }
                }
            }
            Ok(0)
        }
        ConfigAction::Edit => {
            let path = config_path.cloned().unwrap_or_else(|| PathBuf::from("opsagent.yml"));
            let editor = std::env::var("EDITOR").unwrap_or_else(|_| "vi".to_string());
            let status = std::process::Command::new(editor).arg(&path).status()?;
            Ok(if status.success() { 0 } else { 1 })
        }
    }
}

async fn status(config_path: Option<&PathBuf>) -> Result<i32> {
    let config = AgentConfig::load(config_path)?;
    println!("opsagent v{}", env!("CARGO_PKG_VERSION"));
    println!("  provider: {} ({})", config.llm.provider, config.llm.model);

    let provider = create_provider_with_fallback(&config.llm).await;
    let available = provider.is_available().await;
    println!(
        "  llm reachable: {}",
        if available { "yes".green() } else { "no".red() }
    );

    let entries = read_history()?;
    println!("  recorded executions: {}", entries.len());
    Ok(0)
}

async fn execute(
    goal: &str,
    dry_run: bool,
    config_path: Option<&PathBuf>,
    server_path: Option<&PathBuf>,
) -> Result<i32> {
    let config = AgentConfig::load(config_path)?;
    config.validate()?;
    let server = match server_path {
        Some(path) => ServerConfig::load(path)?,
        None => {
            let default_path = PathBuf::from("server.yml");
            if default_path.exists() {
                ServerConfig::load(&default_path)?
            } else {
                ServerConfig::default()
            }
        }
    };

    let llm = create_provider_with_fallback(&config.llm).await;
    let transport = build_transport(&server)?;

    info!(host = %server.host, goal = %goal, dry_run, "starting execution");
    let orchestrator = Orchestrator::new(config, server, llm, transport);
    let result = orchestrator
        .execute_task(
            goal,
            ExecuteOptions {
                dry_run,
                auto_rollback: None,
            },
        )
        .await;

    print_result(&result);
    append_history(&orchestrator.history(1))?;
    Ok(if result.success { 0 } else { 1 })
}

fn build_transport(server: &ServerConfig) -> Result<Arc<dyn SshTransport>> {
    if matches!(server.host.as_str(), "localhost" | "127.0.0.1" | "::1") {
        Ok(Arc::new(LocalTransport::new()))
    } else {
        Ok(Arc::new(
            SshCliTransport::from_config(server).map_err(|e| eyre::eyre!("{}", e))?,
        ))
    }
}

fn print_result(result: &TaskExecutionResult) {
    println!();
    if result.success {
        println!("{} task completed in {:.1}s", "ok".green(), result.duration_ms as f64 / 1000.0);
    } else {
        println!(
            "{} task failed: {}",
            "error".red(),
            result.error.as_deref().unwrap_or("unknown")
        );
    }

    if let Some(task) = &result.task {
        for step in &task.steps {
            println!("  [{}] {}", step.status, step.title);
        }
    }
    if result.escalations > 0 {
        println!("  escalations: {}", result.escalations);
    }
    if result.rollback_executed {
        println!("  {} rollback was executed", "note".yellow());
    }
}

fn history(limit: usize) -> Result<i32> {
    let entries = read_history()?;
    if entries.is_empty() {
        println!("No recorded executions");
        return Ok(0);
    }

    let skip = entries.len().saturating_sub(limit);
    for entry in &entries[skip..] {
        let marker = if entry.success { "ok".green() } else { "failed".red() };
        println!(
            "{}  [{}] {} ({}/{} steps, {:.1}s)",
            entry.finished_at.format("%Y-%m-%d %H:%M:%S"),
            marker,
            entry.title,
            entry.steps_completed,
            entry.steps_total,
            entry.duration_ms as f64 / 1000.0
        );
    }
    Ok(0)
}

fn cleanup(days: i64) -> Result<i32> {
    let cutoff = chrono::Utc::now() - chrono::Duration::days(days);
    let entries = read_history()?;
    let kept: Vec<&HistoryEntry> = entries.iter().filter(|e| e.finished_at >= cutoff).collect();
    let removed = entries.len() - kept.len();

    let path = history_path();
    if path.exists() {
        let mut content = String::new();
        for entry in &kept {
            content.push_str(&serde_json::to_string(entry)?);
            content.push('\n');
        }
        std::fs::write(&path, content)?;
    }

    println!("Removed {} history entries older than {} days", removed, days);
    Ok(0)
}

async fn interactive(config_path: Option<&PathBuf>, server_path: Option<&PathBuf>) -> Result<i32> {
    println!("Interactive mode. Enter a goal per line; 'quit' to exit.");
    let stdin = std::io::stdin();
    loop {
        print!("goal> ");
        std::io::stdout().flush()?;

        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        let goal = line.trim();
        if goal.is_empty() {
            continue;
        }
        if matches!(goal, "quit" | "exit") {
            break;
        }

        if let Err(e) = execute(goal, false, config_path, server_path).await {
            println!("{} {:#}", "error".red(), e);
        }
    }
    Ok(0)
}

fn read_history() -> Result<Vec<HistoryEntry>> {
    let path = history_path();
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = std::fs::read_to_string(&path)?;
    Ok(content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect())
}

fn append_history(entries: &[HistoryEntry]) -> Result<()> {
    let dir = data_dir();
    std::fs::create_dir_all(&dir)?;
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(history_path())?;
    for entry in entries {
        writeln!(file, "{}", serde_json::to_string(entry)?)?;
    }
    Ok(())
}
