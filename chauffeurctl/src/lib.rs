use std::io;
use std::path::{Path, PathBuf};

use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use serde::Serialize;
use thiserror::Error;

use chauffeur_core::{load_browser_config, load_service_config, BrowserConfig, ServiceConfig};

pub mod commands;

use commands::exec::ExecArgs;
use commands::health::{CheckStatus, HealthEntry};

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] chauffeur_core::ConfigError),
    #[error("session error: {0}")]
    Session(#[from] chauffeur_core::SessionError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("authentication failed")]
    Authentication,
    #[error("invalid task spec: {0}")]
    InvalidTask(String),
    #[error("one or more health checks failed")]
    HealthFailure,
}

#[derive(Parser, Debug)]
#[command(author, version, about = "chauffeur command-line control interface", long_about = None)]
pub struct Cli {
    /// Path to the main chauffeur.toml
    #[arg(long, default_value = "configs/chauffeur.toml")]
    pub config: PathBuf,
    /// Alternate path for browser.toml
    #[arg(long)]
    pub browser_config: Option<PathBuf>,
    /// Token for local authentication (when CHAUFFEURCTL_TOKEN is set)
    #[arg(long)]
    pub token: Option<String>,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a single task against a locally launched browser pool
    Exec(ExecArgs),
    /// Configuration inspection
    #[command(subcommand)]
    Config(ConfigCommands),
    /// Integrity checks for the local installation
    #[command(name = "health")]
    #[command(subcommand)]
    Health(HealthCommands),
    /// Emit shell completions to stdout
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Parse and validate the configuration files
    Check,
    /// Print an operator-facing summary
    Show,
}

#[derive(Subcommand, Debug)]
pub enum HealthCommands {
    /// Run basic local checks
    Check,
}

pub fn run(cli: Cli) -> Result<()> {
    enforce_token(&cli)?;
    init_tracing();

    if let Commands::Completions { shell } = &cli.command {
        clap_complete::generate(*shell, &mut Cli::command(), "chauffeurctl", &mut io::stdout());
        return Ok(());
    }

    let context = AppContext::new(&cli)?;

    match &cli.command {
        Commands::Exec(args) => {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()?;
            let report = runtime.block_on(commands::exec::run(&context, args))?;
            render(&report, cli.format)?;
        }
        Commands::Config(ConfigCommands::Check) => {
            let report = context.config_check();
            render(&report, cli.format)?;
        }
        Commands::Config(ConfigCommands::Show) => {
            let summary = context.config_summary();
            render(&summary, cli.format)?;
        }
        Commands::Health(HealthCommands::Check) => {
            let report = commands::health::check(&context);
            render(&report, cli.format)?;
            if report
                .iter()
                .any(|entry| matches!(entry.status, CheckStatus::Error))
            {
                return Err(AppError::HealthFailure);
            }
        }
        Commands::Completions { .. } => unreachable!("handled above"),
    }

    Ok(())
}

fn enforce_token(cli: &Cli) -> Result<()> {
    if let Ok(expected) = std::env::var("CHAUFFEURCTL_TOKEN") {
        match &cli.token {
            Some(provided) if provided == &expected => Ok(()),
            _ => Err(AppError::Authentication),
        }
    } else {
        Ok(())
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn render<T>(value: &T, format: OutputFormat) -> Result<()>
where
    T: Serialize + DisplayFallback,
{
    match format {
        OutputFormat::Text => {
            println!("{}", value.display());
            Ok(())
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{}", json);
            Ok(())
        }
    }
}

pub trait DisplayFallback {
    fn display(&self) -> String;
}

#[derive(Debug)]
pub struct AppContext {
    pub service: ServiceConfig,
    pub browser: BrowserConfig,
    pub config_path: PathBuf,
    pub browser_path: PathBuf,
}

impl AppContext {
    pub fn new(cli: &Cli) -> Result<Self> {
        let config_path = cli.config.clone();
        let mut service = load_service_config(&config_path)?;
        service.apply_env_overrides();
        service.validate()?;

        let config_dir = config_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let browser_path = cli
            .browser_config
            .clone()
            .unwrap_or_else(|| config_dir.join("browser.toml"));
        let browser = load_browser_config(&browser_path)?;

        Ok(Self {
            service,
            browser,
            config_path,
            browser_path,
        })
    }

    fn config_check(&self) -> ConfigCheckReport {
        ConfigCheckReport {
            status: "ok".to_string(),
            config_path: self.config_path.display().to_string(),
            browser_path: self.browser_path.display().to_string(),
        }
    }

    fn config_summary(&self) -> ConfigSummary {
        ConfigSummary {
            config_path: self.config_path.display().to_string(),
            browser_path: self.browser_path.display().to_string(),
            listen_port: self.service.service.listen_port,
            max_sessions: self.service.pool.max_sessions,
            min_idle: self.service.pool.min_idle,
            idle_ttl_seconds: self.service.pool.idle_ttl_seconds,
            default_deadline_seconds: self.service.task.default_deadline_seconds,
            chromium_executable: self.browser.chromium.executable_path.clone(),
            headless: self.browser.chromium.headless,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ConfigCheckReport {
    pub status: String,
    pub config_path: String,
    pub browser_path: String,
}

impl DisplayFallback for ConfigCheckReport {
    fn display(&self) -> String {
        format!(
            "configuration {}: {} + {}",
            self.status, self.config_path, self.browser_path
        )
    }
}

#[derive(Debug, Serialize)]
pub struct ConfigSummary {
    pub config_path: String,
    pub browser_path: String,
    pub listen_port: u16,
    pub max_sessions: usize,
    pub min_idle: usize,
    pub idle_ttl_seconds: u64,
    pub default_deadline_seconds: u64,
    pub chromium_executable: String,
    pub headless: bool,
}

impl DisplayFallback for ConfigSummary {
    fn display(&self) -> String {
        let lines = vec![
            format!("config: {}", self.config_path),
            format!("browser config: {}", self.browser_path),
            format!("listen port: {}", self.listen_port),
            format!(
                "pool: max {} sessions, warm minimum {}, idle ttl {}s",
                self.max_sessions, self.min_idle, self.idle_ttl_seconds
            ),
            format!("task deadline: {}s", self.default_deadline_seconds),
            format!(
                "chromium: {} (headless: {})",
                self.chromium_executable, self.headless
            ),
        ];
        lines.join("\n")
    }
}

impl DisplayFallback for Vec<HealthEntry> {
    fn display(&self) -> String {
        let mut lines = Vec::new();
        for entry in self {
            lines.push(format!(
                "[{status}] {name} - {detail}",
                status = entry.status,
                name = entry.name,
                detail = entry.detail
            ));
        }
        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn prepare_test_context() -> (TempDir, AppContext) {
        let temp = TempDir::new().unwrap();
        let configs_dir = temp.path().join("configs");
        fs::create_dir_all(&configs_dir).unwrap();
        fs::copy("../configs/chauffeur.toml", configs_dir.join("chauffeur.toml")).unwrap();
        fs::copy("../configs/browser.toml", configs_dir.join("browser.toml")).unwrap();

        let cli = Cli::parse_from([
            "chauffeurctl",
            "--config",
            configs_dir.join("chauffeur.toml").to_str().unwrap(),
            "config",
            "check",
        ]);
        let context = AppContext::new(&cli).expect("context should build from fixtures");
        (temp, context)
    }

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn context_loads_sibling_browser_config() {
        let (_temp, context) = prepare_test_context();
        assert_eq!(context.service.service.listen_port, 8080);
        assert!(context.browser.chromium.headless);
    }

    #[test]
    fn config_summary_reports_pool_bounds() {
        let (_temp, context) = prepare_test_context();
        let summary = context.config_summary();
        assert_eq!(summary.max_sessions, context.service.pool.max_sessions);
        assert!(summary.display().contains("pool: max"));
    }
}
