//! azgate entry point: CLI parsing, config loading, server startup.

use std::io::{self, IsTerminal, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, CommandFactory, Parser, Subcommand};
use config::{Config, Environment, File, FileFormat};
use tokio::net::TcpListener;
use tracing::{debug, info};

use azgate::api::{self, AppState};
use azgate::config::AppConfig;

const APP_NAME: &str = "azgate";
const ENV_PREFIX: &str = "AZGATE";

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = cli
        .common
        .config
        .clone()
        .map(Ok)
        .unwrap_or_else(default_config_path)?;

    match cli.command {
        Command::Serve(cmd) => {
            init_logging(&cli.common);
            let config = load_or_init_config(&config_path, &cmd)?;
            config
                .validate()
                .map_err(|e| anyhow::anyhow!("invalid configuration: {e}"))?;
            async_serve(config)
        }
        Command::Config { command } => {
            init_logging(&cli.common);
            handle_config(&config_path, command)
        }
        Command::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, APP_NAME, &mut io::stdout());
            Ok(())
        }
    }
}

#[tokio::main]
async fn async_serve(config: AppConfig) -> Result<()> {
    handle_serve(config).await
}

#[derive(Debug, Parser)]
#[command(name = APP_NAME, about = "Azure device-code authentication gateway", version)]
struct Cli {
    #[command(flatten)]
    common: CommonOpts,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Args)]
struct CommonOpts {
    /// Path to the config file (default: platform config dir).
    #[arg(long, global = true, env = "AZGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Log level when RUST_LOG is unset.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON.
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the HTTP server.
    Serve(ServeCommand),
    /// Inspect the configuration.
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Generate shell completions.
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[derive(Debug, Clone, Args)]
struct ServeCommand {
    /// Override the configured bind host.
    #[arg(long)]
    host: Option<String>,

    /// Override the configured port.
    #[arg(long)]
    port: Option<u16>,
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Print the effective configuration as TOML.
    Show,
    /// Print the config file path.
    Path,
}

fn init_logging(common: &CommonOpts) {
    use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

    let level = common.log_level.as_str();
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("azgate={level},tower_http={level}")));

    if common.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
            .ok();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_ansi(io::stderr().is_terminal())
                    .with_writer(io::stderr),
            )
            .try_init()
            .ok();
    }
}

fn default_config_path() -> Result<PathBuf> {
    let base = dirs::config_dir().context("unable to determine config directory")?;
    Ok(base.join(APP_NAME).join("config.toml"))
}

fn load_or_init_config(path: &Path, cmd: &ServeCommand) -> Result<AppConfig> {
    if !path.exists() {
        write_default_config(path)?;
        info!("Created default config at {}", path.display());
    }

    let built = Config::builder()
        .add_source(
            File::from(path)
                .format(FileFormat::Toml)
                .required(false),
        )
        .add_source(Environment::with_prefix(ENV_PREFIX).separator("__"))
        .build()
        .context("loading configuration")?;

    let mut config: AppConfig = built
        .try_deserialize()
        .context("deserializing configuration")?;

    if let Some(host) = &cmd.host {
        config.server.host = host.clone();
    }
    if let Some(port) = cmd.port {
        config.server.port = port;
    }

    Ok(config)
}

fn write_default_config(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating config directory {parent:?}"))?;
    }

    let config = AppConfig::default();
    let toml = toml::to_string_pretty(&config).context("serializing default config to TOML")?;
    let body = format!("# Configuration for {APP_NAME}\n# File: {}\n\n{toml}", path.display());
    std::fs::write(path, body).with_context(|| format!("writing config file to {}", path.display()))
}

fn handle_config(path: &Path, command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Show => {
            let config = if path.exists() {
                let built = Config::builder()
                    .add_source(File::from(path).format(FileFormat::Toml))
                    .add_source(Environment::with_prefix(ENV_PREFIX).separator("__"))
                    .build()?;
                built.try_deserialize::<AppConfig>()?
            } else {
                AppConfig::default()
            };
            print!("{}", toml::to_string_pretty(&config)?);
        }
        ConfigCommand::Path => {
            println!("{}", path.display());
        }
    }
    Ok(())
}

async fn handle_serve(config: AppConfig) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("invalid address")?;

    let state = AppState::from_config(config);
    spawn_sweep_task(&state);

    let app = api::create_router(state);

    info!("Listening on http://{}", addr);
    let listener = TcpListener::bind(addr).await.context("binding to address")?;

    let shutdown_signal = async move {
        let ctrl_c = async {
            tokio::signal::ctrl_c()
                .await
                .expect("failed to install Ctrl+C handler");
        };

        #[cfg(unix)]
        let terminate = async {
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install signal handler")
                .recv()
                .await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }

        info!("Shutdown signal received");
    };

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal)
    .await
    .context("running server")?;

    Ok(())
}

/// Background eviction of expired attempts, idle sessions, and stale
/// rate-limiter entries.
fn spawn_sweep_task(state: &AppState) {
    let orchestrator = state.orchestrator.clone();
    let sessions = state.sessions.clone();
    let rate_limiter = state.rate_limiter.clone();
    let attempt_ttl = chrono::Duration::seconds(state.config.security.attempt_ttl_secs as i64);
    let session_ttl =
        chrono::Duration::seconds(state.config.security.session_idle_ttl_secs as i64);

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(60));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let swept_attempts = orchestrator.sweep_expired(attempt_ttl).await;
            let swept_sessions = sessions.sweep(session_ttl);
            rate_limiter.prune();
            if swept_attempts > 0 || swept_sessions > 0 {
                debug!(
                    attempts = swept_attempts,
                    sessions = swept_sessions,
                    "Sweep pass evicted expired entries"
                );
            }
        }
    });
}
