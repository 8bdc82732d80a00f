use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::MakeWriterExt;

use agentium::adapters::AdapterRegistry;
use agentium::cloud::Capabilities;
use agentium::config::SessionConfig;
use agentium::errors::SessionError;
use agentium::github::{StaticTokenProvider, TokenProvider};
use agentium::repo::system_runner;
use agentium::session::Session;

#[derive(Parser)]
#[command(name = "agentium")]
#[command(version, about = "Session controller for autonomous coding agents")]
struct Cli {
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to the session config file (overrides AGENTIUM_CONFIG_PATH).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one session to completion.
    Run,
    /// Parse and validate the session configuration, then exit.
    Validate,
}

fn init_tracing(verbose: bool, workdir: &std::path::Path) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let default_filter = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_env("AGENTIUM_LOG")
        .unwrap_or_else(|_| EnvFilter::new(default_filter));

    let log_dir = workdir.join(".agentium").join("logs");
    match std::fs::create_dir_all(&log_dir) {
        Ok(()) => {
            let appender = tracing_appender::rolling::daily(&log_dir, "agentium.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr.and(writer))
                .init();
            Some(guard)
        }
        Err(_) => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
            None
        }
    }
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let workdir = SessionConfig::workdir();
    let _log_guard = init_tracing(cli.verbose, &workdir);

    let exit_code = match run(cli, workdir).await {
        Ok(()) => 0,
        Err(SessionError::Cancelled) => {
            info!("session cancelled");
            130
        }
        Err(e) => {
            error!(error = %e, "session failed");
            1
        }
    };
    std::process::exit(exit_code);
}

async fn run(cli: Cli, workdir: PathBuf) -> Result<(), SessionError> {
    let config = SessionConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Validate => {
            info!(
                id = %config.id,
                repository = %config.repo_slug(),
                tasks = config.tasks.len(),
                prs = config.prs.len(),
                "configuration is valid"
            );
            Ok(())
        }
        Commands::Run => {
            let token_provider: Arc<dyn TokenProvider> = Arc::new(
                StaticTokenProvider::from_env().ok_or_else(|| {
                    SessionError::Credential("GITHUB_TOKEN is not set".into())
                })?,
            );
            let registry = AdapterRegistry::builtin(&config.fallback.default_adapter);
            let session = Session::new(
                config,
                workdir,
                system_runner(),
                registry,
                Capabilities::local(),
                token_provider,
            )
            .await?;
            session.run().await
        }
    }
}
