//! tidegate server binary.
//!
//! Run with: `tidegate serve --config-dir /etc/tidegate`

mod config;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

use config::GlobalConfig;
use tidegate_http::HttpServer;
use tidegate_provider::{DataProvider, DelayedQuotaProvider, MemoryProvider};
use tidegate_sftp::{ConnectionRegistry, Metrics, ScanRegistry, SftpServer};

#[derive(Parser)]
#[command(name = "tidegate")]
#[command(about = "Multi-tenant SFTP/SCP server with an HTTP control plane", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration directory
    #[arg(short = 'c', long, default_value = ".")]
    config_dir: PathBuf,

    /// Configuration file name inside the configuration directory
    #[arg(long, default_value = "tidegate.toml")]
    config_name: String,

    /// Debug-level logging
    #[arg(short, long)]
    verbose: bool,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the SFTP server and the HTTP control plane
    Serve,

    /// Create an empty provider dump file
    Initprovider,

    /// Generate shell completions
    Completions {
        /// Target shell
        shell: clap_complete::Shell,
    },

    /// Render the man page to stdout
    Man,
}

fn init_logging(verbose: bool, json: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));
    if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Completions { shell } => {
            let mut command = Cli::command();
            let name = command.get_name().to_string();
            clap_complete::generate(*shell, &mut command, name, &mut std::io::stdout());
            return Ok(());
        }
        Commands::Man => {
            let man = clap_mangen::Man::new(Cli::command());
            man.render(&mut std::io::stdout())
                .context("failed to render the man page")?;
            return Ok(());
        }
        _ => {}
    }

    init_logging(cli.verbose, cli.log_json);
    let config = GlobalConfig::load(&cli.config_dir, &cli.config_name)
        .context("failed to load the configuration")?;

    match cli.command {
        Commands::Initprovider => {
            let path = config.data_provider.dump_path(&cli.config_dir);
            MemoryProvider::write_initial_dump(&path)
                .await
                .context(format!("failed to initialize {}", path.display()))?;
            info!(path = %path.display(), "provider initialized");
            Ok(())
        }
        Commands::Serve => serve(cli, config).await,
        _ => unreachable!("handled before logging init"),
    }
}

async fn serve(cli: Cli, config: GlobalConfig) -> Result<()> {
    let tracking = config.data_provider.tracking();
    let dump_path = config.data_provider.dump_path(&cli.config_dir);
    let base_provider: Arc<MemoryProvider> = if dump_path.exists() {
        Arc::new(
            MemoryProvider::from_dump_file(&dump_path, tracking)
                .await
                .context(format!("failed to load {}", dump_path.display()))?,
        )
    } else {
        tracing::warn!(
            path = %dump_path.display(),
            "provider dump not found, starting with no users (run initprovider)"
        );
        Arc::new(MemoryProvider::new(tracking))
    };

    let provider: Arc<dyn DataProvider> = if config.data_provider.delayed_quota_update > 0 {
        let delayed = DelayedQuotaProvider::new(
            base_provider,
            Duration::from_secs(config.data_provider.delayed_quota_update),
        );
        delayed.start();
        delayed
    } else {
        base_provider
    };

    let registry = ConnectionRegistry::new(Metrics::new());
    let scans = ScanRegistry::new();

    let sftp_server = SftpServer::new(
        config.sftpd.clone(),
        cli.config_dir.clone(),
        provider.clone(),
        registry.clone(),
        scans.clone(),
    );

    let http_task = if config.httpd.enabled {
        let http_server = HttpServer::new(
            provider.clone(),
            registry.clone(),
            scans.clone(),
            config.httpd.bind_address.clone(),
            config.httpd.bind_port,
        );
        Some(tokio::spawn(async move { http_server.run().await }))
    } else {
        None
    };

    let shutdown_provider = provider.clone();
    let result: Result<()> = tokio::select! {
        res = sftp_server.run() => {
            res.context("sftp server failed")
        }
        res = async {
            match http_task {
                Some(task) => task.await,
                None => std::future::pending().await,
            }
        } => {
            match res {
                Ok(Ok(())) => Err(anyhow::anyhow!("control plane exited unexpectedly")),
                Ok(Err(e)) => Err(e).context("control plane failed"),
                Err(e) => Err(e).context("control plane task failed"),
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
            Ok(())
        }
    };

    // flush pending quota deltas before the process ends
    if let Err(e) = shutdown_provider.close().await {
        tracing::warn!(error = %e, "provider shutdown flush failed");
    }
    info!("shutdown complete");
    result
}
