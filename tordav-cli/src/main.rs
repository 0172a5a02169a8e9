//! tordav CLI - serves BitTorrent swarms over WebDAV
//!
//! Watches the torrents directory, keeps the matching torrents active and
//! serves their content until interrupted.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;
use tordav_core::engine::RqbitEngine;
use tordav_core::lifecycle::prepare_root;
use tordav_core::tracing_setup::{CliLogLevel, init_tracing};
use tordav_core::{DirectoryWatcher, LifecycleManager, TorDavConfig, TorrentService};
use tordav_web::{Multiplexer, run_server};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "tordav")]
#[command(about = "Stream BitTorrent swarms over WebDAV")]
struct Cli {
    /// Address the WebDAV server listens on
    #[arg(short, long)]
    listen: Option<SocketAddr>,
    /// Secret path prefix every request must start with
    #[arg(short, long)]
    secret: Option<String>,
    /// Username for HTTP Basic authentication
    #[arg(long)]
    user: Option<String>,
    /// Password for HTTP Basic authentication
    #[arg(long)]
    pass: Option<String>,
    /// Directory for torrent metadata and completion state
    #[arg(long)]
    metadata: Option<PathBuf>,
    /// Directory watched for torrents and magnet batches
    #[arg(long)]
    torrents: Option<PathBuf>,
    /// Console log level
    #[arg(long, value_enum, default_value_t = CliLogLevel::Info)]
    log_level: CliLogLevel,
    /// Directory for the debug log of the last run
    #[arg(long)]
    logs_dir: Option<PathBuf>,
}

impl Cli {
    fn apply(self, config: &mut TorDavConfig) {
        if let Some(listen) = self.listen {
            config.server.listen_addr = listen;
        }
        if let Some(secret) = self.secret {
            config.server.secret_path = secret;
        }
        if let Some(user) = self.user {
            config.server.username = user;
        }
        if let Some(pass) = self.pass {
            config.server.password = pass;
        }
        if let Some(metadata) = self.metadata {
            config.storage.metadata_dir = metadata;
        }
        if let Some(torrents) = self.torrents {
            config.storage.torrents_dir = torrents;
        }
        if let Some(logs_dir) = self.logs_dir {
            config.storage.logs_dir = logs_dir;
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let log_level = cli.log_level;

    let mut config = TorDavConfig::from_env()?;
    cli.apply(&mut config);
    config.validate()?;

    init_tracing(log_level.as_tracing_level(), &config.storage.logs_dir)?;

    prepare_root(&config).await?;
    tokio::fs::create_dir_all(&config.storage.metadata_dir).await?;

    let engine = RqbitEngine::start(&config).await?;
    let service = Arc::new(TorrentService::new(Arc::new(engine), &config));

    let (watcher, changes) = DirectoryWatcher::new()?;
    let mut lifecycle = LifecycleManager::new(Arc::clone(&service), &config).with_watcher(watcher);
    lifecycle.scan_root().await;
    info!("Torrents active after startup scan: {}", service.active_count());

    let lifecycle_task = tokio::spawn(lifecycle.run(changes));

    let multiplexer = Arc::new(Multiplexer::new(Arc::clone(&service), &config));
    let listen_addr = config.server.listen_addr;
    let server_task = tokio::spawn(async move {
        if let Err(e) = run_server(listen_addr, multiplexer).await {
            error!("WebDAV server stopped: {e}");
        }
    });

    let status_task = spawn_status_printer(Arc::clone(&service));

    wait_for_shutdown().await;
    info!("Shutting down");

    // Dropping the lifecycle task drops the watcher with it
    lifecycle_task.abort();
    server_task.abort();
    status_task.abort();

    service.stop().await?;
    Ok(())
}

/// Prints the status report for every line read from stdin.
fn spawn_status_printer(service: Arc<TorrentService>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(_)) => println!("{}", service.status_report()),
                Ok(None) => break,
                Err(e) => {
                    error!("Can't read stdin: {e}");
                    break;
                }
            }
        }
    })
}

async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    result = tokio::signal::ctrl_c() => {
                        if let Err(e) = result {
                            error!("Can't listen for Ctrl+C: {e}");
                        }
                    }
                    _ = terminate.recv() => {}
                }
                return;
            }
            Err(e) => error!("Can't listen for SIGTERM: {e}"),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Can't listen for Ctrl+C: {e}");
    }
}
