use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use easel_collab::config::ServerConfig;
use easel_collab::server::SyncServer;
use log::{error, info};

#[derive(Parser, Debug)]
#[command(name = "easel-server", version, about = "Collaborative canvas server")]
struct Args {
    /// Path to TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Client listener address, e.g. 0.0.0.0:27750.
    #[arg(long)]
    listen: Option<String>,

    /// Admin listener address. The admin interface is off unless set.
    #[arg(long)]
    admin_listen: Option<String>,

    /// Directory for persisted settings and bans.
    #[arg(long)]
    storage: Option<PathBuf>,

    /// Session recording path pattern (%d date, %t time, %i id, %a alias).
    #[arg(long)]
    record: Option<String>,

    /// Stop once the last session has ended.
    #[arg(long)]
    auto_stop: bool,
}

impl Args {
    fn into_config(self) -> Result<ServerConfig, easel_collab::ConfigError> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::load(path)?,
            None => ServerConfig::default(),
        };
        if let Some(listen) = self.listen {
            config.bind_addr = listen;
        }
        if self.admin_listen.is_some() {
            config.admin_bind_addr = self.admin_listen;
        }
        if self.storage.is_some() {
            config.storage_path = self.storage;
        }
        if self.record.is_some() {
            config.recording_path = self.record;
        }
        config.auto_stop |= self.auto_stop;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();

    let config = match Args::parse().into_config() {
        Ok(config) => config,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    info!("Starting Easel server...");
    let server = match SyncServer::new(config) {
        Ok(server) => Arc::new(server),
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let stopper = server.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, shutting down");
            stopper.stop().await;
        }
    });

    if let Err(e) = server.run().await {
        error!("{e}");
        return ExitCode::FAILURE;
    }
    server.registry().wait_stopped().await;
    ExitCode::SUCCESS
}
