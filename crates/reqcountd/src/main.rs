use anyhow::{Context, Result};
use clap::Parser;
use reqcount_core::{FileConfig, FileStateStore, RequestCounter, ServerConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

mod rotation;
mod server;
mod tls;

use server::{ConnectionLimits, Dispatcher};

#[derive(Parser, Debug)]
#[command(name = "reqcountd", version, about = "Sliding-window request counting HTTP server")]
struct Cli {
    /// TOML file with defaults for the flags below.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    bind: Option<String>,

    #[arg(long)]
    state_file: Option<PathBuf>,

    #[arg(long)]
    cert: Option<PathBuf>,

    #[arg(long)]
    key: Option<PathBuf>,
}

impl Cli {
    fn overrides(&self) -> FileConfig {
        FileConfig {
            bind: self.bind.clone(),
            state_file: self.state_file.clone(),
            cert: self.cert.clone(),
            key: self.key.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let file = match &cli.config {
        Some(path) => FileConfig::load(path)?,
        None => FileConfig::default(),
    };
    let config = ServerConfig::resolve(cli.overrides(), file)?;

    let store = FileStateStore::new(config.state_file.clone());
    let counter = Arc::new(RequestCounter::load(Arc::new(store)).context("load request counter")?);

    let acceptor = config.tls.as_ref().map(tls::acceptor).transpose()?;

    let listener = TcpListener::bind(&config.bind)
        .await
        .with_context(|| format!("bind {}", config.bind))?;
    info!(
        bind = %config.bind,
        tls = acceptor.is_some(),
        state_file = %config.state_file.display(),
        "reqcountd listening"
    );

    let dispatcher = Dispatcher::new(counter.clone());

    tokio::select! {
        res = server::run(listener, acceptor, dispatcher, ConnectionLimits::default()) => res,
        res = rotation::run(counter.clone()) => res,
        res = tokio::signal::ctrl_c() => {
            res.context("wait for interrupt")?;
            info!("interrupt received, flushing request counter");
            counter.flush().context("final flush of request counter")?;
            info!("stopping server");
            Ok(())
        }
    }
}
