use anyhow::{Context, Result};
use bytes::Bytes;
use chrono::{DateTime, Local};
use clap::{Parser, Subcommand};
use http_body_util::{BodyExt, Empty};
use hyper::client::conn::http1;
use hyper::header::HOST;
use hyper::{Method, Request, StatusCode};
use hyper_util::rt::TokioIo;
use reqcount_core::config::DEFAULT_STATE_FILE;
use reqcount_core::{FileStateStore, PersistedState, StateStore, WINDOW_SLOTS};
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use rustls_pemfile::certs;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

#[derive(Parser, Debug)]
#[command(name = "reqcountctl", version, about = "reqcount operator tool")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate a request count file and print its window.
    Inspect {
        #[arg(long, default_value = DEFAULT_STATE_FILE)]
        state: PathBuf,
    },
    /// Ask a running server for its report.
    Get {
        #[arg(long, default_value = "127.0.0.1:8080")]
        connect: String,

        #[arg(long, default_value = "/")]
        path: String,

        /// CA certificate; switches to TLS.
        #[arg(long)]
        ca: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Inspect { state } => inspect(&state),
        Commands::Get { connect, path, ca } => {
            let (status, body) = fetch(&connect, &path, ca.as_deref()).await?;
            println!("{status}");
            print!("{body}");
            if !status.is_success() {
                anyhow::bail!("server answered {status}");
            }
            Ok(())
        }
    }
}

fn inspect(path: &Path) -> Result<()> {
    let store = FileStateStore::new(path.to_path_buf());
    let Some(state) = store.load()? else {
        println!("{}: no state, a server would cold start", path.display());
        return Ok(());
    };
    if let Ok(modified) = std::fs::metadata(path).and_then(|m| m.modified()) {
        let written: DateTime<Local> = modified.into();
        println!("written: {}", written.format("%Y-%m-%d %H:%M:%S"));
    }
    for line in describe(&state) {
        println!("{line}");
    }
    Ok(())
}

fn describe(state: &PersistedState) -> Vec<String> {
    let mut out = vec![
        format!("cursor: {}", state.cursor % WINDOW_SLOTS),
        format!("window total: {}", state.window_total),
    ];
    out.extend(
        state
            .buckets
            .iter()
            .enumerate()
            .filter(|(_, count)| **count > 0)
            .map(|(slot, count)| format!("slot {slot:>2}: {count}")),
    );
    out
}

async fn fetch(connect: &str, path: &str, ca: Option<&Path>) -> Result<(StatusCode, String)> {
    let tcp = TcpStream::connect(connect)
        .await
        .with_context(|| format!("connect {connect}"))?;
    debug!(%connect, tls = ca.is_some(), "connected");
    match ca {
        Some(ca) => {
            let connector = TlsConnector::from(Arc::new(client_config(ca)?));
            let host = host_of(connect);
            let server_name = ServerName::try_from(host).context("server name")?.to_owned();
            let tls = connector.connect(server_name, tcp).await.context("tls handshake")?;
            request(tls, connect, path).await
        }
        None => request(tcp, connect, path).await,
    }
}

async fn request<I>(io: I, authority: &str, path: &str) -> Result<(StatusCode, String)>
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sender, conn) = http1::handshake(TokioIo::new(io)).await?;
    tokio::spawn(async move {
        if let Err(err) = conn.await {
            warn!(%err, "connection error");
        }
    });

    let req = Request::builder()
        .method(Method::GET)
        .uri(path)
        .header(HOST, authority)
        .body(Empty::<Bytes>::new())?;
    let res = sender.send_request(req).await?;
    let status = res.status();
    let body = res.into_body().collect().await?.to_bytes();
    Ok((status, String::from_utf8_lossy(&body).into_owned()))
}

fn client_config(ca: &Path) -> Result<ClientConfig> {
    let mut reader = BufReader::new(File::open(ca).context("open ca")?);
    let mut root = RootCertStore::empty();
    for cert in certs(&mut reader) {
        root.add(cert.context("read ca")?)?;
    }
    Ok(ClientConfig::builder()
        .with_root_certificates(root)
        .with_no_client_auth())
}

fn host_of(connect: &str) -> &str {
    match connect.rsplit_once(':') {
        Some((host, _port)) => host.trim_start_matches('[').trim_end_matches(']'),
        None => connect,
    }
}
