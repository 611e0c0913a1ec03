use anyhow::{Context, Result};
use rcgen::{CertificateParams, DistinguishedName, DnType, SanType};
use reqcount_core::report::parse_served;
use reqcount_core::PersistedState;
use rustls::pki_types::{CertificateDer, ServerName};
use rustls::{ClientConfig, RootCertStore};
use rustls_pemfile::certs;
use std::io::Cursor;
use std::net::IpAddr;
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

struct TestServer {
    child: Child,
    port: u16,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

struct Reply {
    status: u16,
    body: String,
}

#[tokio::test]
async fn get_reports_running_count() -> Result<()> {
    let dir = tempdir()?;
    let server = start_server(&dir.path().join("count.json"), &[]).await?;

    let first = get(server.port, "GET", "/").await?;
    assert_eq!(first.status, 200);
    assert_eq!(parse_served(&first.body), Some(1));
    assert!(first.body.contains("requests in the last 60s\nThe time is: "));

    let second = get(server.port, "GET", "/").await?;
    assert_eq!(parse_served(&second.body), Some(2));
    Ok(())
}

#[tokio::test]
async fn rejects_other_methods_and_paths() -> Result<()> {
    let dir = tempdir()?;
    let server = start_server(&dir.path().join("count.json"), &[]).await?;

    let post = get(server.port, "POST", "/").await?;
    assert_eq!(post.status, 405);

    let missing = get(server.port, "GET", "/nowhere").await?;
    assert_eq!(missing.status, 404);
    assert_eq!(missing.body, "Requested resource '/nowhere' does not exist\n");

    let encoded = get(server.port, "GET", "/a%20b").await?;
    assert_eq!(encoded.status, 404);
    assert_eq!(encoded.body, "Requested resource '/a b' does not exist\n");

    let after = get(server.port, "GET", "/").await?;
    assert_eq!(parse_served(&after.body), Some(1));
    Ok(())
}

#[tokio::test]
async fn count_survives_restart() -> Result<()> {
    let dir = tempdir()?;
    let state = dir.path().join("count.json");

    let server = start_server(&state, &[]).await?;
    for _ in 0..3 {
        get(server.port, "GET", "/").await?;
    }
    wait_for_persisted_total(&state, 3).await?;
    drop(server);

    let server = start_server(&state, &[]).await?;
    let reply = get(server.port, "GET", "/").await?;
    assert_eq!(parse_served(&reply.body), Some(4));
    Ok(())
}

#[cfg(unix)]
#[tokio::test]
async fn interrupt_flushes_and_exits_cleanly() -> Result<()> {
    let dir = tempdir()?;
    let state = dir.path().join("count.json");
    let mut server = start_server(&state, &[]).await?;
    get(server.port, "GET", "/").await?;
    wait_for_persisted_total(&state, 1).await?;

    let status = Command::new("kill")
        .arg("-INT")
        .arg(server.child.id().to_string())
        .status()?;
    assert!(status.success());

    let exit = wait_for_exit(&mut server.child).await?;
    assert!(exit.success(), "unexpected exit status {exit}");

    let raw = std::fs::read_to_string(&state)?;
    let saved = PersistedState::decode(&raw, &state)?;
    assert_eq!(saved.window_total, 1);
    assert_eq!(saved.buckets.iter().sum::<u64>(), 1);
    Ok(())
}

#[tokio::test]
async fn corrupt_state_refuses_to_serve() -> Result<()> {
    let dir = tempdir()?;
    let state = dir.path().join("count.json");
    std::fs::write(&state, "{\"DeltaIdx\": 3, \"Deltas\": [1, 2]")?;

    let port = pick_port()?;
    let mut child = spawn_server(port, &state, &[])?;
    let exit = wait_for_exit(&mut child).await?;
    assert!(!exit.success());
    assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());
    // the corrupt file is left for the operator
    assert!(std::fs::read_to_string(&state)?.starts_with("{\"DeltaIdx\": 3"));
    Ok(())
}

#[tokio::test]
async fn serves_over_tls() -> Result<()> {
    let dir = tempdir()?;
    let cert_path = dir.path().join("cert.pem");
    let key_path = dir.path().join("key.pem");
    let (cert_pem, key_pem) = generate_cert()?;
    std::fs::write(&cert_path, &cert_pem)?;
    std::fs::write(&key_path, &key_pem)?;

    let cert_arg = cert_path.to_string_lossy().to_string();
    let key_arg = key_path.to_string_lossy().to_string();
    let server = start_server(
        &dir.path().join("count.json"),
        &["--cert", &cert_arg, "--key", &key_arg],
    )
    .await?;

    let mut root = RootCertStore::empty();
    let mut cursor = Cursor::new(&cert_pem);
    for cert in certs(&mut cursor).collect::<Result<Vec<_>, _>>()? {
        root.add(CertificateDer::from(cert))?;
    }
    let config = ClientConfig::builder()
        .with_root_certificates(root)
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(config));
    let tcp = TcpStream::connect(("127.0.0.1", server.port)).await?;
    let server_name = ServerName::try_from("localhost").context("server name")?;
    let tls = connector.connect(server_name, tcp).await?;

    let reply = exchange(tls, "GET", "/").await?;
    assert_eq!(reply.status, 200);
    assert_eq!(parse_served(&reply.body), Some(1));
    Ok(())
}

async fn start_server(state: &Path, extra: &[&str]) -> Result<TestServer> {
    let port = pick_port()?;
    let child = spawn_server(port, state, extra)?;
    let server = TestServer { child, port };
    wait_for_port(port).await?;
    Ok(server)
}

fn spawn_server(port: u16, state: &Path, extra: &[&str]) -> Result<Child> {
    Command::new(env!("CARGO_BIN_EXE_reqcountd"))
        .arg("--bind")
        .arg(format!("127.0.0.1:{port}"))
        .arg("--state-file")
        .arg(state)
        .args(extra)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .context("spawn reqcountd")
}

async fn get(port: u16, method: &str, path: &str) -> Result<Reply> {
    let stream = TcpStream::connect(("127.0.0.1", port)).await?;
    exchange(stream, method, path).await
}

async fn exchange<S>(mut stream: S, method: &str, path: &str) -> Result<Reply>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = format!("{method} {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await?;

    let mut raw = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        match tokio::time::timeout(Duration::from_secs(5), stream.read(&mut chunk)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => raw.extend_from_slice(&chunk[..n]),
            // a peer that skips close_notify still delivered the response
            Ok(Err(_)) if !raw.is_empty() => break,
            Ok(Err(err)) => return Err(err.into()),
            Err(_) => anyhow::bail!("timeout waiting for response"),
        }
    }

    let text = String::from_utf8(raw)?;
    let (head, body) = text.split_once("\r\n\r\n").context("malformed response")?;
    let status = head
        .split_whitespace()
        .nth(1)
        .context("missing status")?
        .parse::<u16>()?;
    Ok(Reply {
        status,
        body: body.to_string(),
    })
}

async fn wait_for_persisted_total(state: &Path, expected: u64) -> Result<()> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if let Ok(raw) = std::fs::read_to_string(state) {
            if let Ok(saved) = PersistedState::decode(&raw, state) {
                if saved.window_total >= expected {
                    return Ok(());
                }
            }
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    anyhow::bail!("state file never reached {expected}");
}

async fn wait_for_exit(child: &mut Child) -> Result<ExitStatus> {
    for _ in 0..50 {
        if let Some(status) = child.try_wait()? {
            return Ok(status);
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    anyhow::bail!("server did not exit");
}

fn generate_cert() -> Result<(Vec<u8>, Vec<u8>)> {
    let mut params = CertificateParams::new(vec!["localhost".into()]);
    params.distinguished_name = DistinguishedName::new();
    params
        .distinguished_name
        .push(DnType::CommonName, "reqcount");
    params
        .subject_alt_names
        .push(SanType::IpAddress(IpAddr::from([127, 0, 0, 1])));
    let cert = rcgen::Certificate::from_params(params)?;
    let cert_pem = cert.serialize_pem()?;
    let key_pem = cert.serialize_private_key_pem();
    Ok((cert_pem.into_bytes(), key_pem.into_bytes()))
}

fn pick_port() -> Result<u16> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    let port = listener.local_addr()?.port();
    Ok(port)
}

async fn wait_for_port(port: u16) -> Result<()> {
    let addr = format!("127.0.0.1:{port}");
    for _ in 0..50 {
        if TcpStream::connect(&addr).await.is_ok() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    anyhow::bail!("server did not start");
}
