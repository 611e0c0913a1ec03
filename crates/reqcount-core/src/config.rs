use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_BIND: &str = "0.0.0.0:8080";
/// Same file name earlier deployments of the server wrote to.
pub const DEFAULT_STATE_FILE: &str = "./request-file.txt";

/// Optional settings file for the daemon. Every key may be omitted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub bind: Option<String>,
    pub state_file: Option<PathBuf>,
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
}

impl FileConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path).context("read config")?;
        toml::from_str::<FileConfig>(&raw)
            .with_context(|| format!("parse config {}", path.display()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsPaths {
    pub cert: PathBuf,
    pub key: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub bind: String,
    pub state_file: PathBuf,
    pub tls: Option<TlsPaths>,
}

impl ServerConfig {
    /// Layers explicit values over the file config over built-in defaults.
    pub fn resolve(overrides: FileConfig, file: FileConfig) -> anyhow::Result<Self> {
        let bind = overrides
            .bind
            .or(file.bind)
            .unwrap_or_else(|| DEFAULT_BIND.to_string());
        let state_file = overrides
            .state_file
            .or(file.state_file)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_STATE_FILE));
        let cert = overrides.cert.or(file.cert);
        let key = overrides.key.or(file.key);
        let tls = match (cert, key) {
            (Some(cert), Some(key)) => Some(TlsPaths { cert, key }),
            (None, None) => None,
            (Some(_), None) => anyhow::bail!("a certificate was given without --key"),
            (None, Some(_)) => anyhow::bail!("a key was given without --cert"),
        };
        Ok(Self {
            bind,
            state_file,
            tls,
        })
    }
}
