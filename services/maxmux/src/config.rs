//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! The shared OAuth token is resolved from MAXMUX_OAUTH_TOKEN, then
//! oauth_token_file, then the inline oauth_token key, so deployments can keep
//! the secret out of the TOML entirely.

use common::Secret;
use reqwest::Url;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Listen port used when the file leaves `port` unset or zero.
pub const DEFAULT_PORT: u16 = 4000;

/// Upstream origin used when the file leaves `upstream` unset.
pub const DEFAULT_UPSTREAM: &str = "https://api.anthropic.com";

/// Environment variable that overrides the shared OAuth token.
pub const TOKEN_ENV: &str = "MAXMUX_OAUTH_TOKEN";

const DEFAULT_CONFIG_FILE: &str = "maxmux.toml";

/// On-disk TOML shape. Every key is optional; [`Config`] applies defaults.
#[derive(Debug, Deserialize)]
struct FileConfig {
    #[serde(default)]
    port: Option<u16>,
    #[serde(default)]
    upstream: Option<String>,
    #[serde(default)]
    oauth_token: Option<String>,
    /// Path to a file containing the token (alternative to MAXMUX_OAUTH_TOKEN)
    #[serde(default)]
    oauth_token_file: Option<PathBuf>,
    #[serde(default)]
    virtual_keys: Vec<String>,
    #[serde(default = "default_connect_timeout")]
    connect_timeout_secs: u64,
    #[serde(default)]
    read_timeout_secs: Option<u64>,
    #[serde(default = "default_max_connections")]
    max_connections: usize,
    #[serde(default)]
    metrics_port: Option<u16>,
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_max_connections() -> usize {
    1000
}

/// Resolved, validated configuration. Immutable for the life of the process.
#[derive(Debug)]
pub struct Config {
    pub port: u16,
    pub upstream: Url,
    pub oauth_token: Secret<String>,
    /// Accepted virtual keys in file order; duplicates are harmless.
    pub virtual_keys: Vec<String>,
    pub connect_timeout: Duration,
    /// Per-read idle timeout. `None` keeps the transport default (no limit),
    /// which lets long event streams stay open.
    pub read_timeout: Option<Duration>,
    pub max_connections: usize,
    /// Port of the admin listener serving /health and /metrics.
    pub metrics_port: Option<u16>,
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    /// Parse and validate configuration from TOML text.
    pub fn from_toml(contents: &str) -> common::Result<Self> {
        let file: FileConfig = toml::from_str(contents)?;

        let upstream = parse_upstream(
            file.upstream
                .as_deref()
                .filter(|u| !u.is_empty())
                .unwrap_or(DEFAULT_UPSTREAM),
        )?;

        if file.connect_timeout_secs == 0 {
            return Err(common::Error::Config(
                "connect_timeout_secs must be greater than 0".into(),
            ));
        }

        if file.read_timeout_secs == Some(0) {
            return Err(common::Error::Config(
                "read_timeout_secs must be greater than 0 when set".into(),
            ));
        }

        if file.max_connections == 0 {
            return Err(common::Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }

        let oauth_token = resolve_token(file.oauth_token, file.oauth_token_file.as_deref())?
            .ok_or_else(|| {
                common::Error::Config(format!(
                    "oauth_token is required (set it in the config file, oauth_token_file, or {TOKEN_ENV})"
                ))
            })?;

        Ok(Config {
            port: file.port.filter(|p| *p != 0).unwrap_or(DEFAULT_PORT),
            upstream,
            oauth_token,
            virtual_keys: file.virtual_keys,
            connect_timeout: Duration::from_secs(file.connect_timeout_secs),
            read_timeout: file.read_timeout_secs.map(Duration::from_secs),
            max_connections: file.max_connections,
            metrics_port: file.metrics_port,
        })
    }

    /// Address of the proxy listener (all interfaces).
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], self.port))
    }

    /// Address of the admin listener, when enabled.
    pub fn metrics_addr(&self) -> Option<SocketAddr> {
        self.metrics_port
            .map(|port| SocketAddr::from(([0, 0, 0, 0], port)))
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from(DEFAULT_CONFIG_FILE)
    }
}

/// Upstream must be an absolute http(s) URL with a host.
fn parse_upstream(raw: &str) -> common::Result<Url> {
    let url = Url::parse(raw)
        .map_err(|e| common::Error::Config(format!("invalid upstream URL {raw:?}: {e}")))?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(common::Error::Config(format!(
            "upstream must use http:// or https://, got: {raw}"
        )));
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err(common::Error::Config(format!(
            "upstream must include a host, got: {raw}"
        )));
    }
    Ok(url)
}

/// Token resolution: env var, then token file, then inline value.
fn resolve_token(
    inline: Option<String>,
    token_file: Option<&Path>,
) -> common::Result<Option<Secret<String>>> {
    if let Ok(token) = std::env::var(TOKEN_ENV)
        && !token.trim().is_empty()
    {
        return Ok(Some(Secret::new(token.trim().to_owned())));
    }

    if let Some(path) = token_file {
        let token = std::fs::read_to_string(path).map_err(|e| {
            common::Error::Config(format!(
                "failed to read oauth_token_file {}: {e}",
                path.display()
            ))
        })?;
        let token = token.trim().to_owned();
        if !token.is_empty() {
            return Ok(Some(Secret::new(token)));
        }
    }

    Ok(inline.filter(|t| !t.is_empty()).map(Secret::new))
}
