// Application configuration, loaded from environment variables, CLI flags and the static
// JSON config that lists the known servers.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Process configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Static config file listing servers and display options.
    pub static_config: PathBuf,
    /// Marker catalog file.
    pub catalog: PathBuf,
    /// Server to connect to at startup. Defaults to the first configured server.
    pub initial_server: Option<String>,
    /// Port of the control API.
    pub port: u16,
    /// Periodic snapshot refresh interval, if any.
    pub refresh_interval: Option<Duration>,
}

impl Config {
    /// Load configuration from environment variables and CLI arguments.
    ///
    /// Environment variables:
    /// - `BLIPMAP_CONFIG` - static config path (default: `config/static.json`)
    /// - `BLIPMAP_CATALOG` - marker catalog path (default: `config/markers.json`)
    /// - `BLIPMAP_SERVER` - server to connect to at startup
    /// - `BLIPMAP_REFRESH_SECS` - snapshot refresh interval in seconds (0 disables)
    /// - `PORT` - control API port (default: 4000)
    ///
    /// CLI flags `--config`, `--catalog`, `--server`, `--refresh-secs` and `--port`
    /// take precedence over the matching variables.
    pub fn load() -> Self {
        let args: Vec<String> = std::env::args().collect();
        let lookup = |flag: &str, var: &str| {
            Self::parse_cli_value(&args, flag).or_else(|| std::env::var(var).ok())
        };

        let static_config = lookup("--config", "BLIPMAP_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("config/static.json"));

        let catalog = lookup("--catalog", "BLIPMAP_CATALOG")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("config/markers.json"));

        let initial_server = lookup("--server", "BLIPMAP_SERVER");

        let port = lookup("--port", "PORT")
            .and_then(|v| v.parse().ok())
            .unwrap_or(4000);

        let refresh_interval = lookup("--refresh-secs", "BLIPMAP_REFRESH_SECS")
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|&secs| secs > 0)
            .map(Duration::from_secs);

        Config {
            static_config,
            catalog,
            initial_server,
            port,
            refresh_interval,
        }
    }

    /// Parse a CLI flag value like `--port 8080`.
    fn parse_cli_value(args: &[String], flag: &str) -> Option<String> {
        args.windows(2).find_map(|pair| {
            if pair[0] == flag {
                Some(pair[1].clone())
            } else {
                None
            }
        })
    }
}

/// Reverse-proxy overrides for a server's derived URLs.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ReverseProxy {
    #[serde(default)]
    pub blips: Option<String>,
    #[serde(default)]
    pub socket: Option<String>,
}

/// One entry of the known-servers map.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    pub ip: String,
    pub socket_port: u16,
    #[serde(default)]
    pub reverse_proxy: Option<ReverseProxy>,
}

impl ServerConfig {
    /// URL of the bulk blip snapshot.
    pub fn blips_url(&self) -> String {
        match self.reverse_proxy.as_ref().and_then(|p| p.blips.as_ref()) {
            Some(url) => url.clone(),
            None => format!("http://{}:{}/blips.json", self.ip, self.socket_port),
        }
    }

    /// URL of the live feed.
    pub fn socket_url(&self) -> String {
        match self.reverse_proxy.as_ref().and_then(|p| p.socket.as_ref()) {
            Some(url) => url.clone(),
            None => format!("ws://{}:{}", self.ip, self.socket_port),
        }
    }
}

fn default_true() -> bool {
    true
}

/// Static JSON configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StaticConfig {
    pub servers: BTreeMap<String, ServerConfig>,
    /// Put player markers in a cluster layer.
    #[serde(default = "default_true")]
    pub group_players: bool,
}

impl StaticConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&contents)
    }
}
