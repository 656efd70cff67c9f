use std::env;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;

/// Session cap applied when the configuration document does not set one.
pub const DEFAULT_MAX_CONNECTIONS: usize = 32;

#[derive(Debug, Clone)]
/// Application configuration assembled from CLI flags, the optional JSON
/// configuration document, and environment variables.
pub struct Config {
    /// Address the HTTP/WebSocket server listens on.
    pub addr: SocketAddr,
    /// Hard cap on concurrent peer sessions. Zero admits nobody.
    pub max_connections: usize,
    /// Logging level (e.g., "info", "debug").
    pub rust_log: String,
}

/// On-disk shape of the configuration document.
#[derive(Debug, Default, serde::Deserialize)]
struct ConfigDocument {
    #[serde(rename = "maxConnections")]
    max_connections: Option<u64>,
}

#[derive(Debug)]
/// Errors that can occur during configuration loading.
pub enum ConfigError {
    /// The configuration file could not be read.
    Unreadable(String, std::io::Error),
    /// The configuration file is not a valid JSON document.
    Malformed(String, serde_json::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Unreadable(path, err) => {
                write!(f, "failed to read config file {}: {}", path, err)
            }
            ConfigError::Malformed(path, err) => {
                write!(f, "config file {} is not valid JSON: {}", path, err)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Loads the configuration: `addr` comes from the CLI, the JSON document
/// supplies `maxConnections`, `RUST_LOG` defaults to "info". A missing
/// `path` means the built-in defaults apply.
pub fn load(addr: SocketAddr, path: Option<&Path>) -> Result<Config, ConfigError> {
    let doc = match path {
        Some(p) => {
            let raw = fs::read_to_string(p)
                .map_err(|e| ConfigError::Unreadable(p.display().to_string(), e))?;
            serde_json::from_str::<ConfigDocument>(&raw)
                .map_err(|e| ConfigError::Malformed(p.display().to_string(), e))?
        }
        None => ConfigDocument::default(),
    };

    let rust_log = env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());

    Ok(Config {
        addr,
        max_connections: doc
            .max_connections
            .map(|n| n as usize)
            .unwrap_or(DEFAULT_MAX_CONNECTIONS),
        rust_log,
    })
}
