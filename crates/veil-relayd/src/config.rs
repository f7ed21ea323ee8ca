//! Daemon configuration.
//!
//! Loaded from a TOML file; every section and field has a default so a
//! minimal config only names the identifier, data directory, and listen
//! addresses. Validation failures are fatal at startup.

use std::net::SocketAddr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::Error;

/// Recognized log levels, in decreasing severity.
pub const LOG_LEVELS: &[&str] = &["ERROR", "WARNING", "NOTICE", "INFO", "DEBUG"];

/// Complete daemon configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Server settings.
    #[serde(default)]
    pub server: ServerConfig,
    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Debug settings.
    #[serde(default)]
    pub debug: DebugConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Node identifier; must match this node's name in the consensus.
    #[serde(default)]
    pub identifier: String,
    /// Data directory for keys and mix key databases.
    #[serde(default)]
    pub data_dir: PathBuf,
    /// Addresses to listen on, as `host:port` strings.
    #[serde(default)]
    pub addresses: Vec<String>,
    /// Whether this node terminates client sessions (is a provider).
    #[serde(default)]
    pub is_provider: bool,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Suppress all log output.
    #[serde(default)]
    pub disable: bool,
    /// Log file path. Empty = stderr; relative = under the data dir.
    #[serde(default)]
    pub file: String,
    /// Log level: ERROR | WARNING | NOTICE | INFO | DEBUG.
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// Debug configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebugConfig {
    /// Number of Sphinx unwrap workers.
    #[serde(default = "default_num_sphinx_workers")]
    pub num_sphinx_workers: usize,
    /// Generate and persist all keys, then exit successfully.
    #[serde(default)]
    pub generate_only: bool,
    /// Accept any peer as a mix, bypassing the PKI. Unsafe.
    #[serde(default)]
    pub disable_mix_authentication: bool,
    /// Ingress queue high-water mark; packets beyond it are shed.
    #[serde(default = "default_ingress_queue_depth")]
    pub ingress_queue_depth: usize,
}

fn default_log_level() -> String {
    "INFO".to_string()
}

fn default_num_sphinx_workers() -> usize {
    2
}

fn default_ingress_queue_depth() -> usize {
    1024
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            disable: false,
            file: String::new(),
            level: default_log_level(),
        }
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            num_sphinx_workers: default_num_sphinx_workers(),
            generate_only: false,
            disable_mix_authentication: false,
            ingress_queue_depth: default_ingress_queue_depth(),
        }
    }
}

impl DebugConfig {
    /// Whether any of the unsafe debug options are set.
    pub fn is_unsafe(&self) -> bool {
        self.disable_mix_authentication
    }
}

impl Config {
    /// Parse a config from TOML text and validate it.
    pub fn parse(text: &str) -> Result<Self, Error> {
        let cfg: Config =
            toml::from_str(text).map_err(|e| Error::Config(format!("TOML parse: {e}")))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load a config from a file and validate it.
    pub fn load(path: &std::path::Path) -> Result<Self, Error> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("read {}: {e}", path.display())))?;
        Self::parse(&text)
    }

    /// Validate field constraints. Fatal at startup on failure.
    pub fn validate(&self) -> Result<(), Error> {
        if self.server.identifier.is_empty() {
            return Err(Error::Config("server.identifier must be set".to_string()));
        }
        if self.server.data_dir.as_os_str().is_empty() {
            return Err(Error::Config("server.data_dir must be set".to_string()));
        }
        if self.server.addresses.is_empty() {
            return Err(Error::Config(
                "server.addresses must list at least one address".to_string(),
            ));
        }
        for addr in &self.server.addresses {
            addr.parse::<SocketAddr>().map_err(|e| {
                Error::Config(format!("server.addresses entry '{addr}' invalid: {e}"))
            })?;
        }
        if self.debug.num_sphinx_workers == 0 {
            return Err(Error::Config(
                "debug.num_sphinx_workers must be >= 1".to_string(),
            ));
        }
        if self.debug.ingress_queue_depth == 0 {
            return Err(Error::Config(
                "debug.ingress_queue_depth must be >= 1".to_string(),
            ));
        }
        if !LOG_LEVELS.contains(&self.logging.level.as_str()) {
            return Err(Error::Config(format!(
                "logging.level '{}' not one of {LOG_LEVELS:?}",
                self.logging.level,
            )));
        }
        Ok(())
    }

    /// The parsed listen addresses. Only valid after [`Config::validate`].
    pub fn listen_addresses(&self) -> Vec<SocketAddr> {
        self.server
            .addresses
            .iter()
            .filter_map(|a| a.parse().ok())
            .collect()
    }

    /// Map the configured level onto a `tracing` directive.
    ///
    /// NOTICE has no `tracing` equivalent and maps onto `info`.
    pub fn tracing_directive(&self) -> &'static str {
        match self.logging.level.as_str() {
            "ERROR" => "error",
            "WARNING" => "warn",
            "NOTICE" | "INFO" => "info",
            "DEBUG" => "debug",
            _ => "info",
        }
    }
}
