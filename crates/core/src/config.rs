//! cadex configuration file parsing (cadex.toml)

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::index::{IndexAgent, IndexOptions};
use crate::pattern::{Pattern, PatternMatcher};

/// Config file name
pub const CONFIG_FILE: &str = "cadex.toml";

/// cadex node configuration
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CadexConfig {
    /// Identifier recorded in every location this node indexes
    pub device: String,
    /// Directories to index
    pub roots: Vec<PathBuf>,
    /// Honour .gitignore files while walking
    pub git_ignore: bool,
    /// Follow symbolic links while walking
    pub follow_links: bool,
    /// Rehash files the baseline claims are unchanged
    pub verify_unchanged: bool,
    /// Ordered include/exclude rules
    #[serde(rename = "pattern")]
    pub patterns: Vec<Pattern>,
    /// Remote index service endpoint
    pub service: ServiceConfig,
    /// File transfer endpoint
    pub transfer: TransferConfig,
}

impl Default for CadexConfig {
    fn default() -> Self {
        Self {
            device: default_device(),
            roots: Vec::new(),
            git_ignore: false,
            follow_links: false,
            verify_unchanged: false,
            patterns: Vec::new(),
            service: ServiceConfig::default(),
            transfer: TransferConfig::default(),
        }
    }
}

/// Remote index service settings
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServiceConfig {
    /// Address to bind
    pub bind: IpAddr,
    /// TCP port; there is no built-in default
    pub port: Option<u16>,
    /// Per-call timeout for clients
    pub timeout_secs: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: None,
            timeout_secs: 60,
        }
    }
}

impl ServiceConfig {
    /// Address to listen on
    ///
    /// # Errors
    /// Returns a configuration error if no port was configured
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        listen_addr(self.bind, self.port, "service")
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// File transfer receiver settings
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransferConfig {
    /// Address to bind
    pub bind: IpAddr,
    /// TCP port; there is no built-in default
    pub port: Option<u16>,
    /// Where incoming files are spooled
    pub staging_dir: PathBuf,
    /// Delivery queue capacity
    pub queue_capacity: usize,
    /// Read/write chunk size for file payloads
    pub chunk_size: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: None,
            staging_dir: PathBuf::from(".cadex/incoming"),
            queue_capacity: 64,
            chunk_size: 64 * 1024,
        }
    }
}

impl TransferConfig {
    /// Address to listen on
    ///
    /// # Errors
    /// Returns a configuration error if no port was configured
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        listen_addr(self.bind, self.port, "transfer")
    }
}

fn listen_addr(bind: IpAddr, port: Option<u16>, section: &str) -> Result<SocketAddr> {
    port.map(|port| SocketAddr::new(bind, port))
        .ok_or_else(|| Error::config(format!("no port configured for [{section}]")))
}

fn default_device() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.trim().is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

impl CadexConfig {
    /// Load config from a directory.
    ///
    /// Returns default config if cadex.toml doesn't exist.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be parsed or validated.
    pub fn load(dir: &Path) -> Result<Self> {
        let config_path = dir.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load_file(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load a specific config file
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, parsed or validated
    pub fn load_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| Error::path(path, e))?;
        Self::parse(&content).map_err(|e| match e {
            Error::Configuration(msg) => Error::config(format!("{}: {msg}", path.display())),
            other => other,
        })
    }

    /// Parse and validate TOML text
    ///
    /// # Errors
    /// Returns a configuration error on syntax errors or invalid values
    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).map_err(|e| Error::config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check values that the type system cannot
    ///
    /// # Errors
    /// Returns a configuration error describing the first bad value
    pub fn validate(&self) -> Result<()> {
        if self.device.trim().is_empty() {
            return Err(Error::config("device must not be empty"));
        }
        if self.transfer.queue_capacity == 0 {
            return Err(Error::config("transfer.queue_capacity must be positive"));
        }
        if self.transfer.chunk_size == 0 {
            return Err(Error::config("transfer.chunk_size must be positive"));
        }
        PatternMatcher::from_patterns(&self.patterns)?;
        Ok(())
    }

    #[must_use]
    pub fn index_options(&self) -> IndexOptions {
        IndexOptions {
            git_ignore: self.git_ignore,
            follow_links: self.follow_links,
            verify_unchanged: self.verify_unchanged,
        }
    }

    /// Build an index agent over the configured roots
    #[must_use]
    pub fn index_agent(&self) -> IndexAgent {
        self.roots
            .iter()
            .fold(IndexAgent::new(&self.device), |agent, root| agent.root(root))
            .options(self.index_options())
    }
}
