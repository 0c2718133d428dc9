use log::Level;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::net::SocketAddr;
use std::path::Path;
use thiserror::Error;

const CONFIG_FILE_NAME: &str = "config.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("TOML deserialization error: {0}")]
    TomlDe(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    #[error("configuration validation failed: {0}")]
    Validation(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub node: NodeConfig,
    pub network: NetworkConfig,
    pub log: LogConfig,
    pub demo: Option<DemoConfig>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct NodeConfig {
    pub name: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub bind: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LogConfig {
    pub level: String,
}

/// Optional loopback transfer run at startup, as a self-check.
#[derive(Debug, Serialize, Deserialize)]
pub struct DemoConfig {
    pub payload_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node: NodeConfig::default(),
            network: NetworkConfig::default(),
            log: LogConfig::default(),
            demo: None,
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self { name: "opal".to_string() }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self { bind: "0.0.0.0:9009".to_string() }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self { level: "info".to_string() }
    }
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self { payload_size: 250_000 }
    }
}

impl Config {
    /// Loads `config.toml` from the working directory, writing the
    /// defaults there first if it does not exist yet. The generated file
    /// enables the demo transfer; deleting its `[demo]` section turns
    /// that off on later runs.
    pub fn load_or_create() -> Result<Self> {
        let path = Path::new(CONFIG_FILE_NAME);
        if !path.exists() {
            let config = Config { demo: Some(DemoConfig::default()), ..Config::default() };
            fs::write(path, toml::to_string_pretty(&config)?)?;
            return Ok(config);
        }
        let config: Config = toml::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        Ok(config)
    }

    pub fn bind_addr(&self) -> Result<SocketAddr> {
        self.network
            .bind
            .parse()
            .map_err(|_| ConfigError::Validation(format!("invalid bind address: {}", self.network.bind)))
    }

    pub fn log_level(&self) -> Level {
        match self.log.level.to_lowercase().as_str() {
            "error" => Level::Error,
            "warn" => Level::Warn,
            "debug" => Level::Debug,
            "trace" => Level::Trace,
            _ => Level::Info,
        }
    }

    fn validate(&self) -> Result<()> {
        self.bind_addr()?;
        if let Some(demo) = &self.demo {
            if demo.payload_size == 0 {
                return Err(ConfigError::Validation(
                    "demo payload_size must be nonzero".to_string(),
                ));
            }
        }
        Ok(())
    }
}
