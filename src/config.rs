//! Node configuration.
//!
//! Settings are read from a TOML file; every key is optional and falls back to the value of
//! [`NodeConfig::default`]. A missing file is not an error.
//!
//! ```toml
//! node_id = 7
//! listen = "0.0.0.0:47500"
//! workers = 16
//! window_size = 8192
//! deployment = "enabled"
//! loader_version = 3
//! default_page_size = 1024
//! ```
use std::{
    fs, io,
    net::{Ipv4Addr, SocketAddr},
    path::{Path, PathBuf},
};

use log::{debug, info};
use serde::Deserialize;
use thiserror::Error;

use crate::{
    marshal::{DeploymentMode, Marshaller, NodeId},
    protocol::DEFAULT_WINDOW,
};

pub const DEFAULT_PORT: u16 = 47500;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path:?}: {source}")]
    Io { path: PathBuf, source: io::Error },

    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid setting '{key}': {reason}")]
    Invalid { key: &'static str, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NodeConfig {
    pub node_id: NodeId,
    pub listen: SocketAddr,
    pub workers: usize,
    pub window_size: usize,
    pub deployment: DeploymentMode,
    pub loader_version: u64,
    pub default_page_size: i32,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: NodeId(1),
            listen: SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_PORT)),
            workers: 15,
            window_size: DEFAULT_WINDOW,
            deployment: DeploymentMode::Local,
            loader_version: 0,
            default_page_size: 1024,
        }
    }
}

impl NodeConfig {
    /// Loads `path`, or the defaults when it does not exist.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("no config at {path:?}, using defaults");
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.to_owned(),
                    source,
                });
            }
        };

        let config = Self::parse(&text)?;
        info!("loaded config from {path:?}");
        Ok(config)
    }

    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::Invalid {
                key: "workers",
                reason: "at least one worker is required".into(),
            });
        }
        if self.window_size < 16 {
            return Err(ConfigError::Invalid {
                key: "window_size",
                reason: format!("{} bytes is too small", self.window_size),
            });
        }
        if self.default_page_size <= 0 {
            return Err(ConfigError::Invalid {
                key: "default_page_size",
                reason: "must be positive".into(),
            });
        }
        Ok(())
    }

    /// Marshaller for this node's outbound messages.
    pub fn marshaller(&self) -> Marshaller {
        Marshaller::new(self.deployment, self.node_id, self.loader_version)
    }
}
