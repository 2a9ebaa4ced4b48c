//! Node Configuration Module
//!
//! Loads a node's configuration from a TOML file with environment overrides.
//! Environment variables use the `CASCADE_` prefix and `__` between nested
//! keys, e.g. `CASCADE_BALANCING__SMOOTHING=0.25`.

use anyhow::{bail, Context, Result};
use config_crate::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

/// Environment variable prefix for overrides
pub const ENV_PREFIX: &str = "CASCADE";

/// Main node configuration structure
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct NodeConfig {
    /// Name reported to the chief during the identity handshake
    pub name: String,

    /// Address to accept children on
    pub listen: Option<SocketAddr>,

    /// Chief to report to; `None` makes this node the root
    pub chief: Option<SocketAddr>,

    /// Children that are themselves servers and must be dialed
    pub children: Vec<SocketAddr>,

    pub transport: TransportSettings,

    pub balancing: BalancingConfig,
}

/// Connection parameters
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct TransportSettings {
    pub connect_timeout_ms: u64,
    pub max_message_size: usize,
}

/// Parallel dispatch parameters
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct BalancingConfig {
    /// EMA weight given to the latest round's measured rate
    pub smoothing: f64,
    /// Performance assigned to a System that has no measurements yet
    pub initial_performance: f64,
    /// Invoke history entries retained per System
    pub history_limit: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: "node".to_string(),
            listen: None,
            chief: None,
            children: Vec::new(),
            transport: TransportSettings::default(),
            balancing: BalancingConfig::default(),
        }
    }
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5_000,
            max_message_size: 16 * 1024 * 1024,
        }
    }
}

impl Default for BalancingConfig {
    fn default() -> Self {
        Self {
            smoothing: 0.5,
            initial_performance: 1.0,
            history_limit: 256,
        }
    }
}

impl TransportSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl NodeConfig {
    /// Load configuration from a file with `CASCADE_` environment overrides
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Self::load_with_prefix(path.as_ref(), ENV_PREFIX)
    }

    fn load_with_prefix(path: &Path, prefix: &str) -> Result<Self> {
        info!("Loading node config: {:?}", path);

        let config = Config::builder()
            .add_source(File::from(path).required(true))
            .add_source(
                Environment::with_prefix(prefix)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build configuration")?;

        let node: NodeConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;
        node.validate()
            .with_context(|| format!("Invalid configuration in {}", path.display()))?;

        debug!(name = %node.name, listen = ?node.listen, chief = ?node.chief, "Node config loaded");
        Ok(node)
    }

    /// Parse configuration from TOML text without environment overrides
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config = Config::builder()
            .add_source(File::from_str(content, FileFormat::Toml))
            .build()
            .context("Failed to parse configuration")?;
        let node: NodeConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;
        node.validate()?;
        Ok(node)
    }

    /// Render as TOML, e.g. to write a starter file
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration")
    }

    /// Check value ranges the loader cannot express
    pub fn validate(&self) -> Result<()> {
        let smoothing = self.balancing.smoothing;
        if !(smoothing > 0.0 && smoothing <= 1.0) {
            bail!("balancing.smoothing must be in (0, 1], got {}", smoothing);
        }
        let initial = self.balancing.initial_performance;
        if !(initial.is_finite() && initial > 0.0) {
            bail!("balancing.initial_performance must be positive, got {}", initial);
        }
        if self.transport.max_message_size == 0 {
            bail!("transport.max_message_size must be non-zero");
        }
        if self.name.is_empty() {
            bail!("name must not be empty");
        }
        Ok(())
    }

    /// A node without a chief is the root of its tree
    pub fn is_root(&self) -> bool {
        self.chief.is_none()
    }
}
