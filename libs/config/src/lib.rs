//! # Cascade Node Configuration
//!
//! Describes where a node sits in the tree: the address it listens on for
//! children, the chief it reports to, children it dials itself, and the
//! transport and load-balancing parameters it runs with.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use node_config::NodeConfig;
//!
//! let config = NodeConfig::load("config/node.toml").unwrap();
//! println!("{} listens on {:?}", config.name, config.listen);
//! ```

pub mod node;

// Re-export commonly used types
pub use node::{BalancingConfig, NodeConfig, TransportSettings, ENV_PREFIX};
