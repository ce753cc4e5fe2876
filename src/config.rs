//! Configuration loading.
//!
//! The config file is JSON with one section per run mode, the layout the
//! bot has always shipped:
//!
//! ```json
//! {
//!     "production": {
//!         "node": [
//!             { "host": "10.0.0.5", "port": 8000, "password": "...", "region": "eu" }
//!         ]
//!     },
//!     "develop": {
//!         "node": [{ "local": true }]
//!     }
//! }
//! ```

use serde::Deserialize;
use std::path::Path;

use crate::{AudioError, NodeConfig};

/// One mode section of the config file.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct Config {
    /// Audio node endpoints, in registration order.
    #[serde(rename = "node", default)]
    pub nodes: Vec<NodeEntry>,
}

/// One configured node endpoint.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct NodeEntry {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    /// Launch the node service locally instead of connecting out.
    #[serde(default)]
    pub local: bool,
}

impl NodeEntry {
    /// An entry is local when it says so, or when it has no endpoint fields
    /// at all.
    #[must_use]
    pub fn is_local(&self) -> bool {
        self.local || (self.host.is_none() && self.port.is_none() && self.password.is_none())
    }

    #[must_use]
    pub fn to_node_config(&self) -> NodeConfig {
        NodeConfig {
            host: self.host.clone(),
            port: self.port,
            password: self.password.clone(),
            region: self.region.clone(),
            ..Default::default()
        }
    }
}

impl Config {
    /// Load the section for `mode` from a JSON config file.
    ///
    /// # Errors
    /// Fails on unreadable files, invalid JSON, or a missing mode section.
    pub fn load(path: impl AsRef<Path>, mode: &str) -> Result<Self, AudioError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_str(&raw, mode)
    }

    /// Parse the section for `mode` out of a JSON document.
    ///
    /// # Errors
    /// Fails on invalid JSON or a missing mode section.
    pub fn from_str(raw: &str, mode: &str) -> Result<Self, AudioError> {
        let document: serde_json::Value = serde_json::from_str(raw)?;
        let section = document
            .get(mode)
            .ok_or_else(|| AudioError::InvalidArgument(format!("no config section `{mode}`")))?;
        Ok(serde_json::from_value(section.clone())?)
    }
}
