// src/config.rs

//! Node-local configuration: loading, environment overrides, and validation.
//!
//! This is the file a single node is started with. The replicated,
//! cluster-wide configuration revision (`core::meta::ClusterConfig`) is
//! seeded from the `[cluster]` section on the very first primary and owned
//! by the control plane from then on.

use crate::core::meta::{ClusterConfig, NodeKind, Snode};
use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use tracing::info;

/// Environment override for the primary endpoint; wins over any persisted
/// cluster map at startup.
pub const ENV_PRIMARY_EP: &str = "OPAL_PRIMARY_EP";
/// Client-side default cluster endpoint, also tried as a join candidate.
pub const ENV_ENDPOINT: &str = "OPAL_ENDPOINT";
/// Path to a bearer token attached to intra-cluster requests.
pub const ENV_AUTHN_TOKEN_FILE: &str = "OPAL_AUTHN_TOKEN_FILE";

fn default_log_level() -> String {
    "info".to_string()
}
fn default_data_dir() -> String {
    "opalstore_data".to_string()
}

/// The `[node]` section: identity and role.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct NodeSection {
    /// Stable node ID; minted at first start when empty.
    #[serde(default)]
    pub id: String,
    pub role: NodeKind,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    /// Expected number of targets during primary startup. Zero means "do not
    /// wait for a particular count".
    #[serde(default)]
    pub ntargets: usize,
}

/// The `[net]` section: the three endpoints this node announces.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct NetSection {
    pub public_url: String,
    /// Defaults to `public_url` when empty.
    #[serde(default)]
    pub control_url: String,
    /// Defaults to `public_url` when empty.
    #[serde(default)]
    pub data_url: String,
}

/// A raw representation of the config file before validation and resolution.
#[derive(Deserialize)]
struct RawConfig {
    node: NodeSection,
    net: NetSection,
    #[serde(default = "default_log_level")]
    log_level: String,
    #[serde(default)]
    cluster: ClusterConfig,
}

/// The final, validated node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub node: NodeSection,
    pub net: NetSection,
    pub log_level: String,
    /// Seed values for the replicated cluster configuration. Once a cluster
    /// exists, the metasynced revision supersedes this section.
    pub cluster: ClusterConfig,

    // --- resolved from the environment, never from the file ---
    #[serde(skip)]
    pub primary_ep: Option<String>,
    #[serde(skip)]
    pub endpoint: Option<String>,
    #[serde(skip)]
    pub auth_token: Option<String>,
}

impl NodeConfig {
    /// Creates a new `NodeConfig` by reading and parsing a TOML file, then
    /// applying environment overrides.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at '{path}'"))?;
        let raw: RawConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse TOML from '{path}'"))?;

        let mut config = NodeConfig {
            node: raw.node,
            net: raw.net,
            log_level: raw.log_level,
            cluster: raw.cluster,
            primary_ep: None,
            endpoint: None,
            auth_token: None,
        };
        if config.net.control_url.is_empty() {
            config.net.control_url = config.net.public_url.clone();
        }
        if config.net.data_url.is_empty() {
            config.net.data_url = config.net.public_url.clone();
        }
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Reads the recognized environment variables into the config.
    pub fn apply_env(&mut self) -> Result<()> {
        if let Ok(ep) = std::env::var(ENV_PRIMARY_EP) {
            if !ep.is_empty() {
                info!("{} override: {}", ENV_PRIMARY_EP, ep);
                self.primary_ep = Some(ep);
            }
        }
        if let Ok(ep) = std::env::var(ENV_ENDPOINT) {
            if !ep.is_empty() {
                self.endpoint = Some(ep);
            }
        }
        if let Ok(token_file) = std::env::var(ENV_AUTHN_TOKEN_FILE) {
            if !token_file.is_empty() {
                let token = fs::read_to_string(&token_file)
                    .with_context(|| format!("Failed to read token file '{token_file}'"))?;
                self.auth_token = Some(token.trim().to_string());
            }
        }
        Ok(())
    }

    /// Validates the resolved configuration to ensure logical consistency.
    pub fn validate(&self) -> Result<()> {
        if self.net.public_url.is_empty() {
            return Err(anyhow!("net.public_url cannot be empty"));
        }
        for (name, u) in [
            ("net.public_url", &self.net.public_url),
            ("net.control_url", &self.net.control_url),
            ("net.data_url", &self.net.data_url),
        ] {
            url::Url::parse(u).with_context(|| format!("{name} is not a valid URL: '{u}'"))?;
        }
        if self.node.data_dir.trim().is_empty() {
            return Err(anyhow!("node.data_dir cannot be empty"));
        }
        if self.cluster.ic.count == 0 {
            return Err(anyhow!("cluster.ic.count cannot be 0"));
        }
        if self.cluster.keepalive.interval.is_zero() {
            return Err(anyhow!("cluster.keepalive.interval cannot be 0"));
        }
        if self.cluster.keepalive.retries == 0 {
            return Err(anyhow!("cluster.keepalive.retries cannot be 0"));
        }
        if self.cluster.timeout.startup < self.cluster.timeout.cplane_operation {
            return Err(anyhow!(
                "cluster.timeout.startup must not be shorter than cluster.timeout.cplane_operation"
            ));
        }
        Ok(())
    }

    pub fn data_dir(&self) -> PathBuf {
        PathBuf::from(&self.node.data_dir)
    }

    /// Builds this node's descriptor, minting an ID when the config does not
    /// pin one.
    pub fn snode(&self) -> Result<Snode> {
        let id = if self.node.id.is_empty() {
            let mut raw = [0u8; 8];
            getrandom::fill(&mut raw).map_err(|e| anyhow!("failed to mint node ID: {e}"))?;
            hex::encode(raw)
        } else {
            self.node.id.clone()
        };
        Ok(Snode {
            id,
            kind: self.node.role,
            public_url: self.net.public_url.clone(),
            control_url: self.net.control_url.clone(),
            data_url: self.net.data_url.clone(),
            flags_raw: 0,
        })
    }

    /// True when `url` names one of this node's own endpoints.
    pub fn is_self_url(&self, url: &str) -> bool {
        let trimmed = url.trim_end_matches('/');
        [&self.net.public_url, &self.net.control_url, &self.net.data_url]
            .iter()
            .any(|u| u.trim_end_matches('/') == trimmed)
    }
}
