//! Kiln configuration tree.
//!
//! All sections deserialize from a single JSON document and fall back to
//! defaults field by field, so a minimal config file only needs to name the
//! endpoints it cares about.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

use crate::error::Result;

/// Top-level platform configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub net: NetConfig,
    pub core: CoreConfig,
    pub profile: Profile,
    pub manifest: Manifest,
    pub cluster: ClusterConfig,
}

impl Config {
    /// Loads a configuration from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}

/// Network endpoints for the router and publisher channels.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetConfig {
    /// Bind endpoints for the request router.
    pub listen: Vec<String>,
    /// Bind endpoints for the event publisher.
    pub publish: Vec<String>,
    /// Per-subscriber high-water mark on the publisher. Messages beyond
    /// this bound are dropped on the sender side.
    pub watermark: usize,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            listen: vec!["127.0.0.1:5000".to_string()],
            publish: vec!["127.0.0.1:5001".to_string()],
            watermark: 1000,
        }
    }
}

/// Request validation and history settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Minimum accepted protocol version.
    pub protocol: u32,
    /// Per-driver history buffer capacity. Zero disables history.
    pub history_depth: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            protocol: 1,
            history_depth: 0,
        }
    }
}

/// Worker pool profile shared by all engines.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Profile {
    /// Seconds a freshly spawned slave may take to produce its first
    /// heartbeat.
    pub startup_timeout: f64,
    /// Seconds between inbound slave events before the slave is declared
    /// dead. A busy job's own timeout overrides this when positive.
    pub heartbeat_timeout: f64,
    /// Maximum number of slaves per engine.
    pub pool_limit: usize,
    /// Isolation backend selection, opaque to the core.
    pub isolate: IsolateConfig,
}

impl Default for Profile {
    fn default() -> Self {
        Self {
            startup_timeout: 10.0,
            heartbeat_timeout: 30.0,
            pool_limit: num_cpus::get(),
            isolate: IsolateConfig::default(),
        }
    }
}

/// Isolation backend configuration. The core only passes these through.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IsolateConfig {
    pub kind: String,
    pub args: HashMap<String, String>,
}

impl Default for IsolateConfig {
    fn default() -> Self {
        Self {
            kind: "process".to_string(),
            args: HashMap::new(),
        }
    }
}

/// Application manifest template.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Manifest {
    /// Worker image invoked by the isolation backend for every engine.
    pub slave: String,
}

impl Default for Manifest {
    fn default() -> Self {
        Self {
            slave: "kiln-slave".to_string(),
        }
    }
}

/// Static cluster membership for the peer-relinker.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Peer endpoints by label. The relinker attempts every endpoint of
    /// every label on each tick.
    pub endpoints: HashMap<String, Vec<String>>,
    /// Milliseconds between relink ticks.
    pub interval_ms: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            endpoints: HashMap::new(),
            interval_ms: 5000,
        }
    }
}
