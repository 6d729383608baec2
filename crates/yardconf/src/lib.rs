//! Configuration loading for switchyard.
//!
//! The config file is JSON (the wire format of the whole system) and is
//! discovered in layered locations, later wins:
//!
//! 1. `/etc/switchyard/config.json` (system)
//! 2. `~/.config/switchyard/config.json` (user)
//! 3. `./switchyard.json` (local override)
//! 4. Explicit `--config` path
//! 5. Environment variables (`SWITCHYARD_*`)
//!
//! Validation happens once after loading and is fatal: a component is never
//! instantiated from a config that failed [`SwitchyardConfig::validate`].
//!
//! # Example config
//!
//! ```json
//! {
//!   "client_id": "gateway-01",
//!   "broker_host": "broker.lan",
//!   "broker_port": 8883,
//!   "use_tls": true,
//!   "ca_file": "/etc/switchyard/ca.pem",
//!   "heartbeat": { "topic": "sys/heartbeat", "interval_seconds": 30, "payload": "ok" },
//!   "relay": {
//!     "enabled": true,
//!     "relay_prefix": "filtered",
//!     "brokers": [ { "name": "edge", "broker_host": "10.0.0.2", "broker_port": 1883, "client_id": "relay-edge" } ],
//!     "rules": [ { "source_broker": "edge", "destination_broker": "core",
//!                  "source_topic_pattern": "smart/sensors/+",
//!                  "destination_topic_template": "filtered/sensors/+" } ]
//!   },
//!   "json_added_subs": ["a/+", "b/#"]
//! }
//! ```

pub mod loader;
pub mod model;

pub use loader::{discover_config_files, ConfigSources};
pub use model::{
    BrokerConfig, FilterSpec, HeartbeatConfig, NamedBroker, RelayConfig, RelayRuleConfig,
    SwitchyardConfig,
};

use std::path::PathBuf;
use thiserror::Error;

/// Configuration loading and validation errors. Fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("invalid config: {0}")]
    Invalid(String),
}

impl ConfigError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid(message.into())
    }
}
