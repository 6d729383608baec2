//! Config model: broker, heartbeat, relay pool, rules, filters.

use serde::{Deserialize, Serialize};

use crate::ConfigError;
use yardproto::TopicConfig;

/// One transport connection to an MQTT broker.
///
/// Immutable once a session starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Unique identifier for this session. Persists across reconnects.
    #[serde(default = "BrokerConfig::default_client_id")]
    pub client_id: String,

    #[serde(default = "BrokerConfig::default_broker_host")]
    pub broker_host: String,

    #[serde(default = "BrokerConfig::default_broker_port")]
    pub broker_port: u16,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    #[serde(default = "BrokerConfig::default_true")]
    pub clean_session: bool,

    /// Keepalive interval in seconds.
    #[serde(default = "BrokerConfig::default_keepalive")]
    pub keepalive: u64,

    /// Default publish/subscribe QoS (0-2).
    #[serde(default = "BrokerConfig::default_qos")]
    pub qos: u8,

    #[serde(default)]
    pub use_tls: bool,

    #[serde(default)]
    pub ca_file: Option<String>,

    #[serde(default)]
    pub cert_file: Option<String>,

    #[serde(default)]
    pub key_file: Option<String>,

    /// TLS version pin, e.g. "tlsv1.2". None means the rustls default.
    #[serde(default)]
    pub tls_version: Option<String>,

    /// Skip server certificate verification.
    #[serde(default)]
    pub tls_insecure: bool,

    /// Upper bound for the initial connect, in seconds.
    #[serde(default = "BrokerConfig::default_connect_timeout")]
    pub connect_timeout: u64,

    /// Default per-call upper bound, in seconds.
    #[serde(default = "BrokerConfig::default_message_timeout")]
    pub message_timeout: u64,

    #[serde(default = "BrokerConfig::default_true")]
    pub auto_reconnect: bool,

    /// Reconnect backoff floor, in seconds.
    #[serde(default = "BrokerConfig::default_reconnect_delay_min")]
    pub reconnect_delay_min: u64,

    /// Reconnect backoff ceiling, in seconds.
    #[serde(default = "BrokerConfig::default_reconnect_delay_max")]
    pub reconnect_delay_max: u64,

    #[serde(default)]
    pub heartbeat: Option<HeartbeatConfig>,
}

impl BrokerConfig {
    fn default_client_id() -> String {
        format!("switchyard-{}", std::process::id())
    }

    fn default_broker_host() -> String {
        "localhost".to_string()
    }

    fn default_broker_port() -> u16 {
        1883
    }

    fn default_true() -> bool {
        true
    }

    fn default_keepalive() -> u64 {
        60
    }

    fn default_qos() -> u8 {
        1
    }

    fn default_connect_timeout() -> u64 {
        30
    }

    fn default_message_timeout() -> u64 {
        30
    }

    fn default_reconnect_delay_min() -> u64 {
        1
    }

    fn default_reconnect_delay_max() -> u64 {
        60
    }

    /// Check the invariants that make a session constructible.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.broker_host.is_empty() {
            return Err(ConfigError::invalid("broker_host must not be empty"));
        }
        if self.broker_port == 0 {
            return Err(ConfigError::invalid("broker_port must be in 1..65535"));
        }
        if self.client_id.is_empty() {
            return Err(ConfigError::invalid("client_id must not be empty"));
        }
        if self.qos > 2 {
            return Err(ConfigError::invalid(format!(
                "qos must be 0-2, got {}",
                self.qos
            )));
        }
        if self.use_tls && !self.tls_insecure && self.ca_file.is_none() {
            return Err(ConfigError::invalid(
                "use_tls requires ca_file unless tls_insecure is set",
            ));
        }
        if self.cert_file.is_some() != self.key_file.is_some() {
            return Err(ConfigError::invalid(
                "cert_file and key_file must be provided together",
            ));
        }
        if self.reconnect_delay_min == 0 {
            return Err(ConfigError::invalid("reconnect_delay_min must be >= 1"));
        }
        if self.reconnect_delay_min > self.reconnect_delay_max {
            return Err(ConfigError::invalid(format!(
                "reconnect_delay_min ({}) exceeds reconnect_delay_max ({})",
                self.reconnect_delay_min, self.reconnect_delay_max
            )));
        }
        if let Some(hb) = &self.heartbeat {
            hb.validate()?;
        }
        Ok(())
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            client_id: Self::default_client_id(),
            broker_host: Self::default_broker_host(),
            broker_port: Self::default_broker_port(),
            username: None,
            password: None,
            clean_session: true,
            keepalive: Self::default_keepalive(),
            qos: Self::default_qos(),
            use_tls: false,
            ca_file: None,
            cert_file: None,
            key_file: None,
            tls_version: None,
            tls_insecure: false,
            connect_timeout: Self::default_connect_timeout(),
            message_timeout: Self::default_message_timeout(),
            auto_reconnect: true,
            reconnect_delay_min: Self::default_reconnect_delay_min(),
            reconnect_delay_max: Self::default_reconnect_delay_max(),
            heartbeat: None,
        }
    }
}

/// Periodic liveness publish, active only while connected.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    pub topic: String,

    #[serde(default = "HeartbeatConfig::default_interval_seconds")]
    pub interval_seconds: u64,

    #[serde(default = "HeartbeatConfig::default_payload")]
    pub payload: String,
}

impl HeartbeatConfig {
    fn default_interval_seconds() -> u64 {
        30
    }

    fn default_payload() -> String {
        "alive".to_string()
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.topic.is_empty() {
            return Err(ConfigError::invalid("heartbeat.topic must not be empty"));
        }
        if self.interval_seconds == 0 {
            return Err(ConfigError::invalid(
                "heartbeat.interval_seconds must be >= 1",
            ));
        }
        Ok(())
    }
}

/// A broker entry in the relay pool, addressed by name from rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamedBroker {
    pub name: String,

    #[serde(flatten)]
    pub broker: BrokerConfig,
}

/// One forwarding rule between two pool brokers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayRuleConfig {
    pub source_broker: String,
    pub destination_broker: String,

    /// MQTT filter matched against inbound topics on the source broker.
    pub source_topic_pattern: String,

    /// Destination topic template. May copy the source verbatim, prepend a
    /// prefix, or map `+`/`#` captures positionally.
    pub destination_topic_template: String,

    /// Extra prefix prepended to the rewritten topic. Also marks forwarded
    /// traffic for the loop guard.
    #[serde(default)]
    pub topic_prefix: Option<String>,

    #[serde(default = "RelayRuleConfig::default_qos")]
    pub qos: u8,

    #[serde(default)]
    pub bidirectional: bool,

    /// When true the rule runs the configured filter chain (and the
    /// readiness gate if `require_ready` is set there).
    #[serde(default)]
    pub conditional: bool,
}

impl RelayRuleConfig {
    fn default_qos() -> u8 {
        0
    }
}

/// Filter chain specification, evaluated in declaration order:
/// readiness, then priority, then type, then timestamp.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilterSpec {
    #[serde(default)]
    pub blocked_priorities: Vec<String>,

    #[serde(default)]
    pub allowed_priorities: Vec<String>,

    #[serde(default)]
    pub blocked_types: Vec<String>,

    #[serde(default)]
    pub allowed_types: Vec<String>,

    /// Drop messages whose embedded timestamp is older than this.
    #[serde(default)]
    pub max_age_seconds: Option<u64>,

    /// Gate forwarding on the engine-wide secondary-ready flag.
    #[serde(default)]
    pub require_ready: bool,
}

/// Relay engine configuration: master switches, broker pool, rule table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Master switch for conditional (filtered) relaying.
    #[serde(default)]
    pub conditional_relay: bool,

    /// Global prefix marking forwarded traffic. Never empty when relaying
    /// is enabled.
    #[serde(default = "RelayConfig::default_relay_prefix")]
    pub relay_prefix: String,

    #[serde(default)]
    pub brokers: Vec<NamedBroker>,

    #[serde(default)]
    pub rules: Vec<RelayRuleConfig>,

    #[serde(default)]
    pub conditional_rules: Vec<FilterSpec>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            conditional_relay: false,
            relay_prefix: Self::default_relay_prefix(),
            brokers: Vec::new(),
            rules: Vec::new(),
            conditional_rules: Vec::new(),
        }
    }
}

impl RelayConfig {
    fn default_relay_prefix() -> String {
        "relayed".to_string()
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !self.enabled {
            return Ok(());
        }
        if self.relay_prefix.is_empty() {
            return Err(ConfigError::invalid(
                "relay.relay_prefix must not be empty when relay is enabled",
            ));
        }
        let mut names = std::collections::HashSet::new();
        for entry in &self.brokers {
            if entry.name.is_empty() {
                return Err(ConfigError::invalid("relay.brokers[].name must not be empty"));
            }
            if !names.insert(entry.name.as_str()) {
                return Err(ConfigError::invalid(format!(
                    "duplicate relay broker name: {}",
                    entry.name
                )));
            }
            entry.broker.validate()?;
        }
        for rule in &self.rules {
            if !names.contains(rule.source_broker.as_str()) {
                return Err(ConfigError::invalid(format!(
                    "relay rule references unknown source broker: {}",
                    rule.source_broker
                )));
            }
            if !names.contains(rule.destination_broker.as_str()) {
                return Err(ConfigError::invalid(format!(
                    "relay rule references unknown destination broker: {}",
                    rule.destination_broker
                )));
            }
            if rule.source_broker == rule.destination_broker && !rule.bidirectional {
                return Err(ConfigError::invalid(format!(
                    "relay rule {} -> {} loops back to its source",
                    rule.source_broker, rule.destination_broker
                )));
            }
            if rule.source_topic_pattern.is_empty() || rule.destination_topic_template.is_empty() {
                return Err(ConfigError::invalid(
                    "relay rule pattern and template must not be empty",
                ));
            }
            if rule.qos > 2 {
                return Err(ConfigError::invalid(format!(
                    "relay rule qos must be 0-2, got {}",
                    rule.qos
                )));
            }
        }
        Ok(())
    }
}

/// Complete switchyard configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SwitchyardConfig {
    /// Primary broker session options (flat top-level keys).
    #[serde(flatten)]
    pub broker: BrokerConfig,

    #[serde(default)]
    pub topics: TopicConfig,

    #[serde(default)]
    pub relay: RelayConfig,

    /// Subscription patterns applied on every (re)connect of the primary
    /// session, in addition to the RPC wildcard.
    #[serde(default)]
    pub json_added_subs: Vec<String>,
}

impl SwitchyardConfig {
    /// Validate everything. Fatal at startup: no component is built from a
    /// config that fails here.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.broker.validate()?;
        if !self.topics.is_complete() {
            return Err(ConfigError::invalid("topics fields must all be non-empty"));
        }
        self.relay.validate()?;
        for sub in &self.json_added_subs {
            if sub.is_empty() {
                return Err(ConfigError::invalid(
                    "json_added_subs entries must not be empty",
                ));
            }
        }
        Ok(())
    }
}
