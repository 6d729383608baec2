//! Topic grammar for the RPC bus.
//!
//! Request topic:      `<base>/<service>/<method>/<txid>/<request-suffix>`
//! Response topic:     `<base>/<service>/<method>/<txid>/<response-suffix>`
//! Notification topic: `<base>/<service>/<method>/<notification-suffix>`
//!
//! The grammar is centralised here (and shared with the relay engine's
//! pattern matching) so that a topic-shape change happens in exactly one
//! place.

use serde::{Deserialize, Serialize};

/// Topic prefixes and suffixes. Immutable for the lifetime of a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicConfig {
    /// Leading segment of every topic this client produces.
    #[serde(default = "TopicConfig::default_base_prefix")]
    pub base_prefix: String,

    /// Segment used when building wildcard subscriptions.
    #[serde(default = "TopicConfig::default_service_prefix")]
    pub service_prefix: String,

    #[serde(default = "TopicConfig::default_request_suffix")]
    pub request_suffix: String,

    #[serde(default = "TopicConfig::default_response_suffix")]
    pub response_suffix: String,

    #[serde(default = "TopicConfig::default_notification_suffix")]
    pub notification_suffix: String,
}

impl TopicConfig {
    fn default_base_prefix() -> String {
        "rpc".to_string()
    }

    fn default_service_prefix() -> String {
        "services".to_string()
    }

    fn default_request_suffix() -> String {
        "request".to_string()
    }

    fn default_response_suffix() -> String {
        "response".to_string()
    }

    fn default_notification_suffix() -> String {
        "notification".to_string()
    }

    /// All fields must be non-empty. Checked at config load.
    pub fn is_complete(&self) -> bool {
        !self.base_prefix.is_empty()
            && !self.service_prefix.is_empty()
            && !self.request_suffix.is_empty()
            && !self.response_suffix.is_empty()
            && !self.notification_suffix.is_empty()
    }

    pub fn request_topic(&self, service: &str, method: &str, transaction_id: &str) -> String {
        format!(
            "{}/{}/{}/{}/{}",
            self.base_prefix, service, method, transaction_id, self.request_suffix
        )
    }

    pub fn response_topic(&self, service: &str, method: &str, transaction_id: &str) -> String {
        format!(
            "{}/{}/{}/{}/{}",
            self.base_prefix, service, method, transaction_id, self.response_suffix
        )
    }

    pub fn notification_topic(&self, service: &str, method: &str) -> String {
        format!(
            "{}/{}/{}/{}",
            self.base_prefix, service, method, self.notification_suffix
        )
    }

    /// Wildcard subscription applied on every (re)connect.
    ///
    /// `cross_method` widens the tail from a single segment (`+`) to the
    /// whole subtree (`#`), which is what an RPC client listening for
    /// responses on arbitrary methods wants.
    pub fn subscription_pattern(&self, cross_method: bool) -> String {
        let tail = if cross_method { "#" } else { "+" };
        format!("{}/{}/{}", self.base_prefix, self.service_prefix, tail)
    }

    /// True when `topic` names a response produced under this config.
    pub fn is_response_topic(&self, topic: &str) -> bool {
        topic
            .rsplit('/')
            .next()
            .is_some_and(|last| last == self.response_suffix)
    }

    /// Invert a request or response topic back into its parts.
    ///
    /// Returns `None` for topics not shaped by this config (wrong base,
    /// wrong suffix, wrong segment count).
    pub fn parse_topic(&self, topic: &str) -> Option<TopicParts> {
        let segments: Vec<&str> = topic.split('/').collect();
        if segments.len() != 5 || segments[0] != self.base_prefix {
            return None;
        }
        let kind = if segments[4] == self.request_suffix {
            TopicKind::Request
        } else if segments[4] == self.response_suffix {
            TopicKind::Response
        } else {
            return None;
        };
        Some(TopicParts {
            service: segments[1].to_string(),
            method: segments[2].to_string(),
            transaction_id: segments[3].to_string(),
            kind,
        })
    }
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            base_prefix: Self::default_base_prefix(),
            service_prefix: Self::default_service_prefix(),
            request_suffix: Self::default_request_suffix(),
            response_suffix: Self::default_response_suffix(),
            notification_suffix: Self::default_notification_suffix(),
        }
    }
}

/// Which end of the exchange a parsed topic belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicKind {
    Request,
    Response,
}

/// Decomposed request/response topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicParts {
    pub service: String,
    pub method: String,
    pub transaction_id: String,
    pub kind: TopicKind,
}

/// MQTT 3.1.1 topic-filter matching.
///
/// `+` matches exactly one segment, `#` matches the (possibly empty) rest
/// of the topic and is only valid as the final segment of the filter.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_segments = filter.split('/');
    let mut topic_segments = topic.split('/');

    loop {
        match (filter_segments.next(), topic_segments.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}
