//! Relay engine: conditional forwarding between broker sessions.
//!
//! The engine owns one [`BrokerSession`] per configured pool broker and a
//! rule table. Inbound messages are pushed (from each session's I/O task)
//! into a single forwarding channel; a dedicated worker task applies rules,
//! filters, and topic rewriting, then publishes to the destination session.
//!
//! The rule table is seeded from config and may be edited at runtime
//! through the admin API ([`RelayEngine::add_rule`] /
//! [`RelayEngine::remove_rule`]).
//!
//! The engine is not a store-and-forward broker: messages that arrive while
//! the destination is down, or while the forwarding channel is full, are
//! dropped and counted.

pub mod filters;
pub mod rules;

pub use filters::FilterChain;
pub use rules::{CompiledRule, TopicTemplate};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::error::ClientError;
use crate::session::BrokerSession;
use yardconf::{ConfigError, RelayConfig, RelayRuleConfig};
use yardproto::topic_matches;

/// Capacity of the forwarding channel. Sized for bursts; overflow drops.
const FORWARD_CHANNEL_CAPACITY: usize = 256;

/// Bounded wait for in-flight forwards during shutdown.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

enum RelayCommand {
    Inbound {
        broker: String,
        topic: String,
        payload: Bytes,
    },
    Shutdown,
}

/// Per-rule monotonic counters.
#[derive(Debug, Default)]
pub struct RuleCounters {
    pub forwarded: AtomicU64,
    pub dropped: AtomicU64,
    pub errors: AtomicU64,
}

/// Snapshot of one rule's counters.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RuleStats {
    pub source: String,
    pub destination: String,
    pub pattern: String,
    pub forwarded: u64,
    pub dropped: u64,
    pub errors: u64,
}

/// One installed rule and its counters.
#[derive(Clone)]
struct RuleEntry {
    rule: CompiledRule,
    counters: Arc<RuleCounters>,
}

struct EngineShared {
    sessions: HashMap<String, Arc<BrokerSession>>,
    rules: Mutex<Vec<RuleEntry>>,
    filters: FilterChain,
    conditional_relay: bool,
    relay_prefix: String,
    secondary_ready: AtomicBool,
}

impl EngineShared {
    fn rule_entries(&self) -> Vec<RuleEntry> {
        self.rules.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Loop guard: a message that originated from a forwarding operation is
    /// never forwarded again. Forwarded traffic is recognised by the global
    /// relay prefix and by each rule's destination shape.
    fn is_forwarded(&self, entries: &[RuleEntry], topic: &str) -> bool {
        if topic == self.relay_prefix || topic.starts_with(&format!("{}/", self.relay_prefix)) {
            return true;
        }
        entries
            .iter()
            .any(|entry| topic_matches(&entry.rule.template.destination_pattern(), topic))
    }

    async fn handle_inbound(&self, broker: &str, topic: &str, payload: &[u8]) {
        // Snapshot the table; publishes must not run under the rules lock.
        let entries = self.rule_entries();
        if self.is_forwarded(&entries, topic) {
            trace!("relay: skipping forwarded message on {}", topic);
            return;
        }

        // Decode once, lazily shared across rules. Non-JSON payloads relay
        // fine; filters that need structure pass them by default.
        let decoded: Option<serde_json::Value> = serde_json::from_slice(payload).ok();
        let now_ms = chrono::Utc::now().timestamp_millis();

        for entry in &entries {
            let rule = &entry.rule;
            if rule.source != broker || !topic_matches(&rule.pattern, topic) {
                continue;
            }

            if rule.conditional && self.conditional_relay {
                let ready = self.secondary_ready.load(Ordering::Relaxed);
                if let Err(reason) = self.filters.evaluate(decoded.as_ref(), ready, now_ms) {
                    entry.counters.dropped.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        "relay: dropped {} ({} -> {}): {}",
                        topic, rule.source, rule.destination, reason
                    );
                    continue;
                }
            }

            let Some(destination_topic) = rule.template.rewrite(topic) else {
                continue;
            };
            let Some(destination) = self.sessions.get(&rule.destination) else {
                continue;
            };

            match destination
                .publish(&destination_topic, payload, rule.qos)
                .await
            {
                Ok(()) => {
                    entry.counters.forwarded.fetch_add(1, Ordering::Relaxed);
                    trace!(
                        "relay: {} -> {} as {}",
                        topic,
                        rule.destination,
                        destination_topic
                    );
                }
                Err(e) => {
                    // Per-message failures never tear down the session.
                    entry.counters.errors.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        "relay: forward {} -> {} failed: {}",
                        topic, rule.destination, e
                    );
                }
            }
        }
    }
}

/// Multi-broker relay engine.
pub struct RelayEngine {
    shared: Arc<EngineShared>,
    forward_tx: mpsc::Sender<RelayCommand>,
    forward_rx: Mutex<Option<mpsc::Receiver<RelayCommand>>>,
    worker: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl RelayEngine {
    /// Build sessions and compile the rule table from config.
    ///
    /// The config must already have passed validation; template compilation
    /// may still reject shapes validation cannot see.
    pub fn from_config(config: &RelayConfig) -> Result<Self, ClientError> {
        let mut sessions = HashMap::new();
        for entry in &config.brokers {
            let session = Arc::new(BrokerSession::new(entry.broker.clone())?);
            sessions.insert(entry.name.clone(), session);
        }

        let mut entries = Vec::new();
        for rule_config in &config.rules {
            for rule in CompiledRule::compile(rule_config)? {
                entries.push(RuleEntry {
                    rule,
                    counters: Arc::new(RuleCounters::default()),
                });
            }
        }

        let (forward_tx, forward_rx) = mpsc::channel(FORWARD_CHANNEL_CAPACITY);

        info!(
            "relay engine: {} broker(s), {} rule(s) (incl. reverses)",
            sessions.len(),
            entries.len()
        );

        Ok(Self {
            shared: Arc::new(EngineShared {
                sessions,
                rules: Mutex::new(entries),
                filters: FilterChain::from_specs(&config.conditional_rules),
                conditional_relay: config.conditional_relay,
                relay_prefix: config.relay_prefix.clone(),
                secondary_ready: AtomicBool::new(false),
            }),
            forward_tx,
            forward_rx: Mutex::new(Some(forward_rx)),
            worker: Mutex::new(None),
        })
    }

    /// Install handlers, subscribe rule patterns, start sessions, and spawn
    /// the forwarding worker.
    pub async fn start(&self) -> Result<(), ClientError> {
        let forward_rx = self
            .forward_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or(ClientError::AlreadyStarted)?;

        // Every session feeds the single forwarding channel. The handler
        // runs on the session's I/O task, so it must never block: overflow
        // is a drop, not a wait.
        for (name, session) in &self.shared.sessions {
            let tx = self.forward_tx.clone();
            let broker = name.clone();
            session.set_message_handler(Arc::new(move |topic, payload| {
                let command = RelayCommand::Inbound {
                    broker: broker.clone(),
                    topic: topic.to_string(),
                    payload: Bytes::copy_from_slice(payload),
                };
                if tx.try_send(command).is_err() {
                    warn!("relay: forward channel full, dropping message on {}", topic);
                }
            }));
        }

        // Ensure each rule's source covers its pattern before any traffic.
        for entry in self.shared.rule_entries() {
            if let Some(source) = self.shared.sessions.get(&entry.rule.source) {
                source.subscribe(&entry.rule.pattern, entry.rule.qos).await?;
            }
        }

        for session in self.shared.sessions.values() {
            session.start()?;
        }

        let shared = self.shared.clone();
        let handle = tokio::spawn(async move {
            forward_worker(shared, forward_rx).await;
        });
        *self.worker.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);

        info!("relay engine started");
        Ok(())
    }

    /// Unsubscribe all rules, drain in-flight forwards (bounded), then tear
    /// down the sessions.
    pub async fn stop(&self) {
        for entry in self.shared.rule_entries() {
            if let Some(source) = self.shared.sessions.get(&entry.rule.source) {
                if let Err(e) = source.unsubscribe(&entry.rule.pattern).await {
                    debug!("relay: unsubscribe {} failed: {}", entry.rule.pattern, e);
                }
            }
        }

        let _ = self.forward_tx.send(RelayCommand::Shutdown).await;
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            let _ = tokio::time::timeout(DRAIN_TIMEOUT, handle).await;
        }

        for session in self.shared.sessions.values() {
            session.stop().await;
        }
        info!("relay engine stopped");
    }

    /// Admin API: install a rule at runtime. The rule's brokers must name
    /// pool sessions; the source subscription is issued immediately.
    pub async fn add_rule(&self, config: &RelayRuleConfig) -> Result<(), ClientError> {
        for name in [&config.source_broker, &config.destination_broker] {
            if !self.shared.sessions.contains_key(name.as_str()) {
                return Err(ClientError::Config(ConfigError::invalid(format!(
                    "relay rule references unknown broker: {name}"
                ))));
            }
        }

        let compiled = CompiledRule::compile(config)?;
        for rule in &compiled {
            if let Some(source) = self.shared.sessions.get(&rule.source) {
                source.subscribe(&rule.pattern, rule.qos).await?;
            }
        }

        let mut rules = self
            .shared
            .rules
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        for rule in compiled {
            info!("relay: rule added {} -> {}", rule.source, rule.destination);
            rules.push(RuleEntry {
                rule,
                counters: Arc::new(RuleCounters::default()),
            });
        }
        Ok(())
    }

    /// Admin API: remove every rule matching (source broker, pattern).
    /// Returns how many rules were removed; the source subscription is
    /// dropped with them.
    pub async fn remove_rule(&self, source: &str, pattern: &str) -> usize {
        let removed = {
            let mut rules = self
                .shared
                .rules
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            let before = rules.len();
            rules.retain(|entry| !(entry.rule.source == source && entry.rule.pattern == pattern));
            before - rules.len()
        };

        if removed > 0 {
            if let Some(session) = self.shared.sessions.get(source) {
                if let Err(e) = session.unsubscribe(pattern).await {
                    debug!("relay: unsubscribe {} failed: {}", pattern, e);
                }
            }
            info!("relay: removed {} rule(s) {}/{}", removed, source, pattern);
        }
        removed
    }

    /// Toggle the process-wide secondary-ready flag (admin API). Rules with
    /// a readiness filter drop inbound messages while this is false.
    pub fn set_secondary_ready(&self, ready: bool) {
        self.shared
            .secondary_ready
            .store(ready, Ordering::Relaxed);
        info!("relay: secondary-ready set to {}", ready);
    }

    pub fn secondary_ready(&self) -> bool {
        self.shared.secondary_ready.load(Ordering::Relaxed)
    }

    /// Snapshot the per-rule counters.
    pub fn rule_stats(&self) -> Vec<RuleStats> {
        self.shared
            .rule_entries()
            .iter()
            .map(|entry| RuleStats {
                source: entry.rule.source.clone(),
                destination: entry.rule.destination.clone(),
                pattern: entry.rule.pattern.clone(),
                forwarded: entry.counters.forwarded.load(Ordering::Relaxed),
                dropped: entry.counters.dropped.load(Ordering::Relaxed),
                errors: entry.counters.errors.load(Ordering::Relaxed),
            })
            .collect()
    }

    pub fn session(&self, name: &str) -> Option<&Arc<BrokerSession>> {
        self.shared.sessions.get(name)
    }

    /// All pool sessions, for status reporting and instrumentation.
    pub fn sessions(&self) -> Vec<Arc<BrokerSession>> {
        self.shared.sessions.values().cloned().collect()
    }
}

/// The forwarding worker: applies rules to queued inbound messages. On
/// shutdown it drains whatever is already queued, without waiting for more.
async fn forward_worker(shared: Arc<EngineShared>, mut rx: mpsc::Receiver<RelayCommand>) {
    debug!("relay: forward worker started");
    while let Some(command) = rx.recv().await {
        match command {
            RelayCommand::Inbound {
                broker,
                topic,
                payload,
            } => {
                shared.handle_inbound(&broker, &topic, &payload).await;
            }
            RelayCommand::Shutdown => {
                let mut drained = 0usize;
                while let Ok(command) = rx.try_recv() {
                    if let RelayCommand::Inbound {
                        broker,
                        topic,
                        payload,
                    } = command
                    {
                        shared.handle_inbound(&broker, &topic, &payload).await;
                        drained += 1;
                    }
                }
                if drained > 0 {
                    debug!("relay: drained {} in-flight forward(s) at shutdown", drained);
                }
                break;
            }
        }
    }
    debug!("relay: forward worker exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use yardconf::{BrokerConfig, FilterSpec, NamedBroker};

    fn pool_broker(name: &str) -> NamedBroker {
        let mut broker = BrokerConfig::default();
        broker.client_id = format!("relay-{name}");
        NamedBroker {
            name: name.to_string(),
            broker,
        }
    }

    fn engine_config() -> RelayConfig {
        RelayConfig {
            enabled: true,
            conditional_relay: true,
            relay_prefix: "relayed".to_string(),
            brokers: vec![pool_broker("edge"), pool_broker("core")],
            rules: vec![RelayRuleConfig {
                source_broker: "edge".to_string(),
                destination_broker: "core".to_string(),
                source_topic_pattern: "smart/sensors/+".to_string(),
                destination_topic_template: "filtered/sensors/+".to_string(),
                topic_prefix: None,
                qos: 0,
                bidirectional: false,
                conditional: true,
            }],
            conditional_rules: vec![FilterSpec {
                blocked_priorities: vec!["low".to_string()],
                require_ready: true,
                ..FilterSpec::default()
            }],
        }
    }

    #[tokio::test]
    async fn engine_builds_sessions_and_rules() {
        let engine = RelayEngine::from_config(&engine_config()).unwrap();
        assert!(engine.session("edge").is_some());
        assert!(engine.session("core").is_some());
        assert_eq!(engine.rule_stats().len(), 1);
        assert!(!engine.secondary_ready());
    }

    #[tokio::test]
    async fn readiness_gate_drops_before_publish() {
        let engine = RelayEngine::from_config(&engine_config()).unwrap();
        let payload = serde_json::to_vec(&serde_json::json!({"priority": "high"})).unwrap();

        // Flag is false: the readiness filter drops before any publish is
        // attempted, so the drop counter moves and the error counter stays.
        engine
            .shared
            .handle_inbound("edge", "smart/sensors/t1", &payload)
            .await;
        let stats = &engine.rule_stats()[0];
        assert_eq!(stats.dropped, 1);
        assert_eq!(stats.errors, 0);
        assert_eq!(stats.forwarded, 0);
    }

    #[tokio::test]
    async fn blocked_priority_drops_when_ready() {
        let engine = RelayEngine::from_config(&engine_config()).unwrap();
        engine.set_secondary_ready(true);

        let low = serde_json::to_vec(&serde_json::json!({"priority": "low", "type": "info"}))
            .unwrap();
        engine
            .shared
            .handle_inbound("edge", "smart/sensors/t1", &low)
            .await;
        assert_eq!(engine.rule_stats()[0].dropped, 1);

        // A passing message reaches the publish stage; the disconnected
        // destination turns it into a per-rule error, not a teardown.
        let high = serde_json::to_vec(&serde_json::json!({"priority": "high", "type": "info"}))
            .unwrap();
        engine
            .shared
            .handle_inbound("edge", "smart/sensors/t1", &high)
            .await;
        let stats = &engine.rule_stats()[0];
        assert_eq!(stats.dropped, 1);
        assert_eq!(stats.errors, 1);
    }

    #[tokio::test]
    async fn forwarded_traffic_is_never_reforwarded() {
        let engine = RelayEngine::from_config(&engine_config()).unwrap();
        engine.set_secondary_ready(true);

        let entries = engine.shared.rule_entries();
        assert!(engine.shared.is_forwarded(&entries, "relayed/anything"));
        assert!(engine.shared.is_forwarded(&entries, "filtered/sensors/t1"));
        assert!(!engine.shared.is_forwarded(&entries, "smart/sensors/t1"));

        // A message already shaped like relay output is skipped entirely.
        engine
            .shared
            .handle_inbound("edge", "filtered/sensors/t1", b"{}")
            .await;
        let stats = &engine.rule_stats()[0];
        assert_eq!(stats.forwarded + stats.dropped + stats.errors, 0);
    }

    #[tokio::test]
    async fn non_matching_source_is_ignored() {
        let engine = RelayEngine::from_config(&engine_config()).unwrap();
        engine.set_secondary_ready(true);

        engine
            .shared
            .handle_inbound("core", "smart/sensors/t1", b"{}")
            .await;
        engine
            .shared
            .handle_inbound("edge", "other/topic", b"{}")
            .await;
        let stats = &engine.rule_stats()[0];
        assert_eq!(stats.forwarded + stats.dropped + stats.errors, 0);
    }

    #[tokio::test]
    async fn unconditional_rule_skips_filters() {
        let mut config = engine_config();
        config.rules[0].conditional = false;
        let engine = RelayEngine::from_config(&config).unwrap();

        // Readiness is false and priority is blocked, but the rule is not
        // conditional: the message goes straight to publish (which fails
        // NotConnected here).
        let low = serde_json::to_vec(&serde_json::json!({"priority": "low"})).unwrap();
        engine
            .shared
            .handle_inbound("edge", "smart/sensors/t1", &low)
            .await;
        let stats = &engine.rule_stats()[0];
        assert_eq!(stats.dropped, 0);
        assert_eq!(stats.errors, 1);
    }

    #[tokio::test]
    async fn rules_can_be_added_and_removed_at_runtime() {
        let engine = RelayEngine::from_config(&engine_config()).unwrap();
        assert_eq!(engine.rule_stats().len(), 1);

        engine
            .add_rule(&RelayRuleConfig {
                source_broker: "core".to_string(),
                destination_broker: "edge".to_string(),
                source_topic_pattern: "alerts/#".to_string(),
                destination_topic_template: "mirror/#".to_string(),
                topic_prefix: None,
                qos: 1,
                bidirectional: false,
                conditional: false,
            })
            .await
            .unwrap();
        assert_eq!(engine.rule_stats().len(), 2);

        // Unknown brokers are rejected.
        let err = engine
            .add_rule(&RelayRuleConfig {
                source_broker: "nowhere".to_string(),
                destination_broker: "core".to_string(),
                source_topic_pattern: "x/#".to_string(),
                destination_topic_template: "y/#".to_string(),
                topic_prefix: None,
                qos: 0,
                bidirectional: false,
                conditional: false,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Config(_)));

        assert_eq!(engine.remove_rule("core", "alerts/#").await, 1);
        assert_eq!(engine.rule_stats().len(), 1);
        assert_eq!(engine.remove_rule("core", "alerts/#").await, 0);
    }
}
