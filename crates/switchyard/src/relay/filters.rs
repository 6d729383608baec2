//! Conditional relay filter chain.
//!
//! Filters run in a fixed order - readiness, priority, type, timestamp -
//! and the first failure drops the message. Filters that inspect payload
//! structure pass by default when the payload is not structured JSON.

use serde_json::Value;
use std::time::Duration;

use yardconf::FilterSpec;

/// One filter in the chain.
#[derive(Debug, Clone)]
pub enum Filter {
    /// Gate on the engine-wide secondary-ready flag.
    Readiness,
    /// Block/allow by the payload's `priority` string field.
    Priority {
        blocked: Vec<String>,
        allowed: Vec<String>,
    },
    /// Block/allow by the payload's `type` string field.
    Type {
        blocked: Vec<String>,
        allowed: Vec<String>,
    },
    /// Drop payloads whose `timestamp` field is older than `max_age`.
    Timestamp { max_age: Duration },
}

/// Ordered filter chain built from config.
#[derive(Debug, Clone, Default)]
pub struct FilterChain {
    filters: Vec<Filter>,
}

impl FilterChain {
    /// Flatten filter specs into the fixed evaluation order.
    pub fn from_specs(specs: &[FilterSpec]) -> Self {
        let mut filters = Vec::new();
        for spec in specs {
            if spec.require_ready {
                filters.push(Filter::Readiness);
            }
            if !spec.blocked_priorities.is_empty() || !spec.allowed_priorities.is_empty() {
                filters.push(Filter::Priority {
                    blocked: spec.blocked_priorities.clone(),
                    allowed: spec.allowed_priorities.clone(),
                });
            }
            if !spec.blocked_types.is_empty() || !spec.allowed_types.is_empty() {
                filters.push(Filter::Type {
                    blocked: spec.blocked_types.clone(),
                    allowed: spec.allowed_types.clone(),
                });
            }
            if let Some(max_age_seconds) = spec.max_age_seconds {
                filters.push(Filter::Timestamp {
                    max_age: Duration::from_secs(max_age_seconds),
                });
            }
        }
        Self { filters }
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Whether any filter in the chain gates on readiness.
    pub fn requires_ready(&self) -> bool {
        self.filters
            .iter()
            .any(|f| matches!(f, Filter::Readiness))
    }

    /// Evaluate the chain. `Err(reason)` means drop.
    ///
    /// `payload` is the decoded JSON body, if the payload was structured;
    /// `now_ms` is the wall clock in milliseconds.
    pub fn evaluate(
        &self,
        payload: Option<&Value>,
        ready: bool,
        now_ms: i64,
    ) -> Result<(), &'static str> {
        for filter in &self.filters {
            match filter {
                Filter::Readiness => {
                    if !ready {
                        return Err("secondary not ready");
                    }
                }
                Filter::Priority { blocked, allowed } => {
                    check_field(payload, "priority", blocked, allowed, "priority blocked")?
                }
                Filter::Type { blocked, allowed } => {
                    check_field(payload, "type", blocked, allowed, "type blocked")?
                }
                Filter::Timestamp { max_age } => {
                    let Some(ts) = payload.and_then(|p| p.get("timestamp")).and_then(Value::as_i64)
                    else {
                        continue;
                    };
                    let ts_ms = normalize_to_millis(ts);
                    let age_ms = now_ms.saturating_sub(ts_ms);
                    if age_ms > max_age.as_millis() as i64 {
                        return Err("message too old");
                    }
                }
            }
        }
        Ok(())
    }
}

fn check_field(
    payload: Option<&Value>,
    field: &str,
    blocked: &[String],
    allowed: &[String],
    reason: &'static str,
) -> Result<(), &'static str> {
    // Unstructured payloads, and structured payloads without the field,
    // pass by default.
    let Some(value) = payload.and_then(|p| p.get(field)).and_then(Value::as_str) else {
        return Ok(());
    };
    if blocked.iter().any(|b| b == value) {
        return Err(reason);
    }
    if !allowed.is_empty() && !allowed.iter().any(|a| a == value) {
        return Err(reason);
    }
    Ok(())
}

/// Payload timestamps appear in the field both as epoch seconds and epoch
/// milliseconds; anything below 10^12 is treated as seconds.
fn normalize_to_millis(ts: i64) -> i64 {
    if ts.abs() < 1_000_000_000_000 {
        ts.saturating_mul(1000)
    } else {
        ts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> FilterSpec {
        FilterSpec::default()
    }

    fn now_ms() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    #[test]
    fn empty_chain_passes_everything() {
        let chain = FilterChain::from_specs(&[]);
        assert!(chain.is_empty());
        assert!(chain.evaluate(None, false, now_ms()).is_ok());
    }

    #[test]
    fn blocked_priority_drops() {
        let mut s = spec();
        s.blocked_priorities = vec!["low".to_string()];
        let chain = FilterChain::from_specs(&[s]);

        let high = serde_json::json!({"priority": "high", "type": "info"});
        let low = serde_json::json!({"priority": "low", "type": "info"});
        assert!(chain.evaluate(Some(&high), true, now_ms()).is_ok());
        assert!(chain.evaluate(Some(&low), true, now_ms()).is_err());
    }

    #[test]
    fn allowed_list_excludes_others() {
        let mut s = spec();
        s.allowed_types = vec!["info".to_string()];
        let chain = FilterChain::from_specs(&[s]);

        let info = serde_json::json!({"type": "info"});
        let debug = serde_json::json!({"type": "debug"});
        assert!(chain.evaluate(Some(&info), true, now_ms()).is_ok());
        assert!(chain.evaluate(Some(&debug), true, now_ms()).is_err());
    }

    #[test]
    fn unstructured_payload_passes_structural_filters() {
        let mut s = spec();
        s.blocked_priorities = vec!["low".to_string()];
        s.blocked_types = vec!["debug".to_string()];
        let chain = FilterChain::from_specs(&[s]);
        assert!(chain.evaluate(None, true, now_ms()).is_ok());
    }

    #[test]
    fn missing_field_passes() {
        let mut s = spec();
        s.blocked_priorities = vec!["low".to_string()];
        let chain = FilterChain::from_specs(&[s]);
        let payload = serde_json::json!({"type": "info"});
        assert!(chain.evaluate(Some(&payload), true, now_ms()).is_ok());
    }

    #[test]
    fn stale_timestamp_drops_fresh_passes() {
        let mut s = spec();
        s.max_age_seconds = Some(300);
        let chain = FilterChain::from_specs(&[s]);
        let now = now_ms();

        let stale = serde_json::json!({"timestamp": (now / 1000) - 400});
        let fresh = serde_json::json!({"timestamp": (now / 1000) - 100});
        assert_eq!(
            chain.evaluate(Some(&stale), true, now),
            Err("message too old")
        );
        assert!(chain.evaluate(Some(&fresh), true, now).is_ok());
    }

    #[test]
    fn millisecond_timestamps_also_accepted() {
        let mut s = spec();
        s.max_age_seconds = Some(300);
        let chain = FilterChain::from_specs(&[s]);
        let now = now_ms();

        let stale = serde_json::json!({"timestamp": now - 400_000});
        let fresh = serde_json::json!({"timestamp": now - 100_000});
        assert!(chain.evaluate(Some(&stale), true, now).is_err());
        assert!(chain.evaluate(Some(&fresh), true, now).is_ok());
    }

    #[test]
    fn readiness_gate() {
        let mut s = spec();
        s.require_ready = true;
        let chain = FilterChain::from_specs(&[s]);
        assert!(chain.requires_ready());
        assert_eq!(chain.evaluate(None, false, now_ms()), Err("secondary not ready"));
        assert!(chain.evaluate(None, true, now_ms()).is_ok());
    }

    #[test]
    fn first_failure_wins() {
        let mut s = spec();
        s.require_ready = true;
        s.blocked_priorities = vec!["low".to_string()];
        let chain = FilterChain::from_specs(&[s]);

        // Readiness is evaluated before priority, so the reason reflects
        // the readiness gate even for a blocked priority.
        let low = serde_json::json!({"priority": "low"});
        assert_eq!(
            chain.evaluate(Some(&low), false, now_ms()),
            Err("secondary not ready")
        );
    }
}
