//! Relay rule compilation and destination topic rewriting.
//!
//! A destination template may copy the source topic, prepend a prefix, or
//! map `+`/`#` wildcard captures from the source pattern positionally into
//! `+`/`#` placeholders. The mapping is deterministic and order-preserving;
//! templates the mapping cannot satisfy are rejected at load time.

use rumqttc::QoS;

use crate::session::qos_from_u8;
use yardconf::{ConfigError, RelayRuleConfig};

/// Compiled destination template.
#[derive(Debug, Clone)]
pub struct TopicTemplate {
    pattern_segments: Vec<String>,
    template_segments: Vec<String>,
    prefix: Option<String>,
}

impl TopicTemplate {
    /// Compile and validate a (pattern, template, prefix) triple.
    ///
    /// Rejected shapes:
    /// - `#` anywhere but the final segment of pattern or template
    /// - more `+` placeholders in the template than `+` captures in the
    ///   pattern
    /// - a `#` placeholder without a `#` capture to feed it
    pub fn compile(
        pattern: &str,
        template: &str,
        prefix: Option<&str>,
    ) -> Result<Self, ConfigError> {
        let pattern_segments: Vec<String> = pattern.split('/').map(str::to_string).collect();
        let template_segments: Vec<String> = template.split('/').map(str::to_string).collect();

        for (name, segments) in [("pattern", &pattern_segments), ("template", &template_segments)] {
            if let Some(pos) = segments.iter().position(|s| s == "#") {
                if pos != segments.len() - 1 {
                    return Err(ConfigError::invalid(format!(
                        "'#' must be the final segment of a {name}: {}",
                        segments.join("/")
                    )));
                }
            }
        }

        let pattern_plus = pattern_segments.iter().filter(|s| *s == "+").count();
        let template_plus = template_segments.iter().filter(|s| *s == "+").count();
        if template_plus > pattern_plus {
            return Err(ConfigError::invalid(format!(
                "template '{template}' uses {template_plus} '+' placeholders but pattern \
                 '{pattern}' captures only {pattern_plus}"
            )));
        }

        let pattern_hash = pattern_segments.last().is_some_and(|s| s == "#");
        let template_hash = template_segments.last().is_some_and(|s| s == "#");
        if template_hash && !pattern_hash {
            return Err(ConfigError::invalid(format!(
                "template '{template}' ends in '#' but pattern '{pattern}' has no '#' capture"
            )));
        }

        Ok(Self {
            pattern_segments,
            template_segments,
            prefix: prefix.map(str::to_string),
        })
    }

    /// Rewrite a concrete topic that matched this rule's pattern.
    ///
    /// Returns `None` when the topic does not actually match (the caller's
    /// pattern check and this walk must agree).
    pub fn rewrite(&self, topic: &str) -> Option<String> {
        let topic_segments: Vec<&str> = topic.split('/').collect();

        // Walk the pattern, collecting wildcard captures in order.
        let mut plus_captures: Vec<&str> = Vec::new();
        let mut tail: Option<Vec<&str>> = None;
        let mut index = 0;
        for segment in &self.pattern_segments {
            match segment.as_str() {
                "#" => {
                    tail = Some(topic_segments[index..].to_vec());
                    index = topic_segments.len();
                    break;
                }
                "+" => {
                    plus_captures.push(topic_segments.get(index)?);
                    index += 1;
                }
                literal => {
                    if topic_segments.get(index)? != &literal {
                        return None;
                    }
                    index += 1;
                }
            }
        }
        if tail.is_none() && index != topic_segments.len() {
            return None;
        }

        // Fill the template positionally.
        let mut output: Vec<&str> = Vec::new();
        let mut next_capture = 0;
        for segment in &self.template_segments {
            match segment.as_str() {
                "#" => {
                    if let Some(tail_segments) = &tail {
                        output.extend(tail_segments.iter().copied());
                    }
                }
                "+" => {
                    // Counts were checked at compile time.
                    output.push(plus_captures.get(next_capture)?);
                    next_capture += 1;
                }
                literal => output.push(literal),
            }
        }

        let rewritten = output.join("/");
        Some(match &self.prefix {
            Some(prefix) => format!("{}/{}", prefix, rewritten),
            None => rewritten,
        })
    }

    /// The destination shape as a matchable pattern (prefix applied). Used
    /// by the loop guard to recognise forwarded traffic.
    pub fn destination_pattern(&self) -> String {
        let template = self.template_segments.join("/");
        match &self.prefix {
            Some(prefix) => format!("{}/{}", prefix, template),
            None => template,
        }
    }
}

/// A relay rule ready for dispatch.
#[derive(Debug, Clone)]
pub struct CompiledRule {
    pub source: String,
    pub destination: String,
    pub pattern: String,
    pub template: TopicTemplate,
    pub qos: QoS,
    pub conditional: bool,
}

impl CompiledRule {
    /// Compile a configured rule; bidirectional rules also yield their
    /// symmetric reverse (destination template becomes the reverse pattern,
    /// source pattern becomes the reverse template, same guard prefix).
    pub fn compile(config: &RelayRuleConfig) -> Result<Vec<Self>, ConfigError> {
        let prefix = config.topic_prefix.as_deref();
        let forward = Self {
            source: config.source_broker.clone(),
            destination: config.destination_broker.clone(),
            pattern: config.source_topic_pattern.clone(),
            template: TopicTemplate::compile(
                &config.source_topic_pattern,
                &config.destination_topic_template,
                prefix,
            )?,
            qos: qos_from_u8(config.qos),
            conditional: config.conditional,
        };

        let mut rules = vec![forward];
        if config.bidirectional {
            rules.push(Self {
                source: config.destination_broker.clone(),
                destination: config.source_broker.clone(),
                pattern: config.destination_topic_template.clone(),
                template: TopicTemplate::compile(
                    &config.destination_topic_template,
                    &config.source_topic_pattern,
                    prefix,
                )?,
                qos: qos_from_u8(config.qos),
                conditional: config.conditional,
            });
        }
        Ok(rules)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn rule_config(pattern: &str, template: &str) -> RelayRuleConfig {
        RelayRuleConfig {
            source_broker: "edge".to_string(),
            destination_broker: "core".to_string(),
            source_topic_pattern: pattern.to_string(),
            destination_topic_template: template.to_string(),
            topic_prefix: None,
            qos: 0,
            bidirectional: false,
            conditional: false,
        }
    }

    #[test]
    fn copy_with_literal_template() {
        let template = TopicTemplate::compile("smart/sensors/+", "filtered/sensors/+", None).unwrap();
        assert_eq!(
            template.rewrite("smart/sensors/t1").as_deref(),
            Some("filtered/sensors/t1")
        );
    }

    #[test]
    fn positional_plus_mapping_preserves_order() {
        let template = TopicTemplate::compile("a/+/b/+", "out/+/+", None).unwrap();
        assert_eq!(
            template.rewrite("a/one/b/two").as_deref(),
            Some("out/one/two")
        );
    }

    #[test]
    fn hash_tail_mapping() {
        let template = TopicTemplate::compile("devices/#", "mirror/#", None).unwrap();
        assert_eq!(
            template.rewrite("devices/plant/7/temp").as_deref(),
            Some("mirror/plant/7/temp")
        );
        // An empty tail leaves just the literal part.
        assert_eq!(template.rewrite("devices").as_deref(), Some("mirror"));
    }

    #[test]
    fn prefix_applied_after_rewrite() {
        let template =
            TopicTemplate::compile("smart/sensors/+", "sensors/+", Some("filtered")).unwrap();
        assert_eq!(
            template.rewrite("smart/sensors/t1").as_deref(),
            Some("filtered/sensors/t1")
        );
        assert_eq!(template.destination_pattern(), "filtered/sensors/+");
    }

    #[test]
    fn non_matching_topic_rewrites_to_none() {
        let template = TopicTemplate::compile("smart/sensors/+", "filtered/+", None).unwrap();
        assert!(template.rewrite("other/sensors/t1").is_none());
        assert!(template.rewrite("smart/sensors/t1/extra").is_none());
    }

    #[test]
    fn too_many_plus_placeholders_rejected() {
        let err = TopicTemplate::compile("a/+", "out/+/+", None).unwrap_err();
        assert!(err.to_string().contains("placeholders"));
    }

    #[test]
    fn hash_placeholder_without_capture_rejected() {
        assert!(TopicTemplate::compile("a/+", "out/#", None).is_err());
    }

    #[test]
    fn interior_hash_rejected() {
        assert!(TopicTemplate::compile("a/#/b", "out/#", None).is_err());
        assert!(TopicTemplate::compile("a/#", "out/#/b", None).is_err());
    }

    #[test]
    fn unidirectional_rule_compiles_alone() {
        let rules = CompiledRule::compile(&rule_config("smart/+", "mirror/+")).unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].source, "edge");
        assert_eq!(rules[0].destination, "core");
    }

    #[test]
    fn bidirectional_rule_expands_to_reverse() {
        let mut config = rule_config("smart/+", "mirror/+");
        config.bidirectional = true;
        let rules = CompiledRule::compile(&config).unwrap();
        assert_eq!(rules.len(), 2);

        let reverse = &rules[1];
        assert_eq!(reverse.source, "core");
        assert_eq!(reverse.destination, "edge");
        assert_eq!(reverse.pattern, "mirror/+");
        assert_eq!(reverse.template.rewrite("mirror/t9").as_deref(), Some("smart/t9"));
    }
}
