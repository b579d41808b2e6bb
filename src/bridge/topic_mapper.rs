//! Bridge topic translation
//!
//! Each topics rule pairs a pattern with a local and a remote prefix. On
//! outbound delivery the local prefix is stripped and the remote prefix
//! prepended; inbound is the reverse. When several rules match, the one
//! whose full filter is most specific wins, under the same rule the
//! subscription engine uses.

use std::sync::Arc;

use crate::config::{BridgeDirection, BridgeTopicRule};
use crate::topic::{specificity, topic_matches_filter, Priority};

/// A rule compiled with its full local and remote filters
#[derive(Debug, Clone)]
struct CompiledRule {
    direction: BridgeDirection,
    local_filter: String,
    remote_filter: String,
    local_prefix: Arc<str>,
    remote_prefix: Arc<str>,
    priority: Priority,
}

/// Maps topics between the local and remote brokers
pub struct TopicMapper {
    rules: Vec<CompiledRule>,
}

impl TopicMapper {
    pub fn new(rules: &[BridgeTopicRule]) -> Self {
        let rules = rules
            .iter()
            .map(|r| {
                let local_prefix: Arc<str> = Arc::from(r.local_prefix.as_deref().unwrap_or(""));
                let remote_prefix: Arc<str> = Arc::from(r.remote_prefix.as_deref().unwrap_or(""));
                CompiledRule {
                    direction: r.direction,
                    local_filter: format!("{}{}", local_prefix, r.pattern),
                    remote_filter: format!("{}{}", remote_prefix, r.pattern),
                    local_prefix,
                    remote_prefix,
                    priority: r.priority,
                }
            })
            .collect();
        Self { rules }
    }

    /// Filters to subscribe to on the remote broker (direction IN or BOTH)
    pub fn remote_filters(&self) -> Vec<&str> {
        self.rules
            .iter()
            .filter(|r| r.direction != BridgeDirection::Out)
            .map(|r| r.remote_filter.as_str())
            .collect()
    }

    /// Filters to subscribe to locally (direction OUT or BOTH), with the
    /// delivery priority of each rule
    pub fn local_filters(&self) -> Vec<(&str, Priority)> {
        self.rules
            .iter()
            .filter(|r| r.direction != BridgeDirection::In)
            .map(|r| (r.local_filter.as_str(), r.priority))
            .collect()
    }

    /// Rewrite a local topic for the remote broker: strip the local
    /// prefix, prepend the remote prefix.
    pub fn map_outbound(&self, topic: &str) -> Option<String> {
        let rule = self.most_specific(topic, false)?;
        let stripped = topic.strip_prefix(rule.local_prefix.as_ref())?;
        Some(format!("{}{}", rule.remote_prefix, stripped))
    }

    /// Rewrite a remote topic for the local broker: strip the remote
    /// prefix, prepend the local prefix.
    pub fn map_inbound(&self, topic: &str) -> Option<String> {
        let rule = self.most_specific(topic, true)?;
        let stripped = topic.strip_prefix(rule.remote_prefix.as_ref())?;
        Some(format!("{}{}", rule.local_prefix, stripped))
    }

    fn most_specific(&self, topic: &str, inbound: bool) -> Option<&CompiledRule> {
        self.rules
            .iter()
            .filter(|r| {
                if inbound {
                    r.direction != BridgeDirection::Out
                        && topic_matches_filter(topic, &r.remote_filter)
                } else {
                    r.direction != BridgeDirection::In
                        && topic_matches_filter(topic, &r.local_filter)
                }
            })
            .max_by_key(|r| {
                specificity(if inbound {
                    &r.remote_filter
                } else {
                    &r.local_filter
                })
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(
        pattern: &str,
        direction: BridgeDirection,
        local_prefix: Option<&str>,
        remote_prefix: Option<&str>,
    ) -> BridgeTopicRule {
        BridgeTopicRule {
            pattern: pattern.to_string(),
            direction,
            local_prefix: local_prefix.map(str::to_string),
            remote_prefix: remote_prefix.map(str::to_string),
            priority: Priority::Normal,
        }
    }

    #[test]
    fn test_prefix_rewrite_both_directions() {
        let mapper = TopicMapper::new(&[rule(
            "data/#",
            BridgeDirection::Both,
            Some("site/"),
            None,
        )]);

        assert_eq!(
            mapper.map_outbound("site/data/x").as_deref(),
            Some("data/x")
        );
        assert_eq!(
            mapper.map_inbound("data/y").as_deref(),
            Some("site/data/y")
        );
    }

    #[test]
    fn test_direction_filtering() {
        let mapper = TopicMapper::new(&[rule("out/#", BridgeDirection::Out, None, None)]);
        assert!(mapper.map_outbound("out/x").is_some());
        assert!(mapper.map_inbound("out/x").is_none());

        let mapper = TopicMapper::new(&[rule("in/#", BridgeDirection::In, None, None)]);
        assert!(mapper.map_outbound("in/x").is_none());
        assert!(mapper.map_inbound("in/x").is_some());
    }

    #[test]
    fn test_most_specific_rule_wins() {
        let mapper = TopicMapper::new(&[
            rule("#", BridgeDirection::Both, None, Some("all/")),
            rule("data/#", BridgeDirection::Both, None, Some("narrow/")),
        ]);
        assert_eq!(
            mapper.map_outbound("data/x").as_deref(),
            Some("narrow/data/x")
        );
        assert_eq!(mapper.map_outbound("other").as_deref(), Some("all/other"));
    }

    #[test]
    fn test_filters_carry_prefixes() {
        let mapper = TopicMapper::new(&[rule(
            "data/#",
            BridgeDirection::Both,
            Some("site/"),
            Some("up/"),
        )]);
        assert_eq!(mapper.remote_filters(), vec!["up/data/#"]);
        assert_eq!(
            mapper.local_filters(),
            vec![("site/data/#", Priority::Normal)]
        );
    }

    #[test]
    fn test_no_match_is_dropped() {
        let mapper = TopicMapper::new(&[rule("data/#", BridgeDirection::Both, None, None)]);
        assert!(mapper.map_outbound("other/x").is_none());
    }
}
