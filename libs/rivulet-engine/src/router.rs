use std::collections::{BTreeSet, HashMap};

use crate::error::EngineError;

/// Binding of one agent id to the set of topics it consumes.
///
/// One subscription per agent id; a topic may appear in any number of
/// subscriptions (fan-out). More than one topic in a subscription merges
/// the streams in receipt order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub agent_id: String,
    pub topics: BTreeSet<String>,
}

impl Subscription {
    pub fn new(agent_id: impl Into<String>, topics: impl IntoIterator<Item = String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            topics: topics.into_iter().collect(),
        }
    }
}

/// Maps incoming record topics to the agents subscribed to them.
#[derive(Debug, Default)]
pub struct TopicRouter {
    by_agent: HashMap<String, Subscription>,
    /// topic -> agent ids, in registration order.
    by_topic: HashMap<String, Vec<String>>,
}

impl TopicRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscription. Fails if the agent id is already bound.
    pub fn register(&mut self, sub: Subscription) -> Result<(), EngineError> {
        if self.by_agent.contains_key(&sub.agent_id) {
            return Err(EngineError::DuplicateAgent(sub.agent_id));
        }
        for topic in &sub.topics {
            self.by_topic
                .entry(topic.clone())
                .or_default()
                .push(sub.agent_id.clone());
        }
        self.by_agent.insert(sub.agent_id.clone(), sub);
        Ok(())
    }

    /// All agents subscribed to `topic`, in registration order.
    pub fn route(&self, topic: &str) -> &[String] {
        self.by_topic.get(topic).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn subscription(&self, agent_id: &str) -> Option<&Subscription> {
        self.by_agent.get(agent_id)
    }

    /// All subscribed topics, deduplicated.
    pub fn topics(&self) -> Vec<String> {
        let mut names: Vec<String> = self.by_topic.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn agent_ids(&self) -> Vec<String> {
        self.by_agent.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.by_agent.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sub(id: &str, topics: &[&str]) -> Subscription {
        Subscription::new(id, topics.iter().map(|t| t.to_string()))
    }

    #[test]
    fn duplicate_agent_rejected() {
        let mut router = TopicRouter::new();
        router.register(sub("a", &["t1"])).unwrap();
        let err = router.register(sub("a", &["t2"])).unwrap_err();
        assert!(matches!(err, EngineError::DuplicateAgent(id) if id == "a"));
    }

    #[test]
    fn fan_out_resolves_all_subscribers() {
        let mut router = TopicRouter::new();
        router.register(sub("a", &["topic1"])).unwrap();
        router.register(sub("b", &["topic1", "topic2"])).unwrap();

        assert_eq!(router.route("topic1"), ["a", "b"]);
        assert_eq!(router.route("topic2"), ["b"]);
        assert!(router.route("topic3").is_empty());
    }

    #[test]
    fn merge_subscription_covers_all_topics() {
        let mut router = TopicRouter::new();
        router.register(sub("c", &["topic1", "topic2"])).unwrap();

        assert_eq!(router.route("topic1"), ["c"]);
        assert_eq!(router.route("topic2"), ["c"]);
        assert_eq!(router.topics(), ["topic1", "topic2"]);
    }
}
