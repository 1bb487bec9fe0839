//! Topic membership.
//!
//! Membership is owned by whatever conversation layer sits above pedia;
//! the engine only asks who is in a topic and whether a peer belongs.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use pedia_core::{PeerId, TopicId};

pub trait TopicDirectory: Send + Sync {
    fn get_topic_members(&self, topic: &TopicId) -> HashSet<PeerId>;

    fn is_member(&self, topic: &TopicId, peer: &PeerId) -> bool;
}

/// Directory kept in memory and edited through the API.
#[derive(Clone, Default)]
pub struct MemoryTopics {
    members: Arc<DashMap<TopicId, HashSet<PeerId>>>,
}

impl MemoryTopics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_member(&self, topic: &TopicId, peer: PeerId) {
        self.members.entry(topic.clone()).or_default().insert(peer);
    }

    pub fn remove_member(&self, topic: &TopicId, peer: &PeerId) {
        if let Some(mut set) = self.members.get_mut(topic) {
            set.remove(peer);
        }
        self.members.remove_if(topic, |_, set| set.is_empty());
    }

    pub fn topics(&self) -> Vec<TopicId> {
        self.members.iter().map(|e| e.key().clone()).collect()
    }
}

impl TopicDirectory for MemoryTopics {
    fn get_topic_members(&self, topic: &TopicId) -> HashSet<PeerId> {
        self.members
            .get(topic)
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    fn is_member(&self, topic: &TopicId, peer: &PeerId) -> bool {
        self.members
            .get(topic)
            .map(|s| s.contains(peer))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_and_remove_members() {
        let topics = MemoryTopics::new();
        let t = TopicId::from("room");
        topics.add_member(&t, PeerId::from("a"));
        topics.add_member(&t, PeerId::from("b"));
        assert!(topics.is_member(&t, &PeerId::from("a")));
        assert_eq!(topics.get_topic_members(&t).len(), 2);

        topics.remove_member(&t, &PeerId::from("a"));
        topics.remove_member(&t, &PeerId::from("b"));
        assert!(topics.get_topic_members(&t).is_empty());
        assert!(topics.topics().is_empty());
    }

    #[test]
    fn unknown_topic_is_empty() {
        let topics = MemoryTopics::new();
        assert!(!topics.is_member(&TopicId::from("x"), &PeerId::from("a")));
    }
}
