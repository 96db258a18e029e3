//! In-memory endpoint registry: the single source of truth for which
//! device shadows are live and which topic set each one subscribed.

use dashmap::DashMap;
use shadowlink_sdk::EndpointTopicData;
use tracing::warn;

pub struct EndpointRegistry {
    topic_data: DashMap<String, EndpointTopicData>,
    types: DashMap<String, String>,
    max_shadows: usize,
}

impl EndpointRegistry {
    pub fn new(max_shadows: usize) -> Self {
        Self {
            topic_data: DashMap::new(),
            types: DashMap::new(),
            max_shadows,
        }
    }

    /// Replace any prior topic data for the endpoint. Exactly one entry
    /// exists per live endpoint.
    pub fn insert(&self, ep_name: &str, data: EndpointTopicData) {
        self.types
            .insert(ep_name.to_string(), data.ep_type.clone());
        self.topic_data.insert(ep_name.to_string(), data);
    }

    pub fn topic_data(&self, ep_name: &str) -> Option<EndpointTopicData> {
        self.topic_data.get(ep_name).map(|e| e.value().clone())
    }

    /// Topic strings to unsubscribe / re-subscribe for this endpoint.
    pub fn topic_strings(&self, ep_name: &str) -> Vec<String> {
        self.topic_data
            .get(ep_name)
            .map(|e| e.topic_string_list.clone())
            .unwrap_or_default()
    }

    pub fn has_subscriptions(&self, ep_name: &str) -> bool {
        self.topic_data
            .get(ep_name)
            .map(|e| !e.topic_string_list.is_empty())
            .unwrap_or(false)
    }

    /// Remove the endpoint entry and its type mapping; idempotent.
    pub fn remove(&self, ep_name: &str) -> Option<EndpointTopicData> {
        self.types.remove(ep_name);
        self.topic_data.remove(ep_name).map(|(_, v)| v)
    }

    pub fn set_endpoint_type(&self, ep_name: &str, ep_type: &str) {
        self.types.insert(ep_name.to_string(), ep_type.to_string());
    }

    pub fn endpoint_type(&self, ep_name: &str) -> Option<String> {
        self.types.get(ep_name).map(|e| e.value().clone())
    }

    pub fn len(&self) -> usize {
        self.topic_data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.topic_data.is_empty()
    }

    /// Shadow-count cap; registrations beyond it are refused.
    pub fn can_accept_new_shadow(&self, ep_name: &str) -> bool {
        if self.topic_data.contains_key(ep_name) {
            return true;
        }
        if self.topic_data.len() >= self.max_shadows {
            warn!(
                ep = ep_name,
                max_shadows = self.max_shadows,
                "shadow limit reached, refusing registration"
            );
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rumqttc::QoS;

    fn topic_data(ep_type: &str) -> EndpointTopicData {
        EndpointTopicData::new(
            vec![(format!("cmd/{ep_type}"), QoS::AtLeastOnce)],
            ep_type,
        )
    }

    #[test]
    fn exactly_one_entry_per_endpoint() {
        let reg = EndpointRegistry::new(10);
        reg.insert("d1", topic_data("light"));
        reg.insert("d1", topic_data("switch"));
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.endpoint_type("d1").as_deref(), Some("switch"));
    }

    #[test]
    fn removal_is_idempotent_and_clears_type() {
        let reg = EndpointRegistry::new(10);
        reg.insert("d1", topic_data("light"));
        assert!(reg.remove("d1").is_some());
        assert!(reg.remove("d1").is_none());
        assert_eq!(reg.endpoint_type("d1"), None);
        assert!(!reg.has_subscriptions("d1"));
    }

    #[test]
    fn shadow_cap_enforced_for_new_endpoints_only() {
        let reg = EndpointRegistry::new(1);
        reg.insert("d1", topic_data("light"));
        assert!(reg.can_accept_new_shadow("d1"));
        assert!(!reg.can_accept_new_shadow("d2"));
    }
}
