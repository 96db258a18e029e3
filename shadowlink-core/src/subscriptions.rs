//! Tracks which (domain, endpoint, type, resource-path) tuples the backend
//! is observing on behalf of a peer cloud.

use dashmap::DashMap;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionKey {
    pub domain: String,
    pub ep_name: String,
    pub ep_type: String,
    pub path: String,
}

impl SubscriptionKey {
    pub fn new(domain: &str, ep_name: &str, ep_type: &str, path: &str) -> Self {
        Self {
            domain: domain.to_string(),
            ep_name: ep_name.to_string(),
            ep_type: ep_type.to_string(),
            path: path.to_string(),
        }
    }
}

#[derive(Default)]
pub struct SubscriptionManager {
    entries: DashMap<SubscriptionKey, bool>,
}

impl SubscriptionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert (or refresh) a subscription with its observable flag. The key
    /// is unique; a prior entry is replaced.
    pub fn add(&self, key: SubscriptionKey, observable: bool) {
        self.entries.insert(key, observable);
    }

    pub fn contains(&self, key: &SubscriptionKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn is_observable(&self, key: &SubscriptionKey) -> Option<bool> {
        self.entries.get(key).map(|e| *e.value())
    }

    pub fn remove(&self, key: &SubscriptionKey) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Drop every subscription recorded for an endpoint.
    pub fn remove_endpoint(&self, ep_name: &str) {
        self.entries.retain(|k, _| k.ep_name != ep_name);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A resource is observable when its registration record says so; the flag
/// arrives either as a boolean or as the string "true".
pub fn is_observable_resource(resource: &Value) -> bool {
    match resource.get("obs") {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => s.eq_ignore_ascii_case("true"),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn add_replaces_existing_entry() {
        let subs = SubscriptionManager::new();
        let key = SubscriptionKey::new("domain", "d1", "light", "/3303/0/5700");
        subs.add(key.clone(), false);
        subs.add(key.clone(), true);
        assert_eq!(subs.len(), 1);
        assert_eq!(subs.is_observable(&key), Some(true));
    }

    #[test]
    fn remove_endpoint_drops_all_paths() {
        let subs = SubscriptionManager::new();
        subs.add(SubscriptionKey::new("domain", "d1", "light", "/3303/0/5700"), true);
        subs.add(SubscriptionKey::new("domain", "d1", "light", "/3303/0/5701"), true);
        subs.add(SubscriptionKey::new("domain", "d2", "light", "/3303/0/5700"), true);

        subs.remove_endpoint("d1");
        assert_eq!(subs.len(), 1);
        assert!(subs.contains(&SubscriptionKey::new("domain", "d2", "light", "/3303/0/5700")));
    }

    #[test]
    fn observable_flag_shapes() {
        assert!(is_observable_resource(&json!({"obs": "true"})));
        assert!(is_observable_resource(&json!({"obs": "TRUE"})));
        assert!(is_observable_resource(&json!({"obs": true})));
        assert!(!is_observable_resource(&json!({"obs": "false"})));
        assert!(!is_observable_resource(&json!({"path": "/1/0/1"})));
    }
}
