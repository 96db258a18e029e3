//! Topic template substitution and per-endpoint topic bookkeeping.
//!
//! Cloud topic layouts are configured as templates carrying placeholders
//! that are bound per tenant and per endpoint at runtime.

use rumqttc::QoS;

pub const EPNAME: &str = "__EPNAME__";
pub const DEVICE_TYPE: &str = "__DEVICE_TYPE__";
pub const COMMAND_TYPE: &str = "__COMMAND_TYPE__";
pub const EVENT_TYPE: &str = "__EVENT_TYPE__";
pub const PROJECT_ID: &str = "__PROJECT_ID__";
pub const CLOUD_REGION: &str = "__CLOUD_REGION__";
pub const REGISTRY_NAME: &str = "__REGISTRY_NAME__";
pub const ORG_ID: &str = "__ORG_ID__";
pub const ORG_KEY: &str = "__ORG_KEY__";

/// Apply a set of placeholder bindings to a topic (or client-id) template.
pub fn customize_topic(template: &str, bindings: &[(&str, &str)]) -> String {
    let mut out = template.to_string();
    for (placeholder, value) in bindings {
        out = out.replace(placeholder, value);
    }
    out
}

/// The per-endpoint topic set a processor subscribes to, plus the raw
/// string list kept for unsubscribe and refresh-time re-subscription.
#[derive(Debug, Clone)]
pub struct EndpointTopicData {
    pub topics: Vec<(String, QoS)>,
    pub topic_string_list: Vec<String>,
    pub ep_type: String,
}

impl EndpointTopicData {
    pub fn new(topics: Vec<(String, QoS)>, ep_type: impl Into<String>) -> Self {
        let topic_string_list = topics.iter().map(|(t, _)| t.clone()).collect();
        Self {
            topics,
            topic_string_list,
            ep_type: ep_type.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitutes_all_placeholders() {
        let t = customize_topic(
            "iot-2/type/__DEVICE_TYPE__/id/__EPNAME__/cmd/__COMMAND_TYPE__/fmt/json",
            &[
                (DEVICE_TYPE, "light"),
                (EPNAME, "d1"),
                (COMMAND_TYPE, "GET"),
            ],
        );
        assert_eq!(t, "iot-2/type/light/id/d1/cmd/GET/fmt/json");
    }

    #[test]
    fn unbound_placeholders_survive() {
        let t = customize_topic("/devices/__EPNAME__/events", &[(DEVICE_TYPE, "x")]);
        assert_eq!(t, "/devices/__EPNAME__/events");
    }

    #[test]
    fn topic_data_tracks_string_list() {
        let data = EndpointTopicData::new(
            vec![
                ("a/b".to_string(), QoS::AtLeastOnce),
                ("c/d".to_string(), QoS::AtMostOnce),
            ],
            "light",
        );
        assert_eq!(data.topic_string_list, vec!["a/b", "c/d"]);
        assert_eq!(data.ep_type, "light");
    }
}
