//! Watson IoT topic construction and positional parsing.
//!
//! Publish: `iot-2/type/<ept>/id/<ep>/evt/<event_key>/fmt/json`
//! Subscribe: `iot-2/type/<ept>/id/<ep>/cmd/<verb>/fmt/json`

use crate::config::WatsonConfig;
use rumqttc::QoS;
use shadowlink_sdk::topics::{customize_topic, EndpointTopicData, COMMAND_TYPE, DEVICE_TYPE, EPNAME, EVENT_TYPE};

/// Unknown device types fall back to this topic segment.
const DEFAULT_DEVICE_TYPE: &str = "default";

pub fn observe_topic(config: &WatsonConfig, ep_name: &str, ep_type: Option<&str>) -> String {
    customize_topic(
        &config.observe_notification_topic,
        &[
            (EPNAME, ep_name),
            (DEVICE_TYPE, ep_type.unwrap_or(DEFAULT_DEVICE_TYPE)),
            (EVENT_TYPE, &config.observation_key),
        ],
    )
}

/// Reply topic: the observation topic with the event key replaced by the
/// command-response key.
pub fn reply_topic(config: &WatsonConfig, ep_name: &str, ep_type: Option<&str>) -> String {
    observe_topic(config, ep_name, ep_type).replace(&config.observation_key, &config.cmd_response_key)
}

/// API-response topic: the observation topic with the event key replaced by
/// the api-response key.
pub fn api_reply_topic(config: &WatsonConfig, ep_name: &str, ep_type: Option<&str>) -> String {
    observe_topic(config, ep_name, ep_type).replace(&config.observation_key, &config.api_response_key)
}

fn cmd_topic(config: &WatsonConfig, ep_name: &str, ep_type: &str, verb: &str) -> String {
    // legacy installations use lower-case verb segments
    let verb_segment = if config.legacy_bridge {
        verb.to_ascii_lowercase()
    } else {
        verb.to_ascii_uppercase()
    };
    customize_topic(
        &config.coap_cmd_topic,
        &[
            (EPNAME, ep_name),
            (DEVICE_TYPE, ep_type),
            (COMMAND_TYPE, &verb_segment),
        ],
    )
}

/// The CoAP command topic set subscribed per endpoint.
pub fn endpoint_topic_data(config: &WatsonConfig, ep_name: &str, ep_type: &str) -> EndpointTopicData {
    let topics = ["get", "put", "post", "delete"]
        .iter()
        .map(|verb| (cmd_topic(config, ep_name, ep_type, verb), QoS::AtLeastOnce))
        .collect();
    EndpointTopicData::new(topics, ep_type)
}

/// API request topic for an endpoint (the `api` command type).
pub fn api_request_topic(config: &WatsonConfig, ep_name: &str, ep_type: &str) -> String {
    cmd_topic(config, ep_name, ep_type, "api")
}

/// Wildcard pattern matching every inbound command topic.
pub fn command_pattern() -> &'static str {
    "iot-2/type/+/id/+/cmd/+/fmt/json"
}

/// Endpoint name sits at positional segment 4.
/// Format: `iot-2/type/<ept>/id/<ep>/cmd/<verb>/fmt/json`
pub fn endpoint_from_topic(topic: &str) -> Option<String> {
    topic.split('/').nth(4).map(str::to_string)
}

/// CoAP verb sits at positional segment 6.
pub fn verb_from_topic(topic: &str) -> Option<String> {
    topic.split('/').nth(6).map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use shadowlink_common::Settings;
    use shadowlink_common::settings::{Inner, Watson};

    fn config(legacy: bool) -> WatsonConfig {
        WatsonConfig::from_settings(&Settings::from_inner(Inner {
            watson: Watson {
                org_id: "org".into(),
                org_key: "key".into(),
                legacy_bridge: legacy,
                ..Watson::default()
            },
            ..Inner::default()
        }))
    }

    #[test]
    fn observe_and_reply_topics() {
        let config = config(false);
        assert_eq!(
            observe_topic(&config, "d1", Some("light")),
            "iot-2/type/light/id/d1/evt/notify/fmt/json"
        );
        assert_eq!(
            reply_topic(&config, "d1", Some("light")),
            "iot-2/type/light/id/d1/evt/cmd-response/fmt/json"
        );
        assert_eq!(
            api_reply_topic(&config, "d1", Some("light")),
            "iot-2/type/light/id/d1/evt/api-response/fmt/json"
        );
    }

    #[test]
    fn unknown_device_type_defaults() {
        let config = config(false);
        assert_eq!(
            observe_topic(&config, "d1", None),
            "iot-2/type/default/id/d1/evt/notify/fmt/json"
        );
    }

    #[test]
    fn command_topics_upper_case_in_production() {
        let config = config(false);
        let data = endpoint_topic_data(&config, "d1", "light");
        assert_eq!(
            data.topic_string_list,
            vec![
                "iot-2/type/light/id/d1/cmd/GET/fmt/json",
                "iot-2/type/light/id/d1/cmd/PUT/fmt/json",
                "iot-2/type/light/id/d1/cmd/POST/fmt/json",
                "iot-2/type/light/id/d1/cmd/DELETE/fmt/json",
            ]
        );
    }

    #[test]
    fn command_topics_lower_case_in_legacy() {
        let config = config(true);
        let data = endpoint_topic_data(&config, "d1", "light");
        assert_eq!(
            data.topic_string_list[0],
            "iot-2/type/light/id/d1/cmd/get/fmt/json"
        );
        // legacy event key
        assert_eq!(
            observe_topic(&config, "d1", Some("light")),
            "iot-2/type/light/id/d1/evt/observation/fmt/json"
        );
    }

    #[test]
    fn positional_topic_parsing() {
        let topic = "iot-2/type/light/id/d1/cmd/put/fmt/json";
        assert_eq!(endpoint_from_topic(topic).as_deref(), Some("d1"));
        assert_eq!(verb_from_topic(topic).as_deref(), Some("put"));
        assert_eq!(endpoint_from_topic("short/topic"), None);
    }
}
