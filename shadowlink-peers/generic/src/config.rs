//! Stock-broker bindings for the generic MQTT processor.

use shadowlink_common::{settings::UNCONFIGURED_MQTT_HOST, Settings};

#[derive(Debug, Clone)]
pub struct GenericConfig {
    pub address: String,
    pub port: u16,
    pub topic_root: String,
    pub request_tag: String,
    pub response_tag: String,
    pub username: String,
    pub password: String,
    /// Optional envelope key observations are wrapped under ("" = off).
    pub device_data_key: String,
    pub draft_formats_enabled: bool,
    pub tenant_id: String,
    pub domain: String,
    pub max_shadows: usize,
    pub auto_subscribe: bool,
    pub unified_format: bool,
    pub clean_session: bool,
    pub reconnect_sleep_time_ms: u64,
    pub async_response_ttl_secs: u64,
}

impl GenericConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        let mqtt = &settings.mqtt;
        Self {
            address: mqtt.address.clone(),
            port: mqtt.port,
            topic_root: mqtt.topic_root.clone(),
            request_tag: mqtt.request_tag.clone(),
            response_tag: "/response".to_string(),
            username: mqtt.username.clone(),
            password: mqtt.password.clone(),
            device_data_key: mqtt.device_data_key.clone(),
            draft_formats_enabled: mqtt.draft_formats_enabled,
            tenant_id: mqtt.tenant_id.clone(),
            domain: settings.backend.domain.clone(),
            max_shadows: mqtt.max_shadows,
            auto_subscribe: mqtt.obs_auto_subscribe,
            unified_format: mqtt.unified_format,
            clean_session: mqtt.clean_session,
            reconnect_sleep_time_ms: mqtt.reconnect_sleep_time_ms,
            async_response_ttl_secs: settings.backend.async_response_ttl_secs,
        }
    }

    /// The broker is usable only once the operator replaced the stock
    /// sentinel address.
    pub fn host_configured(&self) -> bool {
        !self.address.trim().is_empty() && self.address != UNCONFIGURED_MQTT_HOST
    }

    /// Listen topic: `<topic_root><request_tag>/<domain>/#`.
    pub fn request_topic(&self) -> String {
        format!("{}{}/{}/#", self.topic_root, self.request_tag, self.domain)
    }

    /// Tunneled-API request topic: `<topic_root>/api`.
    pub fn api_request_topic(&self) -> String {
        format!("{}/api", self.topic_root)
    }

    /// API responses publish under the api-response key off the topic root.
    pub fn api_response_topic(&self) -> String {
        format!("{}/api-response", self.topic_root)
    }

    /// Notification topic: `<topic_root>/notify/<ept>/<ep><uri>`.
    pub fn notification_topic(&self, ep_type: &str, ep_name: &str, uri: &str) -> String {
        format!("{}/notify/{}/{}{}", self.topic_root, ep_type, ep_name, uri)
    }

    /// Reply topic: the request layout with the request tag swapped for the
    /// response tag.
    pub fn reply_topic(&self, ep_name: &str) -> String {
        format!(
            "{}{}/{}/{}",
            self.topic_root, self.response_tag, self.domain, ep_name
        )
    }

    /// Draft-format uplink listen topic: `<tenant>/lwm2m/rd/+/uplink`.
    pub fn draft_uplink_topic(&self) -> String {
        format!("{}/lwm2m/rd/+/uplink", self.tenant_id)
    }

    /// Endpoint name from a request topic.
    /// Format: `<topic_root>/request/<domain>/<ep>/...` (segment 3).
    pub fn endpoint_from_topic(topic: &str) -> Option<String> {
        topic
            .split('/')
            .nth(3)
            .filter(|ep| !ep.is_empty())
            .map(str::to_string)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shadowlink_common::settings::{Inner, Mqtt};

    fn config(address: &str) -> GenericConfig {
        GenericConfig::from_settings(&Settings::from_inner(Inner {
            mqtt: Mqtt {
                address: address.into(),
                tenant_id: "tenant1".into(),
                ..Mqtt::default()
            },
            ..Inner::default()
        }))
    }

    #[test]
    fn sentinel_host_is_unconfigured() {
        assert!(!config(UNCONFIGURED_MQTT_HOST).host_configured());
        assert!(!config("").host_configured());
        assert!(config("broker.local").host_configured());
    }

    #[test]
    fn topic_layouts() {
        let config = config("broker.local");
        assert_eq!(config.request_topic(), "lwm2m/request/domain/#");
        assert_eq!(config.api_request_topic(), "lwm2m/api");
        assert_eq!(config.api_response_topic(), "lwm2m/api-response");
        assert_eq!(
            config.notification_topic("light", "d1", "/3303/0/5700"),
            "lwm2m/notify/light/d1/3303/0/5700"
        );
        assert_eq!(config.reply_topic("d1"), "lwm2m/response/domain/d1");
        assert_eq!(config.draft_uplink_topic(), "tenant1/lwm2m/rd/+/uplink");
    }

    #[test]
    fn endpoint_parses_from_request_topic() {
        assert_eq!(
            GenericConfig::endpoint_from_topic("lwm2m/request/domain/d1/extra").as_deref(),
            Some("d1")
        );
        assert_eq!(GenericConfig::endpoint_from_topic("lwm2m/api"), None);
    }
}
