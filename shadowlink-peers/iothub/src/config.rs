//! MS IoT Hub bindings resolved from settings.

use shadowlink_common::Settings;
use shadowlink_sdk::topics::{customize_topic, EPNAME};

#[derive(Debug, Clone)]
pub struct IotHubConfig {
    pub hub_name: String,
    pub sas_token: String,
    pub api_version: String,
    pub mqtt_port: u16,
    pub observe_notification_topic: String,
    pub coap_cmd_topic: String,
    pub domain: String,
    pub max_shadows: usize,
    pub auto_subscribe: bool,
    pub unified_format: bool,
    pub clean_session: bool,
    pub reconnect_sleep_time_ms: u64,
    pub async_response_ttl_secs: u64,
}

impl IotHubConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        let iothub = &settings.iothub;
        Self {
            hub_name: iothub.hub_name.clone(),
            sas_token: iothub.sas_token.clone(),
            api_version: iothub.api_version.clone(),
            mqtt_port: iothub.mqtt_port,
            observe_notification_topic: iothub.observe_notification_topic.clone(),
            coap_cmd_topic: iothub.coap_cmd_topic.clone(),
            domain: settings.backend.domain.clone(),
            max_shadows: settings.mqtt.max_shadows,
            auto_subscribe: settings.mqtt.obs_auto_subscribe,
            unified_format: settings.mqtt.unified_format,
            clean_session: settings.mqtt.clean_session,
            reconnect_sleep_time_ms: settings.mqtt.reconnect_sleep_time_ms,
            async_response_ttl_secs: settings.backend.async_response_ttl_secs,
        }
    }

    pub fn mqtt_host(&self) -> String {
        format!("{}.azure-devices.net", self.hub_name)
    }

    /// Per-device MQTT username: `<hub-host>/<device-id>/?api-version=...`.
    pub fn username(&self, ep_name: &str) -> String {
        format!(
            "{}/{}/?api-version={}",
            self.mqtt_host(),
            ep_name,
            self.api_version
        )
    }

    /// Telemetry (device-to-cloud) topic; replies publish here too.
    pub fn events_topic(&self, ep_name: &str) -> String {
        customize_topic(&self.observe_notification_topic, &[(EPNAME, ep_name)])
    }

    /// Cloud-to-device command topic subscription.
    pub fn devicebound_topic(&self, ep_name: &str) -> String {
        customize_topic(&self.coap_cmd_topic, &[(EPNAME, ep_name)])
    }

    /// Endpoint name from an inbound topic: `devices/<ep>/messages/...`.
    pub fn endpoint_from_topic(topic: &str) -> Option<String> {
        let mut parts = topic.split('/');
        match (parts.next(), parts.next()) {
            (Some("devices"), Some(ep)) if !ep.is_empty() => Some(ep.to_string()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shadowlink_common::settings::{Inner, IotHub};

    fn config() -> IotHubConfig {
        IotHubConfig::from_settings(&Settings::from_inner(Inner {
            iothub: IotHub {
                hub_name: "myhub".into(),
                sas_token: "SharedAccessSignature sr=...".into(),
                ..IotHub::default()
            },
            ..Inner::default()
        }))
    }

    #[test]
    fn host_and_username_shapes() {
        let config = config();
        assert_eq!(config.mqtt_host(), "myhub.azure-devices.net");
        assert_eq!(
            config.username("d1"),
            "myhub.azure-devices.net/d1/?api-version=2016-11-14"
        );
    }

    #[test]
    fn topic_shapes() {
        let config = config();
        assert_eq!(config.events_topic("d1"), "devices/d1/messages/events/");
        assert_eq!(
            config.devicebound_topic("d1"),
            "devices/d1/messages/devicebound/#"
        );
    }

    #[test]
    fn endpoint_parses_from_topic() {
        assert_eq!(
            IotHubConfig::endpoint_from_topic("devices/d1/messages/devicebound/x").as_deref(),
            Some("d1")
        );
        assert_eq!(IotHubConfig::endpoint_from_topic("other/d1"), None);
    }
}
