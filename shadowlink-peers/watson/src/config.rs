//! Watson IoT bindings resolved from the settings templates.

use shadowlink_common::Settings;
use shadowlink_sdk::topics::{customize_topic, ORG_ID, ORG_KEY};

/// Fully-resolved Watson connection and topic bindings.
#[derive(Debug, Clone)]
pub struct WatsonConfig {
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub api_key: String,
    pub auth_token: String,
    pub client_id: String,
    pub observe_notification_topic: String,
    pub coap_cmd_topic: String,
    /// Event key observations publish under ("notify", legacy: "observation").
    pub observation_key: String,
    pub cmd_response_key: String,
    pub api_response_key: String,
    pub legacy_bridge: bool,
    pub device_data_key: String,
    pub domain: String,
    pub max_shadows: usize,
    pub auto_subscribe: bool,
    pub unified_format: bool,
    pub clean_session: bool,
    pub reconnect_sleep_time_ms: u64,
    pub async_response_ttl_secs: u64,
}

impl WatsonConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        let watson = &settings.watson;
        let legacy = watson.legacy_bridge;
        let observation_key = if legacy { "observation" } else { "notify" }.to_string();

        let bindings: [(&str, &str); 2] = [(ORG_ID, &watson.org_id), (ORG_KEY, &watson.org_key)];
        let api_key = customize_topic(&watson.api_key_template, &bindings);
        let mqtt_host = customize_topic(&watson.mqtt_host_template, &bindings);

        // client id carries at most 12 characters of the domain
        let domain = settings.backend.domain.clone();
        let domain_tag: String = domain.chars().take(12).collect();
        let client_id = format!(
            "{}{}",
            customize_topic(&watson.client_id_template, &bindings),
            domain_tag
        );

        Self {
            mqtt_host,
            mqtt_port: watson.mqtt_port,
            api_key,
            auth_token: watson.auth_token.clone(),
            client_id,
            observe_notification_topic: watson.observe_notification_topic.clone(),
            coap_cmd_topic: watson.coap_cmd_topic.clone(),
            observation_key,
            cmd_response_key: "cmd-response".to_string(),
            api_response_key: "api-response".to_string(),
            legacy_bridge: legacy,
            device_data_key: watson.device_data_key.clone(),
            domain,
            max_shadows: settings.mqtt.max_shadows,
            auto_subscribe: settings.mqtt.obs_auto_subscribe,
            unified_format: settings.mqtt.unified_format,
            clean_session: settings.mqtt.clean_session,
            reconnect_sleep_time_ms: settings.mqtt.reconnect_sleep_time_ms,
            async_response_ttl_secs: settings.backend.async_response_ttl_secs,
        }
    }
}
