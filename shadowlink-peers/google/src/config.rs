//! Google Cloud IoT Core bindings resolved from settings.

use serde_json::Value;
use shadowlink_common::Settings;
use shadowlink_sdk::topics::{customize_topic, CLOUD_REGION, EPNAME, PROJECT_ID, REGISTRY_NAME};
use tracing::warn;

#[derive(Debug, Clone)]
pub struct GoogleConfig {
    pub project_id: String,
    pub application_name: String,
    pub region: String,
    pub registry_name: String,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_version: String,
    pub client_id_template: String,
    pub observe_notification_topic: String,
    pub coap_config_topic: String,
    pub coap_state_topic: String,
    /// Event tag observations publish under; replies swap it for the state tag.
    pub observation_key: String,
    pub cmd_response_key: String,
    pub topic_root: String,
    pub keystore_dir: String,
    pub jwt_expiration_secs: u64,
    pub jwt_refresh_interval_secs: u64,
    pub jwt_refresh_wait_ms: u64,
    pub wait_for_lock_ms: u64,
    pub max_retries: u32,
    pub domain: String,
    pub max_shadows: usize,
    pub auto_subscribe: bool,
    pub unified_format: bool,
    pub clean_session: bool,
    pub reconnect_sleep_time_ms: u64,
    pub async_response_ttl_secs: u64,
}

impl GoogleConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        let google = &settings.google_cloud;
        let project_id = project_id_from_auth_json(&google.auth_json).unwrap_or_else(|| {
            warn!("google auth JSON carries no project_id");
            String::new()
        });
        let application_name = application_name(&project_id);

        Self {
            project_id,
            application_name,
            region: google.region.clone(),
            registry_name: google.registry_name.clone(),
            mqtt_host: google.mqtt_host.clone(),
            mqtt_port: google.mqtt_port,
            mqtt_version: google.mqtt_version.clone(),
            client_id_template: google.client_id_template.clone(),
            observe_notification_topic: google.observe_notification_topic.clone(),
            coap_config_topic: google.coap_config_topic.clone(),
            coap_state_topic: google.coap_state_topic.clone(),
            observation_key: "events".to_string(),
            cmd_response_key: "state".to_string(),
            topic_root: google.topic_root.clone(),
            keystore_dir: google.keystore_dir.clone(),
            jwt_expiration_secs: google.jwt_expiration_secs,
            jwt_refresh_interval_secs: google.jwt_refresh_interval_secs,
            jwt_refresh_wait_ms: google.jwt_refresh_wait_ms,
            wait_for_lock_ms: if google.wait_for_lock_ms == 0 {
                7_500
            } else {
                google.wait_for_lock_ms
            },
            max_retries: settings.mqtt.connect_retries,
            domain: settings.backend.domain.clone(),
            max_shadows: settings.mqtt.max_shadows,
            auto_subscribe: settings.mqtt.obs_auto_subscribe,
            unified_format: settings.mqtt.unified_format,
            clean_session: settings.mqtt.clean_session,
            reconnect_sleep_time_ms: settings.mqtt.reconnect_sleep_time_ms,
            async_response_ttl_secs: settings.backend.async_response_ttl_secs,
        }
    }

    /// Backend endpoint id to Google device id: `<topic_root>_<ep>`.
    pub fn google_device_id(&self, ep_name: &str) -> String {
        format!("{}_{}", self.topic_root, ep_name)
    }

    /// Google device id back to the backend endpoint id.
    pub fn ep_from_google_device_id(&self, device_id: &str) -> String {
        let prefix = format!("{}_", self.topic_root);
        device_id.replacen(&prefix, "", 1)
    }

    pub fn client_id(&self, ep_name: &str) -> String {
        customize_topic(
            &self.client_id_template,
            &[
                (PROJECT_ID, &self.project_id),
                (CLOUD_REGION, &self.region),
                (REGISTRY_NAME, &self.registry_name),
                (EPNAME, &self.google_device_id(ep_name)),
            ],
        )
    }

    pub fn observe_topic(&self, ep_name: &str) -> String {
        customize_topic(
            &self.observe_notification_topic,
            &[(EPNAME, &self.google_device_id(ep_name))],
        )
    }

    pub fn config_topic(&self, ep_name: &str) -> String {
        customize_topic(
            &self.coap_config_topic,
            &[(EPNAME, &self.google_device_id(ep_name))],
        )
    }

    pub fn state_topic(&self, ep_name: &str) -> String {
        customize_topic(
            &self.coap_state_topic,
            &[(EPNAME, &self.google_device_id(ep_name))],
        )
    }

    /// Async and synchronous replies publish on the observation topic with
    /// the event tag swapped for the state tag.
    pub fn reply_topic(&self, ep_name: &str) -> String {
        self.observe_topic(ep_name)
            .replace(&self.observation_key, &self.cmd_response_key)
    }

    /// Endpoint name from an inbound topic.
    /// Format: `/devices/<google_device_id>/config` (segment 2; the topic
    /// carries a leading slash).
    pub fn endpoint_from_topic(&self, topic: &str) -> Option<String> {
        let device_id = topic.split('/').nth(2)?;
        if device_id.is_empty() {
            return None;
        }
        Some(self.ep_from_google_device_id(device_id))
    }
}

/// Pull `project_id` out of the service-account auth JSON. Non-breaking
/// spaces sneak in when the JSON is pasted through a configurator; they are
/// scrubbed before parsing.
pub fn project_id_from_auth_json(auth_json: &str) -> Option<String> {
    if auth_json.trim().is_empty() {
        return None;
    }
    let cleaned: String = auth_json
        .chars()
        .map(|c| if c == '\u{00A0}' { ' ' } else { c })
        .collect();
    let parsed: Value = serde_json::from_str(&cleaned).ok()?;
    parsed
        .get("project_id")
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// The application name is the first dash-separated segment of the project.
pub fn application_name(project_id: &str) -> String {
    project_id
        .split('-')
        .next()
        .unwrap_or(project_id)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use shadowlink_common::settings::{GoogleCloud, Inner};

    fn config() -> GoogleConfig {
        GoogleConfig::from_settings(&Settings::from_inner(Inner {
            google_cloud: GoogleCloud {
                auth_json: r#"{"project_id":"bridge-test-project"}"#.into(),
                region: "us-central1".into(),
                registry_name: "registry".into(),
                ..GoogleCloud::default()
            },
            ..Inner::default()
        }))
    }

    #[test]
    fn project_id_extraction_scrubs_nbsp() {
        let with_nbsp = "{\"project_id\":\u{00A0}\"p-1\"}";
        assert_eq!(project_id_from_auth_json(with_nbsp).as_deref(), Some("p-1"));
        assert_eq!(project_id_from_auth_json(""), None);
        assert_eq!(project_id_from_auth_json("{}"), None);
    }

    #[test]
    fn application_name_is_first_segment() {
        assert_eq!(application_name("bridge-test-project"), "bridge");
        assert_eq!(application_name("plain"), "plain");
    }

    #[test]
    fn device_id_mapping_round_trips() {
        let config = config();
        assert_eq!(config.google_device_id("d1"), "lwm2m_d1");
        assert_eq!(config.ep_from_google_device_id("lwm2m_d1"), "d1");
    }

    #[test]
    fn topics_bind_the_device_id() {
        let config = config();
        assert_eq!(config.observe_topic("d1"), "/devices/lwm2m_d1/events");
        assert_eq!(config.config_topic("d1"), "/devices/lwm2m_d1/config");
        assert_eq!(config.state_topic("d1"), "/devices/lwm2m_d1/state");
        assert_eq!(config.reply_topic("d1"), "/devices/lwm2m_d1/state");
    }

    #[test]
    fn client_id_resolves_full_path() {
        let config = config();
        assert_eq!(
            config.client_id("d1"),
            "projects/bridge-test-project/locations/us-central1/registries/registry/devices/lwm2m_d1"
        );
    }

    #[test]
    fn endpoint_from_config_topic() {
        let config = config();
        assert_eq!(
            config.endpoint_from_topic("/devices/lwm2m_d1/config").as_deref(),
            Some("d1")
        );
        assert_eq!(config.endpoint_from_topic("bad"), None);
    }
}
