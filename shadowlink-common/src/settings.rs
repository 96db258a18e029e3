use config::{Config, File};
use serde::Deserialize;
use shadowlink_error::BridgeResult;
use std::{ops::Deref, sync::Arc};

/// Sentinel value shipped in stock config files; the generic processor
/// refuses to connect while the broker address still carries it.
pub const UNCONFIGURED_MQTT_HOST: &str = "Your_MQTT_broker_IP_address_Goes_Here";

#[derive(Debug, Clone)]
pub struct Settings(Arc<Inner>);

impl Deref for Settings {
    type Target = Inner;
    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl Settings {
    pub fn new(config_path: String) -> BridgeResult<Self> {
        let builder = Config::builder()
            .add_source(File::with_name(config_path.as_str()).required(false))
            .add_source(
                config::Environment::with_prefix("SL")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("peers.enabled"),
            );
        let inner: Inner = builder.build()?.try_deserialize()?;
        Ok(Self(Arc::new(inner)))
    }

    /// In-memory settings for tests.
    pub fn from_inner(inner: Inner) -> Self {
        Self(Arc::new(inner))
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Inner {
    #[serde(default)]
    pub backend: Backend,
    #[serde(default)]
    pub log: Log,
    #[serde(default)]
    pub peers: Peers,
    #[serde(default)]
    pub mqtt: Mqtt,
    #[serde(default)]
    pub google_cloud: GoogleCloud,
    #[serde(default)]
    pub watson: Watson,
    #[serde(default)]
    pub iothub: IotHub,
}

/// Log output bindings.
#[derive(Debug, Clone, Deserialize)]
pub struct Log {
    #[serde(default = "Log::directory_default")]
    pub directory: String,
    #[serde(default = "Log::file_name_default")]
    pub file_name: String,
    /// Initial level: trace, debug, info, warn, or error.
    #[serde(default = "Log::level_default")]
    pub level: String,
}

impl Log {
    fn directory_default() -> String {
        "logs".into()
    }

    fn file_name_default() -> String {
        "shadowlink.log".into()
    }

    fn level_default() -> String {
        "info".into()
    }
}

impl Default for Log {
    fn default() -> Self {
        Self {
            directory: Log::directory_default(),
            file_name: Log::file_name_default(),
            level: Log::level_default(),
        }
    }
}

/// Device-management backend bindings: the REST API the orchestrator calls
/// and the long-poll notification channel that feeds the bridge.
#[derive(Debug, Clone, Deserialize)]
pub struct Backend {
    #[serde(default = "Backend::api_host_default")]
    pub api_host: String,
    #[serde(default)]
    pub api_key: String,
    /// Long-poll channel URL; derived from `api_host` when empty.
    #[serde(default)]
    pub long_poll_url: String,
    #[serde(default = "Backend::domain_default")]
    pub domain: String,
    /// Policy switch: treat a de-registration as a device deletion.
    #[serde(default)]
    pub device_removed_on_deregistration: bool,
    /// TTL for outstanding async-response records, in seconds.
    #[serde(default = "Backend::async_ttl_secs_default")]
    pub async_response_ttl_secs: u64,
}

impl Backend {
    fn api_host_default() -> String {
        "https://api.devices.example.com".into()
    }

    fn domain_default() -> String {
        "domain".into()
    }

    fn async_ttl_secs_default() -> u64 {
        1800
    }

    pub fn long_poll_url_resolved(&self) -> String {
        if self.long_poll_url.is_empty() {
            format!("{}/v2/notification/pull", self.api_host)
        } else {
            self.long_poll_url.clone()
        }
    }
}

impl Default for Backend {
    fn default() -> Self {
        Self {
            api_host: Backend::api_host_default(),
            api_key: String::new(),
            long_poll_url: String::new(),
            domain: Backend::domain_default(),
            device_removed_on_deregistration: false,
            async_response_ttl_secs: Backend::async_ttl_secs_default(),
        }
    }
}

/// Which per-cloud processors to bring up.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Peers {
    #[serde(default)]
    pub enabled: Vec<String>,
}

/// Stock MQTT broker bindings for the generic processor, plus the knobs
/// shared by every MQTT-based peer.
#[derive(Debug, Clone, Deserialize)]
pub struct Mqtt {
    #[serde(default = "Mqtt::address_default")]
    pub address: String,
    #[serde(default = "Mqtt::port_default")]
    pub port: u16,
    #[serde(default = "Mqtt::topic_root_default")]
    pub topic_root: String,
    #[serde(default = "Mqtt::request_tag_default")]
    pub request_tag: String,
    #[serde(default)]
    pub clean_session: bool,
    #[serde(default = "Mqtt::obs_auto_subscribe_default")]
    pub obs_auto_subscribe: bool,
    /// Optional envelope key observations are wrapped under ("" = off).
    #[serde(default)]
    pub device_data_key: String,
    #[serde(default = "Mqtt::reconnect_sleep_time_ms_default")]
    pub reconnect_sleep_time_ms: u64,
    #[serde(default = "Mqtt::max_shadows_default")]
    pub max_shadows: usize,
    #[serde(default = "Mqtt::connect_retries_default")]
    pub connect_retries: u32,
    /// Emit the unified-format keys (resourceId/deviceId/payload/method).
    #[serde(default)]
    pub unified_format: bool,
    /// Draft MQTT format: CBOR observations on `<tenant>/lwm2m/ob/<ep>`.
    #[serde(default)]
    pub draft_formats_enabled: bool,
    #[serde(default)]
    pub tenant_id: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

impl Mqtt {
    fn address_default() -> String {
        UNCONFIGURED_MQTT_HOST.into()
    }

    fn port_default() -> u16 {
        1883
    }

    fn topic_root_default() -> String {
        "lwm2m".into()
    }

    fn request_tag_default() -> String {
        "/request".into()
    }

    fn obs_auto_subscribe_default() -> bool {
        true
    }

    fn reconnect_sleep_time_ms_default() -> u64 {
        15_000
    }

    fn max_shadows_default() -> usize {
        100_000
    }

    fn connect_retries_default() -> u32 {
        10
    }
}

impl Default for Mqtt {
    fn default() -> Self {
        Self {
            address: Mqtt::address_default(),
            port: Mqtt::port_default(),
            topic_root: Mqtt::topic_root_default(),
            request_tag: Mqtt::request_tag_default(),
            clean_session: false,
            obs_auto_subscribe: Mqtt::obs_auto_subscribe_default(),
            device_data_key: String::new(),
            reconnect_sleep_time_ms: Mqtt::reconnect_sleep_time_ms_default(),
            max_shadows: Mqtt::max_shadows_default(),
            connect_retries: Mqtt::connect_retries_default(),
            unified_format: false,
            draft_formats_enabled: false,
            tenant_id: String::new(),
            username: String::new(),
            password: String::new(),
        }
    }
}

/// Google Cloud IoT Core bindings. One MQTT session per device, each
/// authenticated with a device-scoped RS256 JWT.
#[derive(Debug, Clone, Deserialize)]
pub struct GoogleCloud {
    /// Service-account auth JSON (the `project_id` key is extracted from it).
    #[serde(default)]
    pub auth_json: String,
    #[serde(default = "GoogleCloud::region_default")]
    pub region: String,
    #[serde(default = "GoogleCloud::registry_name_default")]
    pub registry_name: String,
    #[serde(default = "GoogleCloud::mqtt_host_default")]
    pub mqtt_host: String,
    #[serde(default = "GoogleCloud::mqtt_port_default")]
    pub mqtt_port: u16,
    #[serde(default = "GoogleCloud::mqtt_version_default")]
    pub mqtt_version: String,
    #[serde(default = "GoogleCloud::client_id_template_default")]
    pub client_id_template: String,
    #[serde(default = "GoogleCloud::observe_notification_topic_default")]
    pub observe_notification_topic: String,
    #[serde(default = "GoogleCloud::coap_config_topic_default")]
    pub coap_config_topic: String,
    #[serde(default = "GoogleCloud::coap_state_topic_default")]
    pub coap_state_topic: String,
    #[serde(default = "GoogleCloud::topic_root_default")]
    pub topic_root: String,
    /// Directory holding per-device RSA private keys (`<ep>.pem`).
    #[serde(default = "GoogleCloud::keystore_dir_default")]
    pub keystore_dir: String,
    #[serde(default = "GoogleCloud::jwt_expiration_secs_default")]
    pub jwt_expiration_secs: u64,
    #[serde(default = "GoogleCloud::jwt_refresh_interval_secs_default")]
    pub jwt_refresh_interval_secs: u64,
    #[serde(default = "GoogleCloud::jwt_refresh_wait_ms_default")]
    pub jwt_refresh_wait_ms: u64,
    #[serde(default = "GoogleCloud::wait_for_lock_ms_default")]
    pub wait_for_lock_ms: u64,
}

impl GoogleCloud {
    fn region_default() -> String {
        "us-central1".into()
    }

    fn registry_name_default() -> String {
        "device-registry".into()
    }

    fn mqtt_host_default() -> String {
        "mqtt.googleapis.com".into()
    }

    fn mqtt_port_default() -> u16 {
        8883
    }

    fn mqtt_version_default() -> String {
        "3.1.1".into()
    }

    fn client_id_template_default() -> String {
        "projects/__PROJECT_ID__/locations/__CLOUD_REGION__/registries/__REGISTRY_NAME__/devices/__EPNAME__".into()
    }

    fn observe_notification_topic_default() -> String {
        "/devices/__EPNAME__/events".into()
    }

    fn coap_config_topic_default() -> String {
        "/devices/__EPNAME__/config".into()
    }

    fn coap_state_topic_default() -> String {
        "/devices/__EPNAME__/state".into()
    }

    fn topic_root_default() -> String {
        "lwm2m".into()
    }

    fn keystore_dir_default() -> String {
        "keystore".into()
    }

    fn jwt_expiration_secs_default() -> u64 {
        23 * 60 * 60
    }

    fn jwt_refresh_interval_secs_default() -> u64 {
        5 * 60 * 60
    }

    fn jwt_refresh_wait_ms_default() -> u64 {
        15_000
    }

    fn wait_for_lock_ms_default() -> u64 {
        7_500
    }
}

impl Default for GoogleCloud {
    fn default() -> Self {
        Self {
            auth_json: String::new(),
            region: GoogleCloud::region_default(),
            registry_name: GoogleCloud::registry_name_default(),
            mqtt_host: GoogleCloud::mqtt_host_default(),
            mqtt_port: GoogleCloud::mqtt_port_default(),
            mqtt_version: GoogleCloud::mqtt_version_default(),
            client_id_template: GoogleCloud::client_id_template_default(),
            observe_notification_topic: GoogleCloud::observe_notification_topic_default(),
            coap_config_topic: GoogleCloud::coap_config_topic_default(),
            coap_state_topic: GoogleCloud::coap_state_topic_default(),
            topic_root: GoogleCloud::topic_root_default(),
            keystore_dir: GoogleCloud::keystore_dir_default(),
            jwt_expiration_secs: GoogleCloud::jwt_expiration_secs_default(),
            jwt_refresh_interval_secs: GoogleCloud::jwt_refresh_interval_secs_default(),
            jwt_refresh_wait_ms: GoogleCloud::jwt_refresh_wait_ms_default(),
            wait_for_lock_ms: GoogleCloud::wait_for_lock_ms_default(),
        }
    }
}

/// IBM Watson IoT bindings. One shared MQTT session for all devices.
#[derive(Debug, Clone, Deserialize)]
pub struct Watson {
    #[serde(default)]
    pub org_id: String,
    #[serde(default)]
    pub org_key: String,
    #[serde(default)]
    pub auth_token: String,
    #[serde(default = "Watson::mqtt_host_template_default")]
    pub mqtt_host_template: String,
    #[serde(default = "Watson::mqtt_port_default")]
    pub mqtt_port: u16,
    #[serde(default = "Watson::api_key_template_default")]
    pub api_key_template: String,
    #[serde(default = "Watson::client_id_template_default")]
    pub client_id_template: String,
    #[serde(default = "Watson::observe_notification_topic_default")]
    pub observe_notification_topic: String,
    #[serde(default = "Watson::coap_cmd_topic_default")]
    pub coap_cmd_topic: String,
    /// Legacy installations lower-case command verbs and publish under the
    /// `observation` event key; a legacy and a non-legacy bridge must not
    /// share a topic space.
    #[serde(default)]
    pub legacy_bridge: bool,
    #[serde(default)]
    pub device_data_key: String,
}

impl Watson {
    fn mqtt_host_template_default() -> String {
        "__ORG_ID__.messaging.internetofthings.ibmcloud.com".into()
    }

    fn mqtt_port_default() -> u16 {
        8883
    }

    fn api_key_template_default() -> String {
        "a-__ORG_ID__-__ORG_KEY__".into()
    }

    fn client_id_template_default() -> String {
        "a:__ORG_ID__:".into()
    }

    fn observe_notification_topic_default() -> String {
        "iot-2/type/__DEVICE_TYPE__/id/__EPNAME__/evt/__EVENT_TYPE__/fmt/json".into()
    }

    fn coap_cmd_topic_default() -> String {
        "iot-2/type/__DEVICE_TYPE__/id/__EPNAME__/cmd/__COMMAND_TYPE__/fmt/json".into()
    }
}

impl Default for Watson {
    fn default() -> Self {
        Self {
            org_id: String::new(),
            org_key: String::new(),
            auth_token: String::new(),
            mqtt_host_template: Watson::mqtt_host_template_default(),
            mqtt_port: Watson::mqtt_port_default(),
            api_key_template: Watson::api_key_template_default(),
            client_id_template: Watson::client_id_template_default(),
            observe_notification_topic: Watson::observe_notification_topic_default(),
            coap_cmd_topic: Watson::coap_cmd_topic_default(),
            legacy_bridge: false,
            device_data_key: String::new(),
        }
    }
}

/// MS IoT Hub bindings. One MQTT session per device shadow.
#[derive(Debug, Clone, Deserialize)]
pub struct IotHub {
    #[serde(default)]
    pub hub_name: String,
    #[serde(default)]
    pub sas_token: String,
    #[serde(default = "IotHub::api_version_default")]
    pub api_version: String,
    #[serde(default = "IotHub::mqtt_port_default")]
    pub mqtt_port: u16,
    #[serde(default = "IotHub::observe_notification_topic_default")]
    pub observe_notification_topic: String,
    #[serde(default = "IotHub::coap_cmd_topic_default")]
    pub coap_cmd_topic: String,
}

impl IotHub {
    fn api_version_default() -> String {
        "2016-11-14".into()
    }

    fn mqtt_port_default() -> u16 {
        8883
    }

    fn observe_notification_topic_default() -> String {
        "devices/__EPNAME__/messages/events/".into()
    }

    fn coap_cmd_topic_default() -> String {
        "devices/__EPNAME__/messages/devicebound/#".into()
    }
}

impl Default for IotHub {
    fn default() -> Self {
        Self {
            hub_name: String::new(),
            sas_token: String::new(),
            api_version: IotHub::api_version_default(),
            mqtt_port: IotHub::mqtt_port_default(),
            observe_notification_topic: IotHub::observe_notification_topic_default(),
            coap_cmd_topic: IotHub::coap_cmd_topic_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let inner = Inner::default();
        assert_eq!(inner.mqtt.address, UNCONFIGURED_MQTT_HOST);
        assert_eq!(inner.mqtt.max_shadows, 100_000);
        assert_eq!(inner.google_cloud.jwt_expiration_secs, 23 * 60 * 60);
        assert!(inner.google_cloud.jwt_refresh_interval_secs < inner.google_cloud.jwt_expiration_secs);
        assert!(inner.mqtt.obs_auto_subscribe);
        assert_eq!(inner.log.directory, "logs");
        assert_eq!(inner.log.level, "info");
    }

    #[test]
    fn long_poll_url_derives_from_api_host() {
        let backend = Backend::default();
        assert_eq!(
            backend.long_poll_url_resolved(),
            "https://api.devices.example.com/v2/notification/pull"
        );

        let explicit = Backend {
            long_poll_url: "https://poll.example.com/pull".into(),
            ..Backend::default()
        };
        assert_eq!(explicit.long_poll_url_resolved(), "https://poll.example.com/pull");
    }
}
