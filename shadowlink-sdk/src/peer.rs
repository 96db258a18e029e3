//! The peer-processor capability surface and the orchestrator-facing
//! interfaces a processor consumes.
//!
//! Processors are owned by the orchestrator; each processor holds a weak
//! back-reference used only to invoke orchestrator operations, never for
//! lifetime. Shutdown order is processors first, orchestrator second.

use crate::envelope::{ApiRequest, ApiResponse};
use async_trait::async_trait;
use serde_json::Value;
use shadowlink_error::BridgeResult;
use std::sync::Weak;
use tracing::{info, warn};

/// Weak back-reference to the orchestrator facade.
pub type OrchestratorHandle = Weak<dyn OrchestratorApi>;

/// The orchestrator facade consumed by every processor.
#[async_trait]
pub trait OrchestratorApi: Send + Sync {
    /// Route a tunneled bridge-administration REST call.
    async fn process_api_request_operation(&self, request: ApiRequest) -> ApiResponse;

    /// Dispatch a CoAP resource operation to the backend. Returns the raw
    /// response body, or `None` when the backend rejected the call.
    async fn process_endpoint_resource_operation(
        &self,
        verb: &str,
        ep_name: &str,
        uri: &str,
        value: Option<String>,
        options: Option<String>,
    ) -> Option<String>;

    /// Establish a backend observation on `(ep, uri)`.
    async fn subscribe_to_endpoint_resource(&self, ep_name: &str, uri: &str) -> bool;

    /// Fetch device metadata and merge it into the endpoint record.
    async fn pull_device_metadata(&self, endpoint: Value) -> Value;

    /// Policy switch: treat de-registrations as device deletions.
    fn device_removed_on_deregistration(&self) -> bool;
}

/// Cloud-side device registry operations (provisioning SDKs live behind
/// this seam; the bridge only consumes the interface).
#[async_trait]
pub trait ShadowRegistry: Send + Sync {
    /// Create (or upsert) the cloud shadow for an endpoint record.
    async fn create_shadow(&self, endpoint: &Value) -> bool;

    /// Delete the cloud shadow; `false` leaves the endpoint unregistered.
    async fn delete_shadow(&self, ep_name: &str) -> bool;
}

/// Registry stand-in that records intent in the log and accepts every
/// operation; used where no provisioning SDK is wired in.
pub struct LoggingShadowRegistry {
    platform: &'static str,
}

impl LoggingShadowRegistry {
    pub fn new(platform: &'static str) -> Self {
        Self { platform }
    }
}

#[async_trait]
impl ShadowRegistry for LoggingShadowRegistry {
    async fn create_shadow(&self, endpoint: &Value) -> bool {
        let ep = endpoint.get("ep").and_then(Value::as_str).unwrap_or("");
        info!(platform = self.platform, ep, "creating device shadow");
        true
    }

    async fn delete_shadow(&self, ep_name: &str) -> bool {
        info!(platform = self.platform, ep = ep_name, "deleting device shadow");
        true
    }
}

/// Session factory seam: per-device-session clouds create and start an
/// MQTT connection for an endpoint on demand; shared-session clouds accept
/// every endpoint onto the one session they already run.
#[async_trait]
pub trait ConnectionCreator: Send + Sync {
    /// Ensure a started MQTT session exists for `ep_name`. Two concurrent
    /// calls for the same endpoint must converge on a single session.
    async fn create_and_start_mqtt_for_endpoint(
        &self,
        ep_name: &str,
        ep_type: &str,
        topics: Option<&[(String, rumqttc::QoS)]>,
    ) -> bool;

    /// Subscribe the endpoint's session to the given topics.
    async fn subscribe_to_topics(&self, ep_name: &str, topics: &[(String, rumqttc::QoS)]) -> bool;
}

/// The per-peer processor capability set. One implementation per cloud,
/// selected by configuration; shared behavior lives in the composable
/// processor core, not in a superclass.
#[async_trait]
pub trait PeerProcessor: Send + Sync {
    fn name(&self) -> &'static str;

    /// Establish the default session and start listening. Processors with
    /// per-device sessions only have sessions once devices register.
    async fn init_listener(&self) -> BridgeResult<()>;

    /// Close the default session; idempotent.
    async fn stop_listener(&self);

    /// Device observations from the backend notification channel.
    async fn process_notification(&self, data: &Value);

    /// New shadow registrations under `data[key]`.
    async fn process_registration(&self, data: &Value, key: &str);

    /// Re-registrations: endpoints without recorded subscriptions are
    /// treated as fresh registrations.
    async fn process_re_registration(&self, data: &Value);

    /// Returns the affected endpoint names.
    async fn process_deregistrations(&self, data: &Value) -> Vec<String>;

    /// Returns the affected endpoint names.
    async fn process_device_deletions(&self, data: &Value) -> Vec<String>;

    /// Backend completions for outstanding async responses.
    async fn process_async_responses(&self, data: &Value);

    /// Finish bringing up a new device shadow once its metadata arrived.
    async fn complete_new_device_registration(&self, endpoint: Value);

    /// Route a raw backend notification-channel message by top-level key.
    async fn process_device_server_message(&self, message: &str) {
        let parsed: Value = match serde_json::from_str(message) {
            Ok(v) => v,
            Err(e) => {
                warn!(processor = self.name(), error = %e, "undecodable backend message");
                return;
            }
        };

        if parsed.get("async-responses").is_some() {
            self.process_async_responses(&parsed).await;
        }
        if parsed.get("notifications").is_some() {
            self.process_notification(&parsed).await;
        }
        if parsed.get("registrations").is_some() {
            self.process_registration(&parsed, "registrations").await;
        }
        if parsed.get("reg-updates").is_some() {
            self.process_re_registration(&parsed).await;
        }
        if parsed.get("de-registrations").is_some() {
            self.process_deregistrations(&parsed).await;
        }
        if parsed.get("registrations-expired").is_some() {
            self.process_device_deletions(&parsed).await;
        }
    }
}
