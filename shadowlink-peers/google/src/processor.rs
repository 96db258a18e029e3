//! Google Cloud IoT Core peer processor.
//!
//! Every device shadow owns its MQTT session because each JWT is
//! device-scoped. Commands arrive on the per-device config topic,
//! observations publish to the events topic, and replies publish to the
//! state topic. A process-wide lock serializes command dispatch against
//! the backend.

use crate::{config::GoogleConfig, jwt::create_device_jwt, refresher};
use async_trait::async_trait;
use backoff::backoff::Backoff;
use dashmap::DashMap;
use rumqttc::{MqttOptions, QoS, Transport};
use serde_json::Value;
use shadowlink_common::Settings;
use shadowlink_core::{async_responses::format_async_reply, CommandOutcome, PeerCore};
use shadowlink_error::{BridgeError, BridgeResult};
use shadowlink_sdk::{
    mqtt::{MqttSession, ReceiveCallback, SessionConfig},
    peer::{ConnectionCreator, OrchestratorHandle, PeerProcessor, ShadowRegistry},
    EndpointTopicData, ReconnectSchedule,
};
use std::{
    future::Future,
    pin::Pin,
    sync::{Arc, Weak},
    time::Duration,
};
use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Lifecycle of one per-device session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceSessionState {
    Disconnected,
    Connecting,
    Connected,
    Refreshing,
    Disconnecting,
}

pub struct GoogleProcessor {
    core: Arc<PeerCore>,
    config: GoogleConfig,
    sessions: DashMap<String, Arc<MqttSession>>,
    states: DashMap<String, DeviceSessionState>,
    refreshers: DashMap<String, CancellationToken>,
    registry: Arc<dyn ShadowRegistry>,
    command_lock: Mutex<()>,
    cancel: CancellationToken,
    self_ref: Weak<GoogleProcessor>,
}

impl GoogleProcessor {
    pub fn new(
        settings: &Settings,
        orchestrator: OrchestratorHandle,
        registry: Arc<dyn ShadowRegistry>,
    ) -> Arc<Self> {
        let config = GoogleConfig::from_settings(settings);
        info!(
            project_id = %config.project_id,
            application = %config.application_name,
            region = %config.region,
            "Google Cloud MQTT processor enabled"
        );

        Arc::new_cyclic(|self_ref| Self {
            core: Arc::new(PeerCore::new(
                config.domain.clone(),
                config.max_shadows,
                config.auto_subscribe,
                config.unified_format,
                orchestrator,
            )),
            config,
            sessions: DashMap::new(),
            states: DashMap::new(),
            refreshers: DashMap::new(),
            registry,
            command_lock: Mutex::new(()),
            cancel: CancellationToken::new(),
            self_ref: self_ref.clone(),
        })
    }

    pub fn core(&self) -> &PeerCore {
        &self.core
    }

    pub fn session_state(&self, ep_name: &str) -> DeviceSessionState {
        self.states
            .get(ep_name)
            .map(|s| *s.value())
            .unwrap_or(DeviceSessionState::Disconnected)
    }

    fn set_state(&self, ep_name: &str, state: DeviceSessionState) {
        self.states.insert(ep_name.to_string(), state);
    }

    fn session(&self, ep_name: &str) -> Option<Arc<MqttSession>> {
        self.sessions.get(ep_name).map(|s| Arc::clone(s.value()))
    }

    fn endpoint_topic_data(&self, ep_name: &str, ep_type: &str) -> EndpointTopicData {
        // the config topic is the only one to listen on for Google
        EndpointTopicData::new(
            vec![(self.config.config_topic(ep_name), QoS::AtLeastOnce)],
            ep_type,
        )
    }

    /// The command-dispatch critical section. Waits are bounded by the
    /// configured lock wait; an unacquirable lock is retried indefinitely.
    async fn acquire_command_lock(&self) -> MutexGuard<'_, ()> {
        let wait = Duration::from_millis(self.config.wait_for_lock_ms);
        loop {
            match tokio::time::timeout(wait, self.command_lock.lock()).await {
                Ok(guard) => return guard,
                Err(_) => {
                    debug!("command lock busy, retrying");
                }
            }
        }
    }

    async fn publish(&self, ep_name: &str, topic: &str, payload: Vec<u8>) -> bool {
        match self.session(ep_name) {
            Some(session) => match session.publish(topic, payload, QoS::AtLeastOnce).await {
                Ok(()) => true,
                Err(e) => {
                    warn!(ep = ep_name, topic, error = %e, "observation not sent, send failed");
                    false
                }
            },
            None => {
                warn!(ep = ep_name, topic, "observation not sent, not connected");
                false
            }
        }
    }

    fn receive_callback(&self) -> ReceiveCallback {
        let self_ref = self.self_ref.clone();
        Arc::new(move |topic, payload| {
            let self_ref = self_ref.clone();
            Box::pin(async move {
                let Some(processor) = self_ref.upgrade() else {
                    return;
                };
                let message = String::from_utf8_lossy(&payload).to_string();
                processor.on_message_receive(&topic, &message).await;
            }) as Pin<Box<dyn Future<Output = ()> + Send>>
        })
    }

    /// Build and connect a fresh device-scoped session.
    async fn connect_device_session(
        &self,
        ep_name: &str,
        ep_type: &str,
    ) -> BridgeResult<Arc<MqttSession>> {
        self.set_state(ep_name, DeviceSessionState::Connecting);

        let jwt = create_device_jwt(
            &self.config.keystore_dir,
            ep_name,
            &self.config.project_id,
            self.config.jwt_expiration_secs,
        )
        .inspect_err(|_| self.set_state(ep_name, DeviceSessionState::Disconnected))?;

        let client_id = self.config.client_id(ep_name);
        debug!(
            ep = ep_name,
            ept = ep_type,
            client_id = %client_id,
            mqtt_version = %self.config.mqtt_version,
            "connecting device session"
        );

        let mut options = MqttOptions::new(
            client_id,
            self.config.mqtt_host.clone(),
            self.config.mqtt_port,
        );
        // the username is ignored by the broker; the JWT is the password
        options.set_credentials("unused", jwt);
        options.set_keep_alive(Duration::from_secs(60));
        options.set_clean_session(self.config.clean_session);
        options.set_transport(Transport::tls_with_default_config());

        let session = MqttSession::connect(
            options,
            SessionConfig {
                connack_timeout: Duration::from_secs(30),
                reconnect_pause: Duration::from_millis(self.config.reconnect_sleep_time_ms),
            },
            self.receive_callback(),
        )
        .await
        .inspect_err(|_| self.set_state(ep_name, DeviceSessionState::Disconnected))?;

        self.sessions
            .insert(ep_name.to_string(), Arc::clone(&session));
        self.set_state(ep_name, DeviceSessionState::Connected);
        Ok(session)
    }

    fn start_jwt_refresher(&self, ep_name: &str) {
        self.stop_jwt_refresher(ep_name);
        let token = self.cancel.child_token();
        self.refreshers.insert(ep_name.to_string(), token.clone());
        refresher::start_refresher(
            self.self_ref.clone(),
            ep_name.to_string(),
            refresher::effective_refresh_interval(
                self.config.jwt_refresh_interval_secs,
                self.config.jwt_expiration_secs,
            ),
            token,
        );
    }

    /// Stop the refresh timer for an endpoint; returns once cancelled.
    pub fn stop_jwt_refresher(&self, ep_name: &str) {
        if let Some((_, token)) = self.refreshers.remove(ep_name) {
            info!(ep = ep_name, "stopping JWT refresher");
            token.cancel();
        }
    }

    pub fn has_refresher(&self, ep_name: &str) -> bool {
        self.refreshers.contains_key(ep_name)
    }

    /// Re-mint the endpoint's JWT and rebuild its session. On every
    /// successful reconnect the full topic set is re-subscribed; the cloud
    /// would otherwise silently drop subscriptions across the rotation.
    pub async fn refresh_jwt_for_endpoint(&self, ep_name: &str) {
        info!(ep = ep_name, "JWT refresh starting");
        self.set_state(ep_name, DeviceSessionState::Refreshing);

        // capture the subscribed set before tearing the session down
        let previous_topics: Vec<(String, QoS)> = match self.session(ep_name) {
            Some(session) => session
                .subscribed_topics()
                .into_iter()
                .map(|t| (t, QoS::AtLeastOnce))
                .collect(),
            None => self
                .core
                .endpoints
                .topic_data(ep_name)
                .map(|d| d.topics)
                .unwrap_or_default(),
        };

        if let Some((_, old)) = self.sessions.remove(ep_name) {
            old.disconnect().await;
        }

        let ep_type = self
            .core
            .endpoints
            .endpoint_type(ep_name)
            .unwrap_or_default();
        let schedule =
            ReconnectSchedule::new(self.config.max_retries, self.config.jwt_refresh_wait_ms);
        let mut backoff = schedule.backoff();
        let mut attempt: u32 = 0;

        loop {
            if !schedule.allows_attempt(attempt) {
                warn!(ep = ep_name, attempts = attempt, "failed to reconnect with new JWT, giving up");
                self.set_state(ep_name, DeviceSessionState::Disconnected);
                return;
            }
            attempt += 1;

            let delay = backoff.next_backoff().unwrap_or(schedule.base);
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            match self.connect_device_session(ep_name, &ep_type).await {
                Ok(session) => {
                    if let Err(e) = session.subscribe_many(&previous_topics).await {
                        warn!(ep = ep_name, error = %e, "re-subscription after refresh failed");
                    }
                    info!(ep = ep_name, "reconnected with new JWT");
                    return;
                }
                Err(e) => {
                    warn!(
                        ep = ep_name,
                        attempt,
                        max_retries = self.config.max_retries,
                        error = %e,
                        "failed to reconnect with new JWT, retrying"
                    );
                }
            }
        }
    }

    /// Inbound config-topic messages: API envelopes or CoAP commands.
    pub async fn on_message_receive(&self, topic: &str, message: &str) {
        debug!(topic, "Google Cloud command message");
        let parsed: Value = match serde_json::from_str(message) {
            Ok(v) => v,
            Err(e) => {
                warn!(topic, error = %e, "undecodable peer message");
                return;
            }
        };

        let topic_ep = self.config.endpoint_from_topic(topic);

        if PeerCore::is_api_request(&parsed) {
            let ep_name = topic_ep.unwrap_or_default();
            // API responses publish to the events topic
            let reply_topic = self.config.observe_topic(&ep_name);
            if let Some(response) = self.core.process_api_request(&parsed).await {
                self.publish(&ep_name, &reply_topic, response.to_json().into_bytes())
                    .await;
            }
            return;
        }

        let Some(command) = self.core.decode_command(&parsed, topic_ep, None, None) else {
            warn!(topic, "inbound message is not a usable CoAP command");
            return;
        };
        let reply_topic = self.config.reply_topic(&command.ep_name);

        // serialize dispatch against the backend
        let _guard = self.acquire_command_lock().await;
        match self
            .core
            .dispatch_command(&command, topic, message, &reply_topic)
            .await
        {
            CommandOutcome::SyncReply { topic, observation } => {
                self.publish(
                    &command.ep_name,
                    &topic,
                    observation.to_string().into_bytes(),
                )
                .await;
            }
            CommandOutcome::AsyncRecorded => {
                debug!(ep = %command.ep_name, "async response recorded");
            }
            CommandOutcome::AsyncIgnored | CommandOutcome::NoResponse => {}
        }
    }

    async fn publish_async_reply(&self, completion: &Value) -> bool {
        let Some(record) = self.core.async_responses.take_completion(completion) else {
            return false;
        };
        if let Some(observation) = format_async_reply(&record, completion, self.core.unified_format())
        {
            self.publish(
                &record.ep_name,
                &record.reply_topic,
                observation.to_string().into_bytes(),
            )
            .await;
        }
        true
    }

    async fn unsubscribe(&self, ep_name: &str) {
        let topic_strings = self.core.endpoints.topic_strings(ep_name);
        if topic_strings.is_empty() {
            info!(ep = ep_name, "not in subscription list (OK)");
        } else if let Some(session) = self.session(ep_name) {
            if let Err(e) = session.unsubscribe_many(&topic_strings).await {
                info!(ep = ep_name, error = %e, "unsubscribe failed");
            }
        }
        self.core.endpoints.remove(ep_name);
    }

    /// Tear down everything attached to a device shadow: the refresh
    /// timer, the session, the cloud-side registration, and the maps.
    async fn delete_device(&self, ep_name: &str) {
        self.set_state(ep_name, DeviceSessionState::Disconnecting);
        self.stop_jwt_refresher(ep_name);
        if let Some((_, session)) = self.sessions.remove(ep_name) {
            session.disconnect().await;
        }
        if !self.registry.delete_shadow(ep_name).await {
            warn!(ep = ep_name, "unable to delete device shadow from Google Cloud");
        }
        self.core.forget_endpoint(ep_name);
        self.states.remove(ep_name);
    }

    fn spawn_metadata_pull(&self, endpoint: Value) {
        let Some(orchestrator) = self.core.orchestrator() else {
            return;
        };
        let self_ref = self.self_ref.clone();
        tokio::spawn(async move {
            let enriched = orchestrator.pull_device_metadata(endpoint).await;
            if let Some(processor) = self_ref.upgrade() {
                processor.complete_new_device_registration(enriched).await;
            }
        });
    }
}

#[async_trait]
impl ConnectionCreator for GoogleProcessor {
    async fn create_and_start_mqtt_for_endpoint(
        &self,
        ep_name: &str,
        ep_type: &str,
        topics: Option<&[(String, QoS)]>,
    ) -> bool {
        if self.session(ep_name).is_some() {
            debug!(ep = ep_name, "already have a session (OK)");
            return true;
        }
        if !self.core.endpoints.can_accept_new_shadow(ep_name) {
            return false;
        }

        match self.connect_device_session(ep_name, ep_type).await {
            Ok(session) => {
                self.start_jwt_refresher(ep_name);
                if let Some(topics) = topics {
                    if let Err(e) = session.subscribe_many(topics).await {
                        warn!(ep = ep_name, error = %e, "re-subscription failed");
                    }
                }
                true
            }
            Err(e) => {
                warn!(ep = ep_name, ept = ep_type, error = %e, "unable to connect device session");
                self.stop_jwt_refresher(ep_name);
                self.sessions.remove(ep_name);
                self.set_state(ep_name, DeviceSessionState::Disconnected);
                false
            }
        }
    }

    async fn subscribe_to_topics(&self, ep_name: &str, topics: &[(String, QoS)]) -> bool {
        let Some(session) = self.session(ep_name) else {
            warn!(ep = ep_name, "no session, cannot subscribe");
            return false;
        };
        match session.subscribe_many(topics).await {
            Ok(()) => true,
            Err(e) => {
                warn!(ep = ep_name, error = %e, "command topic subscription failed");
                false
            }
        }
    }
}

#[async_trait]
impl PeerProcessor for GoogleProcessor {
    fn name(&self) -> &'static str {
        "google-cloud"
    }

    async fn init_listener(&self) -> BridgeResult<()> {
        // sessions are per device; nothing to connect until shadows exist
        if self.config.project_id.is_empty() {
            return Err(BridgeError::ConfigurationError {
                message: "google auth JSON missing or carries no project_id".to_string(),
            });
        }
        if let Some(this) = self.self_ref.upgrade() {
            PeerCore::spawn_async_sweeper(
                Arc::clone(&this.core),
                Duration::from_secs(self.config.async_response_ttl_secs),
                self.cancel.child_token(),
            );
        }
        Ok(())
    }

    async fn stop_listener(&self) {
        self.cancel.cancel();
        let refreshers: Vec<String> = self.refreshers.iter().map(|e| e.key().clone()).collect();
        for ep_name in refreshers {
            self.stop_jwt_refresher(&ep_name);
        }
        let sessions: Vec<Arc<MqttSession>> = self
            .sessions
            .iter()
            .map(|e| Arc::clone(e.value()))
            .collect();
        self.sessions.clear();
        for session in sessions {
            session.disconnect().await;
        }
    }

    async fn process_notification(&self, data: &Value) {
        let Some(notifications) = data.get("notifications").and_then(Value::as_array) else {
            return;
        };
        for notification in notifications {
            if self.publish_async_reply(notification).await {
                continue;
            }
            let Some((ep_name, observation)) = self.core.notification_observation(notification)
            else {
                warn!("notification missing ep/path, skipping");
                continue;
            };
            let topic = self.config.observe_topic(&ep_name);
            self.publish(&ep_name, &topic, observation.to_string().into_bytes())
                .await;
        }
    }

    async fn process_registration(&self, data: &Value, key: &str) {
        let pending = self.core.process_registration_subscriptions(data, key).await;
        for endpoint in pending {
            self.spawn_metadata_pull(endpoint);
        }
    }

    async fn process_re_registration(&self, data: &Value) {
        let Some(entries) = data.get("reg-updates").and_then(Value::as_array) else {
            return;
        };
        if entries
            .iter()
            .any(|entry| self.core.re_registration_needs_full(entry))
        {
            info!("re-registration without subscriptions, processing as new registration");
            self.process_registration(data, "reg-updates").await;
        } else {
            debug!("re-registration already subscribed (OK)");
        }
    }

    async fn process_deregistrations(&self, data: &Value) -> Vec<String> {
        let deregistrations = PeerCore::deregistration_list(data);
        let delete = self
            .core
            .orchestrator()
            .map(|o| o.device_removed_on_deregistration())
            .unwrap_or(false);

        for ep_name in &deregistrations {
            self.core.subscriptions.remove_endpoint(ep_name);
            if delete {
                info!(ep = %ep_name, "processing de-registration as device deletion");
                self.unsubscribe(ep_name).await;
                self.delete_device(ep_name).await;
            }
        }
        deregistrations
    }

    async fn process_device_deletions(&self, data: &Value) -> Vec<String> {
        let deletions = PeerCore::deletion_list(data);
        for ep_name in &deletions {
            info!(ep = %ep_name, "processing device deletion");
            self.unsubscribe(ep_name).await;
            self.delete_device(ep_name).await;
        }
        deletions
    }

    async fn process_async_responses(&self, data: &Value) {
        let Some(responses) = data.get("async-responses").and_then(Value::as_array) else {
            return;
        };
        for completion in responses {
            self.publish_async_reply(completion).await;
        }
    }

    async fn complete_new_device_registration(&self, endpoint: Value) {
        let ep_name = endpoint.get("ep").and_then(Value::as_str).unwrap_or("");
        let ep_type = endpoint.get("ept").and_then(Value::as_str).unwrap_or("");
        if ep_name.is_empty() {
            warn!("endpoint record without a name, not registering");
            return;
        }
        if !self.core.endpoints.can_accept_new_shadow(ep_name) {
            return;
        }
        self.core.endpoints.set_endpoint_type(ep_name, ep_type);

        if !self.registry.create_shadow(&endpoint).await {
            warn!(ep = ep_name, "Google Cloud shadow creation rejected");
            return;
        }

        let topic_data = self.endpoint_topic_data(ep_name, ep_type);
        self.core
            .subscribe(ep_name, ep_type, Some(topic_data), self)
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shadowlink_common::settings::{GoogleCloud, Inner};
    use shadowlink_sdk::peer::{LoggingShadowRegistry, OrchestratorApi};
    use shadowlink_sdk::envelope::{ApiRequest, ApiResponse};

    struct NullOrchestrator;

    #[async_trait]
    impl OrchestratorApi for NullOrchestrator {
        async fn process_api_request_operation(&self, request: ApiRequest) -> ApiResponse {
            ApiResponse::new(request.request_id, 200, "{}")
        }

        async fn process_endpoint_resource_operation(
            &self,
            _verb: &str,
            _ep_name: &str,
            _uri: &str,
            _value: Option<String>,
            _options: Option<String>,
        ) -> Option<String> {
            None
        }

        async fn subscribe_to_endpoint_resource(&self, _ep_name: &str, _uri: &str) -> bool {
            true
        }

        async fn pull_device_metadata(&self, endpoint: Value) -> Value {
            endpoint
        }

        fn device_removed_on_deregistration(&self) -> bool {
            false
        }
    }

    fn processor() -> (Arc<dyn OrchestratorApi>, Arc<GoogleProcessor>) {
        let orchestrator: Arc<dyn OrchestratorApi> = Arc::new(NullOrchestrator);
        let settings = Settings::from_inner(Inner {
            google_cloud: GoogleCloud {
                auth_json: r#"{"project_id":"bridge-test"}"#.into(),
                ..GoogleCloud::default()
            },
            ..Inner::default()
        });
        let p = GoogleProcessor::new(
            &settings,
            Arc::downgrade(&orchestrator),
            Arc::new(LoggingShadowRegistry::new("google")),
        );
        (orchestrator, p)
    }

    #[test]
    fn config_topic_is_the_only_subscription() {
        let (_orch, processor) = processor();
        let data = processor.endpoint_topic_data("d1", "light");
        assert_eq!(data.topic_string_list, vec!["/devices/lwm2m_d1/config"]);
        assert_eq!(data.ep_type, "light");
    }

    #[test]
    fn unknown_endpoint_reports_disconnected() {
        let (_orch, processor) = processor();
        assert_eq!(
            processor.session_state("d1"),
            DeviceSessionState::Disconnected
        );
        assert!(!processor.has_refresher("d1"));
    }
}
