//! MS IoT Hub peer processor.
//!
//! One MQTT session per device shadow, authenticated with the hub SAS
//! token. Telemetry publishes to the device's events topic; commands
//! arrive on the devicebound topic.

use crate::config::IotHubConfig;
use async_trait::async_trait;
use dashmap::DashMap;
use rumqttc::{MqttOptions, QoS, Transport};
use serde_json::Value;
use shadowlink_common::Settings;
use shadowlink_core::{async_responses::format_async_reply, CommandOutcome, PeerCore};
use shadowlink_error::{BridgeError, BridgeResult};
use shadowlink_sdk::{
    mqtt::{MqttSession, ReceiveCallback, SessionConfig},
    peer::{ConnectionCreator, OrchestratorHandle, PeerProcessor, ShadowRegistry},
    EndpointTopicData,
};
use std::{
    future::Future,
    pin::Pin,
    sync::{Arc, Weak},
    time::Duration,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct IotHubProcessor {
    core: Arc<PeerCore>,
    config: IotHubConfig,
    sessions: DashMap<String, Arc<MqttSession>>,
    registry: Arc<dyn ShadowRegistry>,
    cancel: CancellationToken,
    self_ref: Weak<IotHubProcessor>,
}

impl IotHubProcessor {
    pub fn new(
        settings: &Settings,
        orchestrator: OrchestratorHandle,
        registry: Arc<dyn ShadowRegistry>,
    ) -> Arc<Self> {
        let config = IotHubConfig::from_settings(settings);
        info!(hub = %config.hub_name, "MS IoT Hub processor enabled");

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
            registry,
            cancel: CancellationToken::new(),
            self_ref: self_ref.clone(),
        })
    }

    pub fn core(&self) -> &PeerCore {
        &self.core
    }

    fn session(&self, ep_name: &str) -> Option<Arc<MqttSession>> {
        self.sessions.get(ep_name).map(|s| Arc::clone(s.value()))
    }

    fn endpoint_topic_data(&self, ep_name: &str, ep_type: &str) -> EndpointTopicData {
        EndpointTopicData::new(
            vec![(self.config.devicebound_topic(ep_name), QoS::AtLeastOnce)],
            ep_type,
        )
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

    async fn connect_device_session(&self, ep_name: &str) -> BridgeResult<Arc<MqttSession>> {
        let mut options = MqttOptions::new(
            ep_name.to_string(),
            self.config.mqtt_host(),
            self.config.mqtt_port,
        );
        options.set_credentials(self.config.username(ep_name), self.config.sas_token.clone());
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
        .await?;
        self.sessions
            .insert(ep_name.to_string(), Arc::clone(&session));
        Ok(session)
    }

    pub async fn on_message_receive(&self, topic: &str, message: &str) {
        debug!(topic, "IoT Hub command message");
        let parsed: Value = match serde_json::from_str(message) {
            Ok(v) => v,
            Err(e) => {
                warn!(topic, error = %e, "undecodable peer message");
                return;
            }
        };

        let topic_ep = IotHubConfig::endpoint_from_topic(topic);

        if PeerCore::is_api_request(&parsed) {
            let ep_name = topic_ep.unwrap_or_default();
            let reply_topic = self.config.events_topic(&ep_name);
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
        let reply_topic = self.config.events_topic(&command.ep_name);

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

    async fn delete_device(&self, ep_name: &str) {
        if let Some((_, session)) = self.sessions.remove(ep_name) {
            session.disconnect().await;
        }
        if !self.registry.delete_shadow(ep_name).await {
            warn!(ep = ep_name, "unable to delete device shadow from IoT Hub");
        }
        self.core.forget_endpoint(ep_name);
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
impl ConnectionCreator for IotHubProcessor {
    async fn create_and_start_mqtt_for_endpoint(
        &self,
        ep_name: &str,
        _ep_type: &str,
        topics: Option<&[(String, QoS)]>,
    ) -> bool {
        if self.session(ep_name).is_some() {
            debug!(ep = ep_name, "already have a session (OK)");
            return true;
        }
        if !self.core.endpoints.can_accept_new_shadow(ep_name) {
            return false;
        }

        match self.connect_device_session(ep_name).await {
            Ok(session) => {
                if let Some(topics) = topics {
                    if let Err(e) = session.subscribe_many(topics).await {
                        warn!(ep = ep_name, error = %e, "re-subscription failed");
                    }
                }
                true
            }
            Err(e) => {
                warn!(ep = ep_name, error = %e, "unable to connect device session");
                self.sessions.remove(ep_name);
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
impl PeerProcessor for IotHubProcessor {
    fn name(&self) -> &'static str {
        "iothub"
    }

    async fn init_listener(&self) -> BridgeResult<()> {
        if self.config.hub_name.trim().is_empty() {
            return Err(BridgeError::ConfigurationError {
                message: "IoT Hub name unconfigured".to_string(),
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
            let topic = self.config.events_topic(&ep_name);
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
            warn!(ep = ep_name, "IoT Hub shadow creation rejected");
            return;
        }

        let topic_data = self.endpoint_topic_data(ep_name, ep_type);
        self.core
            .subscribe(ep_name, ep_type, Some(topic_data), self)
            .await;
    }
}
