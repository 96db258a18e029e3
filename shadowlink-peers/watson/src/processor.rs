//! Watson IoT peer processor.
//!
//! One shared MQTT session carries every device shadow. Observations
//! publish at most once (Watson's own delivery policy); command
//! subscriptions use at-least-once.

use crate::{config::WatsonConfig, topics};
use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use rumqttc::{MqttOptions, QoS, Transport};
use serde_json::{json, Value};
use shadowlink_common::Settings;
use shadowlink_core::{async_responses::format_async_reply, CommandOutcome, PeerCore};
use shadowlink_error::{BridgeError, BridgeResult};
use shadowlink_sdk::{
    mqtt::{InboundDispatcher, MqttSession, ReceiveCallback, RouteHandler, SessionConfig, TopicFilter},
    peer::{ConnectionCreator, OrchestratorHandle, PeerProcessor, ShadowRegistry},
};
use std::{
    future::Future,
    pin::Pin,
    sync::{Arc, Weak},
    time::Duration,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct WatsonProcessor {
    core: Arc<PeerCore>,
    config: WatsonConfig,
    session: ArcSwapOption<MqttSession>,
    registry: Arc<dyn ShadowRegistry>,
    cancel: CancellationToken,
    self_ref: Weak<WatsonProcessor>,
}

impl WatsonProcessor {
    pub fn new(
        settings: &Settings,
        orchestrator: OrchestratorHandle,
        registry: Arc<dyn ShadowRegistry>,
    ) -> Arc<Self> {
        let config = WatsonConfig::from_settings(settings);
        info!("Watson IoT processor enabled");
        if config.legacy_bridge {
            warn!("Watson IoT bridge in legacy mode");
        }

        Arc::new_cyclic(|self_ref| Self {
            core: Arc::new(PeerCore::new(
                config.domain.clone(),
                config.max_shadows,
                config.auto_subscribe,
                config.unified_format,
                orchestrator,
            )),
            config,
            session: ArcSwapOption::from(None),
            registry,
            cancel: CancellationToken::new(),
            self_ref: self_ref.clone(),
        })
    }

    pub fn core(&self) -> &PeerCore {
        &self.core
    }

    fn endpoint_type(&self, ep_name: &str) -> Option<String> {
        self.core.endpoints.endpoint_type(ep_name)
    }

    /// Optionally wrap the observation under the configured data key.
    fn wrap_observation(&self, observation: &Value) -> Vec<u8> {
        let wrapped = if self.config.device_data_key.is_empty() {
            observation.clone()
        } else {
            json!({ self.config.device_data_key.clone(): observation })
        };
        wrapped.to_string().into_bytes()
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS) -> bool {
        match self.session.load_full() {
            Some(session) => match session.publish(topic, payload, qos).await {
                Ok(()) => true,
                Err(e) => {
                    warn!(topic, error = %e, "Watson IoT notification not sent, send failed");
                    false
                }
            },
            None => {
                warn!(topic, "Watson IoT notification not sent, not connected");
                false
            }
        }
    }

    /// Inbound MQTT messages: API-request envelopes short-circuit to the
    /// API path; everything else is a CoAP command.
    pub async fn on_message_receive(&self, topic: &str, message: &str) {
        debug!(topic, "Watson IoT command message");
        let parsed: Value = match serde_json::from_str(message) {
            Ok(v) => v,
            Err(e) => {
                warn!(topic, error = %e, "undecodable peer message");
                return;
            }
        };

        let topic_ep = topics::endpoint_from_topic(topic);

        if PeerCore::is_api_request(&parsed) {
            let ep_name = topic_ep.unwrap_or_default();
            let ep_type = self.endpoint_type(&ep_name);
            let reply_topic = topics::api_reply_topic(&self.config, &ep_name, ep_type.as_deref());
            if let Some(response) = self.core.process_api_request(&parsed).await {
                self.publish(&reply_topic, response.to_json().into_bytes(), QoS::AtLeastOnce)
                    .await;
            }
            return;
        }

        let topic_verb = topics::verb_from_topic(topic);
        let Some(command) = self.core.decode_command(&parsed, topic_ep, topic_verb, None) else {
            warn!(topic, "inbound message is not a usable CoAP command");
            return;
        };

        let ep_type = self.endpoint_type(&command.ep_name);
        let reply_topic = topics::reply_topic(&self.config, &command.ep_name, ep_type.as_deref());

        match self
            .core
            .dispatch_command(&command, topic, message, &reply_topic)
            .await
        {
            CommandOutcome::SyncReply { topic, observation } => {
                let payload = self.wrap_observation(&observation);
                self.publish(&topic, payload, QoS::AtMostOnce).await;
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
        match format_async_reply(&record, completion, self.core.unified_format()) {
            Some(observation) => {
                let payload = self.wrap_observation(&observation);
                self.publish(&record.reply_topic, payload, QoS::AtMostOnce)
                    .await;
            }
            None => {
                debug!(async_id = %record.async_id, "async completion produced no reply");
            }
        }
        true
    }

    async fn delete_device(&self, ep_name: &str) {
        if !self.registry.delete_shadow(ep_name).await {
            warn!(ep = ep_name, "unable to delete Watson IoT device shadow");
        }
        self.core.forget_endpoint(ep_name);
    }

    async fn unsubscribe(&self, ep_name: &str) -> bool {
        let topic_strings = self.core.endpoints.topic_strings(ep_name);
        if topic_strings.is_empty() {
            info!(ep = ep_name, "not in subscription list (OK)");
            self.core.endpoints.remove(ep_name);
            return true;
        }
        if let Some(session) = self.session.load_full() {
            if let Err(e) = session.unsubscribe_many(&topic_strings).await {
                info!(ep = ep_name, error = %e, "unsubscribe failed");
            }
        }
        self.core.endpoints.remove(ep_name);
        true
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
impl ConnectionCreator for WatsonProcessor {
    async fn create_and_start_mqtt_for_endpoint(
        &self,
        _ep_name: &str,
        _ep_type: &str,
        _topics: Option<&[(String, QoS)]>,
    ) -> bool {
        // Watson uses one shared MQTT session for all devices; it is
        // already up (or not) independent of any endpoint.
        self.session.load_full().is_some()
    }

    async fn subscribe_to_topics(&self, ep_name: &str, topics_list: &[(String, QoS)]) -> bool {
        let Some(session) = self.session.load_full() else {
            warn!(ep = ep_name, "no session, cannot subscribe to command topics");
            return false;
        };
        if let Err(e) = session.subscribe_many(topics_list).await {
            warn!(ep = ep_name, error = %e, "command topic subscription failed");
            return false;
        }

        let ep_type = self.endpoint_type(ep_name).unwrap_or_default();
        let api_topic = topics::api_request_topic(&self.config, ep_name, &ep_type);
        if let Err(e) = session.subscribe(&api_topic, QoS::AtLeastOnce).await {
            warn!(ep = ep_name, error = %e, "API request topic subscription failed");
        }
        true
    }
}

#[async_trait]
impl PeerProcessor for WatsonProcessor {
    fn name(&self) -> &'static str {
        "watson"
    }

    async fn init_listener(&self) -> BridgeResult<()> {
        if self.config.mqtt_host.trim().is_empty() {
            return Err(BridgeError::ConfigurationError {
                message: "Watson IoT MQTT host unconfigured".to_string(),
            });
        }

        let mut options = MqttOptions::new(
            self.config.client_id.clone(),
            self.config.mqtt_host.clone(),
            self.config.mqtt_port,
        );
        options.set_credentials(self.config.api_key.clone(), self.config.auth_token.clone());
        options.set_keep_alive(Duration::from_secs(60));
        options.set_clean_session(self.config.clean_session);
        // TLS is mandatory; self-signed material is not accepted.
        options.set_transport(Transport::tls_with_default_config());

        // every topic this session subscribes is a per-device command (or
        // API) topic, so one command route covers the whole session
        let self_ref = self.self_ref.clone();
        let command_handler: RouteHandler = Box::new(move |topic, payload| {
            let self_ref = self_ref.clone();
            let topic = topic.to_string();
            let message = String::from_utf8_lossy(payload).to_string();
            Box::pin(async move {
                if let Some(processor) = self_ref.upgrade() {
                    processor.on_message_receive(&topic, &message).await;
                }
            }) as Pin<Box<dyn Future<Output = ()> + Send>>
        });
        let dispatcher = Arc::new(
            InboundDispatcher::new()
                .route(TopicFilter::parse(topics::command_pattern())?, command_handler),
        );

        let callback: ReceiveCallback = Arc::new(move |topic, payload| {
            let dispatcher = Arc::clone(&dispatcher);
            Box::pin(async move {
                dispatcher.dispatch(&topic, &payload).await;
            }) as Pin<Box<dyn Future<Output = ()> + Send>>
        });

        let session = MqttSession::connect(
            options,
            SessionConfig {
                connack_timeout: Duration::from_secs(30),
                reconnect_pause: Duration::from_millis(self.config.reconnect_sleep_time_ms),
            },
            callback,
        )
        .await?;
        self.session.store(Some(session));

        if let Some(this) = self.self_ref.upgrade() {
            PeerCore::spawn_async_sweeper(
                Arc::clone(&this.core),
                Duration::from_secs(self.config.async_response_ttl_secs),
                self.cancel.child_token(),
            );
        }

        info!("Watson IoT listener started");
        Ok(())
    }

    async fn stop_listener(&self) {
        self.cancel.cancel();
        if let Some(session) = self.session.swap(None) {
            session.disconnect().await;
        }
    }

    async fn process_notification(&self, data: &Value) {
        let Some(notifications) = data.get("notifications").and_then(Value::as_array) else {
            return;
        };
        for notification in notifications {
            // completions for outstanding async commands resume here
            if self.publish_async_reply(notification).await {
                continue;
            }

            let Some((ep_name, mut observation)) = self.core.notification_observation(notification)
            else {
                warn!("notification missing ep/path, skipping");
                continue;
            };

            // production-bridge compatibility keys
            if !self.config.legacy_bridge {
                if let Some(obj) = observation.as_object_mut() {
                    let resource_id = notification
                        .get("path")
                        .and_then(Value::as_str)
                        .unwrap_or("")
                        .trim_start_matches('/')
                        .to_string();
                    obj.insert("resourceId".to_string(), Value::from(resource_id));
                    obj.insert("deviceId".to_string(), Value::from(ep_name.clone()));
                }
            }

            let ep_type = self.endpoint_type(&ep_name);
            let topic = topics::observe_topic(&self.config, &ep_name, ep_type.as_deref());
            let payload = self.wrap_observation(&observation);
            self.publish(&topic, payload, QoS::AtMostOnce).await;
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
        let needs_full = entries
            .iter()
            .any(|entry| self.core.re_registration_needs_full(entry));
        if needs_full {
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

        if !self.registry.create_shadow(&endpoint).await {
            warn!(ep = ep_name, "Watson IoT shadow creation rejected");
            return;
        }

        let topic_data = topics::endpoint_topic_data(&self.config, ep_name, ep_type);
        self.core
            .subscribe(ep_name, ep_type, Some(topic_data), self)
            .await;
    }
}
