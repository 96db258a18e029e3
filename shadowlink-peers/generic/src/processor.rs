//! Generic MQTT peer processor: one session against a stock broker.
//!
//! Listens on the wildcard request topic and the tunneled-API topic; when
//! the draft MQTT format is enabled it additionally listens on the draft
//! uplink topic and mirrors every observation as CBOR to the draft
//! observation topic.

use crate::{config::GenericConfig, draft};
use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use rumqttc::{MqttOptions, QoS};
use serde_json::Value;
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
use uuid::Uuid;

pub struct GenericProcessor {
    core: Arc<PeerCore>,
    config: GenericConfig,
    session: ArcSwapOption<MqttSession>,
    registry: Arc<dyn ShadowRegistry>,
    cancel: CancellationToken,
    self_ref: Weak<GenericProcessor>,
}

impl GenericProcessor {
    pub fn new(
        settings: &Settings,
        orchestrator: OrchestratorHandle,
        registry: Arc<dyn ShadowRegistry>,
    ) -> Arc<Self> {
        let config = GenericConfig::from_settings(settings);
        info!("generic MQTT processor enabled");

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

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> bool {
        match self.session.load_full() {
            Some(session) => match session.publish(topic, payload, QoS::AtLeastOnce).await {
                Ok(()) => true,
                Err(e) => {
                    warn!(topic, error = %e, "message not sent, send failed");
                    false
                }
            },
            None => {
                warn!(topic, "message not sent, not connected");
                false
            }
        }
    }

    /// Publish an observation; with the draft format on, mirror it to the
    /// draft topic as CBOR.
    async fn publish_observation(&self, topic: &str, observation: &Value) -> bool {
        if self.config.draft_formats_enabled {
            let draft_topic = draft::observation_topic(&self.config.tenant_id, observation);
            match draft::observation_payload(observation) {
                Ok(bytes) => {
                    self.publish(&draft_topic, bytes).await;
                }
                Err(e) => {
                    warn!(error = %e, "draft observation encoding failed");
                }
            }
        }

        let wrapped = if self.config.device_data_key.is_empty() {
            observation.clone()
        } else {
            serde_json::json!({ self.config.device_data_key.clone(): observation })
        };
        self.publish(topic, wrapped.to_string().into_bytes()).await
    }

    pub async fn on_message_receive(&self, topic: &str, message: &str) {
        debug!(topic, "generic MQTT message");
        let parsed: Value = match serde_json::from_str(message) {
            Ok(v) => v,
            Err(e) => {
                warn!(topic, error = %e, "undecodable peer message");
                return;
            }
        };

        if PeerCore::is_api_request(&parsed) {
            let reply_topic = self.config.api_response_topic();
            if let Some(response) = self.core.process_api_request(&parsed).await {
                self.publish(&reply_topic, response.to_json().into_bytes())
                    .await;
            }
            return;
        }

        let topic_ep = GenericConfig::endpoint_from_topic(topic);
        let Some(command) = self.core.decode_command(&parsed, topic_ep, None, None) else {
            warn!(topic, "inbound message is not a usable CoAP command");
            return;
        };
        let reply_topic = self.config.reply_topic(&command.ep_name);

        match self
            .core
            .dispatch_command(&command, topic, message, &reply_topic)
            .await
        {
            CommandOutcome::SyncReply { topic, observation } => {
                self.publish_observation(&topic, &observation).await;
            }
            CommandOutcome::AsyncRecorded => {
                debug!(ep = %command.ep_name, "async response recorded");
            }
            CommandOutcome::AsyncIgnored | CommandOutcome::NoResponse => {}
        }
    }

    /// Draft uplink frames arrive as CBOR; a decoded command envelope is
    /// dispatched like any other command.
    async fn on_draft_uplink(&self, topic: &str, payload: &[u8]) {
        let parsed = match draft::cbor_to_json(payload) {
            Ok(v) => v,
            Err(e) => {
                warn!(topic, error = %e, "undecodable draft uplink frame");
                return;
            }
        };
        debug!(topic, "draft uplink frame");

        // format: <tenant>/lwm2m/rd/<ep>/uplink
        let topic_ep = topic.split('/').nth(3).map(str::to_string);
        let Some(command) = self.core.decode_command(&parsed, topic_ep, None, None) else {
            info!(topic, "draft uplink frame without a command body");
            return;
        };
        let reply_topic = self.config.reply_topic(&command.ep_name);
        if let CommandOutcome::SyncReply { topic, observation } = self
            .core
            .dispatch_command(&command, topic, &parsed.to_string(), &reply_topic)
            .await
        {
            self.publish_observation(&topic, &observation).await;
        }
    }

    async fn publish_async_reply(&self, completion: &Value) -> bool {
        let Some(record) = self.core.async_responses.take_completion(completion) else {
            return false;
        };
        if let Some(observation) = format_async_reply(&record, completion, self.core.unified_format())
        {
            self.publish_observation(&record.reply_topic, &observation)
                .await;
        }
        true
    }

    async fn delete_device(&self, ep_name: &str) {
        if !self.registry.delete_shadow(ep_name).await {
            warn!(ep = ep_name, "unable to delete device shadow");
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

    fn json_route(&self) -> RouteHandler {
        let self_ref = self.self_ref.clone();
        Box::new(move |topic, payload| {
            let self_ref = self_ref.clone();
            let topic = topic.to_string();
            let message = String::from_utf8_lossy(payload).to_string();
            Box::pin(async move {
                if let Some(processor) = self_ref.upgrade() {
                    processor.on_message_receive(&topic, &message).await;
                }
            }) as Pin<Box<dyn Future<Output = ()> + Send>>
        })
    }

    fn draft_route(&self) -> RouteHandler {
        let self_ref = self.self_ref.clone();
        Box::new(move |topic, payload| {
            let self_ref = self_ref.clone();
            let topic = topic.to_string();
            let payload = payload.to_vec();
            Box::pin(async move {
                if let Some(processor) = self_ref.upgrade() {
                    processor.on_draft_uplink(&topic, &payload).await;
                }
            }) as Pin<Box<dyn Future<Output = ()> + Send>>
        })
    }
}

#[async_trait]
impl ConnectionCreator for GenericProcessor {
    async fn create_and_start_mqtt_for_endpoint(
        &self,
        _ep_name: &str,
        _ep_type: &str,
        _topics: Option<&[(String, QoS)]>,
    ) -> bool {
        // one shared session; the wildcard request topic already covers
        // every endpoint
        self.session.load_full().is_some()
    }

    async fn subscribe_to_topics(&self, ep_name: &str, topics: &[(String, QoS)]) -> bool {
        let Some(session) = self.session.load_full() else {
            warn!(ep = ep_name, "no session, cannot subscribe");
            return false;
        };
        match session.subscribe_many(topics).await {
            Ok(()) => true,
            Err(e) => {
                warn!(ep = ep_name, error = %e, "subscription failed");
                false
            }
        }
    }
}

#[async_trait]
impl PeerProcessor for GenericProcessor {
    fn name(&self) -> &'static str {
        "generic-mqtt"
    }

    async fn init_listener(&self) -> BridgeResult<()> {
        // fail without retry while the broker address is the stock sentinel
        if !self.config.host_configured() {
            return Err(BridgeError::ConfigurationError {
                message: "MQTT broker address unconfigured".to_string(),
            });
        }

        let short_id = Uuid::new_v4().simple().to_string();
        let mut options = MqttOptions::new(
            format!("shadowlink-{}", &short_id[..8]),
            self.config.address.clone(),
            self.config.port,
        );
        if !self.config.username.is_empty() {
            options.set_credentials(self.config.username.clone(), self.config.password.clone());
        }
        options.set_keep_alive(Duration::from_secs(60));
        options.set_clean_session(self.config.clean_session);

        // the request and API filters both carry JSON command/API traffic;
        // the draft filter carries CBOR and is decoded separately
        let mut dispatcher = InboundDispatcher::new()
            .route(TopicFilter::parse(&self.config.request_topic())?, self.json_route())
            .route(
                TopicFilter::parse(&self.config.api_request_topic())?,
                self.json_route(),
            );
        if self.config.draft_formats_enabled {
            dispatcher = dispatcher.route(
                TopicFilter::parse(&self.config.draft_uplink_topic())?,
                self.draft_route(),
            );
        }
        let dispatcher = Arc::new(dispatcher);

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

        info!(topic = %self.config.request_topic(), "listening on request topic");
        session
            .subscribe(&self.config.request_topic(), QoS::AtLeastOnce)
            .await?;
        session
            .subscribe(&self.config.api_request_topic(), QoS::AtLeastOnce)
            .await?;
        if self.config.draft_formats_enabled {
            info!(topic = %self.config.draft_uplink_topic(), "listening on draft uplink topic");
            session
                .subscribe(&self.config.draft_uplink_topic(), QoS::AtLeastOnce)
                .await?;
        }
        self.session.store(Some(session));

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
        if let Some(session) = self.session.swap(None) {
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
            let ep_type = self
                .core
                .endpoints
                .endpoint_type(&ep_name)
                .unwrap_or_else(|| "default".to_string());
            let uri = notification
                .get("path")
                .and_then(Value::as_str)
                .unwrap_or("");
            let topic = self.config.notification_topic(&ep_type, &ep_name, uri);
            self.publish_observation(&topic, &observation).await;
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
                self.delete_device(ep_name).await;
            }
        }
        deregistrations
    }

    async fn process_device_deletions(&self, data: &Value) -> Vec<String> {
        let deletions = PeerCore::deletion_list(data);
        for ep_name in &deletions {
            info!(ep = %ep_name, "processing device deletion");
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
            warn!(ep = ep_name, "shadow creation rejected");
        }
        // commands arrive over the wildcard request topic; no per-endpoint
        // subscription is needed
    }
}
