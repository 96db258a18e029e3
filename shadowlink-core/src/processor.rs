//! The composable processor core: endpoint map, subscription bookkeeping,
//! async correlation, API-request tunneling, and CoAP command dispatch.
//! Per-cloud processors own one of these and layer topic formats, session
//! topology, and credential lifecycle on top.

use crate::{
    async_responses::AsyncResponseCorrelator,
    endpoints::EndpointRegistry,
    subscriptions::{is_observable_resource, SubscriptionKey, SubscriptionManager},
};
use dashmap::DashMap;
use serde_json::Value;
use shadowlink_sdk::{
    envelope::{create_observation, create_observation_from_value, ApiRequest, ApiResponse, CoapCommand, CoapVerb},
    peer::{ConnectionCreator, OrchestratorApi, OrchestratorHandle},
    EndpointTopicData,
};
use shadowlink_utils::payload::decode_coap_payload_to_value;
use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc,
};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const MAX_API_REQUEST_ID: u32 = 32768;

/// A decoded inbound CoAP command, body fields backfilled from the topic.
#[derive(Debug, Clone)]
pub struct InboundCommand {
    pub verb: String,
    pub ep_name: String,
    pub uri: String,
    pub value: Option<String>,
    pub options: Option<String>,
}

/// What a command dispatch produced.
#[derive(Debug)]
pub enum CommandOutcome {
    /// An AsyncRecord was stored; the reply publishes later.
    AsyncRecorded,
    /// Async response for a verb we do not bridge; dropped by policy.
    AsyncIgnored,
    /// Synchronous GET result, ready to publish on the reply topic.
    SyncReply { topic: String, observation: Value },
    /// Nothing to publish.
    NoResponse,
}

pub struct PeerCore {
    domain: String,
    pub endpoints: EndpointRegistry,
    pub subscriptions: SubscriptionManager,
    pub async_responses: AsyncResponseCorrelator,
    orchestrator: OrchestratorHandle,
    next_api_request_id: AtomicU32,
    auto_subscribe: bool,
    unified_format: bool,
    // Serializes createAndStartMQTTForEndpoint per endpoint: two concurrent
    // registrations for the same ep_name converge on a single session.
    connection_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl PeerCore {
    pub fn new(
        domain: impl Into<String>,
        max_shadows: usize,
        auto_subscribe: bool,
        unified_format: bool,
        orchestrator: OrchestratorHandle,
    ) -> Self {
        Self {
            domain: domain.into(),
            endpoints: EndpointRegistry::new(max_shadows),
            subscriptions: SubscriptionManager::new(),
            async_responses: AsyncResponseCorrelator::new(),
            orchestrator,
            next_api_request_id: AtomicU32::new(0),
            auto_subscribe,
            unified_format,
            connection_locks: DashMap::new(),
        }
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn unified_format(&self) -> bool {
        self.unified_format
    }

    pub fn orchestrator(&self) -> Option<Arc<dyn OrchestratorApi>> {
        self.orchestrator.upgrade()
    }

    /// Next API request id: pre-incremented, wraps to 1 at 32768 so every
    /// integer in [1, 32767] is issued exactly once per cycle.
    pub fn next_api_request_id(&self) -> u32 {
        let prev = self
            .next_api_request_id
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
                let next = v + 1;
                Some(if next >= MAX_API_REQUEST_ID { 1 } else { next })
            })
            .unwrap();
        let next = prev + 1;
        if next >= MAX_API_REQUEST_ID {
            1
        } else {
            next
        }
    }

    pub fn is_api_request(parsed: &Value) -> bool {
        ApiRequest::is_api_request(parsed)
    }

    /// Extract the API envelope, tag it with the next request id, and route
    /// it through the orchestrator.
    pub async fn process_api_request(&self, parsed: &Value) -> Option<ApiResponse> {
        let request = ApiRequest::from_message(parsed, self.next_api_request_id());
        let orchestrator = self.orchestrator()?;
        Some(orchestrator.process_api_request_operation(request).await)
    }

    pub fn create_observation(
        &self,
        verb: &str,
        ep_name: &str,
        uri: &str,
        value: Option<&str>,
    ) -> Value {
        create_observation(verb, ep_name, uri, value, self.unified_format)
    }

    /// Build the observation for a backend notification entry. The base64
    /// payload decodes to a fundamental value, or stays an object for
    /// composite JSON payloads.
    pub fn notification_observation(&self, notification: &Value) -> Option<(String, Value)> {
        let ep_name = notification.get("ep").and_then(Value::as_str)?;
        let path = notification.get("path").and_then(Value::as_str)?;
        let value = notification
            .get("payload")
            .and_then(Value::as_str)
            .map(decode_coap_payload_to_value)
            .unwrap_or(Value::Null);

        let observation = create_observation_from_value(
            CoapVerb::Get.as_str(),
            ep_name,
            path,
            value,
            self.unified_format,
        );
        Some((ep_name.to_string(), observation))
    }

    /// Walk `data[key]` registrations: re-subscribe known resources,
    /// auto-subscribe observable ones, refresh the subscription entries.
    /// Returns the endpoint records that still need their metadata pulled.
    pub async fn process_registration_subscriptions(&self, data: &Value, key: &str) -> Vec<Value> {
        let mut pending = Vec::new();
        let Some(endpoints) = data.get(key).and_then(Value::as_array) else {
            return pending;
        };

        for endpoint in endpoints {
            let ep_name = endpoint.get("ep").and_then(Value::as_str).unwrap_or("");
            let ep_type = endpoint.get("ept").and_then(Value::as_str).unwrap_or("");
            if ep_name.is_empty() {
                warn!("registration without an endpoint name, skipping");
                continue;
            }

            if let Some(resources) = endpoint.get("resources").and_then(Value::as_array) {
                for resource in resources {
                    let Some(path) = resource.get("path").and_then(Value::as_str) else {
                        continue;
                    };
                    let sub_key = SubscriptionKey::new(&self.domain, ep_name, ep_type, path);
                    let observable = is_observable_resource(resource);

                    if self.subscriptions.contains(&sub_key) {
                        if let Some(orchestrator) = self.orchestrator() {
                            orchestrator.subscribe_to_endpoint_resource(ep_name, path).await;
                        }
                        self.subscriptions.remove(&sub_key);
                        self.subscriptions.add(sub_key, observable);
                    } else if observable && self.auto_subscribe {
                        if let Some(orchestrator) = self.orchestrator() {
                            orchestrator.subscribe_to_endpoint_resource(ep_name, path).await;
                        }
                        self.subscriptions.remove(&sub_key);
                        self.subscriptions.add(sub_key, observable);
                    }
                }
            }

            pending.push(endpoint.clone());
        }

        pending
    }

    /// A re-registration entry for an endpoint with no recorded topic
    /// subscriptions is treated as a fresh registration.
    pub fn re_registration_needs_full(&self, entry: &Value) -> bool {
        let ep_name = entry.get("ep").and_then(Value::as_str).unwrap_or("");
        !self.endpoints.has_subscriptions(ep_name)
    }

    pub fn deregistration_list(data: &Value) -> Vec<String> {
        Self::endpoint_name_list(data, "de-registrations")
    }

    pub fn deletion_list(data: &Value) -> Vec<String> {
        Self::endpoint_name_list(data, "registrations-expired")
    }

    fn endpoint_name_list(data: &Value, key: &str) -> Vec<String> {
        data.get(key)
            .and_then(Value::as_array)
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|e| match e {
                        Value::String(s) => Some(s.clone()),
                        Value::Object(_) => e
                            .get("ep")
                            .and_then(Value::as_str)
                            .map(str::to_string),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Drop every trace of an endpoint from the shared maps.
    pub fn forget_endpoint(&self, ep_name: &str) {
        self.subscriptions.remove_endpoint(ep_name);
        self.endpoints.remove(ep_name);
        self.connection_locks.remove(ep_name);
    }

    /// Serialized per endpoint: concurrent registrations for the same
    /// ep_name must result in a single session.
    pub async fn validate_mqtt_connection(
        &self,
        creator: &dyn ConnectionCreator,
        ep_name: &str,
        ep_type: &str,
        topics: Option<&[(String, rumqttc::QoS)]>,
    ) -> bool {
        let lock = self
            .connection_locks
            .entry(ep_name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;
        creator
            .create_and_start_mqtt_for_endpoint(ep_name, ep_type, topics)
            .await
    }

    /// Register topics for CoAP commands: validate or create the session,
    /// store the topic data, and subscribe through the creator.
    pub async fn subscribe(
        &self,
        ep_name: &str,
        ep_type: &str,
        topic_data: Option<EndpointTopicData>,
        creator: &dyn ConnectionCreator,
    ) -> bool {
        if ep_name.is_empty() {
            warn!("empty endpoint name in subscribe, ignoring");
            return false;
        }
        if !self
            .validate_mqtt_connection(creator, ep_name, ep_type, None)
            .await
        {
            warn!(ep = ep_name, ept = ep_type, "unable to validate MQTT connection, not subscribing");
            return false;
        }

        let Some(topic_data) = topic_data else {
            warn!(ep = ep_name, ept = ep_type, "command topic data missing, unable to subscribe");
            return false;
        };

        info!(ep = ep_name, ept = ep_type, "subscribing to CoAP command topics");
        let topics = topic_data.topics.clone();
        self.endpoints.insert(ep_name, topic_data);
        self.endpoints.set_endpoint_type(ep_name, ep_type);
        creator.subscribe_to_topics(ep_name, &topics).await
    }

    /// Decode an inbound CoAP command: body fields are primary, positional
    /// topic segments are the fallback; a wildcarded endpoint name defers
    /// to the body `ep`.
    pub fn decode_command(
        &self,
        parsed: &Value,
        topic_ep: Option<String>,
        topic_verb: Option<String>,
        topic_uri: Option<String>,
    ) -> Option<InboundCommand> {
        let body = CoapCommand::from_message(parsed);

        let uri = body.path.or(topic_uri)?;
        let verb = body.verb.or(topic_verb)?;
        let ep_name = match topic_ep {
            Some(ep) if !ep.is_empty() && ep != "+" => ep,
            _ => body.ep?,
        };

        Some(InboundCommand {
            verb,
            ep_name,
            uri,
            value: body.new_value,
            options: body.options,
        })
    }

    /// Dispatch a command to the backend and classify the result.
    pub async fn dispatch_command(
        &self,
        command: &InboundCommand,
        original_topic: &str,
        original_message: &str,
        reply_topic: &str,
    ) -> CommandOutcome {
        let Some(orchestrator) = self.orchestrator() else {
            warn!("orchestrator gone, dropping command");
            return CommandOutcome::NoResponse;
        };

        let response = orchestrator
            .process_endpoint_resource_operation(
                &command.verb,
                &command.ep_name,
                &command.uri,
                command.value.clone(),
                command.options.clone(),
            )
            .await;

        let Some(response) = response.filter(|r| !r.is_empty()) else {
            return CommandOutcome::NoResponse;
        };
        debug!(ep = %command.ep_name, uri = %command.uri, response = %response, "command response");

        if AsyncResponseCorrelator::is_async_response(&response) {
            match CoapVerb::parse(&command.verb) {
                Some(verb) if verb.bridges_async_response() => {
                    self.async_responses.record(
                        &response,
                        verb,
                        &command.ep_name,
                        &command.uri,
                        original_topic,
                        reply_topic,
                        original_message,
                    );
                    CommandOutcome::AsyncRecorded
                }
                _ => {
                    info!(verb = %command.verb, "ignoring async response for verb");
                    CommandOutcome::AsyncIgnored
                }
            }
        } else if command.verb.eq_ignore_ascii_case("get") {
            let observation = self.create_observation(
                CoapVerb::Get.as_str(),
                &command.ep_name,
                &command.uri,
                Some(&response),
            );
            CommandOutcome::SyncReply {
                topic: reply_topic.to_string(),
                observation,
            }
        } else {
            CommandOutcome::NoResponse
        }
    }

    /// Periodic TTL sweep over the async-response records.
    pub fn spawn_async_sweeper(core: Arc<Self>, ttl: Duration, cancel: CancellationToken) {
        tokio::spawn(async move {
            let period = ttl.min(Duration::from_secs(60)).max(Duration::from_secs(1));
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(period) => {
                        core.async_responses.sweep(ttl);
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct StubOrchestrator {
        pub subscriptions: StdMutex<Vec<(String, String)>>,
        pub resource_response: StdMutex<Option<String>>,
        pub api_calls: StdMutex<Vec<ApiRequest>>,
    }

    #[async_trait]
    impl OrchestratorApi for StubOrchestrator {
        async fn process_api_request_operation(&self, request: ApiRequest) -> ApiResponse {
            let id = request.request_id;
            self.api_calls.lock().unwrap().push(request);
            ApiResponse::new(id, 200, "{}")
        }

        async fn process_endpoint_resource_operation(
            &self,
            _verb: &str,
            _ep_name: &str,
            _uri: &str,
            _value: Option<String>,
            _options: Option<String>,
        ) -> Option<String> {
            self.resource_response.lock().unwrap().clone()
        }

        async fn subscribe_to_endpoint_resource(&self, ep_name: &str, uri: &str) -> bool {
            self.subscriptions
                .lock()
                .unwrap()
                .push((ep_name.to_string(), uri.to_string()));
            true
        }

        async fn pull_device_metadata(&self, endpoint: Value) -> Value {
            endpoint
        }

        fn device_removed_on_deregistration(&self) -> bool {
            false
        }
    }

    fn core_with_stub() -> (Arc<StubOrchestrator>, PeerCore) {
        let stub = Arc::new(StubOrchestrator::default());
        let handle: Arc<dyn OrchestratorApi> = stub.clone();
        let core = PeerCore::new("domain", 100, true, false, Arc::downgrade(&handle));
        (stub, core)
    }

    #[test]
    fn request_id_sequence_wraps_to_one() {
        let (_stub, core) = core_with_stub();
        assert_eq!(core.next_api_request_id(), 1);
        assert_eq!(core.next_api_request_id(), 2);

        for _ in 0..32764 {
            core.next_api_request_id();
        }
        assert_eq!(core.next_api_request_id(), 32767);
        // 32767 + 1 reaches the cap; the sequence wraps to 1, never 0.
        assert_eq!(core.next_api_request_id(), 1);
    }

    #[tokio::test]
    async fn auto_subscribe_on_registration() {
        let (stub, core) = core_with_stub();
        let data = json!({
            "registrations": [{
                "ep": "d1",
                "ept": "light",
                "resources": [
                    {"path": "/3303/0/5700", "obs": "true"},
                    {"path": "/3/0/0", "obs": "false"}
                ]
            }]
        });

        let pending = core
            .process_registration_subscriptions(&data, "registrations")
            .await;
        assert_eq!(pending.len(), 1);

        let subs = stub.subscriptions.lock().unwrap();
        assert_eq!(subs.as_slice(), &[("d1".to_string(), "/3303/0/5700".to_string())]);
        drop(subs);

        let key = SubscriptionKey::new("domain", "d1", "light", "/3303/0/5700");
        assert_eq!(core.subscriptions.is_observable(&key), Some(true));
        assert!(!core
            .subscriptions
            .contains(&SubscriptionKey::new("domain", "d1", "light", "/3/0/0")));
    }

    #[tokio::test]
    async fn known_subscription_is_resubscribed() {
        let (stub, core) = core_with_stub();
        let key = SubscriptionKey::new("domain", "d1", "light", "/3/0/0");
        core.subscriptions.add(key.clone(), false);

        let data = json!({
            "registrations": [{
                "ep": "d1",
                "ept": "light",
                "resources": [{"path": "/3/0/0", "obs": "false"}]
            }]
        });
        core.process_registration_subscriptions(&data, "registrations")
            .await;

        assert_eq!(stub.subscriptions.lock().unwrap().len(), 1);
        assert!(core.subscriptions.contains(&key));
    }

    #[tokio::test]
    async fn api_request_is_tagged_and_routed() {
        let (stub, core) = core_with_stub();
        let msg = json!({"api_verb": "GET", "api_uri": "/v2/devices", "api_key": "k", "api_caller_id": "c"});

        let response = core.process_api_request(&msg).await.unwrap();
        assert_eq!(response.request_id, 1);
        assert_eq!(response.status, 200);

        let calls = stub.api_calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].uri.as_deref(), Some("/v2/devices"));
        assert_eq!(calls[0].verb.as_deref(), Some("GET"));
    }

    #[tokio::test]
    async fn async_get_command_records_exactly_one_record() {
        let (stub, core) = core_with_stub();
        *stub.resource_response.lock().unwrap() =
            Some(r#"{"async-response-id":"abc123"}"#.to_string());

        let command = InboundCommand {
            verb: "get".to_string(),
            ep_name: "d1".to_string(),
            uri: "/3303/0/5700".to_string(),
            value: None,
            options: None,
        };
        let outcome = core
            .dispatch_command(&command, "cmd/topic", "{}", "reply/topic")
            .await;
        assert!(matches!(outcome, CommandOutcome::AsyncRecorded));
        assert_eq!(core.async_responses.outstanding(), 1);

        let rec = core
            .async_responses
            .take_completion(&json!({"id": "abc123"}))
            .unwrap();
        assert_eq!(rec.reply_topic, "reply/topic");
        assert_eq!(core.async_responses.outstanding(), 0);
    }

    #[tokio::test]
    async fn async_post_command_is_dropped() {
        let (stub, core) = core_with_stub();
        *stub.resource_response.lock().unwrap() =
            Some(r#"{"async-response-id":"x"}"#.to_string());

        let command = InboundCommand {
            verb: "post".to_string(),
            ep_name: "d1".to_string(),
            uri: "/1/0/1".to_string(),
            value: None,
            options: None,
        };
        let outcome = core.dispatch_command(&command, "t", "{}", "r").await;
        assert!(matches!(outcome, CommandOutcome::AsyncIgnored));
        assert_eq!(core.async_responses.outstanding(), 0);
    }

    #[tokio::test]
    async fn sync_get_yields_immediate_observation() {
        let (stub, core) = core_with_stub();
        *stub.resource_response.lock().unwrap() = Some("29.75".to_string());

        let command = InboundCommand {
            verb: "get".to_string(),
            ep_name: "d1".to_string(),
            uri: "/3303/0/5700".to_string(),
            value: None,
            options: None,
        };
        match core.dispatch_command(&command, "t", "{}", "reply").await {
            CommandOutcome::SyncReply { topic, observation } => {
                assert_eq!(topic, "reply");
                assert_eq!(observation["value"], json!(29.75));
                assert_eq!(observation["coap_verb"], "GET");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn decode_command_prefers_body_then_topic() {
        let (_stub, core) = core_with_stub();
        let body = json!({"path": "/3303/0/5700", "coap_verb": "get"});

        let cmd = core
            .decode_command(&body, Some("d1".to_string()), Some("put".to_string()), None)
            .unwrap();
        assert_eq!(cmd.verb, "get");
        assert_eq!(cmd.uri, "/3303/0/5700");
        assert_eq!(cmd.ep_name, "d1");

        // wildcarded topic endpoint falls back to the body ep
        let body = json!({"path": "/1/0/1", "coap_verb": "put", "ep": "d2"});
        let cmd = core
            .decode_command(&body, Some("+".to_string()), None, None)
            .unwrap();
        assert_eq!(cmd.ep_name, "d2");
    }

    #[test]
    fn notification_observation_decodes_payload() {
        let (_stub, core) = core_with_stub();
        let notification = json!({"ep": "d1", "path": "/3303/0/5700", "payload": "MjkuNzU="});
        let (ep, obs) = core.notification_observation(&notification).unwrap();
        assert_eq!(ep, "d1");
        assert_eq!(obs["value"], json!(29.75));
        assert_eq!(obs["coap_verb"], "GET");
    }

    #[test]
    fn deregistration_lists_accept_both_shapes() {
        let strings = json!({"de-registrations": ["d1", "d2"]});
        assert_eq!(PeerCore::deregistration_list(&strings), vec!["d1", "d2"]);

        let objects = json!({"registrations-expired": [{"ep": "d3"}]});
        assert_eq!(PeerCore::deletion_list(&objects), vec!["d3"]);
    }

    #[test]
    fn forget_endpoint_clears_all_maps() {
        let (_stub, core) = core_with_stub();
        core.endpoints.insert(
            "d1",
            EndpointTopicData::new(vec![("t".to_string(), rumqttc::QoS::AtLeastOnce)], "light"),
        );
        core.subscriptions.add(
            SubscriptionKey::new("domain", "d1", "light", "/3303/0/5700"),
            true,
        );

        core.forget_endpoint("d1");
        assert!(!core.endpoints.has_subscriptions("d1"));
        assert!(core.subscriptions.is_empty());
    }
}
