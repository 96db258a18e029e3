//! Command and lifecycle flows for the Google processor against an
//! in-process orchestrator stub.

use async_trait::async_trait;
use serde_json::{json, Value};
use shadowlink_common::settings::{Backend, GoogleCloud, Inner};
use shadowlink_common::Settings;
use shadowlink_peer_google::GoogleProcessor;
use shadowlink_sdk::envelope::{ApiRequest, ApiResponse};
use shadowlink_sdk::peer::{OrchestratorApi, PeerProcessor, ShadowRegistry};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct StubOrchestrator {
    resource_calls: Mutex<Vec<(String, String, String)>>,
    resource_response: Mutex<Option<String>>,
    api_calls: Mutex<Vec<String>>,
    delete_on_deregistration: bool,
}

#[async_trait]
impl OrchestratorApi for StubOrchestrator {
    async fn process_api_request_operation(&self, request: ApiRequest) -> ApiResponse {
        self.api_calls
            .lock()
            .unwrap()
            .push(request.uri.clone().unwrap_or_default());
        ApiResponse::new(request.request_id, 200, "{}")
    }

    async fn process_endpoint_resource_operation(
        &self,
        verb: &str,
        ep_name: &str,
        uri: &str,
        _value: Option<String>,
        _options: Option<String>,
    ) -> Option<String> {
        self.resource_calls.lock().unwrap().push((
            verb.to_string(),
            ep_name.to_string(),
            uri.to_string(),
        ));
        self.resource_response.lock().unwrap().clone()
    }

    async fn subscribe_to_endpoint_resource(&self, _ep_name: &str, _uri: &str) -> bool {
        true
    }

    async fn pull_device_metadata(&self, endpoint: Value) -> Value {
        endpoint
    }

    fn device_removed_on_deregistration(&self) -> bool {
        self.delete_on_deregistration
    }
}

#[derive(Default)]
struct RecordingRegistry {
    deleted: Mutex<Vec<String>>,
}

#[async_trait]
impl ShadowRegistry for RecordingRegistry {
    async fn create_shadow(&self, _endpoint: &Value) -> bool {
        true
    }

    async fn delete_shadow(&self, ep_name: &str) -> bool {
        self.deleted.lock().unwrap().push(ep_name.to_string());
        true
    }
}

struct Fixture {
    orchestrator: Arc<StubOrchestrator>,
    _orchestrator_dyn: Arc<dyn OrchestratorApi>,
    registry: Arc<RecordingRegistry>,
    processor: Arc<GoogleProcessor>,
}

fn fixture(delete_on_deregistration: bool) -> Fixture {
    let settings = Settings::from_inner(Inner {
        google_cloud: GoogleCloud {
            auth_json: r#"{"project_id":"bridge-test"}"#.into(),
            ..GoogleCloud::default()
        },
        backend: Backend {
            device_removed_on_deregistration: delete_on_deregistration,
            ..Backend::default()
        },
        ..Inner::default()
    });

    let orchestrator = Arc::new(StubOrchestrator {
        delete_on_deregistration,
        ..StubOrchestrator::default()
    });
    let orchestrator_dyn: Arc<dyn OrchestratorApi> = orchestrator.clone();
    let registry = Arc::new(RecordingRegistry::default());
    let processor = GoogleProcessor::new(
        &settings,
        Arc::downgrade(&orchestrator_dyn),
        registry.clone(),
    );

    Fixture {
        orchestrator,
        _orchestrator_dyn: orchestrator_dyn,
        registry,
        processor,
    }
}

#[tokio::test]
async fn config_topic_command_records_async_reply_on_state_topic() {
    let fx = fixture(false);
    *fx.orchestrator.resource_response.lock().unwrap() =
        Some(r#"{"async-response-id":"g-1"}"#.to_string());

    fx.processor
        .on_message_receive(
            "/devices/lwm2m_d1/config",
            r#"{"path":"/3303/0/5700","coap_verb":"get"}"#,
        )
        .await;

    // endpoint decoded from the google device id, verb from the body
    let calls = fx.orchestrator.resource_calls.lock().unwrap().clone();
    assert_eq!(
        calls,
        vec![("get".to_string(), "d1".to_string(), "/3303/0/5700".to_string())]
    );

    assert_eq!(fx.processor.core().async_responses.outstanding(), 1);
    let record = fx
        .processor
        .core()
        .async_responses
        .take_completion(&json!({"id": "g-1"}))
        .unwrap();
    assert_eq!(record.reply_topic, "/devices/lwm2m_d1/state");
}

#[tokio::test]
async fn wildcarded_endpoint_falls_back_to_body() {
    let fx = fixture(false);
    *fx.orchestrator.resource_response.lock().unwrap() = Some("ok".to_string());

    fx.processor
        .on_message_receive(
            "/devices/+/config",
            r#"{"path":"/1/0/1","coap_verb":"put","new_value":"0","ep":"d9"}"#,
        )
        .await;

    let calls = fx.orchestrator.resource_calls.lock().unwrap().clone();
    assert_eq!(calls[0].1, "d9");
}

#[tokio::test]
async fn api_request_publishes_no_async_record() {
    let fx = fixture(false);

    fx.processor
        .on_message_receive(
            "/devices/lwm2m_d1/config",
            r#"{"api_verb":"GET","api_uri":"/v2/devices","api_key":"k"}"#,
        )
        .await;

    assert_eq!(
        fx.orchestrator.api_calls.lock().unwrap().clone(),
        vec!["/v2/devices".to_string()]
    );
    assert_eq!(fx.processor.core().async_responses.outstanding(), 0);
}

#[tokio::test]
async fn deletion_stops_refresher_and_clears_shadow() {
    let fx = fixture(true);

    // a deregistration with the delete policy set tears everything down,
    // even when no session ever connected
    fx.processor
        .process_device_server_message(r#"{"de-registrations":["d1"]}"#)
        .await;

    assert!(!fx.processor.has_refresher("d1"));
    assert_eq!(
        fx.registry.deleted.lock().unwrap().clone(),
        vec!["d1".to_string()]
    );
    assert!(!fx.processor.core().endpoints.has_subscriptions("d1"));
}
