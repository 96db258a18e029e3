//! The orchestrator: owns the peer processors, fans backend events out to
//! them, and implements the facade they call back into (REST against the
//! device-management backend).
//!
//! Ownership is one-way: the orchestrator holds `Arc`s to its processors;
//! each processor holds only a weak back-reference. Shutdown order is
//! processors first, orchestrator second.

use crate::longpoll::LongPollProcessor;
use async_trait::async_trait;
use serde_json::Value;
use shadowlink_common::Settings;
use shadowlink_error::{BridgeError, BridgeResult};
use shadowlink_sdk::{
    envelope::{ApiRequest, ApiResponse},
    peer::{OrchestratorApi, OrchestratorHandle, PeerProcessor},
};
use std::{sync::Arc, time::Duration};
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct BridgeOrchestrator {
    settings: Settings,
    http: reqwest::Client,
    processors: RwLock<Vec<Arc<dyn PeerProcessor>>>,
    cancel: CancellationToken,
}

impl BridgeOrchestrator {
    pub fn new(settings: Settings) -> BridgeResult<Arc<Self>> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| BridgeError::HttpError {
                reason: e.to_string(),
            })?;
        Ok(Arc::new(Self {
            settings,
            http,
            processors: RwLock::new(Vec::new()),
            cancel: CancellationToken::new(),
        }))
    }

    /// Weak back-reference handed to processors at construction time.
    pub fn handle(self: &Arc<Self>) -> OrchestratorHandle {
        let strong: Arc<dyn OrchestratorApi> = Arc::clone(self) as Arc<dyn OrchestratorApi>;
        Arc::downgrade(&strong)
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn add_processor(&self, processor: Arc<dyn PeerProcessor>) {
        info!(processor = processor.name(), "registering peer processor");
        self.processors.write().await.push(processor);
    }

    /// Bring up every processor's listener and start the long-poll reader.
    pub async fn start(self: &Arc<Self>) -> BridgeResult<()> {
        for processor in self.processors.read().await.iter() {
            if let Err(e) = processor.init_listener().await {
                warn!(processor = processor.name(), error = %e, "listener failed to start");
            }
        }

        let (events_tx, mut events_rx) = mpsc::channel::<String>(64);

        let dispatcher = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(message) = events_rx.recv().await {
                dispatcher.process_device_server_message(&message).await;
            }
            debug!("backend event dispatcher terminated");
        });

        let poller = LongPollProcessor::new(
            self.settings.backend.long_poll_url_resolved(),
            self.settings.backend.api_key.clone(),
            events_tx,
            self.cancel.child_token(),
        )?;
        poller.start();
        Ok(())
    }

    /// Fan a backend notification-channel message out to every processor.
    pub async fn process_device_server_message(&self, message: &str) {
        for processor in self.processors.read().await.iter() {
            processor.process_device_server_message(message).await;
        }
    }

    /// Processors first, orchestrator second; safe to call twice.
    pub async fn shutdown(&self) {
        info!("shutting down bridge");
        self.cancel.cancel();
        let processors = {
            let mut guard = self.processors.write().await;
            std::mem::take(&mut *guard)
        };
        for processor in processors {
            processor.stop_listener().await;
        }
    }

    fn endpoint_url(&self, ep_name: &str, uri: &str, options: Option<&str>) -> String {
        let mut url = format!(
            "{}/v2/endpoints/{}{}",
            self.settings.backend.api_host, ep_name, uri
        );
        if let Some(options) = options.filter(|o| !o.is_empty()) {
            url.push('?');
            url.push_str(options);
        }
        url
    }
}

#[async_trait]
impl OrchestratorApi for BridgeOrchestrator {
    async fn process_api_request_operation(&self, request: ApiRequest) -> ApiResponse {
        let Some(uri) = request.uri.clone() else {
            return ApiResponse::new(request.request_id, 400, r#"{"error":"missing api_uri"}"#);
        };
        let verb = request.verb.clone().unwrap_or_else(|| "GET".to_string());

        let mut url = format!("{}{}", self.settings.backend.api_host, uri);
        if let Some(options) = request.options.as_deref().filter(|o| !o.is_empty()) {
            url.push('?');
            url.push_str(options);
        }
        let api_key = request
            .api_key
            .clone()
            .unwrap_or_else(|| self.settings.backend.api_key.clone());

        let builder = match verb.as_str() {
            "GET" => self.http.get(&url),
            "PUT" => self.http.put(&url),
            "POST" => self.http.post(&url),
            "DELETE" => self.http.delete(&url),
            other => {
                return ApiResponse::new(
                    request.request_id,
                    400,
                    format!(r#"{{"error":"unsupported verb {other}"}}"#),
                );
            }
        };

        let mut builder = builder.bearer_auth(api_key);
        if let Some(data) = request.data.clone() {
            builder = builder
                .header(
                    "Content-Type",
                    request
                        .content_type
                        .as_deref()
                        .unwrap_or("application/json"),
                )
                .body(data);
        }

        match builder.send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                let body = response.text().await.unwrap_or_default();
                ApiResponse::new(request.request_id, status, body)
            }
            Err(e) => {
                warn!(error = %e, uri = %uri, "API request to backend failed");
                ApiResponse::new(request.request_id, 503, r#"{"error":"backend unreachable"}"#)
            }
        }
    }

    async fn process_endpoint_resource_operation(
        &self,
        verb: &str,
        ep_name: &str,
        uri: &str,
        value: Option<String>,
        options: Option<String>,
    ) -> Option<String> {
        let url = self.endpoint_url(ep_name, uri, options.as_deref());
        debug!(verb, ep = ep_name, uri, "dispatching CoAP resource operation");

        let builder = match verb.to_ascii_lowercase().as_str() {
            "get" => self.http.get(&url),
            "put" => self.http.put(&url).body(value.unwrap_or_default()),
            "post" => self.http.post(&url).body(value.unwrap_or_default()),
            "delete" => self.http.delete(&url),
            other => {
                warn!(verb = other, "unsupported CoAP verb");
                return None;
            }
        };

        match builder
            .bearer_auth(&self.settings.backend.api_key)
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => response.text().await.ok(),
            Ok(response) => {
                warn!(status = %response.status(), ep = ep_name, uri, "backend rejected resource operation");
                None
            }
            Err(e) => {
                warn!(error = %e, ep = ep_name, uri, "resource operation transport error");
                None
            }
        }
    }

    async fn subscribe_to_endpoint_resource(&self, ep_name: &str, uri: &str) -> bool {
        let url = format!(
            "{}/v2/subscriptions/{}{}",
            self.settings.backend.api_host, ep_name, uri
        );
        match self
            .http
            .put(&url)
            .bearer_auth(&self.settings.backend.api_key)
            .send()
            .await
        {
            Ok(response) => {
                let ok = response.status().is_success();
                if !ok {
                    warn!(status = %response.status(), ep = ep_name, uri, "subscription rejected");
                }
                ok
            }
            Err(e) => {
                warn!(error = %e, ep = ep_name, uri, "subscription transport error");
                false
            }
        }
    }

    async fn pull_device_metadata(&self, mut endpoint: Value) -> Value {
        let Some(ep_name) = endpoint.get("ep").and_then(Value::as_str).map(str::to_string) else {
            return endpoint;
        };
        let url = format!("{}/v2/endpoints/{}", self.settings.backend.api_host, ep_name);

        let body = match self
            .http
            .get(&url)
            .bearer_auth(&self.settings.backend.api_key)
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => {
                response.text().await.unwrap_or_default()
            }
            Ok(response) => {
                warn!(status = %response.status(), ep = %ep_name, "metadata pull rejected");
                return endpoint;
            }
            Err(e) => {
                warn!(error = %e, ep = %ep_name, "metadata pull transport error");
                return endpoint;
            }
        };

        match serde_json::from_str::<Value>(&body) {
            // resource discovery list: attach when the registration lacked it
            Ok(discovered @ Value::Array(_)) => {
                if endpoint.get("resources").is_none() {
                    endpoint["resources"] = discovered;
                }
            }
            // attribute object: merge without clobbering registration fields
            Ok(Value::Object(attributes)) => {
                if let Some(target) = endpoint.as_object_mut() {
                    for (k, v) in attributes {
                        target.entry(k).or_insert(v);
                    }
                }
            }
            _ => {}
        }
        endpoint
    }

    fn device_removed_on_deregistration(&self) -> bool {
        self.settings.backend.device_removed_on_deregistration
    }
}
