//! Async-response correlation: records outstanding CoAP async IDs and
//! resumes them when the backend emits the matching completion.

use dashmap::DashMap;
use serde_json::Value;
use shadowlink_sdk::envelope::{create_observation, CoapVerb};
use shadowlink_utils::payload::decode_coap_payload;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// One outstanding async CoAP operation and where its reply publishes.
#[derive(Debug, Clone)]
pub struct AsyncRecord {
    pub async_id: String,
    pub verb: CoapVerb,
    pub ep_name: String,
    pub uri: String,
    pub reply_topic: String,
    pub original_topic: String,
    pub original_message: String,
    pub created_at: Instant,
}

/// Keyed by async-id. Every record is either delivered exactly once (the
/// matching completion takes it) or evicted by the TTL sweep.
#[derive(Default)]
pub struct AsyncResponseCorrelator {
    records: DashMap<String, AsyncRecord>,
}

impl AsyncResponseCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether an orchestrator response defers the real result.
    pub fn is_async_response(response: &str) -> bool {
        Self::async_id_of(response).is_some()
    }

    pub fn async_id_of(response: &str) -> Option<String> {
        let parsed: Value = serde_json::from_str(response).ok()?;
        parsed
            .get("async-response-id")
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    /// Record an async response. Only GET and PUT asyncs are bridged; other
    /// verbs are dropped by policy (HTTP status is not bridged back).
    #[allow(clippy::too_many_arguments)]
    pub fn record(
        &self,
        response: &str,
        verb: CoapVerb,
        ep_name: &str,
        uri: &str,
        original_topic: &str,
        reply_topic: &str,
        original_message: &str,
    ) -> bool {
        if !verb.bridges_async_response() {
            info!(ep = ep_name, verb = %verb, "ignoring async response for verb");
            return false;
        }
        let Some(async_id) = Self::async_id_of(response) else {
            warn!(ep = ep_name, "response carries no async-response-id");
            return false;
        };

        debug!(ep = ep_name, async_id = %async_id, uri, "recording async response");
        self.records.insert(
            async_id.clone(),
            AsyncRecord {
                async_id,
                verb,
                ep_name: ep_name.to_string(),
                uri: uri.to_string(),
                reply_topic: reply_topic.to_string(),
                original_topic: original_topic.to_string(),
                original_message: original_message.to_string(),
                created_at: Instant::now(),
            },
        );
        true
    }

    /// Take the record matching a completion entry's `id`, if any. Taking
    /// removes it, so each record is delivered at most once.
    pub fn take_completion(&self, entry: &Value) -> Option<AsyncRecord> {
        let id = entry.get("id").and_then(Value::as_str)?;
        self.records.remove(id).map(|(_, rec)| rec)
    }

    pub fn outstanding(&self) -> usize {
        self.records.len()
    }

    /// Evict records older than `ttl`; returns how many were dropped.
    pub fn sweep(&self, ttl: Duration) -> usize {
        let before = self.records.len();
        self.records.retain(|_, rec| rec.created_at.elapsed() < ttl);
        let evicted = before.saturating_sub(self.records.len());
        if evicted > 0 {
            info!(evicted, "evicted expired async-response records");
        }
        evicted
    }
}

/// Format a backend completion as the observation published on the stored
/// reply topic. GET replies carry the base64-decoded payload as `value`;
/// PUT replies do the same, or fall back to the async-id when the
/// completion has no payload.
pub fn format_async_reply(
    record: &AsyncRecord,
    completion: &Value,
    unified_format: bool,
) -> Option<Value> {
    let payload = completion
        .get("payload")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|p| !p.is_empty());

    match record.verb {
        CoapVerb::Get => {
            let decoded = decode_coap_payload(payload?)?;
            Some(create_observation(
                record.verb.as_str(),
                &record.ep_name,
                &record.uri,
                Some(&decoded),
                unified_format,
            ))
        }
        CoapVerb::Put => {
            let value = match payload {
                Some(p) => decode_coap_payload(p)?,
                None => record.async_id.clone(),
            };
            Some(create_observation(
                record.verb.as_str(),
                &record.ep_name,
                &record.uri,
                Some(&value),
                unified_format,
            ))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record_get(correlator: &AsyncResponseCorrelator) -> bool {
        correlator.record(
            r#"{"async-response-id":"abc123"}"#,
            CoapVerb::Get,
            "d1",
            "/3303/0/5700",
            "iot-2/type/light/id/d1/cmd/get/fmt/json",
            "iot-2/type/light/id/d1/evt/cmd-response/fmt/json",
            r#"{"path":"/3303/0/5700","coap_verb":"get"}"#,
        )
    }

    #[test]
    fn detects_async_responses() {
        assert!(AsyncResponseCorrelator::is_async_response(
            r#"{"async-response-id":"abc123"}"#
        ));
        assert!(!AsyncResponseCorrelator::is_async_response(r#"{"value":1}"#));
        assert!(!AsyncResponseCorrelator::is_async_response("not json"));
    }

    #[test]
    fn records_only_get_and_put() {
        let correlator = AsyncResponseCorrelator::new();
        assert!(record_get(&correlator));
        assert!(!correlator.record(
            r#"{"async-response-id":"x"}"#,
            CoapVerb::Post,
            "d1",
            "/1/0/1",
            "t",
            "r",
            "m",
        ));
        assert_eq!(correlator.outstanding(), 1);
    }

    #[test]
    fn completion_delivers_exactly_once() {
        let correlator = AsyncResponseCorrelator::new();
        record_get(&correlator);

        let completion = json!({"id": "abc123", "status": 200, "payload": "MjkuNzU="});
        let rec = correlator.take_completion(&completion).unwrap();
        assert_eq!(rec.ep_name, "d1");
        assert!(correlator.take_completion(&completion).is_none());
    }

    #[test]
    fn unknown_completion_is_ignored() {
        let correlator = AsyncResponseCorrelator::new();
        record_get(&correlator);
        assert!(correlator
            .take_completion(&json!({"id": "nope", "payload": ""}))
            .is_none());
        assert_eq!(correlator.outstanding(), 1);
    }

    #[test]
    fn get_reply_decodes_payload() {
        let correlator = AsyncResponseCorrelator::new();
        record_get(&correlator);
        let rec = correlator
            .take_completion(&json!({"id": "abc123", "payload": "MjkuNzU="}))
            .unwrap();

        let obs = format_async_reply(&rec, &json!({"id": "abc123", "payload": "MjkuNzU="}), false)
            .unwrap();
        assert_eq!(obs["value"], json!(29.75));
        assert_eq!(obs["ep"], "d1");
        assert_eq!(obs["coap_verb"], "GET");
    }

    #[test]
    fn empty_put_payload_publishes_async_id() {
        let correlator = AsyncResponseCorrelator::new();
        correlator.record(
            r#"{"async-response-id":"put-1"}"#,
            CoapVerb::Put,
            "d1",
            "/3303/0/5850",
            "t",
            "r",
            "m",
        );
        let rec = correlator
            .take_completion(&json!({"id": "put-1", "status": 200}))
            .unwrap();

        let obs = format_async_reply(&rec, &json!({"id": "put-1", "status": 200}), false).unwrap();
        assert_eq!(obs["value"], "put-1");
    }

    #[test]
    fn sweep_evicts_expired_records() {
        let correlator = AsyncResponseCorrelator::new();
        record_get(&correlator);
        assert_eq!(correlator.sweep(Duration::from_secs(3600)), 0);
        assert_eq!(correlator.sweep(Duration::ZERO), 1);
        assert_eq!(correlator.outstanding(), 0);
    }
}
