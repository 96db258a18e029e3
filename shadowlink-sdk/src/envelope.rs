//! Wire envelopes: API request/response tunneling, CoAP command bodies,
//! and the canonical observation payload published to peer clouds.

use crate::value::json_string_value;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use shadowlink_utils::payload::{encode_coap_payload, fundamental_value};
use std::fmt;

/// CoAP verbs used to address a LwM2M resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CoapVerb {
    Get,
    Put,
    Post,
    Delete,
}

impl CoapVerb {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "get" => Some(Self::Get),
            "put" => Some(Self::Put),
            "post" => Some(Self::Post),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Put => "PUT",
            Self::Post => "POST",
            Self::Delete => "DELETE",
        }
    }

    pub fn as_lower(&self) -> &'static str {
        match self {
            Self::Get => "get",
            Self::Put => "put",
            Self::Post => "post",
            Self::Delete => "delete",
        }
    }

    /// Only GET and PUT asyncs are bridged; other verbs' async results are
    /// dropped (we do not bridge HTTP status back through the peer cloud).
    pub fn bridges_async_response(&self) -> bool {
        matches!(self, Self::Get | Self::Put)
    }
}

impl fmt::Display for CoapVerb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A bridge-administration REST call tunneled over MQTT.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub uri: Option<String>,
    pub data: Option<String>,
    pub options: Option<String>,
    pub verb: Option<String>,
    pub api_key: Option<String>,
    pub caller_id: Option<String>,
    pub content_type: Option<String>,
    pub request_id: u32,
}

impl ApiRequest {
    /// Presence of `api_verb` is sufficient to classify a message as an
    /// API request.
    pub fn is_api_request(parsed: &Value) -> bool {
        parsed.get("api_verb").is_some()
    }

    pub fn from_message(parsed: &Value, request_id: u32) -> Self {
        Self {
            uri: json_string_value(parsed, "api_uri").map(sanitize_uri),
            data: json_string_value(parsed, "api_request_data"),
            options: json_string_value(parsed, "api_options").map(sanitize_options),
            verb: json_string_value(parsed, "api_verb").map(|v| v.trim().to_uppercase()),
            api_key: json_string_value(parsed, "api_key").map(|v| v.trim().to_string()),
            caller_id: json_string_value(parsed, "api_caller_id").map(|v| v.trim().to_string()),
            content_type: json_string_value(parsed, "api_content_type")
                .map(|v| v.trim().to_string()),
            request_id,
        }
    }
}

/// URI sanitation: a single leading slash, no trailing slash.
fn sanitize_uri(uri: String) -> String {
    let trimmed = uri.trim().trim_matches('/');
    format!("/{}", trimmed)
}

/// REST option sanitation: strip any leading '?'.
fn sanitize_options(options: String) -> String {
    options.trim().trim_start_matches('?').to_string()
}

/// Reply envelope for a tunneled API request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse {
    pub request_id: u32,
    pub status: u16,
    pub body: String,
}

impl ApiResponse {
    pub fn new(request_id: u32, status: u16, body: impl Into<String>) -> Self {
        Self {
            request_id,
            status,
            body: body.into(),
        }
    }

    pub fn to_json(&self) -> String {
        json!({
            "request_id": self.request_id,
            "status": self.status,
            "body": self.body,
        })
        .to_string()
    }
}

/// A CoAP command decoded from an inbound peer message. Fields may come
/// from the JSON body or be backfilled from positional topic segments.
#[derive(Debug, Clone, Default)]
pub struct CoapCommand {
    pub path: Option<String>,
    pub verb: Option<String>,
    pub new_value: Option<String>,
    pub ep: Option<String>,
    pub options: Option<String>,
}

impl CoapCommand {
    /// Body shape: `{ "path": "/303/0/5850", "new_value": "0",
    /// "ep": "node-1", "coap_verb": "get", "options": "noResp=true" }`.
    pub fn from_message(parsed: &Value) -> Self {
        Self {
            path: json_string_value(parsed, "path"),
            verb: json_string_value(parsed, "coap_verb"),
            new_value: json_string_value(parsed, "new_value"),
            ep: json_string_value(parsed, "ep"),
            options: json_string_value(parsed, "options"),
        }
    }
}

/// Build the canonical observation JSON published to peer clouds.
///
/// `{"path": ..., "ep": ..., "value": <retyped>, "coap_verb": <VERB>}` plus
/// the unified-format keys (`resourceId`, `deviceId`, base64 `payload`,
/// upper-case `method`) when that feature is on.
pub fn create_observation(
    verb: &str,
    ep_name: &str,
    uri: &str,
    value: Option<&str>,
    unified_format: bool,
) -> Value {
    let effective = match value {
        Some(v) if !v.is_empty() => v,
        _ => "0",
    };
    create_observation_from_value(verb, ep_name, uri, fundamental_value(effective), unified_format)
}

/// Observation builder for an already-typed value (composite JSON payloads
/// keep their object form).
pub fn create_observation_from_value(
    verb: &str,
    ep_name: &str,
    uri: &str,
    value: Value,
    unified_format: bool,
) -> Value {
    let mut notification = Map::new();

    let string_form = match &value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    notification.insert("value".to_string(), value);
    notification.insert("path".to_string(), Value::from(uri));
    notification.insert("ep".to_string(), Value::from(ep_name));
    notification.insert("coap_verb".to_string(), Value::from(verb));

    if unified_format {
        notification.insert(
            "resourceId".to_string(),
            Value::from(uri.trim_start_matches('/')),
        );
        notification.insert("deviceId".to_string(), Value::from(ep_name));
        notification.insert(
            "payload".to_string(),
            Value::from(encode_coap_payload(&string_form)),
        );
        notification.insert("method".to_string(), Value::from(verb.to_uppercase()));
    }

    Value::Object(notification)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn verb_parse_is_case_insensitive() {
        assert_eq!(CoapVerb::parse("GET"), Some(CoapVerb::Get));
        assert_eq!(CoapVerb::parse("put"), Some(CoapVerb::Put));
        assert_eq!(CoapVerb::parse(" Delete "), Some(CoapVerb::Delete));
        assert_eq!(CoapVerb::parse("patch"), None);
    }

    #[test]
    fn async_bridging_policy() {
        assert!(CoapVerb::Get.bridges_async_response());
        assert!(CoapVerb::Put.bridges_async_response());
        assert!(!CoapVerb::Post.bridges_async_response());
        assert!(!CoapVerb::Delete.bridges_async_response());
    }

    #[test]
    fn api_request_detection() {
        assert!(ApiRequest::is_api_request(&json!({"api_verb": "GET"})));
        assert!(!ApiRequest::is_api_request(&json!({"coap_verb": "get"})));
    }

    #[test]
    fn api_request_extraction_sanitizes() {
        let msg = json!({
            "api_verb": "get",
            "api_uri": "v2/devices/",
            "api_options": "?limit=10",
            "api_key": " k ",
            "api_caller_id": "c",
        });
        let req = ApiRequest::from_message(&msg, 7);
        assert_eq!(req.uri.as_deref(), Some("/v2/devices"));
        assert_eq!(req.verb.as_deref(), Some("GET"));
        assert_eq!(req.options.as_deref(), Some("limit=10"));
        assert_eq!(req.api_key.as_deref(), Some("k"));
        assert_eq!(req.request_id, 7);
    }

    #[test]
    fn api_response_json_shape() {
        let resp = ApiResponse::new(3, 200, r#"{"ok":true}"#);
        let parsed: Value = serde_json::from_str(&resp.to_json()).unwrap();
        assert_eq!(parsed["request_id"], 3);
        assert_eq!(parsed["status"], 200);
        assert_eq!(parsed["body"], r#"{"ok":true}"#);
    }

    #[test]
    fn coap_command_from_body() {
        let msg = json!({
            "path": "/3303/0/5700",
            "coap_verb": "get",
            "ep": "d1"
        });
        let cmd = CoapCommand::from_message(&msg);
        assert_eq!(cmd.path.as_deref(), Some("/3303/0/5700"));
        assert_eq!(cmd.verb.as_deref(), Some("get"));
        assert_eq!(cmd.ep.as_deref(), Some("d1"));
        assert_eq!(cmd.new_value, None);
    }

    #[test]
    fn observation_round_trips() {
        let obs = create_observation("GET", "d1", "/3303/0/5700", Some("29.75"), false);
        assert_eq!(obs["value"], json!(29.75));
        assert_eq!(obs["ep"], "d1");
        assert_eq!(obs["path"], "/3303/0/5700");
        assert_eq!(obs["coap_verb"], "GET");
        assert!(obs.get("resourceId").is_none());
    }

    #[test]
    fn observation_unified_format_keys() {
        let obs = create_observation("get", "d1", "/3303/0/5700", Some("29.75"), true);
        assert_eq!(obs["resourceId"], "3303/0/5700");
        assert_eq!(obs["deviceId"], "d1");
        assert_eq!(obs["payload"], "MjkuNzU=");
        assert_eq!(obs["method"], "GET");
    }

    #[test]
    fn observation_empty_value_defaults_to_zero() {
        let obs = create_observation("PUT", "d1", "/1/0/1", None, false);
        assert_eq!(obs["value"], json!(0));
    }
}
