//! CoAP payload helpers: base64 transport coding and re-typing of decoded
//! string payloads into their fundamental JSON value forms.

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use serde_json::Value;

/// Decode a base64-carried CoAP payload into its string form.
///
/// Returns `None` when the input is not valid base64 or not valid UTF-8;
/// callers log and fall back to the raw payload.
pub fn decode_coap_payload(b64: &str) -> Option<String> {
    let bytes = BASE64_STANDARD.decode(b64.trim()).ok()?;
    String::from_utf8(bytes).ok()
}

/// Encode a payload string for base64 transport.
#[inline]
pub fn encode_coap_payload(payload: &str) -> String {
    BASE64_STANDARD.encode(payload.as_bytes())
}

/// Re-type a decoded payload string as its fundamental JSON value: integer,
/// float, boolean, or string, in that order of preference.
pub fn fundamental_value(s: &str) -> Value {
    let trimmed = s.trim();
    if let Ok(i) = trimmed.parse::<i64>() {
        return Value::from(i);
    }
    if let Ok(f) = trimmed.parse::<f64>() {
        if f.is_finite() {
            return Value::from(f);
        }
    }
    match trimmed {
        "true" => Value::from(true),
        "false" => Value::from(false),
        _ => Value::from(s),
    }
}

/// Decode a base64 CoAP payload straight to a JSON value: a JSON object or
/// array payload parses as-is, anything else is re-typed as a fundamental.
pub fn decode_coap_payload_to_value(b64: &str) -> Value {
    match decode_coap_payload(b64) {
        Some(decoded) => match serde_json::from_str::<Value>(&decoded) {
            Ok(v @ Value::Object(_)) | Ok(v @ Value::Array(_)) => v,
            _ => fundamental_value(&decoded),
        },
        None => Value::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_base64_payload() {
        // "29.75"
        assert_eq!(decode_coap_payload("MjkuNzU=").as_deref(), Some("29.75"));
        assert_eq!(decode_coap_payload("not base64!!"), None);
    }

    #[test]
    fn round_trips_encoding() {
        let encoded = encode_coap_payload("29.75");
        assert_eq!(encoded, "MjkuNzU=");
        assert_eq!(decode_coap_payload(&encoded).as_deref(), Some("29.75"));
    }

    #[test]
    fn fundamental_typing() {
        assert_eq!(fundamental_value("42"), json!(42));
        assert_eq!(fundamental_value("29.75"), json!(29.75));
        assert_eq!(fundamental_value("true"), json!(true));
        assert_eq!(fundamental_value("hello"), json!("hello"));
    }

    #[test]
    fn composite_payloads_parse_as_json() {
        let b64 = encode_coap_payload(r#"{"temp":21.5}"#);
        assert_eq!(decode_coap_payload_to_value(&b64), json!({"temp": 21.5}));

        let scalar = encode_coap_payload("7");
        assert_eq!(decode_coap_payload_to_value(&scalar), json!(7));
    }
}
