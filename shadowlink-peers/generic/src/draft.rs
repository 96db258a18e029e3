//! Draft MQTT format: observations re-published as CBOR on
//! `<tenant>/lwm2m/ob/<ep>` with the envelope
//! `{operation: 19, token, paths, payload}`.

use serde_json::{json, Map, Value};
use shadowlink_error::{BridgeError, BridgeResult};
use shadowlink_utils::payload::decode_coap_payload_to_value;

/// CoAP NOTIFY operation code carried in the draft envelope.
const OPERATION_NOTIFY: i64 = 19;

/// Draft observation topic for an endpoint.
pub fn observation_topic(tenant_id: &str, observation: &Value) -> String {
    let ep = observation
        .get("ep")
        .or_else(|| observation.get("deviceId"))
        .and_then(Value::as_str)
        .unwrap_or("");
    format!("{}/lwm2m/ob/{}", tenant_id, ep)
}

/// Re-encode an observation as the draft CBOR envelope.
pub fn observation_payload(observation: &Value) -> BridgeResult<Vec<u8>> {
    let paths = observation
        .get("path")
        .or_else(|| observation.get("uri"))
        .cloned()
        .unwrap_or(Value::Null);
    let token = observation.get("token").cloned().unwrap_or(json!(0));

    // the transported payload reverts to its native JSON form
    let payload = match observation.get("payload").and_then(Value::as_str) {
        Some(b64) => decode_coap_payload_to_value(b64),
        None => observation
            .get("value")
            .cloned()
            .unwrap_or(Value::Object(Map::new())),
    };

    let envelope = json!({
        "operation": OPERATION_NOTIFY,
        "token": token,
        "paths": paths,
        "payload": payload,
    });
    json_to_cbor(&envelope)
}

pub fn json_to_cbor(value: &Value) -> BridgeResult<Vec<u8>> {
    let mut out = Vec::new();
    ciborium::into_writer(value, &mut out).map_err(|e| BridgeError::SerializationError {
        reason: format!("CBOR encode failed: {e}"),
    })?;
    Ok(out)
}

pub fn cbor_to_json(bytes: &[u8]) -> BridgeResult<Value> {
    ciborium::from_reader(bytes).map_err(|e| BridgeError::DeserializationError {
        reason: format!("CBOR decode failed: {e}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cbor_round_trip() {
        let value = json!({"operation": 19, "paths": "/3303/0/5700", "token": 0});
        let bytes = json_to_cbor(&value).unwrap();
        assert_eq!(cbor_to_json(&bytes).unwrap(), value);
    }

    #[test]
    fn draft_topic_binds_endpoint() {
        let observation = json!({"ep": "d1", "path": "/3303/0/5700"});
        assert_eq!(observation_topic("tenant1", &observation), "tenant1/lwm2m/ob/d1");
    }

    #[test]
    fn envelope_carries_operation_and_decoded_payload() {
        let observation = json!({
            "ep": "d1",
            "path": "/3303/0/5700",
            "payload": "MjkuNzU=",
            "value": 29.75
        });
        let bytes = observation_payload(&observation).unwrap();
        let decoded = cbor_to_json(&bytes).unwrap();
        assert_eq!(decoded["operation"], 19);
        assert_eq!(decoded["paths"], "/3303/0/5700");
        assert_eq!(decoded["token"], 0);
        assert_eq!(decoded["payload"], 29.75);
    }

    #[test]
    fn envelope_falls_back_to_value_without_payload() {
        let observation = json!({"ep": "d1", "path": "/1/0/1", "value": 7});
        let decoded = cbor_to_json(&observation_payload(&observation).unwrap()).unwrap();
        assert_eq!(decoded["payload"], 7);
    }
}
