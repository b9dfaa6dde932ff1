// SPDX-FileCopyrightText: © 2025 Siphon Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! JSON wire decoder.
//!
//! Expects a single JSON object per message. Well-known keys populate the
//! typed message columns; every other key becomes a named field. Nested
//! objects and mixed arrays are preserved as their compact JSON text.

use serde_json::Value;
use siphon_core::message::now_nanos;
use siphon_core::{Decoder, FieldValue, Message, PipelineError, Result};
use uuid::Uuid;

#[derive(Debug, Default)]
pub struct JsonDecoder;

impl Decoder for JsonDecoder {
    fn decode(&mut self, raw: &[u8], msg: &mut Message) -> Result<()> {
        let value: Value = serde_json::from_slice(raw)
            .map_err(|e| PipelineError::Flow(format!("invalid json: {e}")))?;
        let Value::Object(object) = value else {
            return Err(PipelineError::Flow("json message must be an object".to_string()));
        };

        msg.timestamp_ns = now_nanos();
        msg.uuid = Uuid::new_v4();

        for (key, value) in object {
            match (key.as_str(), &value) {
                ("type", Value::String(s)) => msg.msg_type.push_str(s),
                ("logger", Value::String(s)) => msg.logger.push_str(s),
                ("payload", Value::String(s)) => msg.payload.push_str(s),
                ("hostname", Value::String(s)) => msg.hostname.push_str(s),
                ("uuid", Value::String(s)) => {
                    msg.uuid = Uuid::parse_str(s)
                        .map_err(|e| PipelineError::Flow(format!("invalid uuid '{s}': {e}")))?;
                }
                ("timestamp", Value::Number(n)) => {
                    msg.timestamp_ns = n
                        .as_i64()
                        .ok_or_else(|| PipelineError::Flow(format!("bad timestamp {n}")))?;
                }
                ("severity", Value::Number(n)) => {
                    let severity = n
                        .as_i64()
                        .and_then(|v| i32::try_from(v).ok())
                        .ok_or_else(|| PipelineError::Flow(format!("bad severity {n}")))?;
                    msg.severity = severity;
                }
                ("pid", Value::Number(n)) => {
                    msg.pid = n
                        .as_u64()
                        .and_then(|v| u32::try_from(v).ok())
                        .ok_or_else(|| PipelineError::Flow(format!("bad pid {n}")))?;
                }
                _ => {
                    if let Some(field) = json_field(&value) {
                        msg.set_field(key, field);
                    }
                }
            }
        }
        Ok(())
    }
}

fn json_field(value: &Value) -> Option<FieldValue> {
    match value {
        Value::Null => None,
        Value::Bool(b) => Some(FieldValue::Bool(*b)),
        Value::Number(n) => Some(
            n.as_i64().map_or_else(|| FieldValue::Double(n.as_f64().unwrap_or(0.0)), FieldValue::Int),
        ),
        Value::String(s) => Some(FieldValue::Str(s.clone())),
        Value::Array(items) => json_array_field(items),
        Value::Object(_) => Some(FieldValue::Str(value.to_string())),
    }
}

fn json_array_field(items: &[Value]) -> Option<FieldValue> {
    if items.iter().all(Value::is_string) {
        let strings = items.iter().filter_map(Value::as_str).map(str::to_string).collect();
        return Some(FieldValue::StrArray(strings));
    }
    if items.iter().all(Value::is_i64) {
        return Some(FieldValue::IntArray(items.iter().filter_map(Value::as_i64).collect()));
    }
    if items.iter().all(Value::is_number) {
        return Some(FieldValue::DoubleArray(items.iter().filter_map(Value::as_f64).collect()));
    }
    if items.iter().all(Value::is_boolean) {
        return Some(FieldValue::BoolArray(items.iter().filter_map(Value::as_bool).collect()));
    }
    // Mixed arrays keep their JSON text.
    Some(FieldValue::Str(Value::Array(items.to_vec()).to_string()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn decode(raw: &str) -> Message {
        let mut msg = Message::new();
        JsonDecoder.decode(raw.as_bytes(), &mut msg).unwrap();
        msg
    }

    #[test]
    fn well_known_keys_fill_message_columns() {
        let msg = decode(
            r#"{
                "type": "nginx.access",
                "logger": "tail",
                "payload": "GET / 200",
                "hostname": "web-1",
                "severity": 6,
                "pid": 901,
                "timestamp": 1700000000000000000,
                "uuid": "6ba7b810-9dad-11d1-80b4-00c04fd430c8"
            }"#,
        );
        assert_eq!(msg.msg_type, "nginx.access");
        assert_eq!(msg.logger, "tail");
        assert_eq!(msg.payload, "GET / 200");
        assert_eq!(msg.hostname, "web-1");
        assert_eq!(msg.severity, 6);
        assert_eq!(msg.pid, 901);
        assert_eq!(msg.timestamp_ns, 1_700_000_000_000_000_000);
        assert_eq!(msg.uuid.to_string(), "6ba7b810-9dad-11d1-80b4-00c04fd430c8");
    }

    #[test]
    fn unknown_keys_become_fields() {
        let msg = decode(
            r#"{"type": "t", "service": "auth", "count": 3, "ratio": 0.5, "ok": true,
                "tags": ["a", "b"], "codes": [1, 2, 3]}"#,
        );
        assert_eq!(msg.field_str("service"), Some("auth"));
        assert_eq!(msg.field("count"), Some(&FieldValue::Int(3)));
        assert_eq!(msg.field("ratio"), Some(&FieldValue::Double(0.5)));
        assert_eq!(msg.field("ok"), Some(&FieldValue::Bool(true)));
        assert_eq!(
            msg.field("tags"),
            Some(&FieldValue::StrArray(vec!["a".to_string(), "b".to_string()]))
        );
        assert_eq!(msg.field("codes"), Some(&FieldValue::IntArray(vec![1, 2, 3])));
    }

    #[test]
    fn missing_identity_is_stamped() {
        let msg = decode(r#"{"type": "t"}"#);
        assert!(msg.timestamp_ns > 0);
        assert_ne!(msg.uuid, Uuid::nil());
    }

    #[test]
    fn non_object_json_is_a_flow_error() {
        let mut msg = Message::new();
        let err = JsonDecoder.decode(b"[1, 2]", &mut msg).unwrap_err();
        assert!(matches!(err, PipelineError::Flow(_)));
        let err = JsonDecoder.decode(b"not json", &mut msg).unwrap_err();
        assert!(matches!(err, PipelineError::Flow(_)));
    }
}
