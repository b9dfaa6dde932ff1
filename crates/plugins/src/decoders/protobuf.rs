// SPDX-FileCopyrightText: © 2025 Siphon Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Protobuf wire decoder.
//!
//! The wire schema mirrors [`Message`] with fixed tags; record schema
//! evolution is out of scope, so the tags are frozen here rather than
//! generated from a .proto file.

use prost::Message as _;
use siphon_core::{Decoder, FieldValue, Message, PipelineError, Result};
use uuid::Uuid;

/// One named field on the wire. Exactly one of the value slots is set.
#[derive(Clone, PartialEq, prost::Message)]
pub struct WireField {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, optional, tag = "2")]
    pub value_string: Option<String>,
    #[prost(int64, optional, tag = "3")]
    pub value_int: Option<i64>,
    #[prost(double, optional, tag = "4")]
    pub value_double: Option<f64>,
    #[prost(bool, optional, tag = "5")]
    pub value_bool: Option<bool>,
    #[prost(bytes = "vec", optional, tag = "6")]
    pub value_bytes: Option<Vec<u8>>,
}

/// The record as serialized by protobuf-speaking producers.
#[derive(Clone, PartialEq, prost::Message)]
pub struct WireRecord {
    #[prost(bytes = "vec", tag = "1")]
    pub uuid: Vec<u8>,
    #[prost(int64, tag = "2")]
    pub timestamp_ns: i64,
    #[prost(string, tag = "3")]
    pub msg_type: String,
    #[prost(string, tag = "4")]
    pub logger: String,
    #[prost(int32, tag = "5")]
    pub severity: i32,
    #[prost(string, tag = "6")]
    pub payload: String,
    #[prost(string, tag = "7")]
    pub hostname: String,
    #[prost(uint32, tag = "8")]
    pub pid: u32,
    #[prost(message, repeated, tag = "9")]
    pub fields: Vec<WireField>,
}

#[derive(Debug, Default)]
pub struct ProtobufDecoder;

impl Decoder for ProtobufDecoder {
    fn decode(&mut self, raw: &[u8], msg: &mut Message) -> Result<()> {
        let record = WireRecord::decode(raw)
            .map_err(|e| PipelineError::Flow(format!("invalid protobuf record: {e}")))?;

        msg.uuid = Uuid::from_slice(&record.uuid)
            .map_err(|e| PipelineError::Flow(format!("invalid record uuid: {e}")))?;
        msg.timestamp_ns = record.timestamp_ns;
        msg.msg_type.push_str(&record.msg_type);
        msg.logger.push_str(&record.logger);
        msg.severity = record.severity;
        msg.payload.push_str(&record.payload);
        msg.hostname.push_str(&record.hostname);
        msg.pid = record.pid;

        for field in record.fields {
            let value = if let Some(s) = field.value_string {
                FieldValue::Str(s)
            } else if let Some(v) = field.value_int {
                FieldValue::Int(v)
            } else if let Some(v) = field.value_double {
                FieldValue::Double(v)
            } else if let Some(v) = field.value_bool {
                FieldValue::Bool(v)
            } else if let Some(v) = field.value_bytes {
                FieldValue::Bytes(v.into())
            } else {
                return Err(PipelineError::Flow(format!("field '{}' carries no value", field.name)));
            };
            msg.set_field(field.name, value);
        }
        Ok(())
    }
}
