// SPDX-FileCopyrightText: © 2025 Siphon Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! The record payload that flows through Siphon pipelines.
//!
//! This module defines the fundamental data structures of the system:
//! - [`Message`]: the typed telemetry record (timestamp, uuid, type, payload,
//!   named fields)
//! - [`FieldValue`]: scalar and array values for named fields
//! - [`Encoding`]: wire-encoding tags used to select a decoder per message

use bytes::Bytes;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Syslog-style severity levels carried in [`Message::severity`].
pub mod severity {
    pub const EMERGENCY: i32 = 0;
    pub const ALERT: i32 = 1;
    pub const CRITICAL: i32 = 2;
    pub const ERROR: i32 = 3;
    pub const WARNING: i32 = 4;
    pub const NOTICE: i32 = 5;
    pub const INFORMATIONAL: i32 = 6;
    pub const DEBUG: i32 = 7;
}

/// A wire-encoding tag identifying which decoder handles a raw message.
///
/// Tags are a single byte, so the valid range is `[0, 256)` by construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Encoding {
    Json = 0,
    ProtocolBuffer = 1,
}

impl Encoding {
    /// The tag value carried in message headers.
    pub const fn tag(self) -> u8 {
        self as u8
    }

    /// Resolves a config-file `encoding_name` to its tag.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "JSON" => Some(Self::Json),
            "PROTOCOL_BUFFER" => Some(Self::ProtocolBuffer),
            _ => None,
        }
    }
}

/// A named field value: scalars and homogeneous arrays.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Str(String),
    Bytes(Bytes),
    Int(i64),
    Double(f64),
    Bool(bool),
    StrArray(Vec<String>),
    IntArray(Vec<i64>),
    DoubleArray(Vec<f64>),
    BoolArray(Vec<bool>),
}

impl FieldValue {
    /// The value as a string slice, for string-typed fields only.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        Self::Double(v)
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

/// A named field attached to a [`Message`].
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub name: String,
    pub value: FieldValue,
}

/// The telemetry record carried by every pipeline pack.
///
/// A message is mutable only while its pack is exclusively held (before it
/// reaches the router); once fanned out it is read-only for all holders.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Event time in nanoseconds since the Unix epoch.
    pub timestamp_ns: i64,
    pub uuid: Uuid,
    /// The record type, the primary routing key (e.g. `logfile.line`).
    pub msg_type: String,
    /// The emitting component (e.g. a filter or input name).
    pub logger: String,
    pub severity: i32,
    pub payload: String,
    pub hostname: String,
    pub pid: u32,
    pub fields: Vec<Field>,
}

impl Default for Message {
    fn default() -> Self {
        Self {
            timestamp_ns: 0,
            uuid: Uuid::nil(),
            msg_type: String::new(),
            logger: String::new(),
            severity: severity::INFORMATIONAL,
            payload: String::new(),
            hostname: String::new(),
            pid: 0,
            fields: Vec::new(),
        }
    }
}

impl Message {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clears every field back to its default, retaining heap allocations
    /// where possible so recycled packs stay cheap.
    pub fn clear(&mut self) {
        self.timestamp_ns = 0;
        self.uuid = Uuid::nil();
        self.msg_type.clear();
        self.logger.clear();
        self.severity = severity::INFORMATIONAL;
        self.payload.clear();
        self.hostname.clear();
        self.pid = 0;
        self.fields.clear();
    }

    /// Stamps identity and origin: current time, a fresh uuid, and the
    /// producing process's hostname and pid.
    pub fn stamp(&mut self, hostname: &str, pid: u32) {
        self.timestamp_ns = now_nanos();
        self.uuid = Uuid::new_v4();
        self.hostname.clear();
        self.hostname.push_str(hostname);
        self.pid = pid;
    }

    /// Looks up a named field.
    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.iter().find(|f| f.name == name).map(|f| &f.value)
    }

    /// Looks up a string-typed named field.
    pub fn field_str(&self, name: &str) -> Option<&str> {
        self.field(name).and_then(FieldValue::as_str)
    }

    /// Sets a named field, replacing any existing field with the same name.
    pub fn set_field(&mut self, name: impl Into<String>, value: impl Into<FieldValue>) {
        let name = name.into();
        let value = value.into();
        if let Some(existing) = self.fields.iter_mut().find(|f| f.name == name) {
            existing.value = value;
        } else {
            self.fields.push(Field { name, value });
        }
    }
}

/// Current wall-clock time in nanoseconds since the Unix epoch.
pub fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_nanos()).unwrap_or(i64::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_field_replaces_existing() {
        let mut msg = Message::new();
        msg.set_field("status", "ok");
        msg.set_field("status", "failed");
        assert_eq!(msg.field_str("status"), Some("failed"));
        assert_eq!(msg.fields.len(), 1);
    }

    #[test]
    fn clear_resets_everything() {
        let mut msg = Message::new();
        msg.stamp("host-1", 42);
        msg.msg_type.push_str("test.type");
        msg.set_field("k", 7i64);
        msg.clear();
        assert_eq!(msg, Message::default());
    }

    #[test]
    fn encoding_names_resolve() {
        assert_eq!(Encoding::from_name("JSON"), Some(Encoding::Json));
        assert_eq!(Encoding::from_name("PROTOCOL_BUFFER"), Some(Encoding::ProtocolBuffer));
        assert_eq!(Encoding::from_name("XML"), None);
        assert_eq!(Encoding::Json.tag(), 0);
        assert_eq!(Encoding::ProtocolBuffer.tag(), 1);
    }
}
