// SPDX-FileCopyrightText: © 2025 Siphon Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Built-in wire decoders.

mod json;
mod protobuf;

pub use json::JsonDecoder;
pub use protobuf::{ProtobufDecoder, WireField, WireRecord};
