// SPDX-FileCopyrightText: © 2025 Siphon Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Built-in input transports.

mod udp;

pub use udp::UdpInput;
