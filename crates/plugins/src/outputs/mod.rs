// SPDX-FileCopyrightText: © 2025 Siphon Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Built-in outputs.

mod file;
mod log;

pub use file::FileOutput;
pub use log::LogOutput;
