// SPDX-FileCopyrightText: © 2025 Siphon Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! File output: appends one formatted line per matched record.
//!
//! With a `ticker_interval` configured, writes are buffered and flushed on
//! each tick; without one, every record is flushed as it arrives.

use serde::Deserialize;
use siphon_core::plugin::{parse_config, FoContext, FoEvent, Output, PluginHelper};
use siphon_core::{async_trait, FieldValue, Message, PipelineError, Result};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LineFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct FileOutputConfig {
    pub path: String,
    pub format: LineFormat,
}

#[derive(Debug)]
pub struct FileOutput {
    config: FileOutputConfig,
}

impl FileOutput {
    /// # Errors
    ///
    /// Returns [`PipelineError::PluginInit`] when the section is invalid or
    /// no path is given.
    pub fn from_config(config: Option<&toml::Value>) -> Result<Self> {
        let cfg: FileOutputConfig = parse_config("FileOutput", config)?;
        if cfg.path.is_empty() {
            return Err(PipelineError::PluginInit {
                plugin: "FileOutput".to_string(),
                reason: "path is required".to_string(),
            });
        }
        Ok(Self { config: cfg })
    }

    fn format_line(&self, msg: &Message, line: &mut Vec<u8>) {
        match self.config.format {
            LineFormat::Text => {
                line.extend_from_slice(
                    format!(
                        "[{} {} {}] {}\n",
                        msg.timestamp_ns, msg.hostname, msg.msg_type, msg.payload
                    )
                    .as_bytes(),
                );
            }
            LineFormat::Json => {
                let mut object = serde_json::Map::new();
                object.insert("uuid".to_string(), msg.uuid.to_string().into());
                object.insert("timestamp".to_string(), msg.timestamp_ns.into());
                object.insert("type".to_string(), msg.msg_type.clone().into());
                object.insert("logger".to_string(), msg.logger.clone().into());
                object.insert("severity".to_string(), msg.severity.into());
                object.insert("payload".to_string(), msg.payload.clone().into());
                object.insert("hostname".to_string(), msg.hostname.clone().into());
                object.insert("pid".to_string(), msg.pid.into());
                for field in &msg.fields {
                    object.insert(field.name.clone(), field_to_json(&field.value));
                }
                line.extend_from_slice(serde_json::Value::Object(object).to_string().as_bytes());
                line.push(b'\n');
            }
        }
    }
}

fn field_to_json(value: &FieldValue) -> serde_json::Value {
    match value {
        FieldValue::Str(s) => s.clone().into(),
        FieldValue::Bytes(b) => String::from_utf8_lossy(b).into_owned().into(),
        FieldValue::Int(v) => (*v).into(),
        FieldValue::Double(v) => (*v).into(),
        FieldValue::Bool(v) => (*v).into(),
        FieldValue::StrArray(items) => items.clone().into(),
        FieldValue::IntArray(items) => items.clone().into(),
        FieldValue::DoubleArray(items) => items.clone().into(),
        FieldValue::BoolArray(items) => items.clone().into(),
    }
}

#[async_trait]
impl Output for FileOutput {
    async fn run(
        self: Box<Self>,
        ctx: &mut FoContext,
        _helper: Arc<dyn PluginHelper>,
    ) -> Result<()> {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.config.path)
            .await
            .map_err(|e| PipelineError::PluginInit {
                plugin: ctx.name().to_string(),
                reason: format!("can't open '{}': {e}", self.config.path),
            })?;

        let mut buffer: Vec<u8> = Vec::new();
        loop {
            match ctx.next().await {
                FoEvent::Pack(plc) => {
                    self.format_line(&plc.pack.message, &mut buffer);
                    drop(plc);
                    if !ctx.has_ticker() {
                        file.write_all(&buffer).await?;
                        file.flush().await?;
                        buffer.clear();
                    }
                }
                FoEvent::Tick => {
                    if !buffer.is_empty() {
                        file.write_all(&buffer).await?;
                        file.flush().await?;
                        buffer.clear();
                    }
                }
                FoEvent::Closed => {
                    if !buffer.is_empty() {
                        file.write_all(&buffer).await?;
                        file.flush().await?;
                    }
                    return Ok(());
                }
            }
        }
    }
}
