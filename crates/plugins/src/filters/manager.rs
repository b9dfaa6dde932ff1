// SPDX-FileCopyrightText: © 2025 Siphon Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! The manager filter: runtime loading and unloading of other filters,
//! driven by the records it receives.
//!
//! A `load` record carries a one-section config snippet in its `config`
//! field and the filter's script source as its payload. Both are persisted
//! into the manager's working directory (mode 0600) before the new filter
//! runner is installed, and restored from there when the manager starts. An
//! `unload` record names the filter to remove; its persisted files are
//! deleted with it.
//!
//! The managed section may name any registered filter type; the computed
//! script path is passed to it via the `script_filename` config key.

use regex::Regex;
use serde::Deserialize;
use siphon_core::plugin::{parse_config, Filter, FoContext, FoEvent, PluginHelper};
use siphon_core::{async_trait, Message, PipelineError, Result};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

fn default_max_filters() -> usize {
    8
}

#[derive(Debug, Deserialize)]
pub struct ManagerFilterConfig {
    #[serde(default = "default_max_filters")]
    pub max_filters: usize,
    pub working_directory: String,
}

impl Default for ManagerFilterConfig {
    fn default() -> Self {
        Self { max_filters: default_max_filters(), working_directory: String::new() }
    }
}

/// Per-section keys the manager itself reads from a managed filter section.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct ManagedSection {
    script_type: Option<String>,
}

const DEFAULT_SCRIPT_TYPE: &str = "lua";

#[derive(Debug)]
pub struct ManagerFilter {
    max_filters: usize,
    current_filters: usize,
    working_directory: PathBuf,
}

impl ManagerFilter {
    /// Builds the manager and prepares its working directory (mode 0700).
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::PluginInit`] when the section is invalid or
    /// the working directory cannot be created.
    pub fn from_config(config: Option<&toml::Value>) -> Result<Self> {
        let cfg: ManagerFilterConfig = parse_config("ManagerFilter", config)?;
        if cfg.working_directory.is_empty() {
            return Err(PipelineError::PluginInit {
                plugin: "ManagerFilter".to_string(),
                reason: "working_directory is required".to_string(),
            });
        }
        let dir = PathBuf::from(&cfg.working_directory);
        std::fs::create_dir_all(&dir).map_err(|e| PipelineError::PluginInit {
            plugin: "ManagerFilter".to_string(),
            reason: format!("can't create working directory '{}': {e}", dir.display()),
        })?;
        let _ = std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o700));
        Ok(Self { max_filters: cfg.max_filters, current_filters: 0, working_directory: dir })
    }

    async fn load_filter(
        &mut self,
        ctx: &FoContext,
        helper: &Arc<dyn PluginHelper>,
        msg: &Message,
    ) -> Result<()> {
        let snippet = msg
            .field_str("config")
            .ok_or_else(|| PipelineError::Flow("load is missing the 'config' field".to_string()))?;
        let sections: toml::Table = toml::from_str(snippet)
            .map_err(|e| PipelineError::Flow(format!("load failed: {e}")))?;
        if sections.len() != 1 {
            return Err(PipelineError::Flow(format!(
                "load config must contain exactly one filter section, found {}",
                sections.len()
            )));
        }
        let Some((target_name, section)) = sections.into_iter().next() else {
            unreachable!("section count was checked above");
        };
        let toml::Value::Table(mut section) = section else {
            return Err(PipelineError::Flow(format!("'{target_name}' is not a config table")));
        };

        let name = managed_name(ctx.name(), &target_name);
        if helper.filter(&name).is_some() {
            return Err(PipelineError::Flow(format!("load failed: {name} is already running")));
        }
        ctx.log_message(&format!("Loading: {name}"));

        let conf_path = self.working_directory.join(format!("{name}.toml"));
        write_private(&conf_path, snippet.as_bytes())?;

        let meta: ManagedSection = toml::Value::Table(section.clone())
            .try_into()
            .map_err(|e| PipelineError::Flow(format!("load failed: {e}")))?;
        let script_type = meta.script_type.unwrap_or_else(|| DEFAULT_SCRIPT_TYPE.to_string());
        let script_path = self.working_directory.join(format!("{name}.{script_type}"));
        if let Err(e) = write_private(&script_path, msg.payload.as_bytes()) {
            remove_persisted(&self.working_directory, &name);
            return Err(e);
        }

        section.insert(
            "script_filename".to_string(),
            toml::Value::String(script_path.display().to_string()),
        );
        if let Err(e) = helper.add_filter(&name, toml::Value::Table(section)).await {
            remove_persisted(&self.working_directory, &name);
            return Err(e);
        }
        self.current_filters += 1;
        Ok(())
    }

    async fn unload_filter(
        &mut self,
        ctx: &FoContext,
        helper: &Arc<dyn PluginHelper>,
        msg: &Message,
    ) {
        let Some(target_name) = msg.field_str("name") else {
            ctx.log_error(&PipelineError::Flow(
                "unload is missing the 'name' field".to_string(),
            ));
            return;
        };
        let name = managed_name(ctx.name(), target_name);
        if helper.remove_filter(&name).await {
            self.current_filters = self.current_filters.saturating_sub(1);
            remove_persisted(&self.working_directory, &name);
        }
    }

    /// Re-installs every filter persisted by a previous run of this manager.
    async fn restore(&mut self, ctx: &FoContext, helper: &Arc<dyn PluginHelper>) {
        let pattern = self
            .working_directory
            .join(format!("{}-*.toml", normalize(ctx.name())))
            .display()
            .to_string();
        let paths = match glob::glob(&pattern) {
            Ok(paths) => paths,
            Err(e) => {
                ctx.log_error(&PipelineError::Flow(format!("restore failed: {e}")));
                return;
            }
        };

        for path in paths.flatten() {
            if let Err(e) = self.restore_one(ctx, helper, &path).await {
                ctx.log_error(&e);
                if let Some(name) = path.file_stem().and_then(|s| s.to_str()) {
                    remove_persisted(&self.working_directory, name);
                }
            }
        }
    }

    async fn restore_one(
        &mut self,
        ctx: &FoContext,
        helper: &Arc<dyn PluginHelper>,
        path: &Path,
    ) -> Result<()> {
        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| PipelineError::Flow(format!("bad filter file '{}'", path.display())))?
            .to_string();
        let snippet = std::fs::read_to_string(path)?;
        let sections: toml::Table = toml::from_str(&snippet)
            .map_err(|e| PipelineError::Flow(format!("restore failed for '{name}': {e}")))?;
        if sections.len() != 1 {
            return Err(PipelineError::Flow(format!(
                "restore failed for '{name}': expected exactly one section"
            )));
        }
        let Some((_, section)) = sections.into_iter().next() else {
            unreachable!("section count was checked above");
        };
        let toml::Value::Table(mut section) = section else {
            return Err(PipelineError::Flow(format!("restore failed for '{name}': not a table")));
        };

        ctx.log_message(&format!("Loading: {name}"));
        let meta: ManagedSection = toml::Value::Table(section.clone())
            .try_into()
            .map_err(|e| PipelineError::Flow(format!("restore failed for '{name}': {e}")))?;
        let script_type = meta.script_type.unwrap_or_else(|| DEFAULT_SCRIPT_TYPE.to_string());
        let script_path = self.working_directory.join(format!("{name}.{script_type}"));
        section.insert(
            "script_filename".to_string(),
            toml::Value::String(script_path.display().to_string()),
        );

        helper.add_filter(&name, toml::Value::Table(section)).await?;
        self.current_filters += 1;
        Ok(())
    }
}

#[async_trait]
impl Filter for ManagerFilter {
    async fn run(
        mut self: Box<Self>,
        ctx: &mut FoContext,
        helper: Arc<dyn PluginHelper>,
    ) -> Result<()> {
        self.restore(ctx, &helper).await;

        loop {
            match ctx.next().await {
                FoEvent::Pack(plc) => {
                    let msg = &plc.pack.message;
                    match msg.field_str("action") {
                        Some("load") => {
                            if self.current_filters < self.max_filters {
                                if let Err(e) = self.load_filter(ctx, &helper, msg).await {
                                    ctx.log_error(&e);
                                }
                            } else {
                                ctx.log_error(&PipelineError::Flow(format!(
                                    "{} attempted to load more than {} filters",
                                    ctx.name(),
                                    self.max_filters
                                )));
                            }
                        }
                        Some("unload") => self.unload_filter(ctx, &helper, msg).await,
                        other => ctx.log_error(&PipelineError::Flow(format!(
                            "unknown manager action {other:?}"
                        ))),
                    }
                }
                FoEvent::Tick => {}
                FoEvent::Closed => return Ok(()),
            }
        }
    }
}

/// Replaces every non-word character so names are safe as file names.
fn normalize(name: &str) -> String {
    static NON_WORD: OnceLock<Regex> = OnceLock::new();
    let re = NON_WORD.get_or_init(|| match Regex::new(r"\W") {
        Ok(re) => re,
        Err(_) => unreachable!("static regex is valid"),
    });
    re.replace_all(name, "_").into_owned()
}

/// The full name of a managed filter: `<manager>-<target>`, both normalized.
fn managed_name(manager_name: &str, target_name: &str) -> String {
    format!("{}-{}", normalize(manager_name), normalize(target_name))
}

/// Writes a file readable and writable by the owner only.
fn write_private(path: &Path, contents: &[u8]) -> Result<()> {
    std::fs::write(path, contents)?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    Ok(())
}

/// Deletes every persisted `<name>.*` file in the working directory.
fn remove_persisted(dir: &Path, name: &str) {
    let pattern = dir.join(format!("{name}.*")).display().to_string();
    if let Ok(paths) = glob::glob(&pattern) {
        for path in paths.flatten() {
            if let Err(e) = std::fs::remove_file(&path) {
                tracing::warn!(path = %path.display(), error = %e, "couldn't remove filter file");
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn names_are_normalized() {
        assert_eq!(normalize("manager"), "manager");
        assert_eq!(normalize("my.manager/1"), "my_manager_1");
        assert_eq!(managed_name("mgr", "calc v2"), "mgr-calc_v2");
    }

    #[test]
    fn working_directory_is_required() {
        let err = ManagerFilter::from_config(None).unwrap_err();
        assert!(matches!(err, PipelineError::PluginInit { .. }));
    }

    #[test]
    fn working_directory_is_created_private() {
        let dir = tempfile::tempdir().unwrap();
        let workdir = dir.path().join("sandboxes");
        let section: toml::Value =
            toml::from_str(&format!("working_directory = {:?}", workdir.display().to_string()))
                .unwrap();
        let manager = ManagerFilter::from_config(Some(&section)).unwrap();
        assert_eq!(manager.max_filters, default_max_filters());
        let mode = std::fs::metadata(&workdir).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }
}
