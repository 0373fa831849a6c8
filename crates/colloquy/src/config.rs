//! Layered configuration: built-in defaults, then a TOML file, then
//! `COLLOQUY__SECTION__KEY` environment variables.

use anyhow::{Context, Result, anyhow};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use crate::upstream::{PermissionMode, ProcessUpstreamConfig};

pub const APP_NAME: &str = "colloquy";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub logging: LoggingConfig,
    pub audit: AuditConfig,
    pub upstream: UpstreamConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    pub enabled: bool,
    /// Directory for audit files. Defaults to `<state dir>/colloquy/audit`.
    pub dir: Option<String>,
    pub file_prefix: String,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: None,
            file_prefix: "colloquy-audit".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub command: String,
    pub leading_args: Vec<String>,
    pub args: Vec<String>,
    pub model: Option<String>,
    pub working_dir: Option<String>,
    pub permission_mode: PermissionMode,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            command: "claude".to_string(),
            leading_args: Vec::new(),
            args: Vec::new(),
            model: None,
            working_dir: None,
            permission_mode: PermissionMode::Default,
        }
    }
}

impl UpstreamConfig {
    pub fn to_process_config(&self) -> Result<ProcessUpstreamConfig> {
        let working_dir = self
            .working_dir
            .as_deref()
            .map(expand_str_path)
            .transpose()?;
        Ok(ProcessUpstreamConfig {
            command: expand_str_path(&self.command)?,
            leading_args: self.leading_args.clone(),
            args: self.args.clone(),
            model: self.model.clone(),
            working_dir,
        })
    }
}

impl AppConfig {
    /// Load from `path` (missing file is fine) and the environment.
    pub fn load(path: &Path) -> Result<Self> {
        Self::load_with_env_prefix(path, &env_prefix())
    }

    pub fn load_with_env_prefix(path: &Path, prefix: &str) -> Result<Self> {
        let built = Config::builder()
            .set_default("logging.level", "info")?
            .set_default("audit.enabled", true)?
            .set_default("audit.file_prefix", "colloquy-audit")?
            .set_default("upstream.command", "claude")?
            .add_source(
                File::from(path)
                    .format(FileFormat::Toml)
                    .required(false),
            )
            .add_source(Environment::with_prefix(prefix).separator("__"))
            .build()
            .with_context(|| format!("loading config from {}", path.display()))?;

        built
            .try_deserialize()
            .with_context(|| format!("parsing config from {}", path.display()))
    }

    /// Resolved audit directory.
    pub fn audit_dir(&self) -> Result<PathBuf> {
        match &self.audit.dir {
            Some(dir) => expand_str_path(dir),
            None => Ok(default_state_dir()?.join("audit")),
        }
    }
}

pub fn write_default_config(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating config directory {}", parent.display()))?;
    }

    let toml = toml::to_string_pretty(&AppConfig::default())
        .context("serializing default config to TOML")?;
    let body = format!(
        "# Configuration for {APP_NAME}\n# File: {}\n\n{toml}",
        path.display()
    );
    fs::write(path, body).with_context(|| format!("writing config file to {}", path.display()))
}

/// Config file location: an explicit override (a directory means
/// `<dir>/config.toml`) or the platform default.
pub fn config_file_path(override_path: Option<PathBuf>) -> Result<PathBuf> {
    match override_path {
        Some(path) => {
            let expanded = expand_path(path)?;
            if expanded.is_dir() {
                Ok(expanded.join("config.toml"))
            } else {
                Ok(expanded)
            }
        }
        None => Ok(default_config_dir()?.join("config.toml")),
    }
}

pub fn expand_path(path: PathBuf) -> Result<PathBuf> {
    if let Some(text) = path.to_str() {
        expand_str_path(text)
    } else {
        Ok(path)
    }
}

pub fn expand_str_path(text: &str) -> Result<PathBuf> {
    let expanded = shellexpand::full(text).context("expanding path")?;
    Ok(PathBuf::from(expanded.to_string()))
}

fn default_config_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }

    if let Some(dir) = dirs::config_dir() {
        return Ok(dir.join(APP_NAME));
    }

    dirs::home_dir()
        .map(|home| home.join(".config").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine configuration directory"))
}

fn default_state_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_STATE_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }

    if let Some(dir) = dirs::state_dir() {
        return Ok(dir.join(APP_NAME));
    }

    dirs::home_dir()
        .map(|home| home.join(".local").join("state").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine state directory"))
}

fn env_prefix() -> String {
    APP_NAME.to_ascii_uppercase()
}
