//! Broker configuration: TOML file + CLI overrides.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use termbroker_core::{BrokerError, BrokerResult};
use tracing::info;

use crate::session::title::TitleMode;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub broker: BrokerSection,
    #[serde(default)]
    pub kill: KillSection,
    #[serde(default)]
    pub title: TitleSection,
    #[serde(default)]
    pub monitor: MonitorSection,
}

/// `[broker]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct BrokerSection {
    #[serde(default = "default_control_dir")]
    pub control_dir: String,
    #[serde(default = "default_cols")]
    pub cols: u16,
    #[serde(default = "default_rows")]
    pub rows: u16,
    #[serde(default)]
    pub title_mode: TitleMode,
    #[serde(default = "default_scrollback_bytes")]
    pub scrollback_bytes: usize,
}

impl Default for BrokerSection {
    fn default() -> Self {
        Self {
            control_dir: default_control_dir(),
            cols: default_cols(),
            rows: default_rows(),
            title_mode: TitleMode::default(),
            scrollback_bytes: default_scrollback_bytes(),
        }
    }
}

/// `[kill]` section: escalation timing.
#[derive(Debug, Clone, Deserialize)]
pub struct KillSection {
    #[serde(default = "default_grace_ms")]
    pub grace_ms: u64,
    #[serde(default = "default_poll_ms")]
    pub poll_ms: u64,
}

impl Default for KillSection {
    fn default() -> Self {
        Self {
            grace_ms: default_grace_ms(),
            poll_ms: default_poll_ms(),
        }
    }
}

/// `[title]` section: injection debounce.
#[derive(Debug, Clone, Deserialize)]
pub struct TitleSection {
    #[serde(default = "default_quiet_ms")]
    pub quiet_ms: u64,
    #[serde(default = "default_injection_timeout_ms")]
    pub injection_timeout_ms: u64,
}

impl Default for TitleSection {
    fn default() -> Self {
        Self {
            quiet_ms: default_quiet_ms(),
            injection_timeout_ms: default_injection_timeout_ms(),
        }
    }
}

/// `[monitor]` section: background polling.
#[derive(Debug, Clone, Deserialize)]
pub struct MonitorSection {
    #[serde(default = "default_foreground_poll_ms")]
    pub foreground_poll_ms: u64,
    #[serde(default = "default_zombie_interval_secs")]
    pub zombie_interval_secs: u64,
}

impl Default for MonitorSection {
    fn default() -> Self {
        Self {
            foreground_poll_ms: default_foreground_poll_ms(),
            zombie_interval_secs: default_zombie_interval_secs(),
        }
    }
}

fn default_control_dir() -> String {
    "~/.termbroker/control".to_string()
}
fn default_cols() -> u16 {
    80
}
fn default_rows() -> u16 {
    24
}
fn default_scrollback_bytes() -> usize {
    256 * 1024
}
fn default_grace_ms() -> u64 {
    3000
}
fn default_poll_ms() -> u64 {
    500
}
fn default_quiet_ms() -> u64 {
    100
}
fn default_injection_timeout_ms() -> u64 {
    5000
}
fn default_foreground_poll_ms() -> u64 {
    1000
}
fn default_zombie_interval_secs() -> u64 {
    30
}

/// Resolved configuration (paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub control_dir: PathBuf,
    pub default_cols: u16,
    pub default_rows: u16,
    pub title_mode: TitleMode,
    pub scrollback_bytes: usize,
    pub kill_grace: Duration,
    pub kill_poll: Duration,
    pub title_quiet: Duration,
    pub title_injection_timeout: Duration,
    pub foreground_poll: Duration,
    pub zombie_interval: Duration,
    /// Version stamped into every session and the `.version` marker.
    pub version: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self::from_file(ConfigFile::default(), None)
    }
}

impl BrokerConfig {
    /// Load config from a TOML file (missing file = defaults), then apply
    /// the control-dir override.
    pub fn load(config_path: Option<&Path>, cli_control_dir: Option<&str>) -> BrokerResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded).map_err(|e| {
                        BrokerError::persistence(format!(
                            "read config {}: {e}",
                            expanded.display()
                        ))
                    })?;
                    parse(&content)?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };
        Ok(Self::from_file(file_config, cli_control_dir))
    }

    fn from_file(file: ConfigFile, cli_control_dir: Option<&str>) -> Self {
        let control_dir = cli_control_dir
            .map(|s| s.to_string())
            .unwrap_or(file.broker.control_dir);
        Self {
            control_dir: expand_tilde_str(&control_dir),
            default_cols: file.broker.cols,
            default_rows: file.broker.rows,
            title_mode: file.broker.title_mode,
            scrollback_bytes: file.broker.scrollback_bytes,
            kill_grace: Duration::from_millis(file.kill.grace_ms),
            kill_poll: Duration::from_millis(file.kill.poll_ms),
            title_quiet: Duration::from_millis(file.title.quiet_ms),
            title_injection_timeout: Duration::from_millis(file.title.injection_timeout_ms),
            foreground_poll: Duration::from_millis(file.monitor.foreground_poll_ms),
            zombie_interval: Duration::from_secs(file.monitor.zombie_interval_secs),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// Config rooted at an explicit control directory, otherwise default.
    pub fn with_control_dir(control_dir: impl Into<PathBuf>) -> Self {
        Self {
            control_dir: control_dir.into(),
            ..Self::default()
        }
    }
}

fn parse(content: &str) -> BrokerResult<ConfigFile> {
    toml::from_str::<ConfigFile>(content)
        .map_err(|e| BrokerError::validation(format!("config parse error: {e}")))
}

/// Expand `~` to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}
