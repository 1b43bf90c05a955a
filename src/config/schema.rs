use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub engine: EngineConfig,
    /// Logical destination name to bus address
    #[serde(default)]
    pub destinations: HashMap<String, String>,
    #[serde(default)]
    pub strict_destinations: bool,
    #[serde(default)]
    pub context: ContextConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    #[serde(default = "default_control_destination")]
    pub control_destination: String,
    #[serde(default = "default_startup_dir")]
    pub startup_dir: PathBuf,
    #[serde(default = "default_plugin_dir")]
    pub plugin_dir: PathBuf,
    /// Where shadow copies of plugin libraries are opened from
    #[serde(default)]
    pub scratch_dir: Option<PathBuf>,
    #[serde(default = "default_true")]
    pub persisted: bool,
    #[serde(default = "default_true")]
    pub validated: bool,
    #[serde(default = "default_ready_timeout")]
    pub ready_timeout_ms: u64,
    #[serde(default = "default_ready_poll_interval")]
    pub ready_poll_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextConfig {
    #[serde(default = "default_app_name")]
    pub app_name: String,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub correlation_id: Option<String>,
}

fn default_control_destination() -> String {
    "pipeline.control".to_string()
}

fn default_startup_dir() -> PathBuf {
    PathBuf::from("startup")
}

fn default_plugin_dir() -> PathBuf {
    PathBuf::from("plugins")
}

fn default_true() -> bool {
    true
}

fn default_ready_timeout() -> u64 {
    5000
}

fn default_ready_poll_interval() -> u64 {
    100
}

fn default_app_name() -> String {
    "Pipeline Plugin".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            control_destination: default_control_destination(),
            startup_dir: default_startup_dir(),
            plugin_dir: default_plugin_dir(),
            scratch_dir: None,
            persisted: true,
            validated: true,
            ready_timeout_ms: default_ready_timeout(),
            ready_poll_interval_ms: default_ready_poll_interval(),
        }
    }
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            app_name: default_app_name(),
            hostname: None,
            correlation_id: None,
        }
    }
}

impl EngineConfig {
    /// Engine rooted at `base`, mostly useful for tests and embedding.
    pub fn rooted_at(base: &Path) -> Self {
        Self {
            startup_dir: base.join("startup"),
            plugin_dir: base.join("plugins"),
            scratch_dir: Some(base.join("scratch")),
            ..Self::default()
        }
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    pub fn ready_poll_interval(&self) -> Duration {
        Duration::from_millis(self.ready_poll_interval_ms)
    }

    /// Shadow library directory; defaults to a subdirectory of the system temp dir.
    pub fn scratch_dir(&self) -> PathBuf {
        self.scratch_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("plugin-pipeline"))
    }
}

impl Config {
    pub fn with_engine(engine: EngineConfig) -> Self {
        Self {
            engine,
            ..Self::default()
        }
    }
}
