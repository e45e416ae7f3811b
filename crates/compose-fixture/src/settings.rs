use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ComposeError;

static APP_NAME: &str = "compose-fixture";
static ENV_PREFIX: &str = "COMPOSE_FIXTURE_";
static DEFAULT_SETTINGS: Lazy<FixtureSettings> = Lazy::new(FixtureSettings::default);

pub const DEFAULT_COMPOSE_FILE: &str = "docker-compose.yml";

/// Tunables shared by every builder. Loaded from defaults, an optional TOML file and
/// `COMPOSE_FIXTURE_*` environment variables, in that order of precedence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixtureSettings {
    #[serde(default = "default_compose_file")]
    pub default_compose_file: String,
    #[serde(default)]
    pub docker_binary: Option<PathBuf>,
    #[serde(default = "default_project_prefix")]
    pub project_prefix: String,
    #[serde(default = "default_check_timeout_ms")]
    pub default_check_timeout_ms: u64,
    #[serde(default)]
    pub poll: PollSettings,
}

impl Default for FixtureSettings {
    fn default() -> Self {
        Self {
            default_compose_file: default_compose_file(),
            docker_binary: None,
            project_prefix: default_project_prefix(),
            default_check_timeout_ms: default_check_timeout_ms(),
            poll: PollSettings::default(),
        }
    }
}

/// Polling cadence for readiness probes.
///
/// Custom checks back off linearly: the wait after attempt `n` is
/// `base_interval_ms - n * decrement_ms`, clamped at `floor_ms`. Port and process probes
/// poll at a fixed interval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollSettings {
    #[serde(default = "default_base_interval_ms")]
    pub base_interval_ms: u64,
    #[serde(default = "default_decrement_ms")]
    pub decrement_ms: u64,
    #[serde(default = "default_floor_ms")]
    pub floor_ms: u64,
    #[serde(default = "default_port_interval_ms")]
    pub port_interval_ms: u64,
    #[serde(default = "default_process_interval_ms")]
    pub process_interval_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            base_interval_ms: default_base_interval_ms(),
            decrement_ms: default_decrement_ms(),
            floor_ms: default_floor_ms(),
            port_interval_ms: default_port_interval_ms(),
            process_interval_ms: default_process_interval_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl PollSettings {
    /// Delay before the next custom-check attempt. Shrinks as attempts accumulate.
    pub fn check_delay(&self, attempt: u32) -> Duration {
        let shrunk = self
            .base_interval_ms
            .saturating_sub(u64::from(attempt).saturating_mul(self.decrement_ms));
        Duration::from_millis(shrunk.max(self.floor_ms))
    }

    pub fn port_interval(&self) -> Duration {
        Duration::from_millis(self.port_interval_ms)
    }

    pub fn process_interval(&self) -> Duration {
        Duration::from_millis(self.process_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl FixtureSettings {
    /// Load settings from the default config location (if present) and the environment.
    pub fn load() -> Result<Self, ComposeError> {
        Self::load_from(None)
    }

    pub fn load_from(explicit_path: Option<&Path>) -> Result<Self, ComposeError> {
        let mut figment = Figment::from(Serialized::defaults(DEFAULT_SETTINGS.clone()));

        if let Some(path) = explicit_path {
            figment = figment.merge(Toml::file(path));
        } else if let Some(path) = resolve_default_config_path() {
            debug!(path = %path.display(), "loading fixture settings");
            figment = figment.merge(Toml::file(path));
        }

        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        Ok(figment.extract()?)
    }

    pub fn default_check_timeout(&self) -> Duration {
        Duration::from_millis(self.default_check_timeout_ms)
    }
}

fn resolve_default_config_path() -> Option<PathBuf> {
    let dirs = ProjectDirs::from("dev", "compose-fixture", APP_NAME)?;
    let path = dirs.config_dir().join("config.toml");
    path.exists().then_some(path)
}

fn default_compose_file() -> String {
    DEFAULT_COMPOSE_FILE.to_string()
}

fn default_project_prefix() -> String {
    "fixture".to_string()
}

fn default_check_timeout_ms() -> u64 {
    60_000
}

fn default_base_interval_ms() -> u64 {
    1000
}

fn default_decrement_ms() -> u64 {
    100
}

fn default_floor_ms() -> u64 {
    100
}

fn default_port_interval_ms() -> u64 {
    250
}

fn default_process_interval_ms() -> u64 {
    500
}

fn default_connect_timeout_ms() -> u64 {
    1000
}
