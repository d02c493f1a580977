//! Process-wide settings, loaded once at start-up.
//!
//! The engine receives an `Arc<Config>` at construction and never mutates it.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::task::ExecutorKind;
use crate::{alog_debug, Error, Result};

pub const DEFAULT_GLOBAL_TIMEOUT_MS: u64 = 600_000;
pub const DEFAULT_MAX_PARALLEL_BRANCHES: usize = 4;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Executor used when no routing rule applies.
    pub default_executor_kind: ExecutorKind,
    /// Hard timeout for tasks that declare none.
    pub global_timeout_ms: u64,
    /// Layer 2 findings block when set.
    pub quality_gate_strict_mode: bool,
    /// Upper bound on concurrently running nodes and organizer items.
    pub max_parallel_branches: usize,
    /// How long a run waits for a Layer 3 verdict before leaving it pending.
    pub human_review_wait_ms: u64,
    /// Command line of the external reasoning backend.
    pub agent_command: Option<String>,
    /// Root for run records and review requests.
    pub state_dir: Option<String>,
    /// Values resolvable through `config:<key>` input sources.
    pub values: BTreeMap<String, serde_json::Value>,
    pub features: BTreeMap<String, bool>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_executor_kind: ExecutorKind::Agent,
            global_timeout_ms: DEFAULT_GLOBAL_TIMEOUT_MS,
            quality_gate_strict_mode: false,
            max_parallel_branches: DEFAULT_MAX_PARALLEL_BRANCHES,
            human_review_wait_ms: 0,
            agent_command: None,
            state_dir: None,
            values: BTreeMap::new(),
            features: BTreeMap::new(),
        }
    }
}

impl Config {
    pub fn aios_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".aios"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::aios_dir()?.join("aios.toml"))
    }

    /// Load from the default location, falling back to defaults.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        alog_debug!("Config::load path={}", path.display());
        if !path.exists() {
            alog_debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        alog_debug!(
            "Config loaded: default_executor={}, timeout_ms={}, strict={}, parallel={}",
            config.default_executor_kind,
            config.global_timeout_ms,
            config.quality_gate_strict_mode,
            config.max_parallel_branches
        );
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn global_timeout(&self) -> Duration {
        Duration::from_millis(self.global_timeout_ms)
    }

    pub fn human_review_wait(&self) -> Duration {
        Duration::from_millis(self.human_review_wait_ms)
    }

    pub fn effective_agent_command(&self) -> &str {
        self.agent_command.as_deref().unwrap_or("claude")
    }

    /// Directory holding runs and reviews.
    pub fn state_dir(&self) -> Result<PathBuf> {
        match &self.state_dir {
            Some(dir) => Ok(expand_tilde(dir)),
            None => Self::aios_dir(),
        }
    }

    pub fn value(&self, key: &str) -> Option<&serde_json::Value> {
        self.values.get(key)
    }

    pub fn feature(&self, name: &str) -> bool {
        self.features.get(name).copied().unwrap_or(false)
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
