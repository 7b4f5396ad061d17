use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use flow_core::{FlowError, Result};

use crate::schema::FlowConfig;

/// Loads and reloads the flow configuration.
pub struct ConfigLoader {
    config: Arc<RwLock<FlowConfig>>,
    config_path: PathBuf,
}

impl ConfigLoader {
    /// Resolve the config path: explicit path > KFLOW_CONFIG env > ~/.kodus-flow/flow.toml
    pub fn resolve_path(explicit: Option<&Path>) -> PathBuf {
        if let Some(p) = explicit {
            return p.to_path_buf();
        }
        if let Ok(p) = std::env::var("KFLOW_CONFIG") {
            return PathBuf::from(p);
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".kodus-flow")
            .join("flow.toml")
    }

    /// Load the config from disk, falling back to defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = Self::resolve_path(path);
        let config = if config_path.exists() {
            info!(?config_path, "loading configuration");
            Self::parse_file(&config_path)?
        } else {
            warn!(?config_path, "config file not found, using defaults");
            FlowConfig::default()
        };

        let config = Self::apply_env_overrides(config);
        Self::check(&config)?;

        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            config_path,
        })
    }

    /// Build a loader around an in-memory config (no file backing).
    pub fn from_config(config: FlowConfig) -> Result<Self> {
        Self::check(&config)?;
        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            config_path: PathBuf::new(),
        })
    }

    /// Get a read snapshot of the current config.
    pub fn get(&self) -> FlowConfig {
        self.config.read().clone()
    }

    /// Get a shared reference for subscription.
    pub fn shared(&self) -> Arc<RwLock<FlowConfig>> {
        Arc::clone(&self.config)
    }

    pub fn path(&self) -> &Path {
        &self.config_path
    }

    /// Reload the config from disk. The current config is kept on any error.
    pub fn reload(&self) -> Result<()> {
        if !self.config_path.exists() {
            return Err(FlowError::Config(format!(
                "config file not found: {}",
                self.config_path.display()
            )));
        }
        let new_config = Self::apply_env_overrides(Self::parse_file(&self.config_path)?);
        Self::check(&new_config)?;
        *self.config.write() = new_config;
        info!("configuration reloaded");
        Ok(())
    }

    fn parse_file(path: &Path) -> Result<FlowConfig> {
        let raw = std::fs::read_to_string(path)?;
        toml::from_str::<FlowConfig>(&raw).map_err(|e| {
            FlowError::Config(format!("failed to parse {}: {}", path.display(), e))
        })
    }

    /// Log warnings, fail on errors.
    fn check(config: &FlowConfig) -> Result<()> {
        match config.validate() {
            Ok(warnings) => {
                for w in &warnings {
                    warn!("{}", w);
                }
                Ok(())
            }
            Err(e) => Err(FlowError::Config(e)),
        }
    }

    /// Apply env var overrides (KFLOW_TENANT_ID, KFLOW_DEFAULT_TIMEOUT_MS, etc.)
    fn apply_env_overrides(mut config: FlowConfig) -> FlowConfig {
        if let Ok(v) = std::env::var("KFLOW_TENANT_ID") {
            config.orchestrator.tenant_id = v;
        }
        if let Ok(v) = std::env::var("KFLOW_DEFAULT_TIMEOUT_MS") {
            if let Ok(ms) = v.parse::<u64>() {
                config.orchestrator.default_timeout_ms = ms;
            }
        }
        if let Ok(v) = std::env::var("KFLOW_MEMORY_BACKEND") {
            config.memory.backend = v;
        }
        if let Ok(v) = std::env::var("KFLOW_MEMORY_DB") {
            config.memory.db_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("KFLOW_LOG_LEVEL") {
            config.logging.level = v;
        }
        config
    }
}
