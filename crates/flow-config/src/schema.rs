use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration, maps to `flow.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowConfig {
    pub orchestrator: OrchestratorConfig,
    pub registry: RegistryConfig,
    pub runtime: RuntimeConfig,
    pub state: StateConfig,
    pub memory: MemoryConfig,
    pub logging: LoggingConfig,
}

// ── Orchestrator ───────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Tenant used when a call does not name one.
    pub tenant_id: String,
    /// Timeout applied to every agent and tool dispatch, in milliseconds.
    pub default_timeout_ms: u64,
    /// Planner iterations before an agent run is stopped.
    pub default_max_iterations: u32,
    /// Capacity of the event bus channel.
    pub event_capacity: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            tenant_id: "default".into(),
            default_timeout_ms: 60_000,
            default_max_iterations: 10,
            event_capacity: 1024,
        }
    }
}

impl OrchestratorConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}

// ── Runtime registry ───────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// How often the background sweep runs.
    pub cleanup_interval_secs: u64,
    /// Threads idle longer than this are evicted by the sweep.
    pub idle_timeout_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            cleanup_interval_secs: 10 * 60,
            idle_timeout_secs: 30 * 60,
        }
    }
}

impl RegistryConfig {
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

// ── Execution runtime ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Versions kept by `cleanup()` (most recent by timestamp).
    pub max_versions: usize,
    /// Execution traces kept by `cleanup()` (most recently started).
    pub max_executions: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_versions: 1000,
            max_executions: 100,
        }
    }
}

// ── Per-invocation state ───────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    pub max_namespaces: usize,
    pub max_entries_per_namespace: usize,
    /// Cap on the shared thread-scoped state (planner history), one
    /// namespace per live thread.
    pub max_thread_namespaces: usize,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            max_namespaces: 50,
            max_entries_per_namespace: 1000,
            max_thread_namespaces: 10_000,
        }
    }
}

// ── Long-term memory ───────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// "memory" (process-local) or "sqlite".
    pub backend: String,
    /// Path to the SQLite database when `backend = "sqlite"`.
    pub db_path: PathBuf,
    /// Items kept by the in-memory backend before the oldest are dropped.
    pub max_items: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            backend: "memory".into(),
            db_path: PathBuf::from("flow-memory.db"),
            max_items: 10_000,
        }
    }
}

// ── Logging ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
    /// Output format: "pretty", "json", "compact".
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "pretty".into(),
        }
    }
}

// ── Validation ─────────────────────────────────────────────────

/// A single config validation issue.
#[derive(Debug)]
pub struct ConfigWarning {
    pub field: String,
    pub message: String,
    pub severity: WarningSeverity,
    pub hint: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarningSeverity {
    Error,
    Warning,
    Info,
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self.severity {
            WarningSeverity::Error => "error",
            WarningSeverity::Warning => "warning",
            WarningSeverity::Info => "info",
        };
        write!(f, "{} {}: {}", label, self.field, self.message)?;
        if let Some(ref h) = self.hint {
            write!(f, "\n   ↳ {}", h)?;
        }
        Ok(())
    }
}

impl FlowConfig {
    /// Validate the config and return a list of warnings/errors.
    /// Returns `Err` with all messages joined if any severity is Error.
    pub fn validate(&self) -> Result<Vec<ConfigWarning>, String> {
        let mut warnings = Vec::new();

        // ── Orchestrator ───
        if self.orchestrator.tenant_id.trim().is_empty() {
            warnings.push(ConfigWarning {
                field: "orchestrator.tenant_id".into(),
                message: "tenant id is empty".into(),
                severity: WarningSeverity::Error,
                hint: Some("Set to e.g. 'default'".into()),
            });
        }
        if self.orchestrator.default_timeout_ms == 0 {
            warnings.push(ConfigWarning {
                field: "orchestrator.default_timeout_ms".into(),
                message: "timeout is 0, every dispatch would fail immediately".into(),
                severity: WarningSeverity::Error,
                hint: Some("The usual value is 60000".into()),
            });
        }
        if self.orchestrator.default_max_iterations == 0 {
            warnings.push(ConfigWarning {
                field: "orchestrator.default_max_iterations".into(),
                message: "max iterations is 0, agents could never answer".into(),
                severity: WarningSeverity::Error,
                hint: None,
            });
        }

        // ── Registry ───
        if self.registry.cleanup_interval_secs == 0 {
            warnings.push(ConfigWarning {
                field: "registry.cleanup_interval_secs".into(),
                message: "cleanup interval is 0".into(),
                severity: WarningSeverity::Error,
                hint: Some("The usual value is 600 (10 minutes)".into()),
            });
        }
        if self.registry.idle_timeout_secs < self.registry.cleanup_interval_secs {
            warnings.push(ConfigWarning {
                field: "registry.idle_timeout_secs".into(),
                message: "idle timeout is shorter than the cleanup interval".into(),
                severity: WarningSeverity::Info,
                hint: Some("Threads will live up to one interval past their timeout".into()),
            });
        }

        // ── Runtime retention ───
        if self.runtime.max_versions == 0 || self.runtime.max_executions == 0 {
            warnings.push(ConfigWarning {
                field: "runtime".into(),
                message: "retention limits of 0 discard the whole context log".into(),
                severity: WarningSeverity::Warning,
                hint: None,
            });
        }

        // ── State caps ───
        if self.state.max_namespaces == 0
            || self.state.max_entries_per_namespace == 0
            || self.state.max_thread_namespaces == 0
        {
            warnings.push(ConfigWarning {
                field: "state".into(),
                message: "state caps of 0 reject every write".into(),
                severity: WarningSeverity::Error,
                hint: Some("Defaults are 50 namespaces × 1000 entries".into()),
            });
        }

        // ── Memory backend ───
        let valid_backends = ["memory", "sqlite"];
        if !valid_backends.contains(&self.memory.backend.as_str()) {
            warnings.push(ConfigWarning {
                field: "memory.backend".into(),
                message: format!("unknown memory backend '{}'", self.memory.backend),
                severity: WarningSeverity::Error,
                hint: Some(format!("Valid values: {}", valid_backends.join(", "))),
            });
        }

        // ── Logging format ───
        let valid_formats = ["pretty", "json", "compact"];
        if !valid_formats.contains(&self.logging.format.as_str()) {
            warnings.push(ConfigWarning {
                field: "logging.format".into(),
                message: format!("unknown log format '{}'", self.logging.format),
                severity: WarningSeverity::Warning,
                hint: Some(format!("Valid values: {}", valid_formats.join(", "))),
            });
        }

        // ── Logging level ───
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            warnings.push(ConfigWarning {
                field: "logging.level".into(),
                message: format!("unknown log level '{}'", self.logging.level),
                severity: WarningSeverity::Warning,
                hint: Some(format!("Valid values: {}", valid_levels.join(", "))),
            });
        }

        // Check for hard errors
        let errors: Vec<String> = warnings
            .iter()
            .filter(|w| w.severity == WarningSeverity::Error)
            .map(|w| format!("{}: {}", w.field, w.message))
            .collect();

        if !errors.is_empty() {
            return Err(format!("Configuration errors:\n  • {}", errors.join("\n  • ")));
        }

        Ok(warnings)
    }
}
