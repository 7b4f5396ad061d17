#[cfg(test)]
mod tests {
    use flow_config::ConfigLoader;
    use flow_config::schema::*;
    use std::io::Write;

    // ── Default tests ──────────────────────────────────────────

    #[test]
    fn test_orchestrator_defaults() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.tenant_id, "default");
        assert_eq!(config.default_timeout_ms, 60_000);
        assert_eq!(config.default_max_iterations, 10);
        assert_eq!(config.default_timeout(), std::time::Duration::from_secs(60));
    }

    #[test]
    fn test_registry_defaults() {
        let config = RegistryConfig::default();
        assert_eq!(config.cleanup_interval(), std::time::Duration::from_secs(600));
        assert_eq!(config.idle_timeout(), std::time::Duration::from_secs(1800));
    }

    #[test]
    fn test_retention_and_state_defaults() {
        let config = FlowConfig::default();
        assert_eq!(config.runtime.max_versions, 1000);
        assert_eq!(config.runtime.max_executions, 100);
        assert_eq!(config.state.max_namespaces, 50);
        assert_eq!(config.state.max_thread_namespaces, 10_000);
        assert_eq!(config.state.max_entries_per_namespace, 1000);
        assert_eq!(config.memory.backend, "memory");
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.logging.format, "pretty");
    }

    #[test]
    fn test_default_config_validates_cleanly() {
        let warnings = FlowConfig::default().validate().unwrap();
        assert!(warnings.is_empty(), "unexpected warnings: {:?}", warnings);
    }

    // ── TOML parsing ───────────────────────────────────────────

    #[test]
    fn test_partial_toml_applies_defaults() {
        let raw = r#"
[orchestrator]
tenant_id = "acme"

[runtime]
max_versions = 50
"#;
        let config: FlowConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.orchestrator.tenant_id, "acme");
        assert_eq!(config.orchestrator.default_timeout_ms, 60_000);
        assert_eq!(config.runtime.max_versions, 50);
        assert_eq!(config.runtime.max_executions, 100);
        assert_eq!(config.registry.idle_timeout_secs, 1800);
    }

    #[test]
    fn test_config_toml_roundtrip() {
        let config = FlowConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let restored: FlowConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(restored.orchestrator.tenant_id, config.orchestrator.tenant_id);
        assert_eq!(restored.memory.db_path, config.memory.db_path);
    }

    // ── Validation ─────────────────────────────────────────────

    #[test]
    fn test_zero_timeout_is_an_error() {
        let mut config = FlowConfig::default();
        config.orchestrator.default_timeout_ms = 0;
        let err = config.validate().unwrap_err();
        assert!(err.contains("orchestrator.default_timeout_ms"));
    }

    #[test]
    fn test_unknown_backend_is_an_error() {
        let mut config = FlowConfig::default();
        config.memory.backend = "redis".into();
        let err = config.validate().unwrap_err();
        assert!(err.contains("memory.backend"));
    }

    #[test]
    fn test_unknown_log_format_is_a_warning() {
        let mut config = FlowConfig::default();
        config.logging.format = "xml".into();
        let warnings = config.validate().unwrap();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].severity, WarningSeverity::Warning);
        assert!(warnings[0].to_string().contains("logging.format"));
    }

    #[test]
    fn test_short_idle_timeout_is_info() {
        let mut config = FlowConfig::default();
        config.registry.idle_timeout_secs = 60;
        let warnings = config.validate().unwrap();
        assert!(warnings.iter().any(|w| w.severity == WarningSeverity::Info));
    }

    // ── Loader ─────────────────────────────────────────────────

    #[test]
    fn test_config_loader_with_file() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("flow.toml");
        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(
            file,
            r#"
[registry]
cleanup_interval_secs = 30
idle_timeout_secs = 120

[memory]
backend = "sqlite"
db_path = "/tmp/flow-test.db"
"#
        )
        .unwrap();

        let loader = ConfigLoader::load(Some(config_path.as_path())).unwrap();
        let config = loader.get();
        assert_eq!(config.registry.cleanup_interval_secs, 30);
        assert_eq!(config.registry.idle_timeout_secs, 120);
        assert_eq!(config.memory.backend, "sqlite");
        assert_eq!(loader.path(), config_path.as_path());
    }

    #[test]
    fn test_config_loader_missing_file_uses_defaults() {
        let loader =
            ConfigLoader::load(Some(std::path::Path::new("/nonexistent/flow.toml"))).unwrap();
        assert_eq!(loader.get().runtime.max_versions, 1000);
    }

    #[test]
    fn test_config_loader_rejects_invalid_file() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("flow.toml");
        std::fs::write(&config_path, "[state]\nmax_namespaces = 0\n").unwrap();

        let err = ConfigLoader::load(Some(config_path.as_path())).err().unwrap();
        assert_eq!(err.code(), "CONFIG_ERROR");
    }

    #[test]
    fn test_config_loader_reload() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("flow.toml");
        std::fs::write(&config_path, "[runtime]\nmax_executions = 5\n").unwrap();

        let loader = ConfigLoader::load(Some(config_path.as_path())).unwrap();
        let shared = loader.shared();
        assert_eq!(loader.get().runtime.max_executions, 5);

        std::fs::write(&config_path, "[runtime]\nmax_executions = 7\n").unwrap();
        loader.reload().unwrap();
        assert_eq!(loader.get().runtime.max_executions, 7);
        assert_eq!(shared.read().runtime.max_executions, 7);
    }

    #[test]
    fn test_reload_keeps_previous_config_on_error() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("flow.toml");
        std::fs::write(&config_path, "[runtime]\nmax_executions = 5\n").unwrap();
        let loader = ConfigLoader::load(Some(config_path.as_path())).unwrap();

        std::fs::write(&config_path, "[runtime\nbroken").unwrap();
        assert!(loader.reload().is_err());
        assert_eq!(loader.get().runtime.max_executions, 5);
    }

    #[test]
    fn test_resolve_path_prefers_explicit() {
        let explicit = std::path::Path::new("/etc/kflow/flow.toml");
        assert_eq!(ConfigLoader::resolve_path(Some(explicit)), explicit);
    }
}
