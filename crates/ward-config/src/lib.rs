#![warn(missing_docs)]

//! # ward-config
//!
//! Configuration loading for the scriptward execution engine.
//!
//! Supports TOML configuration files with environment variable expansion.
//! Every field is optional; anything left out falls back to the engine's
//! built-in defaults.
//!
//! ## Example
//!
//! ```toml
//! [engine]
//! max_concurrent = 4
//! timeout_secs = 300
//! max_memory_mb = 512
//! runner_mode = "hosted"
//!
//! [interpreter]
//! program = "pwsh"
//! args = ["-NoProfile", "-NonInteractive", "-File"]
//!
//! [recorder]
//! backend = "jsonl"
//! path = "${SCRIPTWARD_HOME}/results.jsonl"
//!
//! [[risk.rules]]
//! id = "no-registry-delete"
//! pattern = 'Remove-ItemProperty\s+.*HKLM:'
//! severity = "high"
//! description = "deletes machine-wide registry values"
//! ```

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

/// Errors from config parsing.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse TOML.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Invalid configuration value.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level scriptward configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WardConfig {
    /// Execution limits and runner selection.
    #[serde(default)]
    pub engine: EngineOverrides,

    /// How the script interpreter is launched.
    #[serde(default)]
    pub interpreter: InterpreterOverrides,

    /// Host pool sizing (hosted runner mode only).
    #[serde(default)]
    pub pool: PoolOverrides,

    /// Where terminal results and metrics go.
    #[serde(default)]
    pub recorder: RecorderConfig,

    /// Script catalog location.
    #[serde(default)]
    pub catalog: CatalogConfig,

    /// Risk analyzer rules.
    #[serde(default)]
    pub risk: RiskConfig,
}

/// Engine limit overrides.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EngineOverrides {
    /// Maximum concurrently running executions.
    #[serde(default)]
    pub max_concurrent: Option<usize>,

    /// Wall-clock limit per execution, in seconds.
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    /// Memory ceiling per execution, in megabytes.
    #[serde(default)]
    pub max_memory_mb: Option<u64>,

    /// How often the interpreter's memory is sampled, in milliseconds.
    #[serde(default)]
    pub memory_sample_interval_ms: Option<u64>,

    /// Grace period between a termination request and a forced kill.
    #[serde(default)]
    pub cancel_grace_ms: Option<u64>,

    /// Output retained per execution before truncation, in bytes.
    #[serde(default)]
    pub max_output_bytes: Option<usize>,

    /// Largest accepted script, in bytes.
    #[serde(default)]
    pub max_script_bytes: Option<usize>,

    /// Runner implementation: "direct" (default) or "hosted".
    #[serde(default)]
    pub runner_mode: Option<String>,

    /// How long terminal executions stay queryable, in seconds.
    #[serde(default)]
    pub retain_completed_secs: Option<u64>,

    /// Upper bound on retained terminal executions.
    #[serde(default)]
    pub max_retained: Option<usize>,

    /// Per-execution event buffer for subscribers.
    #[serde(default)]
    pub relay_capacity: Option<usize>,
}

/// Interpreter launch overrides.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InterpreterOverrides {
    /// Interpreter executable.
    #[serde(default)]
    pub program: Option<String>,

    /// Arguments placed before the script path.
    #[serde(default)]
    pub args: Option<Vec<String>>,

    /// File extension for the temporary script file, without the dot.
    #[serde(default)]
    pub script_extension: Option<String>,

    /// Parameter binding: "named" (default) or "environment".
    #[serde(default)]
    pub parameter_binding: Option<String>,

    /// Variable prefix for the "environment" binding.
    #[serde(default)]
    pub env_prefix: Option<String>,

    /// Explicit path to the `ward-host` binary.
    #[serde(default)]
    pub host_binary: Option<PathBuf>,
}

/// Host pool overrides.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PoolOverrides {
    /// Hosts kept warm.
    #[serde(default)]
    pub min_hosts: Option<usize>,

    /// Hard cap on live hosts.
    #[serde(default)]
    pub max_hosts: Option<usize>,

    /// Idle time before a host is reaped, in seconds.
    #[serde(default)]
    pub max_idle_secs: Option<u64>,

    /// Runs before a host is recycled.
    #[serde(default)]
    pub max_uses: Option<u32>,

    /// Ping/pong timeout when reusing an idle host, in milliseconds.
    #[serde(default)]
    pub health_check_timeout_ms: Option<u64>,
}

/// Recorder backend selection.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RecorderConfig {
    /// "noop", "tracing" (default) or "jsonl".
    #[serde(default)]
    pub backend: Option<String>,

    /// Output file for the "jsonl" backend.
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Attempts per record before giving up.
    #[serde(default)]
    pub retry_attempts: Option<u32>,
}

/// Script catalog location.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CatalogConfig {
    /// Directory of scripts; the file stem is the script id.
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

/// Risk analyzer configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RiskConfig {
    /// Drop the built-in denylist and use only `rules`.
    #[serde(default)]
    pub replace_defaults: bool,

    /// Additional rules.
    #[serde(default)]
    pub rules: Vec<RiskRuleConfig>,
}

/// One configured denylist rule.
#[derive(Debug, Clone, Deserialize)]
pub struct RiskRuleConfig {
    /// Stable rule identifier reported with findings.
    pub id: String,

    /// Case-insensitive regular expression matched per line.
    pub pattern: String,

    /// "low", "medium", "high" or "critical".
    pub severity: String,

    /// Human readable explanation.
    #[serde(default)]
    pub description: Option<String>,
}

const RUNNER_MODES: &[&str] = &["direct", "hosted"];
const BINDINGS: &[&str] = &["named", "environment"];
const SEVERITIES: &[&str] = &["low", "medium", "high", "critical"];
const RECORDERS: &[&str] = &["noop", "tracing", "jsonl"];

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV_VAR: &str = "SCRIPTWARD_CONFIG";

/// Config file looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "scriptward.toml";

impl WardConfig {
    /// Parse a config from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let config: WardConfig = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse a config from a TOML string, expanding `${ENV_VAR}` references.
    pub fn from_toml_with_env(toml_str: &str) -> Result<Self, ConfigError> {
        let expanded = expand_env_vars(toml_str);
        Self::from_toml(&expanded)
    }

    /// Load config from a file path, expanding environment variables.
    pub fn from_file_with_env(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_with_env(&content)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let engine = &self.engine;
        if engine.max_concurrent == Some(0) {
            return Err(invalid("engine.max_concurrent must be at least 1"));
        }
        if engine.timeout_secs == Some(0) {
            return Err(invalid("engine.timeout_secs must be at least 1"));
        }
        if engine.max_memory_mb == Some(0) {
            return Err(invalid("engine.max_memory_mb must be at least 1"));
        }
        if engine.memory_sample_interval_ms == Some(0) {
            return Err(invalid("engine.memory_sample_interval_ms must be at least 1"));
        }
        if engine.relay_capacity == Some(0) {
            return Err(invalid("engine.relay_capacity must be at least 1"));
        }
        check_choice("engine.runner_mode", engine.runner_mode.as_deref(), RUNNER_MODES)?;
        check_choice(
            "interpreter.parameter_binding",
            self.interpreter.parameter_binding.as_deref(),
            BINDINGS,
        )?;
        if let Some(program) = &self.interpreter.program {
            if program.trim().is_empty() {
                return Err(invalid("interpreter.program must not be empty"));
            }
        }

        if let (Some(min), Some(max)) = (self.pool.min_hosts, self.pool.max_hosts) {
            if min > max {
                return Err(invalid(format!(
                    "pool.min_hosts ({min}) exceeds pool.max_hosts ({max})"
                )));
            }
        }
        if self.pool.max_hosts == Some(0) {
            return Err(invalid("pool.max_hosts must be at least 1"));
        }
        if let (Some(hosts), Some(concurrent)) = (self.pool.max_hosts, engine.max_concurrent) {
            if hosts < concurrent {
                return Err(invalid(format!(
                    "pool.max_hosts ({hosts}) is below engine.max_concurrent ({concurrent}), \
                     admitted executions would fail for lack of a host"
                )));
            }
        }

        check_choice("recorder.backend", self.recorder.backend.as_deref(), RECORDERS)?;
        if self.recorder.backend.as_deref() == Some("jsonl") && self.recorder.path.is_none() {
            return Err(invalid("recorder.backend 'jsonl' requires 'path'"));
        }

        for rule in &self.risk.rules {
            if rule.pattern.trim().is_empty() {
                return Err(invalid(format!("risk rule '{}': empty pattern", rule.id)));
            }
            check_choice(
                &format!("risk rule '{}': severity", rule.id),
                Some(rule.severity.as_str()),
                SEVERITIES,
            )?;
            if let Err(e) = regex::RegexBuilder::new(&rule.pattern)
                .case_insensitive(true)
                .build()
            {
                return Err(invalid(format!(
                    "risk rule '{}': invalid pattern: {e}",
                    rule.id
                )));
            }
        }
        Ok(())
    }
}

/// Locate the config file to load.
///
/// An explicit path wins, then `SCRIPTWARD_CONFIG`, then `./scriptward.toml`
/// if it exists. `None` means run on defaults.
pub fn discover_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        if !path.is_empty() {
            return Some(PathBuf::from(path));
        }
    }
    let local = PathBuf::from(DEFAULT_CONFIG_FILE);
    local.exists().then_some(local)
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(msg.into())
}

fn check_choice(field: &str, value: Option<&str>, allowed: &[&str]) -> Result<(), ConfigError> {
    match value {
        Some(v) if !allowed.contains(&v) => Err(invalid(format!(
            "{field}: unsupported value '{v}', supported: {}",
            allowed.join(", ")
        ))),
        _ => Ok(()),
    }
}

/// Expand `${ENV_VAR}` patterns in a string using environment variables.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        result.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let name = &after[..end];
                match std::env::var(name) {
                    Ok(value) => result.push_str(&value),
                    // unresolved placeholders stay as written
                    Err(_) => {
                        result.push_str("${");
                        result.push_str(name);
                        result.push('}');
                    }
                }
                rest = &after[end + 1..];
            }
            None => {
                result.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    result.push_str(rest);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn config_empty_is_valid() {
        let config = WardConfig::from_toml("").unwrap();
        assert!(config.engine.max_concurrent.is_none());
        assert!(config.engine.runner_mode.is_none());
        assert!(config.risk.rules.is_empty());
        assert!(!config.risk.replace_defaults);
    }

    #[test]
    fn config_parses_engine_overrides() {
        let toml = r#"
            [engine]
            max_concurrent = 4
            timeout_secs = 120
            max_memory_mb = 256
            memory_sample_interval_ms = 100
            cancel_grace_ms = 500
            runner_mode = "hosted"
            retain_completed_secs = 60
            max_retained = 10
        "#;

        let config = WardConfig::from_toml(toml).unwrap();
        assert_eq!(config.engine.max_concurrent, Some(4));
        assert_eq!(config.engine.timeout_secs, Some(120));
        assert_eq!(config.engine.max_memory_mb, Some(256));
        assert_eq!(config.engine.memory_sample_interval_ms, Some(100));
        assert_eq!(config.engine.cancel_grace_ms, Some(500));
        assert_eq!(config.engine.runner_mode.as_deref(), Some("hosted"));
        assert_eq!(config.engine.retain_completed_secs, Some(60));
        assert_eq!(config.engine.max_retained, Some(10));
    }

    #[test]
    fn config_parses_interpreter_and_pool() {
        let toml = r#"
            [interpreter]
            program = "/bin/sh"
            args = []
            script_extension = "sh"
            parameter_binding = "environment"
            env_prefix = "WARD_"

            [pool]
            min_hosts = 1
            max_hosts = 3
            max_uses = 20
        "#;

        let config = WardConfig::from_toml(toml).unwrap();
        assert_eq!(config.interpreter.program.as_deref(), Some("/bin/sh"));
        assert_eq!(config.interpreter.args.as_deref(), Some(&[][..]));
        assert_eq!(config.interpreter.script_extension.as_deref(), Some("sh"));
        assert_eq!(
            config.interpreter.parameter_binding.as_deref(),
            Some("environment")
        );
        assert_eq!(config.pool.min_hosts, Some(1));
        assert_eq!(config.pool.max_hosts, Some(3));
        assert_eq!(config.pool.max_uses, Some(20));
    }

    #[test]
    fn config_parses_risk_rules() {
        let toml = r#"
            [risk]
            replace_defaults = true

            [[risk.rules]]
            id = "no-shutdown"
            pattern = 'shutdown\s+-h'
            severity = "critical"
            description = "powers off the host"

            [[risk.rules]]
            id = "curl"
            pattern = "curl"
            severity = "medium"
        "#;

        let config = WardConfig::from_toml(toml).unwrap();
        assert!(config.risk.replace_defaults);
        assert_eq!(config.risk.rules.len(), 2);
        assert_eq!(config.risk.rules[0].id, "no-shutdown");
        assert_eq!(config.risk.rules[0].severity, "critical");
        assert!(config.risk.rules[1].description.is_none());
    }

    #[test]
    fn config_rejects_zero_concurrency() {
        let err = WardConfig::from_toml("[engine]\nmax_concurrent = 0").unwrap_err();
        assert!(err.to_string().contains("max_concurrent"));
    }

    #[test]
    fn config_rejects_zero_timeout() {
        let err = WardConfig::from_toml("[engine]\ntimeout_secs = 0").unwrap_err();
        assert!(err.to_string().contains("timeout_secs"));
    }

    #[test]
    fn config_rejects_unknown_runner_mode() {
        let err = WardConfig::from_toml("[engine]\nrunner_mode = \"in_process\"").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("in_process"), "should name the value: {msg}");
        assert!(msg.contains("hosted"), "should list supported modes: {msg}");
    }

    #[test]
    fn config_rejects_unknown_binding() {
        let err =
            WardConfig::from_toml("[interpreter]\nparameter_binding = \"stdin\"").unwrap_err();
        assert!(err.to_string().contains("parameter_binding"));
    }

    #[test]
    fn config_rejects_bad_severity() {
        let toml = r#"
            [[risk.rules]]
            id = "x"
            pattern = "x"
            severity = "severe"
        "#;
        let err = WardConfig::from_toml(toml).unwrap_err();
        assert!(err.to_string().contains("severe"));
    }

    #[test]
    fn config_rejects_invalid_regex() {
        let toml = r#"
            [[risk.rules]]
            id = "broken"
            pattern = "(unclosed"
            severity = "high"
        "#;
        let err = WardConfig::from_toml(toml).unwrap_err();
        assert!(err.to_string().contains("broken"));
    }

    #[test]
    fn config_rejects_empty_pattern() {
        let toml = r#"
            [[risk.rules]]
            id = "blank"
            pattern = "  "
            severity = "low"
        "#;
        let err = WardConfig::from_toml(toml).unwrap_err();
        assert!(err.to_string().contains("empty pattern"));
    }

    #[test]
    fn config_rejects_pool_min_above_max() {
        let err = WardConfig::from_toml("[pool]\nmin_hosts = 4\nmax_hosts = 2").unwrap_err();
        assert!(err.to_string().contains("min_hosts"));
    }

    #[test]
    fn config_rejects_pool_smaller_than_concurrency() {
        let toml = "[engine]\nmax_concurrent = 4\n[pool]\nmax_hosts = 2";
        let err = WardConfig::from_toml(toml).unwrap_err();
        assert!(err.to_string().contains("max_concurrent"), "{err}");

        let toml = "[engine]\nmax_concurrent = 2\n[pool]\nmax_hosts = 2";
        assert!(WardConfig::from_toml(toml).is_ok());
    }

    #[test]
    fn config_rejects_jsonl_without_path() {
        let err = WardConfig::from_toml("[recorder]\nbackend = \"jsonl\"").unwrap_err();
        assert!(err.to_string().contains("path"));
    }

    #[test]
    #[serial]
    fn config_expands_environment_variables() {
        std::env::set_var("WARD_TEST_RESULTS_DIR", "/var/lib/ward");
        let toml = r#"
            [recorder]
            backend = "jsonl"
            path = "${WARD_TEST_RESULTS_DIR}/results.jsonl"
        "#;

        let config = WardConfig::from_toml_with_env(toml).unwrap();
        assert_eq!(
            config.recorder.path.as_deref(),
            Some(Path::new("/var/lib/ward/results.jsonl"))
        );
        std::env::remove_var("WARD_TEST_RESULTS_DIR");
    }

    #[test]
    fn config_loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scriptward.toml");
        std::fs::write(&path, "[engine]\nmax_concurrent = 3\n").unwrap();

        let config = WardConfig::from_file(&path).unwrap();
        assert_eq!(config.engine.max_concurrent, Some(3));
    }

    #[test]
    fn config_missing_file_is_io_error() {
        let err = WardConfig::from_file(Path::new("/definitely/not/here.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }

    #[test]
    fn env_var_expansion_preserves_unresolved() {
        let result = expand_env_vars("prefix ${DEFINITELY_NOT_SET_12345} suffix");
        assert_eq!(result, "prefix ${DEFINITELY_NOT_SET_12345} suffix");
    }

    #[test]
    fn env_var_expansion_handles_no_vars() {
        assert_eq!(expand_env_vars("no variables here"), "no variables here");
    }

    #[test]
    fn env_var_expansion_keeps_unterminated_placeholder() {
        assert_eq!(expand_env_vars("a ${OPEN"), "a ${OPEN");
    }

    #[test]
    #[serial]
    fn discover_prefers_explicit_path() {
        std::env::set_var(CONFIG_ENV_VAR, "/from/env.toml");
        let found = discover_config_path(Some(Path::new("/explicit.toml")));
        assert_eq!(found, Some(PathBuf::from("/explicit.toml")));
        std::env::remove_var(CONFIG_ENV_VAR);
    }

    #[test]
    #[serial]
    fn discover_falls_back_to_env_var() {
        std::env::set_var(CONFIG_ENV_VAR, "/from/env.toml");
        let found = discover_config_path(None);
        assert_eq!(found, Some(PathBuf::from("/from/env.toml")));
        std::env::remove_var(CONFIG_ENV_VAR);
    }
}
