#![warn(missing_docs)]

//! scriptward command-line front end.
//!
//! Validates, analyzes and runs PowerShell scripts through the execution
//! engine, streaming output to the terminal as it is produced.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use ward_config::{RecorderConfig, RiskConfig, WardConfig};
use ward_engine::catalog::DirectoryCatalog;
use ward_engine::pool::PoolConfig;
use ward_engine::process::{InterpreterConfig, ParameterBinding, RunLimits};
use ward_engine::recorder::{JsonLinesRecorder, NoopRecorder, TracingRecorder};
use ward_engine::risk::{RiskAnalyzer, RiskRule};
use ward_engine::runner::RunnerMode;
use ward_engine::{
    Caller, EngineConfig, EngineError, EventPayload, ExecutionEngine, ExecutionId,
    ExecutionRequest, ExecutionStatus, Parameters, ResultRecorder, RiskLevel, ScriptCatalog,
    ScriptSource, StreamKind,
};

/// scriptward - sandboxed PowerShell execution
#[derive(Parser)]
#[command(name = "scriptward")]
#[command(version)]
struct Cli {
    /// Config file. Defaults to $SCRIPTWARD_CONFIG, then ./scriptward.toml.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a script and stream its output
    Run {
        #[command(flatten)]
        target: Target,
        /// Caller identity recorded on the execution
        #[arg(long = "as", default_value = "cli")]
        caller: String,
        /// Caller permission level: low, medium, high or critical
        #[arg(long, default_value = "medium", value_parser = parse_level)]
        level: RiskLevel,
        /// The caller has recently completed step-up verification
        #[arg(long)]
        step_up: bool,
        /// Print the final execution record as JSON instead of streaming output
        #[arg(long)]
        json: bool,
    },
    /// Check a script and its parameters without running it
    Validate {
        #[command(flatten)]
        target: Target,
    },
    /// Print the risk analysis of a script file
    Analyze {
        /// Script file
        file: PathBuf,
    },
    /// List the scripts in the configured catalog
    Scripts,
}

#[derive(clap::Args)]
struct Target {
    /// Script file to run inline
    #[arg(required_unless_present = "script", conflicts_with = "script")]
    file: Option<PathBuf>,
    /// Catalog script id
    #[arg(short, long)]
    script: Option<String>,
    /// Script parameter, NAME=VALUE; may be repeated
    #[arg(short, long = "param", value_parser = parse_param)]
    params: Vec<(String, String)>,
}

impl Target {
    fn source(&self) -> Result<ScriptSource> {
        match (&self.file, &self.script) {
            (Some(path), _) => {
                let content = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read {}", path.display()))?;
                Ok(ScriptSource::inline(content))
            }
            (None, Some(id)) => Ok(ScriptSource::catalog(id.clone())),
            (None, None) => anyhow::bail!("either a script file or --script is required"),
        }
    }
}

fn parse_param(raw: &str) -> Result<(String, String), String> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=VALUE, got '{raw}'"))?;
    if name.is_empty() {
        return Err(format!("missing parameter name in '{raw}'"));
    }
    Ok((name.to_string(), value.to_string()))
}

fn parse_level(raw: &str) -> Result<RiskLevel, String> {
    raw.parse()
}

/// Build the engine settings from config overrides.
fn build_engine_config(config: &WardConfig) -> Result<EngineConfig> {
    let mut engine = EngineConfig::default();
    let overrides = &config.engine;

    if let Some(max) = overrides.max_concurrent {
        engine.max_concurrent = max;
    }
    let mut limits = RunLimits::default();
    if let Some(secs) = overrides.timeout_secs {
        limits.timeout_ms = secs.saturating_mul(1000);
    }
    if let Some(mb) = overrides.max_memory_mb {
        limits.max_memory_bytes = mb.saturating_mul(1024 * 1024);
    }
    if let Some(ms) = overrides.memory_sample_interval_ms {
        limits.memory_sample_interval_ms = ms;
    }
    if let Some(ms) = overrides.cancel_grace_ms {
        limits.cancel_grace_ms = ms;
    }
    engine.limits = limits;
    if let Some(bytes) = overrides.max_output_bytes {
        engine.max_output_bytes = bytes;
    }
    if let Some(bytes) = overrides.max_script_bytes {
        engine.max_script_bytes = bytes;
    }
    if let Some(mode) = &overrides.runner_mode {
        engine.runner_mode = mode.parse::<RunnerMode>().map_err(anyhow::Error::msg)?;
    }
    if let Some(secs) = overrides.retain_completed_secs {
        engine.retain_completed = Duration::from_secs(secs);
    }
    if let Some(max) = overrides.max_retained {
        engine.max_retained = max;
    }
    if let Some(capacity) = overrides.relay_capacity {
        engine.relay_capacity = capacity;
    }
    if let Some(attempts) = config.recorder.retry_attempts {
        engine.recorder_attempts = attempts;
    }

    engine.interpreter = build_interpreter(config);
    engine.pool = build_pool_config(config);
    Ok(engine)
}

fn build_interpreter(config: &WardConfig) -> InterpreterConfig {
    let overrides = &config.interpreter;
    let mut interpreter = InterpreterConfig::default();
    if let Some(program) = &overrides.program {
        interpreter.program = program.clone();
    }
    if let Some(args) = &overrides.args {
        interpreter.args = args.clone();
    }
    if let Some(ext) = &overrides.script_extension {
        interpreter.script_extension = ext.trim_start_matches('.').to_string();
    }
    if overrides.parameter_binding.as_deref() == Some("environment") {
        interpreter.parameter_binding = ParameterBinding::Environment {
            prefix: overrides
                .env_prefix
                .clone()
                .unwrap_or_else(|| "WARD_".into()),
        };
    }
    interpreter
}

fn build_pool_config(config: &WardConfig) -> PoolConfig {
    let overrides = &config.pool;
    let mut pool = PoolConfig::default();
    if let Some(min) = overrides.min_hosts {
        pool.min_hosts = min;
    }
    if let Some(max) = overrides.max_hosts {
        pool.max_hosts = max;
    }
    if let Some(secs) = overrides.max_idle_secs {
        pool.max_idle_time = Duration::from_secs(secs);
    }
    if let Some(uses) = overrides.max_uses {
        pool.max_uses = (uses > 0).then_some(uses);
    }
    if let Some(ms) = overrides.health_check_timeout_ms {
        pool.health_check_timeout = Duration::from_millis(ms);
    }
    pool.host_binary = config.interpreter.host_binary.clone();
    pool
}

/// Build the risk analyzer, adding configured rules to the defaults.
fn build_analyzer(risk: &RiskConfig) -> Result<RiskAnalyzer> {
    if risk.rules.is_empty() && !risk.replace_defaults {
        return Ok(RiskAnalyzer::default());
    }
    let mut rules = Vec::with_capacity(risk.rules.len());
    for rule in &risk.rules {
        let severity: RiskLevel = rule.severity.parse().map_err(anyhow::Error::msg)?;
        let description = rule.description.clone().unwrap_or_else(|| rule.id.clone());
        rules.push(RiskRule::new(&rule.id, &rule.pattern, severity, description));
    }
    RiskAnalyzer::with_rules(rules, risk.replace_defaults).context("invalid risk rule")
}

async fn build_recorder(config: &RecorderConfig) -> Result<Arc<dyn ResultRecorder>> {
    match config.backend.as_deref().unwrap_or("tracing") {
        "noop" => Ok(Arc::new(NoopRecorder)),
        "tracing" => Ok(Arc::new(TracingRecorder)),
        "jsonl" => {
            let path = config
                .path
                .as_deref()
                .context("recorder.path is required for the jsonl backend")?;
            Ok(Arc::new(JsonLinesRecorder::open(path).await?))
        }
        other => anyhow::bail!("unsupported recorder backend '{other}'"),
    }
}

fn load_config(explicit: Option<&Path>) -> Result<WardConfig> {
    match ward_config::discover_config_path(explicit) {
        Some(path) => {
            tracing::info!(path = %path.display(), "loading config");
            WardConfig::from_file_with_env(&path)
                .with_context(|| format!("failed to load config from {}", path.display()))
        }
        None => {
            tracing::debug!("no config file found, using defaults");
            Ok(WardConfig::from_toml("")?)
        }
    }
}

struct App {
    engine: ExecutionEngine,
    catalog: Option<Arc<DirectoryCatalog>>,
}

impl App {
    async fn new(config: &WardConfig) -> Result<Self> {
        let engine_config = build_engine_config(config)?;
        let catalog = config.catalog.directory.as_ref().map(|dir| {
            Arc::new(DirectoryCatalog::new(
                dir,
                engine_config.interpreter.script_extension.clone(),
            ))
        });
        let mut builder = ExecutionEngine::builder(engine_config)
            .recorder(build_recorder(&config.recorder).await?)
            .analyzer(build_analyzer(&config.risk)?);
        if let Some(catalog) = &catalog {
            builder = builder.catalog(catalog.clone());
        }
        Ok(Self {
            engine: builder.build(),
            catalog,
        })
    }

    /// Print an engine error as structured JSON on stderr.
    async fn report_error(&self, err: &EngineError) {
        let known = match &self.catalog {
            Some(catalog) => catalog.list_scripts().await.unwrap_or_default(),
            None => Vec::new(),
        };
        let known: Vec<&str> = known.iter().map(String::as_str).collect();
        let structured = err.to_structured_error(Some(known.as_slice()));
        eprintln!(
            "{}",
            serde_json::to_string_pretty(&structured).unwrap_or_else(|_| err.to_string())
        );
    }

    async fn run(
        &self,
        source: ScriptSource,
        parameters: Parameters,
        caller: Caller,
        json: bool,
    ) -> Result<ExitCode> {
        let id = ExecutionId::new();
        let mut events = self.engine.subscribe_all();
        let printer = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                if event.execution_id != id {
                    continue;
                }
                let terminal = event.is_terminal();
                match event.payload {
                    EventPayload::Output { chunk } if !json => match chunk.stream {
                        StreamKind::Stdout => println!("{}", chunk.text),
                        StreamKind::Stderr => eprintln!("{}", chunk.text),
                    },
                    EventPayload::Progress { percent, activity } if !json => match percent {
                        Some(p) => eprintln!("[{p:>3}%] {activity}"),
                        None => eprintln!("[...] {activity}"),
                    },
                    _ => {}
                }
                if terminal {
                    break;
                }
            }
        });

        let request = ExecutionRequest::new(source, parameters, caller).with_id(id);
        let started = match self.engine.execute_request(request).await {
            Ok(exec) => exec,
            Err(e) => {
                printer.abort();
                self.report_error(&e).await;
                return Ok(ExitCode::from(2));
            }
        };
        tracing::debug!(execution_id = %id, status = %started.status, "execution submitted");

        if !started.status.is_terminal() {
            let engine = self.engine.clone();
            let cancel_on_interrupt = tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!(execution_id = %id, "interrupted, cancelling");
                    engine.cancel_execution(id);
                }
            });
            let _ = printer.await;
            cancel_on_interrupt.abort();
        } else {
            printer.abort();
        }

        let exec = self
            .engine
            .wait_for_completion(id, Duration::from_secs(5))
            .await?;
        if json {
            println!("{}", serde_json::to_string_pretty(&exec)?);
        } else if let Some(message) = &exec.error_message {
            eprintln!("{}: {message}", exec.status);
        }
        tracing::info!(
            execution_id = %id,
            status = %exec.status,
            exit_code = ?exec.exit_code,
            duration_ms = ?exec.duration_ms(),
            "execution finished"
        );
        Ok(if exec.status == ExecutionStatus::Completed {
            ExitCode::SUCCESS
        } else {
            ExitCode::FAILURE
        })
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = load_config(cli.config.as_deref())?;

    let code = match cli.command {
        Commands::Analyze { file } => {
            let content = std::fs::read_to_string(&file)
                .with_context(|| format!("failed to read {}", file.display()))?;
            let analysis = build_analyzer(&config.risk)?.analyze(&content);
            println!("{}", serde_json::to_string_pretty(&analysis)?);
            ExitCode::SUCCESS
        }
        Commands::Scripts => {
            let app = App::new(&config).await?;
            let catalog = app
                .catalog
                .context("no script catalog configured (catalog.directory)")?;
            for id in catalog.list_scripts().await? {
                println!("{id}");
            }
            ExitCode::SUCCESS
        }
        Commands::Validate { target } => {
            let app = App::new(&config).await?;
            let source = target.source()?;
            match app.engine.validate_execution(&source, &target.params).await {
                Ok(report) => {
                    println!("{}", serde_json::to_string_pretty(&report)?);
                    if report.is_valid {
                        ExitCode::SUCCESS
                    } else {
                        ExitCode::FAILURE
                    }
                }
                Err(e) => {
                    app.report_error(&e).await;
                    ExitCode::from(2)
                }
            }
        }
        Commands::Run {
            target,
            caller,
            level,
            step_up,
            json,
        } => {
            let app = App::new(&config).await?;
            let mut caller = Caller::new(caller, level);
            if step_up {
                caller = caller.with_step_up();
            }
            let code = app.run(target.source()?, target.params, caller, json).await?;
            app.engine.shutdown(Duration::from_secs(5)).await;
            code
        }
    };
    Ok(code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn param_parsing() {
        assert_eq!(
            parse_param("Path=/tmp/a=b").unwrap(),
            ("Path".to_string(), "/tmp/a=b".to_string())
        );
        assert_eq!(parse_param("Empty=").unwrap().1, "");
        assert!(parse_param("novalue").is_err());
        assert!(parse_param("=x").is_err());
    }

    #[test]
    fn defaults_without_config() {
        let config = WardConfig::from_toml("").unwrap();
        let engine = build_engine_config(&config).unwrap();
        assert_eq!(engine.max_concurrent, 4);
        assert_eq!(engine.runner_mode, RunnerMode::Direct);
        assert_eq!(engine.interpreter.program, "pwsh");
        assert_eq!(engine.limits, RunLimits::default());
    }

    #[test]
    fn overrides_are_applied() {
        let config = WardConfig::from_toml(
            r#"
            [engine]
            max_concurrent = 2
            timeout_secs = 30
            max_memory_mb = 256
            runner_mode = "hosted"

            [interpreter]
            program = "/usr/bin/pwsh"
            parameter_binding = "environment"
            host_binary = "/opt/scriptward/ward-host"

            [pool]
            min_hosts = 0
            max_hosts = 3
            max_uses = 0

            [recorder]
            retry_attempts = 1
            "#,
        )
        .unwrap();
        let engine = build_engine_config(&config).unwrap();
        assert_eq!(engine.max_concurrent, 2);
        assert_eq!(engine.limits.timeout_ms, 30_000);
        assert_eq!(engine.limits.max_memory_bytes, 256 * 1024 * 1024);
        assert_eq!(engine.runner_mode, RunnerMode::Hosted);
        assert_eq!(engine.interpreter.program, "/usr/bin/pwsh");
        assert_eq!(
            engine.interpreter.parameter_binding,
            ParameterBinding::Environment {
                prefix: "WARD_".into()
            }
        );
        assert_eq!(engine.pool.max_hosts, 3);
        assert_eq!(engine.pool.max_uses, None);
        assert_eq!(
            engine.pool.host_binary.as_deref(),
            Some(Path::new("/opt/scriptward/ward-host"))
        );
        assert_eq!(engine.recorder_attempts, 1);
    }

    #[test]
    fn huge_limits_saturate_instead_of_overflowing() {
        let config = WardConfig::from_toml(
            "[engine]\ntimeout_secs = 9223372036854775807\nmax_memory_mb = 9223372036854775807",
        )
        .unwrap();
        let engine = build_engine_config(&config).unwrap();
        assert_eq!(engine.limits.timeout_ms, u64::MAX);
        assert_eq!(engine.limits.max_memory_bytes, u64::MAX);

        let mut config = WardConfig::default();
        config.engine.timeout_secs = Some(u64::MAX);
        config.engine.max_memory_mb = Some(u64::MAX);
        let engine = build_engine_config(&config).unwrap();
        assert_eq!(engine.limits.timeout_ms, u64::MAX);
        assert_eq!(engine.limits.max_memory_bytes, u64::MAX);
    }

    #[test]
    fn configured_rules_extend_defaults() {
        let config = WardConfig::from_toml(
            r#"
            [[risk.rules]]
            id = "no-registry"
            pattern = "\\bSet-ItemProperty\\b.*HKLM:"
            severity = "critical"
            "#,
        )
        .unwrap();
        let analyzer = build_analyzer(&config.risk).unwrap();
        let analysis = analyzer.analyze("Set-ItemProperty -Path HKLM:\\Software\\X -Name Y");
        assert_eq!(analysis.risk_score, RiskLevel::Critical);
        assert!(analysis.findings.iter().any(|f| f.rule == "no-registry"));
        assert!(!analyzer.analyze("Format-Volume").is_clean());
    }

    #[test]
    fn replacing_defaults_drops_builtin_rules() {
        let config = WardConfig::from_toml(
            r#"
            [risk]
            replace_defaults = true
            "#,
        )
        .unwrap();
        let analyzer = build_analyzer(&config.risk).unwrap();
        assert!(analyzer.analyze("Format-Volume").is_clean());
    }

    #[tokio::test]
    async fn jsonl_recorder_requires_path() {
        let config = RecorderConfig {
            backend: Some("jsonl".into()),
            path: None,
            retry_attempts: None,
        };
        let err = build_recorder(&config).await.err().unwrap();
        assert!(err.to_string().contains("recorder.path"));

        let dir = tempfile::tempdir().unwrap();
        let config = RecorderConfig {
            backend: Some("jsonl".into()),
            path: Some(dir.path().join("results.jsonl")),
            retry_attempts: None,
        };
        assert!(build_recorder(&config).await.is_ok());
    }

    #[test]
    fn cli_parses_run_with_params() {
        let cli = Cli::try_parse_from([
            "scriptward",
            "run",
            "--script",
            "cleanup",
            "-p",
            "Days=7",
            "--param",
            "Path=C:\\Temp",
            "--level",
            "high",
            "--step-up",
        ])
        .unwrap();
        match cli.command {
            Commands::Run {
                target,
                level,
                step_up,
                ..
            } => {
                assert_eq!(target.script.as_deref(), Some("cleanup"));
                assert_eq!(target.params.len(), 2);
                assert_eq!(level, RiskLevel::High);
                assert!(step_up);
            }
            _ => panic!("expected run"),
        }
        assert!(Cli::try_parse_from(["scriptward", "run"]).is_err());
    }
}
