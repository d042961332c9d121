//! End-to-end tests of the execution lifecycle with directly supervised
//! interpreters.
//!
//! `/bin/sh` stands in for PowerShell so the tests run anywhere a POSIX shell
//! exists. Every test is serialized: they spawn real processes and some
//! depend on wall-clock timing.

#![cfg(unix)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use serial_test::serial;
use ward_engine::catalog::DirectoryCatalog;
use ward_engine::process::{InterpreterConfig, RunLimits};
use ward_engine::recorder::MemoryRecorder;
use ward_engine::{
    Caller, EngineConfig, EngineError, ErrorKind, EventPayload, ExecutionEngine, ExecutionId,
    ExecutionRequest, ExecutionStatus, ExitSignal, RiskLevel, ScriptReference, ScriptSource,
    StreamKind,
};

const WAIT: Duration = Duration::from_secs(10);

fn sh_config() -> EngineConfig {
    EngineConfig {
        interpreter: InterpreterConfig::posix_shell("/bin/sh"),
        limits: RunLimits {
            cancel_grace_ms: 500,
            ..RunLimits::default()
        },
        ..EngineConfig::default()
    }
}

fn operator() -> Caller {
    Caller::new("operator", RiskLevel::Medium)
}

#[tokio::test]
#[serial]
async fn simple_script_completes_with_ordered_output() {
    let engine = ExecutionEngine::new(sh_config());
    let started = engine
        .execute_script_content(
            "echo 'Line 1'\necho 'Line 2'\necho 'Line 3'\n",
            vec![],
            operator(),
        )
        .await
        .unwrap();
    assert!(
        matches!(
            started.status,
            ExecutionStatus::Running | ExecutionStatus::Completed
        ),
        "got {}",
        started.status
    );

    let exec = engine.wait_for_completion(started.id, WAIT).await.unwrap();
    assert_eq!(exec.status, ExecutionStatus::Completed);
    assert_eq!(exec.exit_code, Some(0));
    assert_eq!(exec.exit_signal, ExitSignal::Success);
    assert_eq!(exec.error_kind, None);
    assert_eq!(exec.stdout_text(), "Line 1\nLine 2\nLine 3");
    let seqs: Vec<u64> = exec.output.iter().map(|c| c.seq).collect();
    assert_eq!(seqs, vec![0, 1, 2]);
    assert!(exec.started_at.is_some());
    assert!(exec.duration_ms().is_some());
    assert!(matches!(exec.script_reference, ScriptReference::Inline { .. }));
    assert_eq!(engine.available_slots(), 4);
}

#[tokio::test]
#[serial]
async fn parameters_reach_the_script() {
    let engine = ExecutionEngine::new(sh_config());
    let exec = engine
        .execute_script_content(
            "echo \"hello $WARD_name\"\n",
            vec![("name".into(), "world".into())],
            operator(),
        )
        .await
        .unwrap();
    let exec = engine.wait_for_completion(exec.id, WAIT).await.unwrap();
    assert_eq!(exec.stdout_text(), "hello world");
    assert_eq!(exec.parameters, vec![("name".to_string(), "world".to_string())]);
}

#[tokio::test]
#[serial]
async fn third_concurrent_execution_is_rejected() {
    let engine = ExecutionEngine::new(EngineConfig {
        max_concurrent: 2,
        ..sh_config()
    });
    let script = "sleep 2\necho done\n";
    let (a, b, c) = tokio::join!(
        engine.execute_script_content(script, vec![], operator()),
        engine.execute_script_content(script, vec![], operator()),
        engine.execute_script_content(script, vec![], operator()),
    );
    let results = [a.unwrap(), b.unwrap(), c.unwrap()];

    let rejected: Vec<_> = results
        .iter()
        .filter(|e| e.status == ExecutionStatus::RejectedConcurrencyLimit)
        .collect();
    let statuses: Vec<_> = results.iter().map(|e| e.status).collect();
    assert_eq!(rejected.len(), 1, "statuses: {statuses:?}");
    assert_eq!(
        rejected[0].error_kind,
        Some(ErrorKind::RejectedConcurrencyLimit)
    );
    assert!(rejected[0].started_at.is_none());

    for exec in results
        .iter()
        .filter(|e| e.status != ExecutionStatus::RejectedConcurrencyLimit)
    {
        let done = engine.wait_for_completion(exec.id, WAIT).await.unwrap();
        assert_eq!(done.status, ExecutionStatus::Completed);
    }
    assert_eq!(engine.available_slots(), 2);
}

#[tokio::test]
#[serial]
async fn wall_clock_limit_times_out() {
    let mut config = sh_config();
    config.limits.timeout_ms = 2000;
    let engine = ExecutionEngine::new(config);

    let submitted = Instant::now();
    let exec = engine
        .execute_script_content("sleep 5\necho never\n", vec![], operator())
        .await
        .unwrap();
    let exec = engine.wait_for_completion(exec.id, WAIT).await.unwrap();
    assert_eq!(exec.status, ExecutionStatus::TimedOut);
    assert_eq!(exec.error_kind, Some(ErrorKind::TimedOut));
    assert!(exec.stdout_text().is_empty());
    assert!(
        submitted.elapsed() < Duration::from_secs(4),
        "took {:?}",
        submitted.elapsed()
    );
    assert_eq!(engine.available_slots(), 4);
}

#[tokio::test]
#[serial]
async fn critical_script_is_blocked_below_critical_clearance() {
    let engine = ExecutionEngine::new(sh_config());
    let exec = engine
        .execute_script_content(
            "Format-Volume -DriveLetter C\n",
            vec![],
            Caller::new("admin", RiskLevel::High).with_step_up(),
        )
        .await
        .unwrap();
    assert_eq!(exec.status, ExecutionStatus::SecurityBlocked);
    assert_eq!(exec.error_kind, Some(ErrorKind::SecurityBlocked));
    assert!(exec.started_at.is_none());
    assert!(exec
        .error_message
        .as_deref()
        .unwrap_or_default()
        .contains("formats a volume"));
    assert_eq!(
        exec.security.as_ref().map(|s| s.risk_score),
        Some(RiskLevel::Critical)
    );
}

#[tokio::test]
#[serial]
async fn high_risk_requires_step_up() {
    let engine = ExecutionEngine::new(sh_config());
    let script = "Invoke-Expression 'echo hi'\n";

    let err = engine
        .execute_script_content(script, vec![], Caller::new("admin", RiskLevel::High))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::StepUpRequired { .. }), "{err}");
    assert!(err.retryable());
    assert!(engine.list_executions().is_empty());

    // verified: runs, and sh reports the unknown command as a script failure
    let exec = engine
        .execute_script_content(
            script,
            vec![],
            Caller::new("admin", RiskLevel::High).with_step_up(),
        )
        .await
        .unwrap();
    let exec = engine.wait_for_completion(exec.id, WAIT).await.unwrap();
    assert_eq!(exec.status, ExecutionStatus::Failed);
    assert_eq!(exec.error_kind, Some(ErrorKind::Failed));
    assert_eq!(exec.exit_code, Some(127));
}

#[tokio::test]
#[serial]
async fn interpreter_crash_is_contained() {
    let engine = ExecutionEngine::new(sh_config());
    let exec = engine
        .execute_script_content("echo before\nkill -9 $$\necho after\n", vec![], operator())
        .await
        .unwrap();
    let crashed = engine.wait_for_completion(exec.id, WAIT).await.unwrap();
    assert_eq!(crashed.status, ExecutionStatus::Failed);
    assert_eq!(crashed.error_kind, Some(ErrorKind::EngineCrash));
    assert_eq!(crashed.stdout_text(), "before");
    assert_eq!(engine.available_slots(), 4);

    let next = engine
        .execute_script_content("echo still working\n", vec![], operator())
        .await
        .unwrap();
    let next = engine.wait_for_completion(next.id, WAIT).await.unwrap();
    assert_eq!(next.status, ExecutionStatus::Completed);
    assert_eq!(next.stdout_text(), "still working");
}

#[tokio::test]
#[serial]
async fn cancelling_a_running_execution() {
    let engine = ExecutionEngine::new(sh_config());
    let exec = engine
        .execute_script_content("echo ready\nsleep 5\n", vec![], operator())
        .await
        .unwrap();
    assert_eq!(exec.status, ExecutionStatus::Running);
    assert_eq!(engine.available_slots(), 3);

    assert!(engine.cancel_execution(exec.id));
    assert!(engine.get_execution(exec.id).unwrap().cancellation_requested);
    let done = engine.wait_for_completion(exec.id, WAIT).await.unwrap();
    assert_eq!(done.status, ExecutionStatus::Cancelled);
    assert_eq!(done.error_kind, Some(ErrorKind::Cancelled));
    assert!(done.cancellation_requested);
    assert_eq!(engine.available_slots(), 4);

    assert!(!engine.cancel_execution(exec.id));
    assert_eq!(engine.available_slots(), 4);
}

#[tokio::test]
#[serial]
async fn duplicate_execution_id_is_rejected() {
    let engine = ExecutionEngine::new(sh_config());
    let id = ExecutionId::new();
    let request = ExecutionRequest::new(ScriptSource::inline("echo once\n"), vec![], operator())
        .with_id(id);

    let first = engine.execute_request(request.clone()).await.unwrap();
    assert_eq!(first.id, id);
    let err = engine.execute_request(request).await.unwrap_err();
    assert!(matches!(err, EngineError::DuplicateExecution(_)), "{err}");
    assert_eq!(err.kind(), Some(ErrorKind::ValidationError));
    assert_eq!(engine.list_executions().len(), 1);
}

#[tokio::test]
#[serial]
async fn subscribers_see_lifecycle_output_and_progress_in_order() {
    let engine = ExecutionEngine::new(sh_config());
    let id = ExecutionId::new();
    let mut events = engine.subscribe_all();
    let request = ExecutionRequest::new(
        ScriptSource::inline("echo one\necho '##progress 50 halfway'\necho two\n"),
        vec![],
        operator(),
    )
    .with_id(id);
    engine.execute_request(request).await.unwrap();

    let mut statuses = Vec::new();
    let mut output = Vec::new();
    let mut progress = Vec::new();
    tokio::time::timeout(WAIT, async {
        while let Some(event) = events.next().await {
            if event.execution_id != id {
                continue;
            }
            let terminal = event.is_terminal();
            match event.payload {
                EventPayload::Status { status, .. } => statuses.push(status),
                EventPayload::Output { chunk } => output.push(chunk.text),
                EventPayload::Progress { percent, activity } => progress.push((percent, activity)),
            }
            if terminal {
                break;
            }
        }
    })
    .await
    .unwrap();

    assert_eq!(
        statuses,
        vec![
            ExecutionStatus::Pending,
            ExecutionStatus::Admitted,
            ExecutionStatus::Running,
            ExecutionStatus::Completed,
        ]
    );
    assert_eq!(output, vec!["one", "two"]);
    assert_eq!(progress, vec![(Some(50), "halfway".to_string())]);

    // the per-execution stream is gone once the execution has finished
    let mut late = engine.subscribe(id).unwrap();
    assert!(late.next().await.is_none());
    assert!(engine.subscribe(ExecutionId::new()).is_err());
}

#[tokio::test]
#[serial]
async fn retained_output_is_capped() {
    let engine = ExecutionEngine::new(EngineConfig {
        max_output_bytes: 10,
        ..sh_config()
    });
    let exec = engine
        .execute_script_content(
            "for i in 1 2 3 4 5; do echo abcdef; done\necho oops >&2\n",
            vec![],
            operator(),
        )
        .await
        .unwrap();
    let exec = engine.wait_for_completion(exec.id, WAIT).await.unwrap();
    assert_eq!(exec.status, ExecutionStatus::Completed);
    assert!(exec.output_truncated);
    assert_eq!(exec.output.len(), 1);
    assert_eq!(exec.output[0].stream, StreamKind::Stdout);

    let metrics = engine.get_execution_metrics(exec.id).unwrap();
    assert_eq!(metrics.stdout_bytes, 6);
    assert!(metrics.output_truncated);
}

#[cfg(target_os = "linux")]
#[tokio::test]
#[serial]
async fn memory_ceiling_is_enforced() {
    let mut config = sh_config();
    config.limits.max_memory_bytes = 1024;
    config.limits.memory_sample_interval_ms = 50;
    let engine = ExecutionEngine::new(config);

    let exec = engine
        .execute_script_content("sleep 5\n", vec![], operator())
        .await
        .unwrap();
    let exec = engine.wait_for_completion(exec.id, WAIT).await.unwrap();
    assert_eq!(exec.status, ExecutionStatus::ResourceLimitExceeded);
    assert_eq!(exec.error_kind, Some(ErrorKind::ResourceLimitExceeded));
    assert!(exec.resource_usage.peak_memory_bytes.unwrap_or_default() > 1024);
}

#[tokio::test]
#[serial]
async fn results_and_metrics_are_recorded() {
    let recorder = Arc::new(MemoryRecorder::new());
    let engine = ExecutionEngine::builder(sh_config())
        .recorder(recorder.clone())
        .build();
    let exec = engine
        .execute_script_content("echo recorded\n", vec![], operator())
        .await
        .unwrap();
    engine.wait_for_completion(exec.id, WAIT).await.unwrap();
    engine.shutdown(Duration::from_secs(5)).await;

    let recorded = recorder.executions();
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].id, exec.id);
    assert_eq!(recorded[0].status, ExecutionStatus::Completed);

    let durations = recorder.metric("execution.duration_ms");
    assert_eq!(durations.len(), 1);
    assert_eq!(durations[0].tag("status"), Some("completed"));
    assert_eq!(durations[0].tag("error_kind"), Some("none"));
    let bytes = recorder.metric("execution.output_bytes");
    assert_eq!(bytes[0].value, "recorded".len() as f64);
}

#[tokio::test]
#[serial]
async fn catalog_scripts_run_by_id() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("greet.sh"), "echo \"hello $WARD_who\"\n").unwrap();
    let engine = ExecutionEngine::builder(sh_config())
        .catalog(Arc::new(DirectoryCatalog::new(dir.path(), "sh")))
        .build();

    let report = engine
        .validate_execution(&ScriptSource::catalog("greet"), &vec![])
        .await
        .unwrap();
    assert!(report.is_valid, "{report:?}");

    let exec = engine
        .execute_script("greet", vec![("who".into(), "ward".into())], operator())
        .await
        .unwrap();
    let exec = engine.wait_for_completion(exec.id, WAIT).await.unwrap();
    assert_eq!(exec.stdout_text(), "hello ward");
    match &exec.script_reference {
        ScriptReference::Catalog {
            script_id,
            content_hash,
        } => {
            assert_eq!(script_id, "greet");
            assert_eq!(content_hash.len(), 64);
        }
        other => panic!("unexpected reference {other:?}"),
    }

    let err = engine
        .execute_script("gret", vec![], operator())
        .await
        .unwrap_err();
    let known = ["greet"];
    let structured = err.to_structured_error(Some(&known[..]));
    assert_eq!(structured["code"], "NOT_FOUND");
    assert_eq!(structured["suggested_fix"], "Did you mean script 'greet'?");
}

#[tokio::test]
#[serial]
async fn shutdown_cancels_in_flight_work() {
    let engine = ExecutionEngine::new(sh_config());
    let exec = engine
        .execute_script_content("sleep 5\n", vec![], operator())
        .await
        .unwrap();
    assert_eq!(engine.get_running_executions().len(), 1);

    let started = Instant::now();
    engine.shutdown(Duration::from_secs(5)).await;
    assert!(started.elapsed() < Duration::from_secs(4));

    let exec = engine.get_execution(exec.id).unwrap();
    assert_eq!(exec.status, ExecutionStatus::Cancelled);
    assert!(engine.get_running_executions().is_empty());
    let err = engine
        .execute_script_content("echo late\n", vec![], operator())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::ShuttingDown));
}

#[cfg(feature = "metrics")]
#[tokio::test]
#[serial]
async fn prometheus_metrics_follow_executions() {
    use prometheus_client::registry::Registry;
    use ward_engine::metrics::{EngineMetrics, StatusLabels};

    let mut registry = Registry::default();
    let metrics = Arc::new(EngineMetrics::new(&mut registry));
    let engine = ExecutionEngine::builder(sh_config())
        .metrics(metrics.clone())
        .build();
    let exec = engine
        .execute_script_content("echo counted\n", vec![], operator())
        .await
        .unwrap();
    engine.wait_for_completion(exec.id, WAIT).await.unwrap();

    let completed = StatusLabels {
        status: "completed".into(),
    };
    assert_eq!(metrics.executions_total.get_or_create(&completed).get(), 1);
    assert_eq!(metrics.running_executions.get(), 0);
}
