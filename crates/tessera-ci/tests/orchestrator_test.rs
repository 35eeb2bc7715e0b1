//! End-to-end workflow runs against a real shell.

#![cfg(unix)]

use std::time::Duration;
use std::time::Instant;

use tempfile::TempDir;
use tessera_cache::RestoreOutcome;
use tessera_ci::CiError;
use tessera_ci::RunContext;
use tessera_ci::RunStatus;
use tessera_ci::RunnerConfig;
use tessera_ci::WorkflowOrchestrator;
use tessera_ci::config::load_workflow_config_str;
use tessera_ci::orchestrator::StepStatus;
use tessera_ci_core::FailureKind;
use tessera_ci_core::MatrixSelection;
use tessera_ci_core::WorkflowConfig;
use tessera_ci_core::config::TriggerEvent;
use tokio_util::sync::CancellationToken;

struct Harness {
    state: TempDir,
    source: TempDir,
    orchestrator: WorkflowOrchestrator,
}

impl Harness {
    fn new() -> Self {
        let state = TempDir::new().unwrap();
        let source = TempDir::new().unwrap();
        let config = RunnerConfig {
            state_dir: state.path().to_path_buf(),
            max_parallel: Some(4),
            ..Default::default()
        };
        Self {
            orchestrator: WorkflowOrchestrator::new(config),
            state,
            source,
        }
    }

    fn context(&self) -> RunContext {
        RunContext {
            event: TriggerEvent::Push,
            branch: "refs/heads/main".to_string(),
            selection: MatrixSelection::default(),
            source_dir: self.source.path().to_path_buf(),
            force: false,
        }
    }
}

fn workflow(toml_src: &str) -> WorkflowConfig {
    load_workflow_config_str(toml_src, "test.toml".to_string()).unwrap()
}

#[tokio::test]
async fn test_every_cell_runs_once() {
    let h = Harness::new();
    let wf = workflow(
        r#"
        name = "matrix"
        [matrix]
        os = ["ubuntu-22.04", "macos-13"]
        version = ["3.10", "3.11"]
        [[steps]]
        name = "whoami"
        kind = "run"
        run = 'echo "$TESSERA_MATRIX_OS $TESSERA_MATRIX_VERSION $CI"'
        "#,
    );

    let run = h.orchestrator.run(wf, h.context()).await.unwrap();

    assert_eq!(run.status, RunStatus::Success);
    let ids: Vec<&str> = run.cells.iter().map(|c| c.id.as_str()).collect();
    assert_eq!(ids, vec!["ubuntu-22.04-3.10", "ubuntu-22.04-3.11", "macos-13-3.10", "macos-13-3.11"]);
    assert!(run.cells.iter().all(|c| c.status == RunStatus::Success));

    let log = run.cells[3].steps[0].log_path.clone().unwrap();
    let content = std::fs::read_to_string(log).unwrap();
    assert!(content.contains("[stdout] macos-13 3.11 true"));

    // Workspaces are removed and the record is persisted.
    assert!(!h.state.path().join("workspaces").join(&run.id).join("macos-13-3.11").exists());
    let loaded = h.orchestrator.runs().load(&run.id).await.unwrap();
    assert_eq!(loaded.status, RunStatus::Success);
    assert_eq!(loaded.cells.len(), 4);
}

#[tokio::test]
async fn test_failing_cell_does_not_affect_others() {
    let h = Harness::new();
    let wf = workflow(
        r#"
        name = "isolation"
        [matrix]
        os = ["ubuntu-22.04"]
        version = ["3.10", "3.11"]
        [[steps]]
        name = "test"
        kind = "run"
        run = 'if [ "$TESSERA_MATRIX_VERSION" = "3.10" ]; then echo broken >&2; exit 1; fi'
        "#,
    );

    let run = h.orchestrator.run(wf, h.context()).await.unwrap();

    assert_eq!(run.status, RunStatus::Failed);
    let failed = run.cell("ubuntu-22.04-3.10").unwrap();
    assert_eq!(failed.status, RunStatus::Failed);
    assert_eq!(failed.failure_kind(), Some(FailureKind::Test));
    assert!(failed.failure.as_ref().unwrap().message.contains("broken"));
    assert_eq!(run.cell("ubuntu-22.04-3.11").unwrap().status, RunStatus::Success);
}

#[tokio::test]
async fn test_toolkit_build_failure_skips_tests() {
    let h = Harness::new();
    let wf = workflow(
        r#"
        name = "toolkit"
        [matrix]
        os = ["ubuntu-22.04"]
        version = ["3.11"]
        [[steps]]
        name = "Build GMTSAR"
        kind = "toolkit_build"
        repository = "file:///nonexistent/gmtsar"
        branch = "master"
        [[steps]]
        name = "Run test"
        kind = "run"
        run = "touch ran"
        [[steps]]
        name = "Upload"
        kind = "upload_artifact"
        artifact = "images"
        path = "."
        if_no_files_found = "ignore"
        "#,
    );

    let run = h.orchestrator.run(wf, h.context()).await.unwrap();
    let cell = &run.cells[0];

    assert_eq!(cell.failure_kind(), Some(FailureKind::Build));
    assert_eq!(cell.failure.as_ref().unwrap().step.as_deref(), Some("Build GMTSAR"));
    assert_eq!(cell.step("Build GMTSAR").unwrap().status, StepStatus::Failed);
    assert_eq!(cell.step("Run test").unwrap().status, StepStatus::Skipped);
    // Archival still runs after a failure.
    assert_eq!(cell.step("Upload").unwrap().status, StepStatus::Success);
}

#[tokio::test]
async fn test_missing_images_violate_artifact_contract() {
    let h = Harness::new();
    let wf = workflow(
        r#"
        name = "artifacts"
        [matrix]
        os = ["ubuntu-22.04", "macos-13"]
        version = ["3.11"]
        [[steps]]
        name = "test"
        kind = "run"
        run = 'mkdir -p tests; if [ "$TESSERA_MATRIX_OS" = "macos-13" ]; then printf png > tests/phase.png; fi'
        [[steps]]
        name = "upload"
        kind = "upload_artifact"
        artifact = "golden-${{ matrix.os }}-${{ matrix.version }}"
        path = "tests"
        "#,
    );

    let run = h.orchestrator.run(wf, h.context()).await.unwrap();

    let linux = run.cell("ubuntu-22.04-3.11").unwrap();
    assert_eq!(linux.status, RunStatus::Failed);
    assert_eq!(linux.failure_kind(), Some(FailureKind::ArtifactContract));
    assert_eq!(linux.step("test").unwrap().status, StepStatus::Success);

    let mac = run.cell("macos-13-3.11").unwrap();
    assert_eq!(mac.status, RunStatus::Success);
    assert_eq!(mac.artifacts.len(), 1);
    let stored = h.state.path().join("artifacts").join(&run.id).join("golden-macos-13-3.11/phase.png");
    assert_eq!(std::fs::read(stored).unwrap(), b"png");
}

const CACHE_WORKFLOW: &str = r#"
name = "cache"
[matrix]
os = ["ubuntu-22.04"]
version = ["3.11"]
[[steps]]
name = "restore"
kind = "cache"
key = "KEY_PLACEHOLDER"
restore_keys = ["S1A_Stack_"]
paths = ["data"]
[[steps]]
name = "fetch"
kind = "run"
run = 'if [ ! -f data/fixture.bin ]; then mkdir -p data; head -c 4096 /dev/urandom > data/fixture.bin; fi'
"#;

fn cache_workflow(key: &str) -> WorkflowConfig {
    workflow(&CACHE_WORKFLOW.replace("KEY_PLACEHOLDER", key))
}

#[tokio::test]
async fn test_cache_miss_falls_through_then_hits() {
    let h = Harness::new();

    let first = h.orchestrator.run(cache_workflow("S1A_Stack_CPGF_T173"), h.context()).await.unwrap();
    assert_eq!(first.status, RunStatus::Success);
    assert_eq!(first.cells[0].step("restore").unwrap().cache, Some(RestoreOutcome::Miss));

    let saved = h.orchestrator.cache().get("S1A_Stack_CPGF_T173").await.unwrap().unwrap();

    let second = h.orchestrator.run(cache_workflow("S1A_Stack_CPGF_T173"), h.context()).await.unwrap();
    assert_eq!(second.status, RunStatus::Success);
    let outcome = second.cells[0].step("restore").unwrap().cache.clone().unwrap();
    assert!(outcome.is_exact_hit());

    // An exact hit is not re-saved, so the stored bytes are unchanged.
    let after = h.orchestrator.cache().get("S1A_Stack_CPGF_T173").await.unwrap().unwrap();
    assert_eq!(after.digest, saved.digest);
    assert_eq!(after.archive, saved.archive);

    let third = h.orchestrator.run(cache_workflow("S1A_Stack_OTHER"), h.context()).await.unwrap();
    assert!(matches!(
        third.cells[0].step("restore").unwrap().cache,
        Some(RestoreOutcome::PrefixHit { ref key, .. }) if key == "S1A_Stack_CPGF_T173"
    ));
}

#[tokio::test]
async fn test_corrupted_cache_metadata_does_not_fail_cell() {
    let h = Harness::new();
    let toml_src = CACHE_WORKFLOW
        .replace("KEY_PLACEHOLDER", "gmtsar_data")
        .replace("restore_keys = [\"S1A_Stack_\"]\n", "");
    let exact_only = workflow(&toml_src);

    let first = h.orchestrator.run(exact_only.clone(), h.context()).await.unwrap();
    assert_eq!(first.status, RunStatus::Success);
    let meta = h.state.path().join("cache").join(tessera_cache::key_digest("gmtsar_data")).join("meta.json");
    std::fs::write(&meta, b"{not json").unwrap();

    let second = h.orchestrator.run(exact_only, h.context()).await.unwrap();
    assert_eq!(second.status, RunStatus::Success);
    assert_eq!(second.cells[0].step("restore").unwrap().cache, Some(RestoreOutcome::Miss));

    // The successful job saves the key again over the corrupt metadata.
    assert!(h.orchestrator.cache().get("gmtsar_data").await.unwrap().is_some());
}

#[tokio::test]
async fn test_fail_fast_cancels_other_cells() {
    let h = Harness::new();
    let wf = workflow(
        r#"
        name = "fail-fast"
        [matrix]
        os = ["ubuntu-22.04"]
        version = ["broken", "slow"]
        fail_fast = true
        max_parallel = 2
        [[steps]]
        name = "test"
        kind = "run"
        run = 'if [ "$TESSERA_MATRIX_VERSION" = "broken" ]; then exit 1; fi; sleep 30'
        "#,
    );

    let start = Instant::now();
    let run = h.orchestrator.run(wf, h.context()).await.unwrap();

    assert!(start.elapsed() < Duration::from_secs(20));
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.cell("ubuntu-22.04-broken").unwrap().failure_kind(), Some(FailureKind::Test));
    let slow = run.cell("ubuntu-22.04-slow").unwrap();
    assert_eq!(slow.status, RunStatus::Cancelled);
    assert_eq!(slow.failure_kind(), Some(FailureKind::Cancelled));
}

#[tokio::test]
async fn test_step_timeout() {
    let h = Harness::new();
    let wf = workflow(
        r#"
        name = "timeout"
        [matrix]
        os = ["ubuntu-22.04"]
        version = ["3.11"]
        [[steps]]
        name = "hang"
        kind = "run"
        run = "sleep 30"
        timeout_secs = 1
        "#,
    );

    let start = Instant::now();
    let run = h.orchestrator.run(wf, h.context()).await.unwrap();

    assert!(start.elapsed() < Duration::from_secs(15));
    let cell = &run.cells[0];
    assert_eq!(cell.failure_kind(), Some(FailureKind::Timeout));
    assert_eq!(cell.step("hang").unwrap().status, StepStatus::TimedOut);
}

#[tokio::test]
async fn test_external_cancel() {
    let h = Harness::new();
    let wf = workflow(
        r#"
        name = "cancel"
        [matrix]
        os = ["ubuntu-22.04"]
        version = ["3.11"]
        [[steps]]
        name = "hang"
        kind = "run"
        run = "sleep 30"
        "#,
    );

    let token = CancellationToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        canceller.cancel();
    });

    let run = h.orchestrator.run_with_cancel(wf, h.context(), token).await.unwrap();
    assert_eq!(run.status, RunStatus::Cancelled);
    assert_eq!(run.cells[0].step("hang").unwrap().status, StepStatus::Cancelled);
}

#[tokio::test]
async fn test_checkout_path_and_continue_on_error() {
    let h = Harness::new();
    std::fs::create_dir_all(h.source.path().join("bin")).unwrap();
    std::fs::write(h.source.path().join("bin/greet"), "#!/bin/sh\necho hello from greet\n").unwrap();
    {
        use std::os::unix::fs::PermissionsExt;
        let script = h.source.path().join("bin/greet");
        std::fs::set_permissions(script, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    let wf = workflow(
        r#"
        name = "path"
        [matrix]
        os = ["ubuntu-22.04"]
        version = ["3.11"]
        [[steps]]
        name = "checkout"
        kind = "checkout"
        [[steps]]
        name = "flaky"
        kind = "run"
        run = "exit 3"
        continue_on_error = true
        [[steps]]
        name = "extend path"
        kind = "run"
        run = "true"
        add_path = ["bin"]
        [[steps]]
        name = "greet"
        kind = "run"
        run = "greet"
        "#,
    );

    let run = h.orchestrator.run(wf, h.context()).await.unwrap();
    let cell = &run.cells[0];

    assert_eq!(cell.status, RunStatus::Success, "{:?}", cell.failure);
    assert_eq!(cell.step("flaky").unwrap().status, StepStatus::Failed);
    assert_eq!(cell.step("flaky").unwrap().exit_code, Some(3));
    let log = std::fs::read_to_string(cell.step("greet").unwrap().log_path.clone().unwrap()).unwrap();
    assert!(log.contains("hello from greet"));
}

#[tokio::test]
async fn test_trigger_filters() {
    let h = Harness::new();
    let toml_src = r#"
        name = "triggers"
        [triggers]
        events = ["push"]
        branches = ["pygmtsar2"]
        [matrix]
        os = ["ubuntu-22.04"]
        version = ["3.11"]
        [[steps]]
        name = "test"
        kind = "run"
        run = "true"
        "#;

    let err = h.orchestrator.run(workflow(toml_src), h.context()).await.unwrap_err();
    assert!(matches!(err, CiError::NotTriggered { .. }));

    let mut forced = h.context();
    forced.force = true;
    let run = h.orchestrator.run(workflow(toml_src), forced).await.unwrap();
    assert_eq!(run.status, RunStatus::Success);
}

#[tokio::test]
async fn test_matrix_selection() {
    let h = Harness::new();
    let wf = workflow(
        r#"
        name = "select"
        [matrix]
        os = ["ubuntu-22.04", "macos-13"]
        version = ["3.10", "3.11"]
        [[steps]]
        name = "test"
        kind = "run"
        run = "true"
        "#,
    );

    let mut context = h.context();
    context.selection = MatrixSelection {
        os: vec!["macos-13".to_string()],
        version: Vec::new(),
    };
    let run = h.orchestrator.run(wf, context).await.unwrap();
    let ids: Vec<&str> = run.cells.iter().map(|c| c.id.as_str()).collect();
    assert_eq!(ids, vec!["macos-13-3.10", "macos-13-3.11"]);
    assert_eq!(run.cells[0].cell.index, 2);
}
