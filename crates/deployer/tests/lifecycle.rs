//! End-to-end deployment runs against in-memory git, docker and cluster fakes.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use common::{config, request, FakeCluster, ScriptedRunner, MANIFEST};
use deployer::{
    DeployError, DeploymentIdentity, DeploymentOrchestrator, DeploymentOutcome, DeploymentState,
    DirectoryRunbookStore, RemediationOutcome, RemediationStep, ResumeRequest, RollbackOutcome,
    RunbookDocument, RunbookStore, StaticRunbookStore,
};
use tempfile::TempDir;

fn orchestrator(
    dir: &TempDir,
    runner: &Arc<ScriptedRunner>,
    cluster: &Arc<FakeCluster>,
) -> DeploymentOrchestrator {
    let config = config(dir);
    let runbooks = DirectoryRunbookStore::load(&config.runbook_dir).unwrap();
    DeploymentOrchestrator::new(
        &config,
        runner.clone(),
        cluster.clone(),
        Arc::new(runbooks),
    )
}

/// Orchestrator whose only runbook redeploys on any failure.
fn redeploying_orchestrator(
    dir: &TempDir,
    runner: &Arc<ScriptedRunner>,
    cluster: &Arc<FakeCluster>,
) -> DeploymentOrchestrator {
    let runbooks: Arc<dyn RunbookStore> = Arc::new(
        StaticRunbookStore::from_documents(vec![RunbookDocument {
            name: "redeploy-anything".to_string(),
            description: String::new(),
            matches: vec![".*".to_string()],
            steps: vec![RemediationStep::Redeploy],
        }])
        .unwrap(),
    );
    DeploymentOrchestrator::new(&config(dir), runner.clone(), cluster.clone(), runbooks)
}

fn identity() -> DeploymentIdentity {
    DeploymentIdentity::new("feature-x", "staging")
}

fn assert_workspaces_released(runner: &ScriptedRunner) {
    let roots = runner.workspace_roots();
    assert!(!roots.is_empty(), "no workspace was created");
    for root in roots {
        assert!(!root.exists(), "workspace {} leaked", root.display());
    }
}

#[tokio::test(start_paused = true)]
async fn test_happy_path_deploys_branch() {
    let dir = TempDir::new().unwrap();
    let runner = ScriptedRunner::new();
    let cluster = FakeCluster::healthy();
    let orchestrator = orchestrator(&dir, &runner, &cluster);

    let report = orchestrator
        .deploy(request("feature-x", "staging", MANIFEST))
        .await;

    assert!(report.outcome.is_success(), "{:?}", report.outcome);
    assert_eq!(
        report.states(),
        vec![
            DeploymentState::Fetching,
            DeploymentState::CheckedOut,
            DeploymentState::Built,
            DeploymentState::Pushed,
            DeploymentState::ManifestReady,
            DeploymentState::Applied,
            DeploymentState::Monitoring,
            DeploymentState::Succeeded,
        ]
    );

    let builds = runner.ran("docker", "build");
    assert_eq!(builds.len(), 1);
    assert!(builds[0].args.contains(&"acme/app-feature-x:latest".to_string()));
    assert!(builds[0].args.contains(&"acme/app-feature-x:3f2c9a1b7d4e".to_string()));
    let pushed: Vec<String> = runner
        .ran("docker", "push")
        .into_iter()
        .map(|spec| spec.args[1].clone())
        .collect();
    assert_eq!(
        pushed,
        vec!["acme/app-feature-x:latest", "acme/app-feature-x:3f2c9a1b7d4e"]
    );

    assert_eq!(cluster.creates.load(Ordering::SeqCst), 1);
    assert_eq!(cluster.replaces.load(Ordering::SeqCst), 0);
    assert!(cluster.object("staging", "app").is_some());

    let artifact = dir.path().join("deployments/deployments-feature-x@staging.yaml");
    assert_eq!(std::fs::read(&artifact).unwrap(), MANIFEST.as_bytes());
    assert_workspaces_released(&runner);
}

#[tokio::test(start_paused = true)]
async fn test_existing_object_is_replaced() {
    let dir = TempDir::new().unwrap();
    let runner = ScriptedRunner::new();
    let cluster = FakeCluster::healthy();
    let orchestrator = orchestrator(&dir, &runner, &cluster);

    let first = orchestrator
        .deploy(request("feature-x", "staging", MANIFEST))
        .await;
    let second = orchestrator
        .deploy(request("feature-x", "staging", MANIFEST))
        .await;

    assert!(first.outcome.is_success());
    assert!(second.outcome.is_success(), "{:?}", second.outcome);
    assert_eq!(cluster.creates.load(Ordering::SeqCst), 1);
    assert_eq!(cluster.replaces.load(Ordering::SeqCst), 1);
    assert_eq!(cluster.object_count(), 1);
    assert!(orchestrator.renderer().history_entries(&identity()).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_template_deploys_pinned_image() {
    let dir = TempDir::new().unwrap();
    let runner = ScriptedRunner::new();
    let cluster = FakeCluster::healthy();
    let orchestrator = orchestrator(&dir, &runner, &cluster);
    let template = MANIFEST.replace("acme/app-feature-x:latest", "{{image}}");

    let report = orchestrator
        .deploy(request("feature-x", "staging", &template))
        .await;

    assert!(report.outcome.is_success());
    let deployment = cluster.object("staging", "app").unwrap();
    let image = deployment.spec.unwrap().template.spec.unwrap().containers[0]
        .image
        .clone();
    assert_eq!(image.as_deref(), Some("acme/app-feature-x:3f2c9a1b7d4e"));
    assert_eq!(
        report.image.unwrap().deploy_reference(),
        "acme/app-feature-x:3f2c9a1b7d4e"
    );
}

#[tokio::test(start_paused = true)]
async fn test_never_available_fails_and_starts_remediation() {
    let dir = TempDir::new().unwrap();
    let runner = ScriptedRunner::new();
    let cluster = FakeCluster::stuck("ImagePullBackOff");
    let orchestrator = orchestrator(&dir, &runner, &cluster);

    let start = tokio::time::Instant::now();
    let report = orchestrator
        .deploy(request("feature-x", "staging", MANIFEST))
        .await;

    let states = report.states();
    let failed = states
        .iter()
        .position(|s| *s == DeploymentState::Failed)
        .unwrap();
    assert_eq!(states[failed - 1], DeploymentState::Monitoring);
    assert_eq!(states[failed + 1], DeploymentState::Remediating);

    let RemediationOutcome::StillFailing { procedure, .. } = &report.remediation[0] else {
        panic!("unexpected first attempt {:?}", report.remediation[0]);
    };
    assert_eq!(procedure, "image-pull-error");

    // 24 reads for the first rollout, then 24 per redeploy.
    assert_eq!(cluster.status_reads.load(Ordering::SeqCst), 24 * 4);
    // 120s first rollout, then 15s wait + 120s monitor per attempt.
    assert_eq!(start.elapsed(), Duration::from_secs(120 + 3 * 135));
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_remediation_escalates_with_summary() {
    let dir = TempDir::new().unwrap();
    let runner = ScriptedRunner::new();
    let cluster = FakeCluster::stuck("ImagePullBackOff");
    let orchestrator = orchestrator(&dir, &runner, &cluster);

    let report = orchestrator
        .deploy(request("feature-x", "staging", MANIFEST))
        .await;

    assert_eq!(report.remediation.len(), 4);
    for attempt in &report.remediation[..3] {
        assert!(matches!(attempt, RemediationOutcome::StillFailing { .. }));
    }
    let RemediationOutcome::Exhausted { attempts, summary } = &report.remediation[3] else {
        panic!("expected exhaustion, got {:?}", report.remediation[3]);
    };
    assert_eq!(*attempts, 3);
    assert!(!summary.is_empty());

    let DeploymentOutcome::Escalated { cause, reason } = &report.outcome else {
        panic!("expected escalation, got {:?}", report.outcome);
    };
    assert_eq!(cause.signature(), "monitor:ImagePullBackOff");
    assert!(matches!(reason, DeployError::RemediationExhausted { .. }));
    assert_eq!(report.final_state(), Some(DeploymentState::Escalated));
    assert_eq!(cluster.replaces.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn test_remediation_recovers_deployment() {
    let dir = TempDir::new().unwrap();
    let runner = ScriptedRunner::new();
    let cluster = FakeCluster::available_after(2);
    let orchestrator = orchestrator(&dir, &runner, &cluster);

    let report = orchestrator
        .deploy(request("feature-x", "staging", MANIFEST))
        .await;

    assert!(report.outcome.is_success(), "{:?}", report.outcome);
    assert_eq!(
        report.remediation,
        vec![RemediationOutcome::Fixed {
            procedure: "progress-deadline".to_string()
        }]
    );
    assert_eq!(
        &report.states()[6..],
        &[
            DeploymentState::Monitoring,
            DeploymentState::Failed,
            DeploymentState::Remediating,
            DeploymentState::Succeeded,
        ]
    );
    assert_eq!(orchestrator.remediation().attempts(&identity()), 0);
}

#[tokio::test(start_paused = true)]
async fn test_missing_branch_is_rejected_and_workspace_released() {
    let dir = TempDir::new().unwrap();
    let runner = ScriptedRunner::new();
    runner.fail("git checkout");
    let cluster = FakeCluster::healthy();
    let orchestrator = orchestrator(&dir, &runner, &cluster);

    let report = orchestrator
        .deploy(request("feature-x", "staging", MANIFEST))
        .await;

    let DeploymentOutcome::CheckoutRejected { guidance, .. } = &report.outcome else {
        panic!("expected checkout rejection, got {:?}", report.outcome);
    };
    assert_eq!(*guidance, "create the branch and retry");
    assert!(runner.ran("docker", "build").is_empty());
    assert!(runner.ran("docker", "push").is_empty());
    assert!(report.remediation.is_empty());
    assert_eq!(cluster.applies(), 0);
    assert_workspaces_released(&runner);
}

#[tokio::test(start_paused = true)]
async fn test_clone_failure_leaves_no_workspace() {
    let dir = TempDir::new().unwrap();
    let runner = ScriptedRunner::new();
    runner.fail("git clone");
    let cluster = FakeCluster::healthy();
    let orchestrator = orchestrator(&dir, &runner, &cluster);

    let report = orchestrator
        .deploy(request("feature-x", "staging", MANIFEST))
        .await;

    assert!(matches!(
        report.outcome,
        DeploymentOutcome::CheckoutRejected { .. }
    ));
    assert!(runner.ran("git", "checkout").is_empty());
    assert_workspaces_released(&runner);
}

#[tokio::test(start_paused = true)]
async fn test_build_failure_without_runbook_escalates() {
    let dir = TempDir::new().unwrap();
    let runner = ScriptedRunner::new();
    runner.fail("docker build");
    let cluster = FakeCluster::healthy();
    let orchestrator = orchestrator(&dir, &runner, &cluster);

    let report = orchestrator
        .deploy(request("feature-x", "staging", MANIFEST))
        .await;

    let DeploymentOutcome::Escalated { cause, reason } = &report.outcome else {
        panic!("expected escalation, got {:?}", report.outcome);
    };
    assert!(cause.is_build_related());
    assert!(matches!(reason, DeployError::RunbookNotFound { .. }));
    assert!(runner.ran("docker", "push").is_empty());
    assert!(!orchestrator.renderer().exists(&identity()));
    assert_workspaces_released(&runner);
}

#[tokio::test(start_paused = true)]
async fn test_push_failure_escalates_before_apply() {
    let dir = TempDir::new().unwrap();
    let runner = ScriptedRunner::new();
    runner.fail("docker push");
    let cluster = FakeCluster::healthy();
    let orchestrator = orchestrator(&dir, &runner, &cluster);

    let report = orchestrator
        .deploy(request("feature-x", "staging", MANIFEST))
        .await;

    let DeploymentOutcome::Escalated { cause, reason } = &report.outcome else {
        panic!("expected escalation, got {:?}", report.outcome);
    };
    assert!(matches!(cause, DeployError::Push { .. }));
    assert!(cause.is_build_related());
    assert!(matches!(reason, DeployError::RunbookNotFound { .. }));
    assert_eq!(
        report.states(),
        vec![
            DeploymentState::Fetching,
            DeploymentState::CheckedOut,
            DeploymentState::Built,
            DeploymentState::Failed,
            DeploymentState::Remediating,
            DeploymentState::Escalated,
        ]
    );
    assert_eq!(runner.ran("docker", "push").len(), 1);
    assert_eq!(cluster.applies(), 0);
    assert!(!orchestrator.renderer().exists(&identity()));
    assert_workspaces_released(&runner);
}

#[tokio::test(start_paused = true)]
async fn test_failed_build_never_recovers_with_previous_revision() {
    let dir = TempDir::new().unwrap();
    let runner = ScriptedRunner::new();
    let cluster = FakeCluster::healthy();
    let orchestrator = redeploying_orchestrator(&dir, &runner, &cluster);

    let first = orchestrator
        .deploy(request("feature-x", "staging", MANIFEST))
        .await;
    assert!(first.outcome.is_success());

    runner.fail("docker build");
    let scaled = MANIFEST.replace("replicas: 1", "replicas: 7");
    let report = orchestrator
        .deploy(request("feature-x", "staging", &scaled))
        .await;

    assert!(!report.outcome.is_success(), "{:?}", report.outcome);
    let DeploymentOutcome::Escalated { cause, reason } = &report.outcome else {
        panic!("expected escalation, got {:?}", report.outcome);
    };
    assert!(matches!(cause, DeployError::Build { .. }));
    assert!(matches!(reason, DeployError::RemediationExhausted { attempts: 3, .. }));
    for attempt in &report.remediation[..3] {
        assert!(matches!(attempt, RemediationOutcome::StillFailing { .. }));
    }
    assert_eq!(report.final_state(), Some(DeploymentState::Escalated));

    // Nothing from the failed run reached the cluster.
    assert_eq!(cluster.applies(), 1);
    let replicas = cluster
        .object("staging", "app")
        .and_then(|d| d.spec)
        .and_then(|s| s.replicas);
    assert_eq!(replicas, Some(1));
    assert_eq!(
        orchestrator.renderer().load(&identity()).unwrap().raw,
        MANIFEST
    );
}

#[tokio::test(start_paused = true)]
async fn test_redeploying_same_commit_keeps_spent_budget() {
    let dir = TempDir::new().unwrap();
    let runner = ScriptedRunner::new();
    let cluster = FakeCluster::stuck("CrashLoopBackOff");
    let orchestrator = redeploying_orchestrator(&dir, &runner, &cluster);

    let first = orchestrator
        .deploy(request("feature-x", "staging", MANIFEST))
        .await;
    assert_eq!(first.remediation.len(), 4);
    assert_eq!(orchestrator.remediation().attempts(&identity()), 3);

    let again = orchestrator
        .deploy(request("feature-x", "staging", MANIFEST))
        .await;
    assert!(matches!(
        again.remediation.as_slice(),
        [RemediationOutcome::Exhausted { attempts: 3, .. }]
    ));
    assert!(matches!(again.outcome, DeploymentOutcome::Escalated { .. }));

    runner.set_commit("9e8d7c6b5a4f30211203f4e5d6c7b8a9f0e1d2c3");
    let fresh = orchestrator
        .deploy(request("feature-x", "staging", MANIFEST))
        .await;
    assert_eq!(fresh.remediation.len(), 4);
    for attempt in &fresh.remediation[..3] {
        assert!(matches!(attempt, RemediationOutcome::StillFailing { .. }));
    }
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_run_releases_workspace() {
    let dir = TempDir::new().unwrap();
    let runner = ScriptedRunner::new();
    runner.set_build_delay(Duration::from_secs(3600));
    let cluster = FakeCluster::healthy();
    let orchestrator = orchestrator(&dir, &runner, &cluster);

    let result = tokio::time::timeout(
        Duration::from_secs(10),
        orchestrator.deploy(request("feature-x", "staging", MANIFEST)),
    )
    .await;

    assert!(result.is_err());
    assert_workspaces_released(&runner);
    assert_eq!(cluster.applies(), 0);
    assert_eq!(orchestrator.active_identities(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_runs_for_same_identity_are_serialized() {
    let dir = TempDir::new().unwrap();
    let runner = ScriptedRunner::new();
    runner.set_build_delay(Duration::from_secs(30));
    let cluster = FakeCluster::healthy();
    let orchestrator = orchestrator(&dir, &runner, &cluster);

    let (first, second) = tokio::join!(
        orchestrator.deploy(request("feature-x", "staging", MANIFEST)),
        orchestrator.deploy(request("feature-x", "staging", MANIFEST)),
    );

    assert!(first.outcome.is_success());
    assert!(second.outcome.is_success());
    assert_eq!(runner.max_builds_in_flight.load(Ordering::SeqCst), 1);
    assert_eq!(cluster.object_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_runs_for_different_identities_overlap() {
    let dir = TempDir::new().unwrap();
    let runner = ScriptedRunner::new();
    runner.set_build_delay(Duration::from_secs(30));
    let cluster = FakeCluster::healthy();
    let orchestrator = orchestrator(&dir, &runner, &cluster);

    let (first, second) = tokio::join!(
        orchestrator.deploy(request("feature-x", "staging", MANIFEST)),
        orchestrator.deploy(request("feature-x", "qa", MANIFEST)),
    );

    assert!(first.outcome.is_success());
    assert!(second.outcome.is_success());
    assert_eq!(runner.max_builds_in_flight.load(Ordering::SeqCst), 2);
    assert_eq!(cluster.object_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_resume_skips_build() {
    let dir = TempDir::new().unwrap();
    let runner = ScriptedRunner::new();
    let cluster = FakeCluster::healthy();
    let orchestrator = orchestrator(&dir, &runner, &cluster);

    orchestrator
        .deploy(request("feature-x", "staging", MANIFEST))
        .await;
    let report = orchestrator
        .resume(ResumeRequest {
            identity: identity(),
        })
        .await;

    assert!(report.outcome.is_success());
    assert_eq!(report.states()[0], DeploymentState::ManifestReady);
    assert_eq!(runner.ran("docker", "build").len(), 1);
    assert_eq!(cluster.replaces.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_rollback_restores_previous_revision() {
    let dir = TempDir::new().unwrap();
    let runner = ScriptedRunner::new();
    let cluster = FakeCluster::healthy();
    let orchestrator = orchestrator(&dir, &runner, &cluster);
    let scaled = MANIFEST.replace("replicas: 1", "replicas: 3");

    orchestrator
        .deploy(request("feature-x", "staging", MANIFEST))
        .await;
    orchestrator
        .deploy(request("feature-x", "staging", &scaled))
        .await;

    let outcome = orchestrator.rollback(&identity(), "app").await.unwrap();
    assert!(matches!(outcome, RollbackOutcome::Restored { .. }));

    let replicas = cluster
        .object("staging", "app")
        .and_then(|d| d.spec)
        .and_then(|s| s.replicas);
    assert_eq!(replicas, Some(1));
    assert_eq!(
        orchestrator.renderer().load(&identity()).unwrap().raw,
        MANIFEST
    );
    assert_eq!(cluster.deletes.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn test_rollback_without_history_removes_deployment() {
    let dir = TempDir::new().unwrap();
    let runner = ScriptedRunner::new();
    let cluster = FakeCluster::healthy();
    let orchestrator = orchestrator(&dir, &runner, &cluster);

    orchestrator
        .deploy(request("feature-x", "staging", MANIFEST))
        .await;
    let outcome = orchestrator.rollback(&identity(), "app").await.unwrap();

    assert_eq!(
        outcome,
        RollbackOutcome::Removed {
            name: "app".to_string()
        }
    );
    assert_eq!(cluster.object_count(), 0);
    assert!(!orchestrator.renderer().exists(&identity()));
}
