//! End-to-end deployment runs.
//!
//! A run walks an explicit state machine:
//!
//! ```text
//! Fetching -> CheckedOut -> Built -> Pushed -> ManifestReady -> Applied -> Monitoring -> Succeeded
//!     any non-terminal state -> Failed -> Remediating -> Succeeded | Escalated
//! ```
//!
//! The resume flow enters at `ManifestReady` from the persisted artifact.
//! Runs for the same (branch, environment) are serialized.
//!
//! Remediation only ever redeploys or rolls back the manifest of the run that
//! failed. A run that failed before rendering has nothing to redeploy, so its
//! attempts cannot report the previous revision as a recovery.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::cluster::{ClusterController, DeploymentStatus, WorkloadApi};
use crate::command::CommandRunner;
use crate::config::{DeployerConfig, MonitorConfig};
use crate::error::{DeployError, Result};
use crate::image::{ImageBuilder, ImageRef};
use crate::manifest::{DeploymentManifest, ManifestRenderer};
use crate::monitor::DeploymentMonitor;
use crate::remediation::{RemediationActions, RemediationEngine, RemediationOutcome};
use crate::runbook::RunbookStore;
use crate::source::{Revision, SourceFetcher};
use crate::types::DeploymentIdentity;

/// Guidance returned when the requested branch cannot be checked out.
pub const CHECKOUT_GUIDANCE: &str = "create the branch and retry";

/// States of a deployment run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentState {
    Fetching,
    CheckedOut,
    Built,
    Pushed,
    ManifestReady,
    Applied,
    Monitoring,
    Succeeded,
    Failed,
    Remediating,
    Escalated,
}

impl DeploymentState {
    /// No further transitions leave this state.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Escalated)
    }

    /// Whether `self -> next` is an edge of the run state machine.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        match (self, next) {
            (Self::Fetching, Self::CheckedOut)
            | (Self::CheckedOut, Self::Built)
            | (Self::Built, Self::Pushed)
            | (Self::Pushed, Self::ManifestReady)
            | (Self::ManifestReady, Self::Applied)
            | (Self::Applied, Self::Monitoring)
            | (Self::Monitoring, Self::Succeeded)
            | (Self::Failed, Self::Remediating)
            | (Self::Remediating, Self::Succeeded | Self::Escalated) => true,
            (from, Self::Failed) => !from.is_terminal() && from != Self::Failed && from != Self::Remediating,
            _ => false,
        }
    }
}

impl fmt::Display for DeploymentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// One recorded state change.
#[derive(Debug, Clone, Serialize)]
pub struct Transition {
    /// `None` for the entry state of a run
    pub from: Option<DeploymentState>,
    pub to: DeploymentState,
    pub at: DateTime<Utc>,
}

/// Ordered state history of one run.
#[derive(Debug, Default)]
struct RunJournal {
    state: Option<DeploymentState>,
    transitions: Vec<Transition>,
}

impl RunJournal {
    fn advance(&mut self, to: DeploymentState) {
        let from = self.state;
        if let Some(from) = from {
            if !from.can_transition_to(to) {
                warn!(%from, %to, "Unexpected deployment state transition");
            }
        }
        info!(from = ?from, %to, "Deployment state changed");
        self.transitions.push(Transition {
            from,
            to,
            at: Utc::now(),
        });
        self.state = Some(to);
    }
}

/// Full-flow request: build `revision` and deploy it to `environment`.
#[derive(Debug, Clone)]
pub struct DeployRequest {
    pub revision: Revision,
    pub environment: String,
    /// Workload name; must equal the manifest's `metadata.name`
    pub name: String,
    /// Manifest text or handlebars template
    pub manifest: String,
}

impl DeployRequest {
    #[must_use]
    pub fn identity(&self) -> DeploymentIdentity {
        DeploymentIdentity::new(&self.revision.reference, &self.environment)
    }
}

/// Resume-flow request: redeploy the persisted artifact of an identity.
#[derive(Debug, Clone)]
pub struct ResumeRequest {
    pub identity: DeploymentIdentity,
}

/// How a run ended.
#[derive(Debug)]
pub enum DeploymentOutcome {
    Succeeded,
    /// The branch could not be checked out; nothing was built
    CheckoutRejected {
        error: DeployError,
        guidance: &'static str,
    },
    /// Automation gave up; `cause` is the failure that started remediation
    Escalated {
        cause: DeployError,
        reason: DeployError,
    },
}

impl DeploymentOutcome {
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }

    /// One-line description for operators.
    #[must_use]
    pub fn summary(&self) -> String {
        match self {
            Self::Succeeded => "deployment succeeded".to_string(),
            Self::CheckoutRejected { error, guidance } => format!("{error}; {guidance}"),
            Self::Escalated { cause, reason } => {
                format!("escalated after '{}' failure: {cause}; {reason}", cause.stage())
            }
        }
    }
}

/// Everything a run produced.
#[derive(Debug)]
pub struct DeploymentReport {
    pub run_id: Uuid,
    pub identity: DeploymentIdentity,
    /// Image built by this run (full flow only)
    pub image: Option<ImageRef>,
    pub outcome: DeploymentOutcome,
    pub transitions: Vec<Transition>,
    /// Outcome of every remediation attempt made by this run
    pub remediation: Vec<RemediationOutcome>,
}

impl DeploymentReport {
    #[must_use]
    pub fn final_state(&self) -> Option<DeploymentState> {
        self.transitions.last().map(|t| t.to)
    }

    /// States visited, in order.
    #[must_use]
    pub fn states(&self) -> Vec<DeploymentState> {
        self.transitions.iter().map(|t| t.to).collect()
    }
}

/// Result of an operator or runbook rollback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RollbackOutcome {
    /// The previous manifest revision was applied and is the artifact again
    Restored { name: String, image: Option<String> },
    /// No history: the workload was deleted and the artifact removed
    Removed { name: String },
}

/// Drives fetch, build, push, render, apply and monitor for a deployment,
/// and hands failures to remediation.
pub struct DeploymentOrchestrator {
    fetcher: SourceFetcher,
    builder: ImageBuilder,
    renderer: ManifestRenderer,
    controller: ClusterController,
    monitor: DeploymentMonitor,
    remediation: RemediationEngine,
    monitor_config: MonitorConfig,
    locks: DashMap<DeploymentIdentity, Arc<Mutex<()>>>,
    /// Commit of the last full run per identity
    commits: DashMap<DeploymentIdentity, String>,
}

impl DeploymentOrchestrator {
    /// Wire the lifecycle components from configuration and the external seams.
    pub fn new(
        config: &DeployerConfig,
        runner: Arc<dyn CommandRunner>,
        workloads: Arc<dyn WorkloadApi>,
        runbooks: Arc<dyn RunbookStore>,
    ) -> Self {
        let controller = ClusterController::new(workloads);
        Self {
            fetcher: SourceFetcher::new(Arc::clone(&runner)),
            builder: ImageBuilder::new(
                Arc::clone(&runner),
                &config.registry_namespace,
                &config.project,
            )
            .with_pinning(config.pin_images),
            renderer: ManifestRenderer::new(&config.manifest_dir)
                .with_history_limit(config.history_limit),
            monitor: DeploymentMonitor::new(controller.clone()),
            controller,
            remediation: RemediationEngine::new(runbooks, runner)
                .with_max_attempts(config.max_remediation_attempts),
            monitor_config: config.monitor.clone(),
            locks: DashMap::new(),
            commits: DashMap::new(),
        }
    }

    #[must_use]
    pub fn renderer(&self) -> &ManifestRenderer {
        &self.renderer
    }

    #[must_use]
    pub fn remediation(&self) -> &RemediationEngine {
        &self.remediation
    }

    /// Build `request.revision` and deploy it.
    ///
    /// A new commit starts with a fresh remediation budget. Deploying the same
    /// commit again keeps the attempts already spent on it.
    pub async fn deploy(&self, request: DeployRequest) -> DeploymentReport {
        let identity = request.identity();
        let run_id = Uuid::new_v4();
        let span = info_span!(
            "deployment",
            %run_id,
            branch = %identity.branch,
            environment = %identity.environment
        );

        async move {
            let _lease = self.lease(&identity).await;
            info!(repository = %request.revision.repository, name = %request.name, "Starting deployment");

            let mut journal = RunJournal::default();
            let mut image = None;
            let mut artifact = None;
            let result = self
                .run_full(&request, &identity, &mut journal, &mut image, &mut artifact)
                .await;
            let (outcome, remediation) = self
                .conclude(result, &identity, &mut journal, artifact)
                .await;

            DeploymentReport {
                run_id,
                identity,
                image,
                outcome,
                transitions: journal.transitions,
                remediation,
            }
        }
        .instrument(span)
        .await
    }

    /// Apply and monitor the persisted artifact without rebuilding.
    pub async fn resume(&self, request: ResumeRequest) -> DeploymentReport {
        let identity = request.identity;
        let run_id = Uuid::new_v4();
        let span = info_span!(
            "deployment",
            %run_id,
            branch = %identity.branch,
            environment = %identity.environment
        );

        async move {
            let _lease = self.lease(&identity).await;
            info!("Resuming deployment from persisted manifest");

            let mut journal = RunJournal::default();
            let mut artifact = None;
            let result = self.run_resume(&identity, &mut journal, &mut artifact).await;
            let (outcome, remediation) = self
                .conclude(result, &identity, &mut journal, artifact)
                .await;

            DeploymentReport {
                run_id,
                identity,
                image: None,
                outcome,
                transitions: journal.transitions,
                remediation,
            }
        }
        .instrument(span)
        .await
    }

    /// Operator rollback of `identity`.
    ///
    /// Restores the previous manifest revision when one exists. Otherwise the
    /// workload `name` is deleted and the artifact removed.
    pub async fn rollback(
        &self,
        identity: &DeploymentIdentity,
        name: &str,
    ) -> Result<RollbackOutcome> {
        let span = info_span!(
            "rollback",
            branch = %identity.branch,
            environment = %identity.environment
        );

        async move {
            let _lease = self.lease(identity).await;
            let outcome = self.roll_back(identity, Some(name)).await?;
            self.remediation.reset(identity);
            Ok(outcome)
        }
        .instrument(span)
        .await
    }

    /// Current cluster status of the workload `name` in `environment`.
    pub async fn status(&self, name: &str, environment: &str) -> Result<DeploymentStatus> {
        self.controller.get_status(name, environment).await
    }

    /// Number of identities with a run holding or waiting on their lock.
    #[must_use]
    pub fn active_identities(&self) -> usize {
        self.locks.len()
    }

    /// Wait for exclusive use of `identity`.
    async fn lease(&self, identity: &DeploymentIdentity) -> IdentityLease<'_> {
        let lock = Arc::clone(self.locks.entry(identity.clone()).or_default().value());
        let guard = lock.lock_owned().await;
        IdentityLease {
            locks: &self.locks,
            identity: identity.clone(),
            guard: Some(guard),
        }
    }

    /// Start a fresh remediation budget when `commit` differs from the last
    /// full run of `identity`. An unresolved commit keeps the current budget.
    fn renew_budget(&self, identity: &DeploymentIdentity, commit: Option<&str>) {
        let Some(commit) = commit else {
            return;
        };
        let previous = self.commits.insert(identity.clone(), commit.to_string());
        if previous.as_deref() == Some(commit) {
            debug!(
                commit,
                attempts = self.remediation.attempts(identity),
                "Same commit as last run, keeping remediation budget"
            );
        } else {
            self.remediation.reset(identity);
        }
    }

    async fn run_full(
        &self,
        request: &DeployRequest,
        identity: &DeploymentIdentity,
        journal: &mut RunJournal,
        built: &mut Option<ImageRef>,
        artifact: &mut Option<DeploymentManifest>,
    ) -> Result<()> {
        let image = self
            .build_and_push(&request.revision, identity, journal)
            .await?;
        *built = Some(image.clone());

        let manifest = self.renderer.render(
            &request.manifest,
            identity,
            &request.name,
            Some(&image.deploy_reference()),
        )?;
        journal.advance(DeploymentState::ManifestReady);

        let manifest = artifact.insert(manifest);
        self.apply_and_monitor(manifest, journal).await
    }

    async fn run_resume(
        &self,
        identity: &DeploymentIdentity,
        journal: &mut RunJournal,
        artifact: &mut Option<DeploymentManifest>,
    ) -> Result<()> {
        let manifest = artifact.insert(self.renderer.load(identity)?);
        journal.advance(DeploymentState::ManifestReady);
        self.apply_and_monitor(manifest, journal).await
    }

    /// Fetch, check out, build and push. The workspace is gone when this returns.
    async fn build_and_push(
        &self,
        revision: &Revision,
        identity: &DeploymentIdentity,
        journal: &mut RunJournal,
    ) -> Result<ImageRef> {
        journal.advance(DeploymentState::Fetching);
        let workspace = self.fetcher.fetch(&revision.repository).await?;
        self.fetcher.checkout(&workspace, &revision.reference).await?;
        journal.advance(DeploymentState::CheckedOut);

        let commit = self.fetcher.resolve_commit(&workspace).await;
        debug!(commit = ?commit, "Resolved source commit");
        self.renew_budget(identity, commit.as_deref());
        let image = self.builder.build(&workspace, revision, commit).await?;
        journal.advance(DeploymentState::Built);
        self.fetcher.release(workspace);

        self.builder.push(&image).await?;
        journal.advance(DeploymentState::Pushed);
        Ok(image)
    }

    async fn apply_and_monitor(
        &self,
        manifest: &DeploymentManifest,
        journal: &mut RunJournal,
    ) -> Result<()> {
        let environment = manifest.environment();
        let action = self.controller.apply(manifest, environment).await?;
        debug!(?action, name = %manifest.name, "Applied manifest");
        journal.advance(DeploymentState::Applied);

        journal.advance(DeploymentState::Monitoring);
        let report = self
            .monitor
            .observe(
                &manifest.name,
                environment,
                self.monitor_config.timeout(),
                self.monitor_config.interval(),
            )
            .await?;

        if report.ready {
            Ok(())
        } else {
            Err(DeployError::MonitorTimeout {
                name: manifest.name.clone(),
                namespace: environment.to_string(),
                waited_secs: report.elapsed.as_secs(),
                reason: report.failure_reason(),
            })
        }
    }

    async fn conclude(
        &self,
        result: Result<()>,
        identity: &DeploymentIdentity,
        journal: &mut RunJournal,
        artifact: Option<DeploymentManifest>,
    ) -> (DeploymentOutcome, Vec<RemediationOutcome>) {
        match result {
            Ok(()) => {
                journal.advance(DeploymentState::Succeeded);
                self.remediation.reset(identity);
                info!("Deployment succeeded");
                (DeploymentOutcome::Succeeded, Vec::new())
            }
            Err(error @ DeployError::Checkout { .. }) => {
                journal.advance(DeploymentState::Failed);
                warn!(error = %error, "Checkout rejected, {CHECKOUT_GUIDANCE}");
                (
                    DeploymentOutcome::CheckoutRejected {
                        error,
                        guidance: CHECKOUT_GUIDANCE,
                    },
                    Vec::new(),
                )
            }
            Err(cause) => {
                journal.advance(DeploymentState::Failed);
                warn!(error = %cause, signature = %cause.signature(), "Deployment failed, remediating");
                let actions = RunActions {
                    orchestrator: self,
                    artifact,
                };
                self.remediate(identity, cause, journal, &actions).await
            }
        }
    }

    async fn remediate(
        &self,
        identity: &DeploymentIdentity,
        cause: DeployError,
        journal: &mut RunJournal,
        actions: &RunActions<'_>,
    ) -> (DeploymentOutcome, Vec<RemediationOutcome>) {
        journal.advance(DeploymentState::Remediating);
        let signature = cause.signature();
        let mut attempts = Vec::new();

        loop {
            match self.remediation.attempt(identity, &signature, actions).await {
                Ok(outcome @ RemediationOutcome::Fixed { .. }) => {
                    attempts.push(outcome);
                    journal.advance(DeploymentState::Succeeded);
                    info!("Deployment recovered by remediation");
                    return (DeploymentOutcome::Succeeded, attempts);
                }
                Ok(outcome @ RemediationOutcome::StillFailing { .. }) => {
                    attempts.push(outcome);
                }
                Ok(RemediationOutcome::Exhausted { attempts: count, summary }) => {
                    attempts.push(RemediationOutcome::Exhausted {
                        attempts: count,
                        summary: summary.clone(),
                    });
                    journal.advance(DeploymentState::Escalated);
                    error!(error = %cause, attempts = count, "Remediation exhausted, escalating");
                    let reason = DeployError::RemediationExhausted {
                        attempts: count,
                        summary,
                    };
                    return (DeploymentOutcome::Escalated { cause, reason }, attempts);
                }
                Err(reason) => {
                    journal.advance(DeploymentState::Escalated);
                    error!(error = %cause, reason = %reason, "Remediation unavailable, escalating");
                    return (DeploymentOutcome::Escalated { cause, reason }, attempts);
                }
            }
        }
    }

    async fn roll_back(
        &self,
        identity: &DeploymentIdentity,
        name: Option<&str>,
    ) -> Result<RollbackOutcome> {
        let environment = identity.environment.as_str();

        if let Some(previous) = self.renderer.previous(identity)? {
            self.controller
                .apply(&previous, environment)
                .await
                .map_err(|e| DeployError::Rollback {
                    name: previous.name.clone(),
                    namespace: environment.to_string(),
                    message: e.to_string(),
                })?;
            let restored = self.renderer.restore_previous(identity)?.unwrap_or(previous);
            info!(name = %restored.name, image = ?restored.image, "Rolled back to previous revision");
            return Ok(RollbackOutcome::Restored {
                name: restored.name,
                image: restored.image,
            });
        }

        let current = self.renderer.load(identity).ok();
        let name = name
            .map(str::to_string)
            .or_else(|| current.as_ref().map(|m| m.name.clone()))
            .ok_or_else(|| DeployError::Rollback {
                name: identity.to_string(),
                namespace: environment.to_string(),
                message: "no manifest history and no deployment name to delete".to_string(),
            })?;

        self.controller.delete(&name, environment).await?;
        if let Some(current) = current {
            self.renderer.remove(&current)?;
        }
        info!(name = %name, "No previous revision, removed deployment");
        Ok(RollbackOutcome::Removed { name })
    }

    async fn monitor_ready(&self, name: &str, environment: &str) -> Result<bool> {
        self.monitor
            .wait_for_ready(
                name,
                environment,
                self.monitor_config.timeout(),
                self.monitor_config.interval(),
            )
            .await
    }
}

/// Exclusive use of one identity. Dropping it unlocks, and forgets the lock
/// once no other run holds or waits on it.
struct IdentityLease<'a> {
    locks: &'a DashMap<DeploymentIdentity, Arc<Mutex<()>>>,
    identity: DeploymentIdentity,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for IdentityLease<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.locks
            .remove_if(&self.identity, |_, lock| Arc::strong_count(lock) == 1);
    }
}

/// Remediation actions bound to the manifest written by the failed run.
struct RunActions<'a> {
    orchestrator: &'a DeploymentOrchestrator,
    artifact: Option<DeploymentManifest>,
}

impl RunActions<'_> {
    fn artifact(&self, identity: &DeploymentIdentity) -> Result<&DeploymentManifest> {
        self.artifact.as_ref().ok_or_else(|| DeployError::Manifest {
            identity: identity.to_string(),
            message: "no manifest was rendered for this run".to_string(),
        })
    }
}

#[async_trait]
impl<'a> RemediationActions for RunActions<'a> {
    async fn redeploy(&self, identity: &DeploymentIdentity) -> Result<bool> {
        let manifest = self.artifact(identity)?;
        self.orchestrator
            .controller
            .apply(manifest, &identity.environment)
            .await?;
        self.orchestrator
            .monitor_ready(&manifest.name, &identity.environment)
            .await
    }

    async fn rollback(&self, identity: &DeploymentIdentity) -> Result<bool> {
        self.artifact(identity)?;
        match self.orchestrator.roll_back(identity, None).await? {
            RollbackOutcome::Restored { name, .. } => {
                self.orchestrator
                    .monitor_ready(&name, &identity.environment)
                    .await
            }
            RollbackOutcome::Removed { .. } => Ok(false),
        }
    }
}
