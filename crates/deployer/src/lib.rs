//! Branch deployment orchestrator.
//!
//! Takes a branch of a source repository and drives it to a running
//! Kubernetes Deployment: clone and check out the branch, build and push a
//! container image, render and persist the deployment manifest, apply it,
//! and watch the rollout until the workload reports `Available`.
//!
//! When any step after checkout fails, a runbook matching the failure
//! signature is executed, at most three times per deployment, before the
//! failure is escalated to an operator.
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use deployer::{
//!     DeployRequest, DeployerConfig, DeploymentOrchestrator, DirectoryRunbookStore,
//!     KubeWorkloadApi, Revision, ShellRunner,
//! };
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = DeployerConfig::load("deployer.yaml".as_ref())?;
//! let client = kube::Client::try_default().await?;
//!
//! let orchestrator = DeploymentOrchestrator::new(
//!     &config,
//!     Arc::new(ShellRunner::new()),
//!     Arc::new(KubeWorkloadApi::new(client)),
//!     Arc::new(DirectoryRunbookStore::load(&config.runbook_dir)?),
//! );
//!
//! let report = orchestrator
//!     .deploy(DeployRequest {
//!         revision: Revision::new(&config.repository, "feature-x"),
//!         environment: "staging".to_string(),
//!         name: "app".to_string(),
//!         manifest: std::fs::read_to_string("deployment.yaml")?,
//!     })
//!     .await;
//! println!("{}", report.outcome.summary());
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! - [`SourceFetcher`] clones into a self-removing [`Workspace`]
//! - [`ImageBuilder`] builds and pushes `{namespace}/{project}-{branch}` images
//! - [`ManifestRenderer`] owns manifest artifacts and their revision history
//! - [`ClusterController`] talks to the cluster through the [`WorkloadApi`] seam
//! - [`DeploymentMonitor`] polls rollout status with a deadline
//! - [`RemediationEngine`] runs runbooks from a [`RunbookStore`]
//! - [`DeploymentOrchestrator`] sequences all of the above

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod cluster;
pub mod command;
pub mod config;
pub mod error;
pub mod image;
pub mod manifest;
pub mod monitor;
pub mod orchestrator;
pub mod remediation;
pub mod runbook;
pub mod source;
pub mod types;

pub use cluster::{
    ApplyAction, ClusterController, Condition, DeploymentStatus, KubeWorkloadApi, WorkloadApi,
    WorkloadState,
};
pub use command::{CommandOutput, CommandRunner, CommandSpec, ShellRunner};
pub use config::{DeployerConfig, MonitorConfig, MAX_REMEDIATION_ATTEMPTS};
pub use error::{CheckoutKind, ClusterError, DeployError, Result, Stage};
pub use image::{ImageBuilder, ImageRef};
pub use manifest::{DeploymentManifest, ManifestRenderer};
pub use monitor::{DeploymentMonitor, MonitorReport};
pub use orchestrator::{
    DeployRequest, DeploymentOrchestrator, DeploymentOutcome, DeploymentReport, DeploymentState,
    ResumeRequest, RollbackOutcome, Transition, CHECKOUT_GUIDANCE,
};
pub use remediation::{
    AttemptRecord, RemediationActions, RemediationAttempt, RemediationEngine, RemediationOutcome,
};
pub use runbook::{
    DirectoryRunbookStore, RemediationProcedure, RemediationStep, RunbookDocument, RunbookStore,
    StaticRunbookStore,
};
pub use source::{Revision, SourceFetcher, Workspace};
pub use types::DeploymentIdentity;
