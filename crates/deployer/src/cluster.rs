//! Cluster operations on a single `apps/v1` Deployment.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use crate::error::{ClusterError, DeployError, Result};
use crate::manifest::DeploymentManifest;

/// Condition type that marks a rollout as done.
pub const AVAILABLE_CONDITION: &str = "Available";

/// Container waiting reasons that are part of a normal start.
const BENIGN_WAITING_REASONS: &[&str] = &["ContainerCreating", "PodInitializing"];

/// A named boolean-state entry from `status.conditions[]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    /// Condition type: "Available", "Progressing", "ReplicaFailure"
    pub kind: String,
    pub status: bool,
    pub reason: Option<String>,
    pub message: Option<String>,
}

impl Condition {
    pub fn new(kind: impl Into<String>, status: bool) -> Self {
        Self {
            kind: kind.into(),
            status,
            reason: None,
            message: None,
        }
    }

    #[must_use]
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// Lifecycle of a managed workload as seen from the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkloadState {
    Absent,
    Creating,
    Progressing,
    Available,
    Failed,
}

/// Snapshot of a Deployment's status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentStatus {
    pub exists: bool,
    pub conditions: Vec<Condition>,
    /// Why containers of the workload's pods are waiting (e.g. `ImagePullBackOff`)
    pub waiting_reasons: Vec<String>,
    pub replicas: i32,
    pub ready_replicas: i32,
}

impl DeploymentStatus {
    /// Status of a workload that does not exist.
    #[must_use]
    pub fn absent() -> Self {
        Self::default()
    }

    /// Status of an existing workload with the given conditions.
    #[must_use]
    pub fn with_conditions(conditions: Vec<Condition>) -> Self {
        Self {
            exists: true,
            conditions,
            ..Self::default()
        }
    }

    fn condition(&self, kind: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.kind == kind)
    }

    /// True when an `Available` condition reports a true state.
    #[must_use]
    pub fn is_available(&self) -> bool {
        self.condition(AVAILABLE_CONDITION).is_some_and(|c| c.status)
    }

    #[must_use]
    pub fn state(&self) -> WorkloadState {
        if !self.exists {
            return WorkloadState::Absent;
        }
        if self.is_available() {
            return WorkloadState::Available;
        }
        let replica_failure = self.condition("ReplicaFailure").is_some_and(|c| c.status);
        let stalled = self.condition("Progressing").is_some_and(|c| !c.status);
        if replica_failure || stalled {
            return WorkloadState::Failed;
        }
        if self.conditions.is_empty() {
            WorkloadState::Creating
        } else {
            WorkloadState::Progressing
        }
    }

    /// Most specific explanation for a workload that is not available.
    #[must_use]
    pub fn failure_reason(&self) -> Option<String> {
        if let Some(reason) = self.waiting_reasons.first() {
            return Some(reason.clone());
        }
        for kind in ["ReplicaFailure", "Progressing"] {
            if let Some(condition) = self.condition(kind) {
                let failing = if kind == "ReplicaFailure" {
                    condition.status
                } else {
                    !condition.status
                };
                if failing {
                    if let Some(reason) = &condition.reason {
                        return Some(reason.clone());
                    }
                }
            }
        }
        if self.exists {
            None
        } else {
            Some("NotFound".to_string())
        }
    }

    /// Build a snapshot from a Deployment object.
    #[must_use]
    pub fn from_deployment(deployment: &Deployment) -> Self {
        let status = deployment.status.as_ref();
        let conditions = status
            .and_then(|s| s.conditions.as_ref())
            .map(|conditions| {
                conditions
                    .iter()
                    .map(|c| Condition {
                        kind: c.type_.clone(),
                        status: c.status == "True",
                        reason: c.reason.clone(),
                        message: c.message.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default();

        Self {
            exists: true,
            conditions,
            waiting_reasons: Vec::new(),
            replicas: status.and_then(|s| s.replicas).unwrap_or_default(),
            ready_replicas: status.and_then(|s| s.ready_replicas).unwrap_or_default(),
        }
    }
}

/// Outcome of [`ClusterController::apply`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyAction {
    Created,
    Replaced,
}

/// Raw Deployment operations against a cluster.
///
/// Abstracted so the controller logic can be tested without an API server.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait WorkloadApi: Send + Sync {
    /// Create the Deployment in `namespace`.
    async fn create(&self, namespace: &str, deployment: &Deployment) -> std::result::Result<(), ClusterError>;

    /// Replace the existing Deployment `name` in `namespace`.
    async fn replace(
        &self,
        namespace: &str,
        name: &str,
        deployment: &Deployment,
    ) -> std::result::Result<(), ClusterError>;

    /// Delete the Deployment `name` in `namespace`.
    async fn delete(&self, namespace: &str, name: &str) -> std::result::Result<(), ClusterError>;

    /// Read the status of Deployment `name` in `namespace`.
    async fn status(&self, namespace: &str, name: &str) -> std::result::Result<DeploymentStatus, ClusterError>;
}

/// [`WorkloadApi`] backed by a Kubernetes client.
///
/// The client is built once by the caller and shared by every operation.
#[derive(Clone)]
pub struct KubeWorkloadApi {
    client: Client,
}

impl KubeWorkloadApi {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn deployments(&self, namespace: &str) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), namespace)
    }

    /// Reasons the workload's containers are waiting, from its pods.
    async fn waiting_reasons(&self, namespace: &str, deployment: &Deployment) -> Vec<String> {
        let Some(match_labels) = deployment
            .spec
            .as_ref()
            .and_then(|spec| spec.selector.match_labels.as_ref())
        else {
            return Vec::new();
        };
        let selector = label_selector(match_labels);

        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let list = match pods.list(&ListParams::default().labels(&selector)).await {
            Ok(list) => list,
            Err(e) => {
                warn!(selector = %selector, error = %e, "Failed to list pods for status");
                return Vec::new();
            }
        };

        let mut reasons: Vec<String> = Vec::new();
        for pod in list.items {
            let statuses = pod
                .status
                .and_then(|s| s.container_statuses)
                .unwrap_or_default();
            for status in statuses {
                let reason = status
                    .state
                    .and_then(|state| state.waiting)
                    .and_then(|waiting| waiting.reason);
                if let Some(reason) = reason {
                    if !BENIGN_WAITING_REASONS.contains(&reason.as_str()) && !reasons.contains(&reason) {
                        reasons.push(reason);
                    }
                }
            }
        }
        reasons
    }
}

fn label_selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

#[async_trait]
impl WorkloadApi for KubeWorkloadApi {
    async fn create(&self, namespace: &str, deployment: &Deployment) -> std::result::Result<(), ClusterError> {
        self.deployments(namespace)
            .create(&PostParams::default(), deployment)
            .await?;
        Ok(())
    }

    async fn replace(
        &self,
        namespace: &str,
        name: &str,
        deployment: &Deployment,
    ) -> std::result::Result<(), ClusterError> {
        let api = self.deployments(namespace);
        let existing = api.get(name).await?;

        let mut updated = deployment.clone();
        updated.metadata.resource_version = existing.metadata.resource_version;
        api.replace(name, &PostParams::default(), &updated).await?;
        Ok(())
    }

    async fn delete(&self, namespace: &str, name: &str) -> std::result::Result<(), ClusterError> {
        self.deployments(namespace)
            .delete(name, &DeleteParams::default())
            .await?;
        Ok(())
    }

    async fn status(&self, namespace: &str, name: &str) -> std::result::Result<DeploymentStatus, ClusterError> {
        let deployment = self.deployments(namespace).get(name).await?;
        let mut status = DeploymentStatus::from_deployment(&deployment);
        if !status.is_available() {
            status.waiting_reasons = self.waiting_reasons(namespace, &deployment).await;
        }
        Ok(status)
    }
}

/// Applies, deletes and inspects one workload per call.
#[derive(Clone)]
pub struct ClusterController {
    api: Arc<dyn WorkloadApi>,
}

impl ClusterController {
    pub fn new(api: Arc<dyn WorkloadApi>) -> Self {
        Self { api }
    }

    /// Create the manifest's Deployment, replacing it in place if it exists.
    pub async fn apply(&self, manifest: &DeploymentManifest, environment: &str) -> Result<ApplyAction> {
        let failure = |source: ClusterError| DeployError::Deployment {
            name: manifest.name.clone(),
            namespace: environment.to_string(),
            source,
        };

        match self.api.create(environment, &manifest.deployment).await {
            Ok(()) => {
                info!(name = %manifest.name, namespace = environment, "Created deployment");
                Ok(ApplyAction::Created)
            }
            Err(ClusterError::Conflict) => {
                debug!(name = %manifest.name, namespace = environment, "Deployment exists, replacing");
                self.api
                    .replace(environment, &manifest.name, &manifest.deployment)
                    .await
                    .map_err(failure)?;
                info!(name = %manifest.name, namespace = environment, "Replaced deployment");
                Ok(ApplyAction::Replaced)
            }
            Err(e) => Err(failure(e)),
        }
    }

    /// Remove the workload. A workload that is already gone counts as removed.
    pub async fn delete(&self, name: &str, environment: &str) -> Result<()> {
        match self.api.delete(environment, name).await {
            Ok(()) => {
                info!(name, namespace = environment, "Deleted deployment");
                Ok(())
            }
            Err(ClusterError::NotFound) => {
                debug!(name, namespace = environment, "Deployment already absent");
                Ok(())
            }
            Err(e) => Err(DeployError::Rollback {
                name: name.to_string(),
                namespace: environment.to_string(),
                message: e.to_string(),
            }),
        }
    }

    /// Single status read. A missing workload is reported as absent.
    pub async fn get_status(&self, name: &str, environment: &str) -> Result<DeploymentStatus> {
        match self.api.status(environment, name).await {
            Ok(status) => Ok(status),
            Err(ClusterError::NotFound) => Ok(DeploymentStatus::absent()),
            Err(source) => Err(DeployError::Deployment {
                name: name.to_string(),
                namespace: environment.to_string(),
                source,
            }),
        }
    }
}
