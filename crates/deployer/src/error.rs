//! Error types for the deployment lifecycle.
//!
//! Every lifecycle stage raises its own variant so the orchestrator can
//! decide between remediation and escalation, and so a failure signature
//! can be derived for runbook lookup.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result alias used throughout the library.
pub type Result<T> = std::result::Result<T, DeployError>;

/// Lifecycle stage that produced a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Checkout,
    Build,
    Push,
    Manifest,
    Deployment,
    Rollback,
    Monitor,
    Remediation,
}

impl Stage {
    /// Stable lowercase name, used as the first segment of a failure signature.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Checkout => "checkout",
            Self::Build => "build",
            Self::Push => "push",
            Self::Manifest => "manifest",
            Self::Deployment => "deployment",
            Self::Rollback => "rollback",
            Self::Monitor => "monitor",
            Self::Remediation => "remediation",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which part of the source checkout failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckoutKind {
    /// The repository could not be cloned
    Clone,
    /// The requested ref does not resolve
    Ref,
}

impl fmt::Display for CheckoutKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Clone => f.write_str("clone"),
            Self::Ref => f.write_str("ref"),
        }
    }
}

/// Errors raised by the deployment lifecycle components.
#[derive(Debug, Error)]
pub enum DeployError {
    /// Clone or checkout of the source failed
    #[error("checkout failed ({kind}) for '{target}': {message}")]
    Checkout {
        kind: CheckoutKind,
        target: String,
        message: String,
    },

    /// Container image build failed
    #[error("failed to build image for branch '{branch}': {message}")]
    Build { branch: String, message: String },

    /// Container image push failed
    #[error("failed to push image '{image}': {message}")]
    Push { image: String, message: String },

    /// Manifest could not be rendered, validated or persisted
    #[error("manifest for '{identity}' is invalid: {message}")]
    Manifest { identity: String, message: String },

    /// Cluster apply or status read failed
    #[error("deployment '{name}' in '{namespace}' failed: {source}")]
    Deployment {
        name: String,
        namespace: String,
        #[source]
        source: ClusterError,
    },

    /// Rollback of a deployment failed
    #[error("rollback of '{name}' in '{namespace}' failed: {message}")]
    Rollback {
        name: String,
        namespace: String,
        message: String,
    },

    /// A status read failed while monitoring
    #[error("monitoring '{name}' in '{namespace}' failed: {source}")]
    Monitor {
        name: String,
        namespace: String,
        #[source]
        source: Box<DeployError>,
    },

    /// The workload never reported Available within the timeout
    #[error("deployment '{name}' in '{namespace}' not available after {waited_secs}s{}", timeout_detail(.reason))]
    MonitorTimeout {
        name: String,
        namespace: String,
        waited_secs: u64,
        reason: Option<String>,
    },

    /// No remediation procedure matches the failure signature
    #[error("no runbook matches failure signature '{signature}'")]
    RunbookNotFound { signature: String },

    /// The remediation attempt budget is spent
    #[error("remediation exhausted after {attempts} attempts: {summary}")]
    RemediationExhausted { attempts: u32, summary: String },
}

fn timeout_detail(reason: &Option<String>) -> String {
    reason
        .as_deref()
        .map(|r| format!(" ({r})"))
        .unwrap_or_default()
}

impl DeployError {
    /// Stage that produced this error.
    #[must_use]
    pub fn stage(&self) -> Stage {
        match self {
            Self::Checkout { .. } => Stage::Checkout,
            Self::Build { .. } => Stage::Build,
            Self::Push { .. } => Stage::Push,
            Self::Manifest { .. } => Stage::Manifest,
            Self::Deployment { .. } => Stage::Deployment,
            Self::Rollback { .. } => Stage::Rollback,
            Self::Monitor { .. } | Self::MonitorTimeout { .. } => Stage::Monitor,
            Self::RunbookNotFound { .. } | Self::RemediationExhausted { .. } => Stage::Remediation,
        }
    }

    /// Failure signature used to look up a remediation runbook.
    ///
    /// Shape is `stage` or `stage:reason`, e.g. `monitor:ImagePullBackOff`.
    #[must_use]
    pub fn signature(&self) -> String {
        let reason = match self {
            Self::Checkout { kind, .. } => Some(kind.to_string()),
            Self::Deployment { source, .. } => source.reason().map(str::to_string),
            Self::Monitor { source, .. } => match source.as_ref() {
                Self::Deployment { source, .. } => source.reason().map(str::to_string),
                _ => None,
            },
            Self::MonitorTimeout { reason, .. } => reason.clone(),
            _ => None,
        };

        match reason {
            Some(reason) if !reason.is_empty() => format!("{}:{reason}", self.stage()),
            _ => self.stage().to_string(),
        }
    }

    /// Build and push failures escalate the same way.
    #[must_use]
    pub fn is_build_related(&self) -> bool {
        matches!(self, Self::Build { .. } | Self::Push { .. })
    }

    /// Checkout failures are never remediated automatically.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Checkout { .. } | Self::RemediationExhausted { .. }
        )
    }
}

/// Errors from the cluster API seam.
#[derive(Debug, Clone, Error)]
pub enum ClusterError {
    /// The object already exists (HTTP 409)
    #[error("object already exists")]
    Conflict,

    /// The object does not exist (HTTP 404)
    #[error("object not found")]
    NotFound,

    /// Any other API status
    #[error("API error {code} ({reason}): {message}")]
    Api {
        code: u16,
        reason: String,
        message: String,
    },

    /// Connection, TLS, auth plumbing or serialization failure
    #[error("transport error: {0}")]
    Transport(String),
}

impl ClusterError {
    /// Machine-readable reason, if the API supplied one.
    #[must_use]
    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Conflict => Some("AlreadyExists"),
            Self::NotFound => Some("NotFound"),
            Self::Api { reason, .. } if !reason.is_empty() => Some(reason.as_str()),
            Self::Api { .. } | Self::Transport(_) => None,
        }
    }
}

impl From<kube::Error> for ClusterError {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(ae) if ae.code == 409 => Self::Conflict,
            kube::Error::Api(ae) if ae.code == 404 => Self::NotFound,
            kube::Error::Api(ae) => Self::Api {
                code: ae.code,
                reason: ae.reason,
                message: ae.message,
            },
            other => Self::Transport(other.to_string()),
        }
    }
}
