//! Deployer configuration.
//!
//! Loaded from a YAML file (all fields optional) and then overridden by
//! `DEPLOYER_*` environment variables.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Hard ceiling on automated remediation attempts per deployment identity.
pub const MAX_REMEDIATION_ATTEMPTS: u32 = 3;

const ENV_REPOSITORY: &str = "DEPLOYER_REPOSITORY";
const ENV_REGISTRY_NAMESPACE: &str = "DEPLOYER_REGISTRY_NAMESPACE";
const ENV_PROJECT: &str = "DEPLOYER_PROJECT";
const ENV_MANIFEST_DIR: &str = "DEPLOYER_MANIFEST_DIR";
const ENV_RUNBOOK_DIR: &str = "DEPLOYER_RUNBOOK_DIR";

/// Top-level configuration for the deployer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DeployerConfig {
    /// Repository clone URL
    pub repository: String,

    /// Registry namespace images are pushed under (e.g. `acme`)
    pub registry_namespace: String,

    /// Project name, combined with the branch into the image name
    pub project: String,

    /// Directory holding rendered manifest artifacts
    pub manifest_dir: PathBuf,

    /// Directory holding remediation runbooks
    pub runbook_dir: PathBuf,

    /// Rollout monitoring settings
    pub monitor: MonitorConfig,

    /// Automated remediation cycles per deployment identity (at most 3)
    pub max_remediation_attempts: u32,

    /// Also tag images with the short commit and deploy that tag
    pub pin_images: bool,

    /// Previous manifest revisions kept per deployment identity
    pub history_limit: usize,

    /// Optional timeout for git/docker subprocesses
    pub command_timeout_secs: Option<u64>,

    /// Kubeconfig context to use instead of the current one
    pub kube_context: Option<String>,
}

/// Polling settings for rollout monitoring.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MonitorConfig {
    /// Give up waiting for Available after this many seconds
    pub timeout_secs: u64,
    /// Seconds between status reads
    pub interval_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 120,
            interval_secs: 5,
        }
    }
}

impl MonitorConfig {
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl Default for DeployerConfig {
    fn default() -> Self {
        Self {
            repository: "https://github.com/acme/app.git".to_string(),
            registry_namespace: "acme".to_string(),
            project: "app".to_string(),
            manifest_dir: PathBuf::from("deployments"),
            runbook_dir: PathBuf::from("runbooks"),
            monitor: MonitorConfig::default(),
            max_remediation_attempts: MAX_REMEDIATION_ATTEMPTS,
            pin_images: true,
            history_limit: 5,
            command_timeout_secs: None,
            kube_context: None,
        }
    }
}

impl DeployerConfig {
    /// Load configuration from `path`, falling back to defaults when the file
    /// does not exist, then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config {}", path.display()))?;
            serde_yaml::from_str::<Self>(&raw)
                .with_context(|| format!("Failed to parse config {}", path.display()))?
        } else {
            debug!(path = %path.display(), "Config file not found, using defaults");
            Self::default()
        };

        config.apply_env();
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    /// Apply `DEPLOYER_*` environment overrides.
    pub fn apply_env(&mut self) {
        if let Ok(value) = std::env::var(ENV_REPOSITORY) {
            self.repository = value;
        }
        if let Ok(value) = std::env::var(ENV_REGISTRY_NAMESPACE) {
            self.registry_namespace = value;
        }
        if let Ok(value) = std::env::var(ENV_PROJECT) {
            self.project = value;
        }
        if let Ok(value) = std::env::var(ENV_MANIFEST_DIR) {
            self.manifest_dir = PathBuf::from(value);
        }
        if let Ok(value) = std::env::var(ENV_RUNBOOK_DIR) {
            self.runbook_dir = PathBuf::from(value);
        }
    }

    fn normalize(&mut self) {
        if self.max_remediation_attempts > MAX_REMEDIATION_ATTEMPTS {
            warn!(
                requested = self.max_remediation_attempts,
                cap = MAX_REMEDIATION_ATTEMPTS,
                "Clamping remediation attempts to the hard cap"
            );
            self.max_remediation_attempts = MAX_REMEDIATION_ATTEMPTS;
        }
    }

    /// Reject configurations the orchestrator cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.repository.trim().is_empty() {
            bail!("repository must not be empty");
        }
        if self.registry_namespace.trim().is_empty() {
            bail!("registryNamespace must not be empty");
        }
        if self.project.trim().is_empty() {
            bail!("project must not be empty");
        }
        if self.monitor.interval_secs == 0 {
            bail!("monitor.intervalSecs must be greater than zero");
        }
        Ok(())
    }

    /// Subprocess timeout, if configured.
    #[must_use]
    pub fn command_timeout(&self) -> Option<Duration> {
        self.command_timeout_secs.map(Duration::from_secs)
    }
}
