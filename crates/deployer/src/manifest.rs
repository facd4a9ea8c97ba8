//! Deployment manifest rendering, persistence and revision history.
//!
//! Artifacts live at `{dir}/deployments-{branch}@{environment}.yaml`, with
//! both parts percent-encoded. Each time a different manifest is rendered for
//! the same identity, the previous artifact is moved into
//! `{dir}/history/{branch}@{environment}/NNNN.yaml`
//! so a rollback can restore it instead of deleting the workload.

use std::path::{Path, PathBuf};

use handlebars::Handlebars;
use k8s_openapi::api::apps::v1::Deployment;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{DeployError, Result};
use crate::types::DeploymentIdentity;

const EXPECTED_API_VERSION: &str = "apps/v1";
const EXPECTED_KIND: &str = "Deployment";
const HISTORY_DIR: &str = "history";

/// A rendered, validated and persisted deployment manifest.
#[derive(Debug, Clone)]
pub struct DeploymentManifest {
    /// Workload name (`metadata.name`)
    pub name: String,
    pub identity: DeploymentIdentity,
    /// Image of the first container
    pub image: Option<String>,
    /// Artifact location
    pub path: PathBuf,
    /// Exact document text as written to disk
    pub raw: String,
    /// Parsed object sent to the cluster
    pub deployment: Deployment,
}

impl DeploymentManifest {
    #[must_use]
    pub fn environment(&self) -> &str {
        &self.identity.environment
    }

    #[must_use]
    pub fn branch(&self) -> &str {
        &self.identity.branch
    }
}

/// Values available to `{{...}}` placeholders in manifest templates.
#[derive(Debug, Serialize)]
struct TemplateContext<'a> {
    image: &'a str,
    branch: &'a str,
    environment: &'a str,
    name: &'a str,
}

/// Renders manifests and owns their on-disk artifacts.
#[derive(Debug, Clone)]
pub struct ManifestRenderer {
    dir: PathBuf,
    history_limit: usize,
}

impl ManifestRenderer {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            history_limit: 5,
        }
    }

    /// Number of previous revisions kept per identity.
    #[must_use]
    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }

    /// Directory artifacts are written to.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Deterministic artifact path for an identity.
    #[must_use]
    pub fn artifact_path(&self, identity: &DeploymentIdentity) -> PathBuf {
        self.dir
            .join(format!("deployments-{}.yaml", identity.file_stem()))
    }

    fn history_dir(&self, identity: &DeploymentIdentity) -> PathBuf {
        self.dir.join(HISTORY_DIR).join(identity.file_stem())
    }

    /// Render `text` for `identity`, validate it and persist it.
    ///
    /// Text containing `{{` is treated as a handlebars template with
    /// `image`, `branch`, `environment` and `name` in scope; anything else is
    /// written verbatim.
    pub fn render(
        &self,
        text: &str,
        identity: &DeploymentIdentity,
        name: &str,
        image: Option<&str>,
    ) -> Result<DeploymentManifest> {
        let failure = |message: String| DeployError::Manifest {
            identity: identity.to_string(),
            message,
        };

        let raw = if text.contains("{{") {
            let image = image.ok_or_else(|| {
                failure("template references values but no image was built".to_string())
            })?;
            render_template(
                text,
                &TemplateContext {
                    image,
                    branch: &identity.branch,
                    environment: &identity.environment,
                    name,
                },
            )
            .map_err(failure)?
        } else {
            text.to_string()
        };

        let path = self.artifact_path(identity);
        let manifest = parse_manifest(&raw, identity, path.clone()).map_err(failure)?;
        if manifest.name != name {
            return Err(failure(format!(
                "metadata.name '{}' does not match deployment name '{name}'",
                manifest.name
            )));
        }

        std::fs::create_dir_all(&self.dir).map_err(|e| {
            failure(format!("failed to create {}: {e}", self.dir.display()))
        })?;
        self.archive_current(identity, &raw);
        std::fs::write(&path, raw.as_bytes())
            .map_err(|e| failure(format!("failed to write {}: {e}", path.display())))?;

        info!(
            identity = %identity,
            path = %path.display(),
            image = ?manifest.image,
            "Rendered deployment manifest"
        );
        Ok(manifest)
    }

    /// Read back the persisted artifact for `identity`.
    pub fn load(&self, identity: &DeploymentIdentity) -> Result<DeploymentManifest> {
        let path = self.artifact_path(identity);
        let raw = std::fs::read_to_string(&path).map_err(|e| DeployError::Manifest {
            identity: identity.to_string(),
            message: format!("failed to read {}: {e}", path.display()),
        })?;
        parse_manifest(&raw, identity, path).map_err(|message| DeployError::Manifest {
            identity: identity.to_string(),
            message,
        })
    }

    /// Whether an artifact exists for `identity`.
    #[must_use]
    pub fn exists(&self, identity: &DeploymentIdentity) -> bool {
        self.artifact_path(identity).is_file()
    }

    /// Most recent previous revision, if any.
    pub fn previous(&self, identity: &DeploymentIdentity) -> Result<Option<DeploymentManifest>> {
        let Some(entry) = self.history_entries(identity).pop() else {
            return Ok(None);
        };
        let raw = std::fs::read_to_string(&entry).map_err(|e| DeployError::Manifest {
            identity: identity.to_string(),
            message: format!("failed to read {}: {e}", entry.display()),
        })?;
        parse_manifest(&raw, identity, entry)
            .map(Some)
            .map_err(|message| DeployError::Manifest {
                identity: identity.to_string(),
                message,
            })
    }

    /// Make the most recent previous revision the current artifact again.
    ///
    /// The history entry is consumed; the replaced artifact is discarded.
    pub fn restore_previous(
        &self,
        identity: &DeploymentIdentity,
    ) -> Result<Option<DeploymentManifest>> {
        let Some(previous) = self.previous(identity)? else {
            return Ok(None);
        };
        let history_entry = previous.path.clone();
        let path = self.artifact_path(identity);

        std::fs::write(&path, previous.raw.as_bytes()).map_err(|e| DeployError::Manifest {
            identity: identity.to_string(),
            message: format!("failed to write {}: {e}", path.display()),
        })?;
        if let Err(e) = std::fs::remove_file(&history_entry) {
            warn!(path = %history_entry.display(), error = %e, "Failed to remove history entry");
        }

        info!(identity = %identity, "Restored previous manifest revision");
        Ok(Some(DeploymentManifest { path, ..previous }))
    }

    /// Delete the artifact. Only called after a confirmed rollback.
    pub fn remove(&self, manifest: &DeploymentManifest) -> Result<()> {
        match std::fs::remove_file(&manifest.path) {
            Ok(()) => {
                info!(path = %manifest.path.display(), "Removed deployment manifest");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(DeployError::Manifest {
                identity: manifest.identity.to_string(),
                message: format!("failed to remove {}: {e}", manifest.path.display()),
            }),
        }
    }

    /// Previous revisions for `identity`, oldest first.
    #[must_use]
    pub fn history_entries(&self, identity: &DeploymentIdentity) -> Vec<PathBuf> {
        let Ok(entries) = std::fs::read_dir(self.history_dir(identity)) else {
            return Vec::new();
        };
        let mut paths: Vec<PathBuf> = entries
            .filter_map(std::result::Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|ext| ext == "yaml"))
            .collect();
        paths.sort();
        paths
    }

    /// Move the current artifact into history unless it equals `incoming`.
    fn archive_current(&self, identity: &DeploymentIdentity, incoming: &str) {
        if self.history_limit == 0 {
            return;
        }
        let current = self.artifact_path(identity);
        let Ok(existing) = std::fs::read_to_string(&current) else {
            return;
        };
        if existing == incoming {
            debug!(identity = %identity, "Manifest unchanged, not archiving");
            return;
        }

        let dir = self.history_dir(identity);
        if let Err(e) = std::fs::create_dir_all(&dir) {
            warn!(path = %dir.display(), error = %e, "Failed to create history directory");
            return;
        }

        let entries = self.history_entries(identity);
        let next = entries
            .last()
            .and_then(|p| p.file_stem())
            .and_then(|s| s.to_str())
            .and_then(|s| s.parse::<u32>().ok())
            .map_or(1, |n| n + 1);
        let target = dir.join(format!("{next:04}.yaml"));
        if let Err(e) = std::fs::write(&target, existing.as_bytes()) {
            warn!(path = %target.display(), error = %e, "Failed to archive manifest");
            return;
        }

        let entries = self.history_entries(identity);
        let excess = entries.len().saturating_sub(self.history_limit);
        for stale in entries.iter().take(excess) {
            if let Err(e) = std::fs::remove_file(stale) {
                warn!(path = %stale.display(), error = %e, "Failed to prune manifest history");
            }
        }
    }
}

fn render_template(text: &str, context: &TemplateContext<'_>) -> std::result::Result<String, String> {
    let mut handlebars = Handlebars::new();
    handlebars.set_strict_mode(true);
    handlebars.register_escape_fn(handlebars::no_escape);
    handlebars
        .render_template(text, context)
        .map_err(|e| format!("template rendering failed: {e}"))
}

/// Parse and validate a manifest document.
fn parse_manifest(
    raw: &str,
    identity: &DeploymentIdentity,
    path: PathBuf,
) -> std::result::Result<DeploymentManifest, String> {
    let value: serde_yaml::Value =
        serde_yaml::from_str(raw).map_err(|e| format!("not valid YAML: {e}"))?;

    let field = |key: &str| value.get(key).and_then(serde_yaml::Value::as_str);
    match field("apiVersion") {
        Some(EXPECTED_API_VERSION) => {}
        Some(other) => return Err(format!("apiVersion must be {EXPECTED_API_VERSION}, got {other}")),
        None => return Err("apiVersion is missing".to_string()),
    }
    match field("kind") {
        Some(EXPECTED_KIND) => {}
        Some(other) => return Err(format!("kind must be {EXPECTED_KIND}, got {other}")),
        None => return Err("kind is missing".to_string()),
    }

    let deployment: Deployment =
        serde_yaml::from_value(value).map_err(|e| format!("not a valid Deployment: {e}"))?;

    let name = deployment
        .metadata
        .name
        .clone()
        .filter(|n| !n.is_empty())
        .ok_or_else(|| "metadata.name is missing".to_string())?;

    if let Some(namespace) = deployment.metadata.namespace.as_deref() {
        if namespace != identity.environment {
            return Err(format!(
                "metadata.namespace '{namespace}' does not match environment '{}'",
                identity.environment
            ));
        }
    }

    let containers = deployment
        .spec
        .as_ref()
        .and_then(|spec| spec.template.spec.as_ref())
        .map(|pod| pod.containers.as_slice())
        .unwrap_or_default();
    let Some(first) = containers.first() else {
        return Err("spec.template.spec.containers must not be empty".to_string());
    };
    let image = first.image.clone();

    Ok(DeploymentManifest {
        name,
        identity: identity.clone(),
        image,
        path,
        raw: raw.to_string(),
        deployment,
    })
}
