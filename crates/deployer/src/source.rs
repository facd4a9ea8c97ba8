//! Source checkout into isolated, self-cleaning workspaces.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use tracing::{debug, info, warn};

use crate::command::{CommandRunner, CommandSpec};
use crate::error::{CheckoutKind, DeployError, Result};

/// Directory name of the clone inside the workspace.
const CHECKOUT_DIR: &str = "src";

/// What to build: a repository and the ref to check out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Revision {
    pub repository: String,
    pub reference: String,
}

impl Revision {
    pub fn new(repository: impl Into<String>, reference: impl Into<String>) -> Self {
        Self {
            repository: repository.into(),
            reference: reference.into(),
        }
    }
}

/// Ephemeral directory owning one checked-out revision.
///
/// The directory is removed when the workspace is released or dropped,
/// so every exit path of a run gives it back.
#[derive(Debug)]
pub struct Workspace {
    root: Option<TempDir>,
    checkout: PathBuf,
}

impl Workspace {
    /// Root of the working tree.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.checkout
    }

    /// Directory that holds the working tree and is removed on release.
    #[must_use]
    pub fn root(&self) -> Option<&Path> {
        self.root.as_ref().map(TempDir::path)
    }

    /// Remove the workspace. Failures are logged, never returned.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        let Some(root) = self.root.take() else {
            return;
        };
        let path = root.path().to_path_buf();
        match root.close() {
            Ok(()) => debug!(path = %path.display(), "Released workspace"),
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove workspace"),
        }
    }
}

#[cfg(test)]
impl Workspace {
    /// Empty workspace that is not backed by a clone.
    pub(crate) fn for_tests() -> Self {
        let root = TempDir::new().expect("temp dir");
        let checkout = root.path().to_path_buf();
        Self {
            root: Some(root),
            checkout,
        }
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        self.release_inner();
    }
}

/// Clones repositories and checks out refs with git.
#[derive(Clone)]
pub struct SourceFetcher {
    runner: Arc<dyn CommandRunner>,
}

impl SourceFetcher {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    /// Clone `repository` into a fresh workspace.
    ///
    /// On any failure the partially created directory is removed before the
    /// error is returned.
    pub async fn fetch(&self, repository: &str) -> Result<Workspace> {
        let clone_failure = |message: String| DeployError::Checkout {
            kind: CheckoutKind::Clone,
            target: repository.to_string(),
            message,
        };

        let root = tempfile::Builder::new()
            .prefix("deployer-")
            .tempdir()
            .map_err(|e| clone_failure(format!("failed to create workspace: {e}")))?;
        let workspace = Workspace {
            checkout: root.path().join(CHECKOUT_DIR),
            root: Some(root),
        };

        info!(repository, path = %workspace.path().display(), "Cloning repository");

        let spec = CommandSpec::new(
            "git",
            [
                "clone".to_string(),
                repository.to_string(),
                workspace.path().display().to_string(),
            ],
        );

        match self.runner.run(spec).await {
            Ok(output) if output.success => Ok(workspace),
            Ok(output) => {
                let message = output.failure_message();
                workspace.release();
                Err(clone_failure(message))
            }
            Err(e) => {
                workspace.release();
                Err(clone_failure(format!("failed to run git clone: {e}")))
            }
        }
    }

    /// Switch the workspace's working tree to `reference`.
    pub async fn checkout(&self, workspace: &Workspace, reference: &str) -> Result<()> {
        let ref_failure = |message: String| DeployError::Checkout {
            kind: CheckoutKind::Ref,
            target: reference.to_string(),
            message,
        };

        if reference.trim().is_empty() || reference.starts_with('-') {
            return Err(ref_failure("not a valid ref name".to_string()));
        }

        info!(reference, "Checking out ref");

        let spec = CommandSpec::new("git", ["checkout", reference]).in_dir(workspace.path());
        match self.runner.run(spec).await {
            Ok(output) if output.success => Ok(()),
            Ok(output) => Err(ref_failure(output.failure_message())),
            Err(e) => Err(ref_failure(format!("failed to run git checkout: {e}"))),
        }
    }

    /// Commit hash of the checked-out tree, if git can tell.
    pub async fn resolve_commit(&self, workspace: &Workspace) -> Option<String> {
        let spec = CommandSpec::new("git", ["rev-parse", "HEAD"]).in_dir(workspace.path());
        match self.runner.run(spec).await {
            Ok(output) if output.success => {
                let commit = output.stdout.trim().to_string();
                (!commit.is_empty()).then_some(commit)
            }
            Ok(output) => {
                warn!(error = %output.failure_message(), "Could not resolve commit");
                None
            }
            Err(e) => {
                warn!(error = %e, "Could not resolve commit");
                None
            }
        }
    }

    /// Remove a workspace. Never fails the run.
    pub fn release(&self, workspace: Workspace) {
        workspace.release();
    }
}
