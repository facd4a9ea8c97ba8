//! Container image build and push.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::command::{CommandRunner, CommandSpec};
use crate::error::{DeployError, Result};
use crate::source::{Revision, Workspace};

/// Mutable tag every image receives.
pub const LATEST_TAG: &str = "latest";

/// Length of the commit prefix used for pinned tags.
const SHORT_COMMIT_LEN: usize = 12;

/// Image reference derived from a revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    pub namespace: String,
    pub project: String,
    pub branch: String,
    pub tag: String,
    /// Commit the image was built from, when known
    pub revision: Option<String>,
}

impl ImageRef {
    /// Image for `branch`, tagged `latest`.
    pub fn new(
        namespace: impl Into<String>,
        project: impl Into<String>,
        branch: &str,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            project: project.into(),
            branch: sanitize_tag_component(branch),
            tag: LATEST_TAG.to_string(),
            revision: None,
        }
    }

    /// Attach the commit the image is built from.
    #[must_use]
    pub fn with_revision(mut self, commit: Option<String>) -> Self {
        self.revision = commit.filter(|c| !c.is_empty());
        self
    }

    /// Repository part, `{namespace}/{project}-{branch}`.
    #[must_use]
    pub fn repository(&self) -> String {
        format!("{}/{}-{}", self.namespace, self.project, self.branch)
    }

    /// `{namespace}/{project}-{branch}:latest`
    #[must_use]
    pub fn reference(&self) -> String {
        format!("{}:{}", self.repository(), self.tag)
    }

    /// Reference addressed by commit, if the commit is known.
    #[must_use]
    pub fn pinned_reference(&self) -> Option<String> {
        self.revision.as_ref().map(|commit| {
            let short: String = commit.chars().take(SHORT_COMMIT_LEN).collect();
            format!("{}:{short}", self.repository())
        })
    }

    /// Reference manifests should point at: pinned when possible.
    #[must_use]
    pub fn deploy_reference(&self) -> String {
        self.pinned_reference().unwrap_or_else(|| self.reference())
    }

    /// All tags this image is built and pushed under.
    #[must_use]
    pub fn all_references(&self) -> Vec<String> {
        let mut refs = vec![self.reference()];
        refs.extend(self.pinned_reference());
        refs
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.reference())
    }
}

/// Make a branch name usable inside an image name.
fn sanitize_tag_component(branch: &str) -> String {
    let sanitized: String = branch
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect();
    sanitized.trim_matches(|c| c == '-' || c == '.').to_string()
}

/// Builds and pushes images with the docker CLI.
#[derive(Clone)]
pub struct ImageBuilder {
    runner: Arc<dyn CommandRunner>,
    namespace: String,
    project: String,
    pin_images: bool,
}

impl ImageBuilder {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        namespace: impl Into<String>,
        project: impl Into<String>,
    ) -> Self {
        Self {
            runner,
            namespace: namespace.into(),
            project: project.into(),
            pin_images: true,
        }
    }

    /// Also tag images with the commit they were built from.
    #[must_use]
    pub fn with_pinning(mut self, pin_images: bool) -> Self {
        self.pin_images = pin_images;
        self
    }

    /// Image reference `revision` will be built as.
    #[must_use]
    pub fn image_for(&self, revision: &Revision, commit: Option<String>) -> ImageRef {
        let image = ImageRef::new(&self.namespace, &self.project, &revision.reference);
        if self.pin_images {
            image.with_revision(commit)
        } else {
            image
        }
    }

    /// Build the workspace into an image.
    pub async fn build(
        &self,
        workspace: &Workspace,
        revision: &Revision,
        commit: Option<String>,
    ) -> Result<ImageRef> {
        let image = self.image_for(revision, commit);
        let build_failure = |message: String| DeployError::Build {
            branch: revision.reference.clone(),
            message,
        };

        let mut args = vec!["build".to_string()];
        for reference in image.all_references() {
            args.push("-t".to_string());
            args.push(reference);
        }
        args.push(".".to_string());

        info!(image = %image, pinned = ?image.pinned_reference(), "Building image");

        let spec = CommandSpec::new("docker", args).in_dir(workspace.path());
        match self.runner.run(spec).await {
            Ok(output) if output.success => Ok(image),
            Ok(output) => Err(build_failure(output.failure_message())),
            Err(e) => Err(build_failure(format!("failed to run docker build: {e}"))),
        }
    }

    /// Upload every tag of `image` to the registry.
    pub async fn push(&self, image: &ImageRef) -> Result<()> {
        for reference in image.all_references() {
            info!(image = %reference, "Pushing image");

            let push_failure = |message: String| DeployError::Push {
                image: reference.clone(),
                message,
            };
            let spec = CommandSpec::new("docker", ["push".to_string(), reference.clone()]);
            match self.runner.run(spec).await {
                Ok(output) if output.success => {}
                Ok(output) => return Err(push_failure(output.failure_message())),
                Err(e) => return Err(push_failure(format!("failed to run docker push: {e}"))),
            }
        }
        Ok(())
    }
}
