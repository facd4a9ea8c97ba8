//! Shared identifiers.

use std::fmt;

use serde::{Deserialize, Serialize};

/// The (branch, environment) pair identifying a logical deployment target.
///
/// Keys manifest artifacts, remediation counters and run locks.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeploymentIdentity {
    pub branch: String,
    pub environment: String,
}

impl DeploymentIdentity {
    pub fn new(branch: impl Into<String>, environment: impl Into<String>) -> Self {
        Self {
            branch: branch.into(),
            environment: environment.into(),
        }
    }

    /// `{branch}@{environment}` with both parts percent-encoded, for file names.
    ///
    /// Distinct identities always get distinct stems: `/` and `@` are
    /// encoded inside each part, so the stem is a single path component and
    /// the separator is unambiguous.
    #[must_use]
    pub fn file_stem(&self) -> String {
        format!(
            "{}@{}",
            urlencoding::encode(&self.branch),
            urlencoding::encode(&self.environment)
        )
    }
}

impl fmt::Display for DeploymentIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.branch, self.environment)
    }
}
