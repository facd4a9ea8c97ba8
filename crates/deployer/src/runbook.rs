//! Remediation procedures (runbooks) and their lookup by failure signature.
//!
//! A runbook is a JSON or YAML document:
//!
//! ```json
//! {
//!   "name": "image-pull-error",
//!   "description": "The cluster cannot pull the deployed image",
//!   "matches": ["^monitor:(ImagePullBackOff|ErrImagePull)$"],
//!   "steps": [
//!     { "action": "note", "text": "Check the image exists in the registry" },
//!     { "action": "rollback" }
//!   ]
//! }
//! ```

use std::path::Path;

use anyhow::{Context, Result as AnyResult};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{DeployError, Result};

/// One step of a remediation procedure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RemediationStep {
    /// Apply the persisted manifest again and monitor it
    Redeploy,
    /// Restore the previous manifest revision and monitor it
    Rollback,
    /// Pause before the next step
    Wait { seconds: u64 },
    /// Run an external command; a non-zero exit stops the procedure
    Command {
        program: String,
        #[serde(default)]
        args: Vec<String>,
    },
    /// Documented manual step, logged for the operator
    Note { text: String },
}

/// Serialized form of a runbook.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunbookDocument {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Regular expressions matched against failure signatures
    pub matches: Vec<String>,
    pub steps: Vec<RemediationStep>,
}

/// A named, ordered remediation procedure for a failure class.
#[derive(Debug, Clone)]
pub struct RemediationProcedure {
    pub name: String,
    pub description: String,
    patterns: Vec<Regex>,
    pub steps: Vec<RemediationStep>,
}

impl RemediationProcedure {
    /// Compile a document into a procedure.
    pub fn from_document(document: RunbookDocument) -> AnyResult<Self> {
        if document.matches.is_empty() {
            anyhow::bail!("runbook '{}' has no match patterns", document.name);
        }
        let patterns = document
            .matches
            .iter()
            .map(|pattern| {
                Regex::new(pattern).with_context(|| {
                    format!("runbook '{}' has an invalid pattern '{pattern}'", document.name)
                })
            })
            .collect::<AnyResult<Vec<_>>>()?;

        Ok(Self {
            name: document.name,
            description: document.description,
            patterns,
            steps: document.steps,
        })
    }

    /// Whether this procedure handles `signature`.
    #[must_use]
    pub fn matches(&self, signature: &str) -> bool {
        self.patterns.iter().any(|p| p.is_match(signature))
    }
}

/// Keyed lookup of remediation procedures.
pub trait RunbookStore: Send + Sync {
    /// Procedure for `signature`, or `RunbookNotFound`.
    fn lookup(&self, signature: &str) -> Result<RemediationProcedure>;
}

/// In-memory store.
#[derive(Debug, Clone, Default)]
pub struct StaticRunbookStore {
    procedures: Vec<RemediationProcedure>,
}

impl StaticRunbookStore {
    /// Store over `procedures`, consulted in name order.
    #[must_use]
    pub fn new(mut procedures: Vec<RemediationProcedure>) -> Self {
        procedures.sort_by(|a, b| a.name.cmp(&b.name));
        Self { procedures }
    }

    /// Build a store from documents.
    pub fn from_documents(documents: Vec<RunbookDocument>) -> AnyResult<Self> {
        let procedures = documents
            .into_iter()
            .map(RemediationProcedure::from_document)
            .collect::<AnyResult<Vec<_>>>()?;
        Ok(Self::new(procedures))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.procedures.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.procedures.is_empty()
    }
}

impl RunbookStore for StaticRunbookStore {
    fn lookup(&self, signature: &str) -> Result<RemediationProcedure> {
        let procedure = self
            .procedures
            .iter()
            .find(|p| p.matches(signature))
            .cloned()
            .ok_or_else(|| DeployError::RunbookNotFound {
                signature: signature.to_string(),
            })?;
        debug!(signature, runbook = %procedure.name, "Resolved runbook");
        Ok(procedure)
    }
}

/// Store loaded from `*.json`, `*.yaml` and `*.yml` files in a directory.
#[derive(Debug, Clone)]
pub struct DirectoryRunbookStore {
    inner: StaticRunbookStore,
}

impl DirectoryRunbookStore {
    /// Load every runbook in `dir`. A missing directory yields an empty store.
    pub fn load(dir: &Path) -> AnyResult<Self> {
        if !dir.is_dir() {
            info!(path = %dir.display(), "Runbook directory not found, no runbooks loaded");
            return Ok(Self {
                inner: StaticRunbookStore::default(),
            });
        }

        let mut documents = Vec::new();
        for entry in std::fs::read_dir(dir)
            .with_context(|| format!("Failed to read runbook directory {}", dir.display()))?
        {
            let path = entry?.path();
            let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
                continue;
            };
            let raw = match ext {
                "json" | "yaml" | "yml" => std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read runbook {}", path.display()))?,
                _ => continue,
            };
            let document: RunbookDocument = if ext == "json" {
                serde_json::from_str(&raw)
                    .with_context(|| format!("Failed to parse runbook {}", path.display()))?
            } else {
                serde_yaml::from_str(&raw)
                    .with_context(|| format!("Failed to parse runbook {}", path.display()))?
            };
            documents.push(document);
        }

        let inner = StaticRunbookStore::from_documents(documents)?;
        info!(path = %dir.display(), count = inner.len(), "Loaded runbooks");
        Ok(Self { inner })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl RunbookStore for DirectoryRunbookStore {
    fn lookup(&self, signature: &str) -> Result<RemediationProcedure> {
        self.inner.lookup(signature)
    }
}
