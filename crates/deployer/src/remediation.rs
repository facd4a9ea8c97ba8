//! Bounded, runbook-driven remediation of failed deployments.
//!
//! Each deployment identity gets at most `max_attempts` remediation cycles.
//! The attempt after the last one does not run any step; it returns
//! [`RemediationOutcome::Exhausted`] with a summary of what was tried so the
//! caller can escalate.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
#[cfg(test)]
use mockall::automock;
use serde::Serialize;
use tracing::{info, warn};

use crate::command::{CommandRunner, CommandSpec};
use crate::config::MAX_REMEDIATION_ATTEMPTS;
use crate::error::Result;
use crate::runbook::{RemediationProcedure, RemediationStep, RunbookStore};
use crate::types::DeploymentIdentity;

/// Lifecycle operations a remediation procedure may invoke.
///
/// Both return whether the workload reported available afterwards.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RemediationActions: Send + Sync {
    /// Re-apply the persisted manifest and monitor it.
    async fn redeploy(&self, identity: &DeploymentIdentity) -> Result<bool>;

    /// Roll back to the previous revision and monitor it.
    async fn rollback(&self, identity: &DeploymentIdentity) -> Result<bool>;
}

/// Result of one remediation attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemediationOutcome {
    /// The procedure ran and the workload is available again
    Fixed { procedure: String },
    /// The procedure ran but the failure persists
    StillFailing { procedure: String, reason: String },
    /// The attempt budget is spent; nothing was executed
    Exhausted { attempts: u32, summary: String },
}

/// One executed attempt, kept for the escalation summary.
#[derive(Debug, Clone, Serialize)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub signature: String,
    pub procedure: Option<String>,
    pub result: String,
    pub at: DateTime<Utc>,
}

/// Per-identity attempt counter and history.
#[derive(Debug, Clone, Default)]
pub struct RemediationAttempt {
    pub count: u32,
    pub history: Vec<AttemptRecord>,
}

impl RemediationAttempt {
    fn summary(&self, identity: &DeploymentIdentity) -> String {
        let tried = self
            .history
            .iter()
            .map(|record| {
                format!(
                    "#{} [{}] {}: {}",
                    record.attempt,
                    record.signature,
                    record.procedure.as_deref().unwrap_or("no runbook"),
                    record.result
                )
            })
            .collect::<Vec<_>>();
        if tried.is_empty() {
            format!("{identity}: no remediation attempts recorded")
        } else {
            format!("{identity}: {}", tried.join("; "))
        }
    }
}

/// Executes remediation procedures within a fixed attempt budget.
pub struct RemediationEngine {
    store: Arc<dyn RunbookStore>,
    runner: Arc<dyn CommandRunner>,
    max_attempts: u32,
    attempts: Mutex<HashMap<DeploymentIdentity, RemediationAttempt>>,
}

impl RemediationEngine {
    pub fn new(store: Arc<dyn RunbookStore>, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            store,
            runner,
            max_attempts: MAX_REMEDIATION_ATTEMPTS,
            attempts: Mutex::new(HashMap::new()),
        }
    }

    /// Lower the attempt budget. Values above the hard ceiling are clamped.
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.min(MAX_REMEDIATION_ATTEMPTS);
        self
    }

    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Attempts made for `identity` since its last reset.
    #[must_use]
    pub fn attempts(&self, identity: &DeploymentIdentity) -> u32 {
        self.lock()
            .get(identity)
            .map_or(0, |attempt| attempt.count.min(self.max_attempts))
    }

    /// Executed attempts for `identity`, oldest first.
    #[must_use]
    pub fn history(&self, identity: &DeploymentIdentity) -> Vec<AttemptRecord> {
        self.lock()
            .get(identity)
            .map(|attempt| attempt.history.clone())
            .unwrap_or_default()
    }

    /// Forget the counter for `identity`, e.g. after a successful deployment.
    pub fn reset(&self, identity: &DeploymentIdentity) {
        if self.lock().remove(identity).is_some() {
            info!(identity = %identity, "Reset remediation attempts");
        }
    }

    /// Run one remediation attempt for a failure with `signature`.
    ///
    /// Returns `Err(RunbookNotFound)` when no procedure matches; that still
    /// consumes an attempt.
    pub async fn attempt(
        &self,
        identity: &DeploymentIdentity,
        signature: &str,
        actions: &dyn RemediationActions,
    ) -> Result<RemediationOutcome> {
        let attempt = {
            let mut attempts = self.lock();
            let entry = attempts.entry(identity.clone()).or_default();
            if entry.count >= self.max_attempts {
                let summary = entry.summary(identity);
                warn!(
                    identity = %identity,
                    signature,
                    attempts = entry.count,
                    "Remediation attempts exhausted"
                );
                return Ok(RemediationOutcome::Exhausted {
                    attempts: entry.count,
                    summary,
                });
            }
            entry.count += 1;
            entry.count
        };

        info!(
            identity = %identity,
            signature,
            attempt,
            max_attempts = self.max_attempts,
            "Starting remediation attempt"
        );

        let procedure = match self.store.lookup(signature) {
            Ok(procedure) => procedure,
            Err(e) => {
                self.record(identity, attempt, signature, None, e.to_string());
                return Err(e);
            }
        };

        let outcome = self.execute(identity, &procedure, actions).await;
        let result = match &outcome {
            RemediationOutcome::Fixed { .. } => "fixed".to_string(),
            RemediationOutcome::StillFailing { reason, .. } => format!("still failing ({reason})"),
            RemediationOutcome::Exhausted { .. } => "exhausted".to_string(),
        };
        self.record(identity, attempt, signature, Some(&procedure.name), result);

        if matches!(outcome, RemediationOutcome::Fixed { .. }) {
            info!(identity = %identity, procedure = %procedure.name, attempt, "Remediation fixed the deployment");
            self.reset(identity);
        } else {
            warn!(identity = %identity, procedure = %procedure.name, attempt, "Remediation did not fix the deployment");
        }
        Ok(outcome)
    }

    async fn execute(
        &self,
        identity: &DeploymentIdentity,
        procedure: &RemediationProcedure,
        actions: &dyn RemediationActions,
    ) -> RemediationOutcome {
        let still_failing = |reason: String| RemediationOutcome::StillFailing {
            procedure: procedure.name.clone(),
            reason,
        };

        let mut available = None;
        for (index, step) in procedure.steps.iter().enumerate() {
            let step_number = index + 1;
            match step {
                RemediationStep::Note { text } => {
                    info!(procedure = %procedure.name, step = step_number, "{text}");
                }
                RemediationStep::Wait { seconds } => {
                    info!(procedure = %procedure.name, step = step_number, seconds, "Waiting");
                    tokio::time::sleep(Duration::from_secs(*seconds)).await;
                }
                RemediationStep::Command { program, args } => {
                    let spec = CommandSpec::new(program.clone(), args.clone());
                    info!(procedure = %procedure.name, step = step_number, command = %spec.display(), "Running command");
                    match self.runner.run(spec).await {
                        Ok(output) if output.success => {}
                        Ok(output) => {
                            return still_failing(format!(
                                "step {step_number} `{program}` failed: {}",
                                output.failure_message()
                            ))
                        }
                        Err(e) => {
                            return still_failing(format!(
                                "step {step_number} `{program}` could not run: {e}"
                            ))
                        }
                    }
                }
                RemediationStep::Redeploy => {
                    info!(procedure = %procedure.name, step = step_number, "Redeploying");
                    match actions.redeploy(identity).await {
                        Ok(ready) => available = Some(ready),
                        Err(e) => return still_failing(format!("redeploy failed: {e}")),
                    }
                }
                RemediationStep::Rollback => {
                    info!(procedure = %procedure.name, step = step_number, "Rolling back");
                    match actions.rollback(identity).await {
                        Ok(ready) => available = Some(ready),
                        Err(e) => return still_failing(format!("rollback failed: {e}")),
                    }
                }
            }
        }

        match available {
            Some(true) => RemediationOutcome::Fixed {
                procedure: procedure.name.clone(),
            },
            Some(false) => still_failing("workload not available after remediation".to_string()),
            None => still_failing("procedure did not redeploy or roll back".to_string()),
        }
    }

    fn record(
        &self,
        identity: &DeploymentIdentity,
        attempt: u32,
        signature: &str,
        procedure: Option<&str>,
        result: String,
    ) {
        if let Some(entry) = self.lock().get_mut(identity) {
            entry.history.push(AttemptRecord {
                attempt,
                signature: signature.to_string(),
                procedure: procedure.map(str::to_string),
                result,
                at: Utc::now(),
            });
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<DeploymentIdentity, RemediationAttempt>> {
        self.attempts.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
