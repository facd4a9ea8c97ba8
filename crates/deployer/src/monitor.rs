//! Rollout monitoring by bounded polling.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cluster::{ClusterController, DeploymentStatus};
use crate::error::{DeployError, Result};

/// What a monitoring run observed.
#[derive(Debug, Clone)]
pub struct MonitorReport {
    /// Whether `Available=True` was observed before the deadline
    pub ready: bool,
    /// Number of status reads performed
    pub polls: u32,
    pub elapsed: Duration,
    /// Last status read, if any
    pub last_status: Option<DeploymentStatus>,
}

impl MonitorReport {
    /// Best explanation for a rollout that never became available.
    #[must_use]
    pub fn failure_reason(&self) -> Option<String> {
        self.last_status.as_ref().and_then(DeploymentStatus::failure_reason)
    }
}

/// Polls a workload until it is available or a deadline passes.
#[derive(Clone)]
pub struct DeploymentMonitor {
    controller: ClusterController,
}

impl DeploymentMonitor {
    #[must_use]
    pub fn new(controller: ClusterController) -> Self {
        Self { controller }
    }

    /// Wait for `name` to report `Available=True`.
    ///
    /// Returns `Ok(false)` when the timeout elapses; that is a negative
    /// outcome, not an error. A failed status read is a `MonitorFailure`.
    pub async fn wait_for_ready(
        &self,
        name: &str,
        environment: &str,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<bool> {
        self.observe(name, environment, timeout, poll_interval)
            .await
            .map(|report| report.ready)
    }

    /// Like [`wait_for_ready`](Self::wait_for_ready), keeping the last status.
    pub async fn observe(
        &self,
        name: &str,
        environment: &str,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<MonitorReport> {
        let start = Instant::now();
        let deadline = start + timeout;
        let mut report = MonitorReport {
            ready: false,
            polls: 0,
            elapsed: Duration::ZERO,
            last_status: None,
        };

        info!(
            name,
            namespace = environment,
            timeout_secs = timeout.as_secs(),
            interval_secs = poll_interval.as_secs(),
            "Monitoring rollout"
        );

        while Instant::now() < deadline {
            let status = self
                .controller
                .get_status(name, environment)
                .await
                .map_err(|e| DeployError::Monitor {
                    name: name.to_string(),
                    namespace: environment.to_string(),
                    source: Box::new(e),
                })?;
            report.polls += 1;

            let available = status.is_available();
            debug!(
                name,
                poll = report.polls,
                state = ?status.state(),
                ready_replicas = status.ready_replicas,
                "Polled deployment status"
            );
            report.last_status = Some(status);

            if available {
                report.ready = true;
                report.elapsed = start.elapsed();
                info!(name, namespace = environment, polls = report.polls, "Deployment is available");
                return Ok(report);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            tokio::time::sleep(poll_interval.min(remaining)).await;
        }

        report.elapsed = start.elapsed();
        warn!(
            name,
            namespace = environment,
            polls = report.polls,
            reason = ?report.failure_reason(),
            "Deployment did not become available before the timeout"
        );
        Ok(report)
    }
}
