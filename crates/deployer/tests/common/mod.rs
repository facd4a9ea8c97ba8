//! Fakes shared by the lifecycle integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use deployer::{
    ClusterError, CommandOutput, CommandRunner, CommandSpec, Condition, DeployRequest,
    DeployerConfig, DeploymentStatus, Revision, WorkloadApi,
};
use k8s_openapi::api::apps::v1::Deployment;
use tempfile::TempDir;

pub const REPOSITORY: &str = "https://git.example.com/acme/app.git";
pub const COMMIT: &str = "3f2c9a1b7d4e5f60718293a4b5c6d7e8f9012345";

pub const MANIFEST: &str = "\
apiVersion: apps/v1
kind: Deployment
metadata:
  name: app
spec:
  replicas: 1
  selector:
    matchLabels:
      app: app
  template:
    metadata:
      labels:
        app: app
    spec:
      containers:
        - name: app
          image: acme/app-feature-x:latest
";

/// Records every command and fails the ones it is told to.
#[derive(Default)]
pub struct ScriptedRunner {
    pub commands: Mutex<Vec<CommandSpec>>,
    /// Workspace roots handed to `git clone`
    pub workspaces: Mutex<Vec<PathBuf>>,
    /// `"{program} {first arg}"` prefixes that exit non-zero
    pub failing: Mutex<Vec<String>>,
    /// Simulated duration of `docker build`
    pub build_delay: Mutex<Option<Duration>>,
    /// Commit reported by `git rev-parse`, [`COMMIT`] when unset
    pub commit: Mutex<Option<String>>,
    builds_in_flight: AtomicUsize,
    pub max_builds_in_flight: AtomicUsize,
}

impl ScriptedRunner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail(&self, prefix: &str) {
        self.failing.lock().unwrap().push(prefix.to_string());
    }

    pub fn set_build_delay(&self, delay: Duration) {
        *self.build_delay.lock().unwrap() = Some(delay);
    }

    pub fn set_commit(&self, commit: &str) {
        *self.commit.lock().unwrap() = Some(commit.to_string());
    }

    pub fn ran(&self, program: &str, first_arg: &str) -> Vec<CommandSpec> {
        self.commands
            .lock()
            .unwrap()
            .iter()
            .filter(|spec| spec.program == program && spec.args.first().map(String::as_str) == Some(first_arg))
            .cloned()
            .collect()
    }

    pub fn workspace_roots(&self) -> Vec<PathBuf> {
        self.workspaces.lock().unwrap().clone()
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, spec: CommandSpec) -> std::io::Result<CommandOutput> {
        self.commands.lock().unwrap().push(spec.clone());
        let key = format!(
            "{} {}",
            spec.program,
            spec.args.first().map(String::as_str).unwrap_or_default()
        );

        if key == "git clone" {
            let checkout = PathBuf::from(&spec.args[2]);
            if let Some(root) = checkout.parent() {
                self.workspaces.lock().unwrap().push(root.to_path_buf());
            }
            std::fs::create_dir_all(&checkout)?;
        }

        if key == "docker build" {
            let in_flight = self.builds_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_builds_in_flight.fetch_max(in_flight, Ordering::SeqCst);
            let delay = *self.build_delay.lock().unwrap();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            self.builds_in_flight.fetch_sub(1, Ordering::SeqCst);
        }

        if self.failing.lock().unwrap().iter().any(|p| key.starts_with(p.as_str())) {
            return Ok(CommandOutput::failed(1, format!("{key} failed")));
        }
        if key == "git rev-parse" {
            let commit = self
                .commit
                .lock()
                .unwrap()
                .clone()
                .unwrap_or_else(|| COMMIT.to_string());
            return Ok(CommandOutput::ok(format!("{commit}\n")));
        }
        Ok(CommandOutput::ok(""))
    }
}

/// In-memory cluster holding Deployments by (namespace, name).
pub struct FakeCluster {
    pub objects: Mutex<HashMap<(String, String), Deployment>>,
    pub creates: AtomicUsize,
    pub replaces: AtomicUsize,
    pub deletes: AtomicUsize,
    pub status_reads: AtomicUsize,
    /// Number of applies after which the workload reports available
    available_after_applies: AtomicUsize,
    waiting_reason: Mutex<Option<String>>,
}

impl FakeCluster {
    /// Cluster where every applied workload becomes available.
    pub fn healthy() -> Arc<Self> {
        Self::available_after(1)
    }

    /// Cluster where no workload ever becomes available.
    pub fn stuck(waiting_reason: &str) -> Arc<Self> {
        let cluster = Self::available_after(usize::MAX);
        *cluster.waiting_reason.lock().unwrap() = Some(waiting_reason.to_string());
        cluster
    }

    /// Workloads become available once `applies` applies have happened.
    pub fn available_after(applies: usize) -> Arc<Self> {
        Arc::new(Self {
            objects: Mutex::new(HashMap::new()),
            creates: AtomicUsize::new(0),
            replaces: AtomicUsize::new(0),
            deletes: AtomicUsize::new(0),
            status_reads: AtomicUsize::new(0),
            available_after_applies: AtomicUsize::new(applies),
            waiting_reason: Mutex::new(None),
        })
    }

    pub fn applies(&self) -> usize {
        self.creates.load(Ordering::SeqCst) + self.replaces.load(Ordering::SeqCst)
    }

    pub fn object(&self, namespace: &str, name: &str) -> Option<Deployment> {
        self.objects
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn object_count(&self) -> usize {
        self.objects.lock().unwrap().len()
    }
}

#[async_trait]
impl WorkloadApi for FakeCluster {
    async fn create(&self, namespace: &str, deployment: &Deployment) -> Result<(), ClusterError> {
        let name = deployment.metadata.name.clone().unwrap_or_default();
        let mut objects = self.objects.lock().unwrap();
        let key = (namespace.to_string(), name);
        if objects.contains_key(&key) {
            return Err(ClusterError::Conflict);
        }
        objects.insert(key, deployment.clone());
        self.creates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn replace(
        &self,
        namespace: &str,
        name: &str,
        deployment: &Deployment,
    ) -> Result<(), ClusterError> {
        let mut objects = self.objects.lock().unwrap();
        let key = (namespace.to_string(), name.to_string());
        if !objects.contains_key(&key) {
            return Err(ClusterError::NotFound);
        }
        objects.insert(key, deployment.clone());
        self.replaces.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        let removed = self
            .objects
            .lock()
            .unwrap()
            .remove(&(namespace.to_string(), name.to_string()));
        if removed.is_none() {
            return Err(ClusterError::NotFound);
        }
        self.deletes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn status(&self, namespace: &str, name: &str) -> Result<DeploymentStatus, ClusterError> {
        self.status_reads.fetch_add(1, Ordering::SeqCst);
        if self.object(namespace, name).is_none() {
            return Err(ClusterError::NotFound);
        }

        let available = self.applies() >= self.available_after_applies.load(Ordering::SeqCst);
        let mut status = DeploymentStatus::with_conditions(vec![
            Condition::new("Available", available),
            Condition::new("Progressing", true),
        ]);
        if !available {
            status.waiting_reasons.extend(self.waiting_reason.lock().unwrap().clone());
        }
        Ok(status)
    }
}

/// Configuration writing artifacts under `dir`.
pub fn config(dir: &TempDir) -> DeployerConfig {
    DeployerConfig {
        repository: REPOSITORY.to_string(),
        manifest_dir: dir.path().join("deployments"),
        runbook_dir: PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("runbooks"),
        ..DeployerConfig::default()
    }
}

pub fn request(branch: &str, environment: &str, manifest: &str) -> DeployRequest {
    DeployRequest {
        revision: Revision::new(REPOSITORY, branch),
        environment: environment.to_string(),
        name: "app".to_string(),
        manifest: manifest.to_string(),
    }
}
