//! Deployer CLI - build, roll out and remediate branch deployments.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use deployer::{
    DeployRequest, DeployerConfig, DeploymentIdentity, DeploymentOrchestrator,
    DeploymentOutcome, DeploymentReport, DirectoryRunbookStore, KubeWorkloadApi,
    RemediationOutcome, ResumeRequest, Revision, RollbackOutcome, ShellRunner,
};

/// Deployer - deploy a branch to a Kubernetes environment.
#[derive(Parser)]
#[command(name = "deployer")]
#[command(about = "Branch deployment orchestrator")]
#[command(version)]
pub struct Cli {
    /// Configuration file
    #[arg(long, global = true, env = "DEPLOYER_CONFIG", default_value = "deployer.yaml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value = "text")]
    log_format: LogFormat,

    /// Kubeconfig context (overrides `kubeContext` from the config file)
    #[arg(long, global = true)]
    context: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Build a branch and deploy it
    Deploy {
        /// Branch (or any git ref) to deploy
        #[arg(long)]
        branch: String,

        /// Target environment; used as the namespace
        #[arg(long)]
        environment: String,

        /// Manifest file or handlebars template
        #[arg(long)]
        manifest: PathBuf,

        /// Deployment name; defaults to the project name
        #[arg(long)]
        name: Option<String>,

        /// Repository to clone instead of the configured one
        #[arg(long)]
        repository: Option<String>,
    },

    /// Re-apply the persisted manifest without rebuilding
    Resume {
        #[arg(long)]
        branch: String,

        #[arg(long)]
        environment: String,
    },

    /// Roll back to the previous manifest revision, or remove the deployment
    Rollback {
        #[arg(long)]
        branch: String,

        #[arg(long)]
        environment: String,

        /// Deployment name; defaults to the project name
        #[arg(long)]
        name: Option<String>,
    },

    /// Show the cluster status of a deployment
    Status {
        /// Deployment name; defaults to the project name
        #[arg(long)]
        name: Option<String>,

        #[arg(long)]
        environment: String,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_format);

    let mut config = DeployerConfig::load(&cli.config)?;
    if let Some(context) = cli.context {
        config.kube_context = Some(context);
    }

    let orchestrator = build_orchestrator(&config).await?;

    match cli.command {
        Commands::Deploy {
            branch,
            environment,
            manifest,
            name,
            repository,
        } => {
            let manifest = std::fs::read_to_string(&manifest)
                .with_context(|| format!("Failed to read manifest {}", manifest.display()))?;
            let request = DeployRequest {
                revision: Revision::new(
                    repository.unwrap_or_else(|| config.repository.clone()),
                    branch,
                ),
                environment,
                name: name.unwrap_or_else(|| config.project.clone()),
                manifest,
            };
            tracing::info!(
                repository = %request.revision.repository,
                branch = %request.revision.reference,
                environment = %request.environment,
                "Starting deploy"
            );

            tokio::select! {
                report = orchestrator.deploy(request) => Ok(print_report(&report)),
                _ = tokio::signal::ctrl_c() => {
                    eprintln!("{}", "Interrupted, deployment cancelled".yellow());
                    Ok(ExitCode::FAILURE)
                }
            }
        }
        Commands::Resume {
            branch,
            environment,
        } => {
            let request = ResumeRequest {
                identity: DeploymentIdentity::new(branch, environment),
            };
            tokio::select! {
                report = orchestrator.resume(request) => Ok(print_report(&report)),
                _ = tokio::signal::ctrl_c() => {
                    eprintln!("{}", "Interrupted, resume cancelled".yellow());
                    Ok(ExitCode::FAILURE)
                }
            }
        }
        Commands::Rollback {
            branch,
            environment,
            name,
        } => {
            let identity = DeploymentIdentity::new(branch, environment);
            let name = name.unwrap_or_else(|| config.project.clone());
            match orchestrator.rollback(&identity, &name).await {
                Ok(RollbackOutcome::Restored { name, image }) => {
                    println!(
                        "{} {name} restored to previous revision ({})",
                        "✓".green(),
                        image.as_deref().unwrap_or("unknown image")
                    );
                    Ok(ExitCode::SUCCESS)
                }
                Ok(RollbackOutcome::Removed { name }) => {
                    println!(
                        "{} {name} removed, no previous revision to restore",
                        "✓".green()
                    );
                    Ok(ExitCode::SUCCESS)
                }
                Err(e) => {
                    eprintln!("{} {}", "✗".red(), format!("Rollback failed: {e}").red());
                    Ok(ExitCode::FAILURE)
                }
            }
        }
        Commands::Status { name, environment } => {
            let name = name.unwrap_or_else(|| config.project.clone());
            let status = orchestrator
                .status(&name, &environment)
                .await
                .with_context(|| format!("Failed to read status of {name} in {environment}"))?;

            let state = format!("{:?}", status.state());
            let state = if status.is_available() {
                state.green()
            } else {
                state.yellow()
            };
            println!("{name} ({environment}): {state}");
            println!(
                "   Replicas: {}/{}",
                status.ready_replicas, status.replicas
            );
            for condition in &status.conditions {
                println!(
                    "   {}={} {}",
                    condition.kind,
                    condition.status,
                    condition.reason.as_deref().unwrap_or_default()
                );
            }
            if let Some(reason) = status.failure_reason() {
                println!("   Reason: {}", reason.red());
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn init_tracing(verbose: bool, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("deployer=debug,info")
        } else {
            EnvFilter::new("deployer=info,warn")
        }
    });

    match format {
        LogFormat::Text => tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init(),
    }
}

async fn build_orchestrator(config: &DeployerConfig) -> Result<DeploymentOrchestrator> {
    let client = kube_client(config.kube_context.as_deref()).await?;
    let runbooks = DirectoryRunbookStore::load(&config.runbook_dir)?;
    if runbooks.is_empty() {
        tracing::warn!(
            path = %config.runbook_dir.display(),
            "No runbooks loaded, failures will escalate immediately"
        );
    }

    Ok(DeploymentOrchestrator::new(
        config,
        Arc::new(ShellRunner::new().with_timeout(config.command_timeout())),
        Arc::new(KubeWorkloadApi::new(client)),
        Arc::new(runbooks),
    ))
}

async fn kube_client(context: Option<&str>) -> Result<kube::Client> {
    let config = match context {
        Some(context) => {
            let options = kube::config::KubeConfigOptions {
                context: Some(context.to_string()),
                ..Default::default()
            };
            kube::Config::from_kubeconfig(&options)
                .await
                .with_context(|| format!("Failed to load kubeconfig context {context}"))?
        }
        None => kube::Config::infer()
            .await
            .context("Failed to infer Kubernetes configuration")?,
    };
    kube::Client::try_from(config).context("Failed to create Kubernetes client")
}

fn print_report(report: &DeploymentReport) -> ExitCode {
    let identity = &report.identity;
    println!("\nDeployment {identity} (run {})", report.run_id);
    if let Some(image) = &report.image {
        println!("   Image: {}", image.deploy_reference());
    }
    let states = report
        .states()
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" -> ");
    println!("   States: {states}");

    for (index, attempt) in report.remediation.iter().enumerate() {
        let line = match attempt {
            RemediationOutcome::Fixed { procedure } => format!("{procedure}: fixed").green(),
            RemediationOutcome::StillFailing { procedure, reason } => {
                format!("{procedure}: {reason}").yellow()
            }
            RemediationOutcome::Exhausted { attempts, .. } => {
                format!("budget of {attempts} attempts spent").red()
            }
        };
        println!("   Remediation #{}: {line}", index + 1);
    }

    match &report.outcome {
        DeploymentOutcome::Succeeded => {
            println!("{} {}", "✓".green(), report.outcome.summary().green());
            ExitCode::SUCCESS
        }
        DeploymentOutcome::CheckoutRejected { .. } => {
            eprintln!("{} {}", "✗".red(), report.outcome.summary().red());
            ExitCode::FAILURE
        }
        DeploymentOutcome::Escalated { .. } => {
            eprintln!("{} {}", "✗".red(), report.outcome.summary().red());
            eprintln!("   Manual intervention required");
            ExitCode::FAILURE
        }
    }
}
