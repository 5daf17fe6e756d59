//! SearchOps Operator - recurring backups for SearchCloud clusters

use std::sync::Arc;

use clap::Parser;
use futures::StreamExt;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, CustomResourceExt};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use searchops_backup::backup_controller::{error_policy, reconcile, Context};
use searchops_backup::cluster_api::HttpClusterApiFactory;
use searchops_common::crd::SearchBackup;

/// SearchOps - CRD-driven operator managing SearchCloud backups
#[derive(Parser, Debug)]
#[command(name = "searchops-operator", version, about, long_about = None)]
struct Cli {
    /// Generate CRD manifests and exit
    #[arg(long)]
    crd: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&SearchBackup::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    run_controller().await
}

/// Ensure the SearchOps CRDs are installed
///
/// The operator installs its own CRDs on startup using server-side
/// apply, so the CRD version always matches the operator version.
async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
    use kube::api::{Patch, PatchParams};

    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply("searchops-operator").force();

    tracing::info!("Installing SearchBackup CRD...");
    crds.patch(
        "searchbackups.searchops.dev",
        &params,
        &Patch::Apply(&SearchBackup::crd()),
    )
    .await
    .map_err(|e| anyhow::anyhow!("Failed to install SearchBackup CRD: {}", e))?;

    tracing::info!("All SearchOps CRDs installed/updated");
    Ok(())
}

/// Run in controller mode - watches SearchBackup objects cluster-wide
async fn run_controller() -> anyhow::Result<()> {
    tracing::info!("SearchOps controller starting...");

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    ensure_crds_installed(&client).await?;

    let api_factory = HttpClusterApiFactory::new()
        .map_err(|e| anyhow::anyhow!("Failed to build cluster API factory: {}", e))?;
    let ctx = Arc::new(Context::new(client.clone(), Arc::new(api_factory)));

    let backups: Api<SearchBackup> = Api::all(client);

    tracing::info!("Starting SearchBackup controller");
    Controller::new(backups, WatcherConfig::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok(action) => {
                    tracing::debug!(?action, "Backup reconciliation completed");
                }
                Err(e) => {
                    tracing::error!(error = ?e, "Backup reconciliation error");
                }
            }
        })
        .await;

    tracing::info!("SearchOps controller shutting down");
    Ok(())
}
