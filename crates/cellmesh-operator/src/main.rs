//! cellmesh operator - reconciles cells, composites and their mesh plumbing

mod runner;

use std::path::PathBuf;

use clap::Parser;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client, CustomResourceExt};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cellmesh_common::crd::{AutoscalePolicy, Cell, Composite, Gateway, TokenService};
use cellmesh_common::kube_utils::{create_client, FIELD_MANAGER};
use cellmesh_common::DEFAULT_SYSTEM_NAMESPACE;
use cellmesh_controller::MeshConfig;

/// cellmesh - Kubernetes operator for cell-based service meshes
#[derive(Parser, Debug)]
#[command(name = "cellmesh-operator", version, about, long_about = None)]
struct Cli {
    /// Generate CRD manifests and exit
    #[arg(long)]
    crd: bool,

    /// Path to a kubeconfig; in-cluster config is used when unset
    #[arg(long, env = "KUBECONFIG")]
    kubeconfig: Option<PathBuf>,

    /// API server address overriding the kubeconfig
    #[arg(long, env = "CELLMESH_MASTER")]
    master: Option<String>,

    /// Concurrent workers per controller
    #[arg(long, env = "CELLMESH_WORKERS", default_value_t = 2)]
    workers: usize,

    /// Namespace holding the mesh config map and key secret
    #[arg(long, env = "CELLMESH_SYSTEM_NAMESPACE", default_value = DEFAULT_SYSTEM_NAMESPACE)]
    system_namespace: String,

    /// Name of the mesh config map
    #[arg(long, env = "CELLMESH_CONFIG_MAP", default_value = "cellery-config")]
    config_map: String,

    /// Name of the secret holding the private key
    #[arg(long, env = "CELLMESH_SECRET", default_value = "cellery-secret")]
    secret: String,
}

fn crd_manifests() -> anyhow::Result<String> {
    let docs = [
        serde_yaml::to_string(&Cell::crd())?,
        serde_yaml::to_string(&Composite::crd())?,
        serde_yaml::to_string(&Gateway::crd())?,
        serde_yaml::to_string(&TokenService::crd())?,
        serde_yaml::to_string(&AutoscalePolicy::crd())?,
    ];
    Ok(docs.join("---\n"))
}

async fn install_crd<K: CustomResourceExt>(
    crds: &Api<CustomResourceDefinition>,
    params: &PatchParams,
) -> anyhow::Result<()> {
    tracing::info!(crd = K::crd_name(), "installing CRD");
    crds.patch(K::crd_name(), params, &Patch::Apply(&K::crd()))
        .await
        .map_err(|e| anyhow::anyhow!("Failed to install {} CRD: {}", K::crd_name(), e))?;
    Ok(())
}

/// Ensure all cellmesh CRDs are installed
///
/// Server-side apply with force keeps the installed schema in step with
/// the running operator.
async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    install_crd::<Cell>(&crds, &params).await?;
    install_crd::<Composite>(&crds, &params).await?;
    install_crd::<Gateway>(&crds, &params).await?;
    install_crd::<TokenService>(&crds, &params).await?;
    install_crd::<AutoscalePolicy>(&crds, &params).await?;

    tracing::info!("All cellmesh CRDs installed/updated");
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "cannot listen for SIGTERM, waiting for ctrl-c only");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        print!("{}", crd_manifests()?);
        return Ok(());
    }

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let client = create_client(cli.kubeconfig.as_deref(), cli.master.as_deref())
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    ensure_crds_installed(&client).await?;

    let config = MeshConfig::load(&client, &cli.system_namespace, &cli.config_map, &cli.secret)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to load mesh config: {}", e))?;

    let token = CancellationToken::new();
    let runner = runner::build(client, config, cli.workers, token.clone());

    let mut tasks = JoinSet::new();
    for informer in runner.informers {
        tasks.spawn(informer);
    }

    tracing::info!("waiting for informer caches to sync");
    tokio::select! {
        synced = runner.caches_synced => {
            if !synced {
                token.cancel();
                while tasks.join_next().await.is_some() {}
                anyhow::bail!("informer caches failed to sync");
            }
        }
        _ = shutdown_signal() => {
            tracing::info!("shutdown requested before caches synced");
            token.cancel();
            while tasks.join_next().await.is_some() {}
            return Ok(());
        }
    }
    tracing::info!("caches synced, starting controllers");

    for controller in runner.controllers {
        tasks.spawn(controller);
    }

    shutdown_signal().await;
    tracing::info!("shutdown requested, draining controllers");
    token.cancel();

    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            tracing::error!(error = %e, "task failed during shutdown");
        }
    }
    tracing::info!("cellmesh operator stopped");
    Ok(())
}
