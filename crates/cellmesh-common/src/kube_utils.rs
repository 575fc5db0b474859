//! Shared Kubernetes utilities: clients, child naming, ownership and labels

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::api::{Api, Patch, PatchParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tracing::{debug, info};

use crate::{Error, LABEL_MANAGED_BY, LABEL_MANAGED_BY_CELLMESH};

/// Field manager used for every write the controllers make
pub const FIELD_MANAGER: &str = "cellmesh-controller";

/// Default connection timeout for kube clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default read timeout for kube clients
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Create a kube client
///
/// `kubeconfig` selects a file (otherwise in-cluster or inferred config);
/// `master` overrides the API server URL from either source.
pub async fn create_client(kubeconfig: Option<&Path>, master: Option<&str>) -> Result<Client, Error> {
    let mut config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                Error::internal_with_context(
                    "create_client",
                    format!("failed to read kubeconfig: {}", e),
                )
            })?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| {
                    Error::internal_with_context(
                        "create_client",
                        format!("failed to load kubeconfig: {}", e),
                    )
                })?
        }
        None => Config::infer().await.map_err(|e| {
            Error::internal_with_context("create_client", format!("failed to infer config: {}", e))
        })?,
    };
    if let Some(master) = master.filter(|m| !m.is_empty()) {
        config.cluster_url = master.parse::<http::Uri>().map_err(|e| {
            Error::config("create_client", format!("invalid master url {}: {}", master, e))
        })?;
    }
    info!(cluster_url = %config.cluster_url, "connecting to API server");
    config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
    config.read_timeout = Some(DEFAULT_READ_TIMEOUT);
    Client::try_from(config).map_err(|e| {
        Error::internal_with_context("create_client", format!("failed to create client: {}", e))
    })
}

/// Server-side apply body carrying only `status`
///
/// The controllers are the sole writer of status, so applying the whole
/// status with one field manager prunes entries that are no longer present
/// (a merge patch could never remove a `childGenerations` key).
pub fn status_apply_patch<T>(status: &impl serde::Serialize) -> serde_json::Value
where
    T: kube::Resource,
    <T as kube::Resource>::DynamicType: Default,
{
    let dt = Default::default();
    serde_json::json!({
        "apiVersion": T::api_version(&dt),
        "kind": T::kind(&dt),
        "status": status,
    })
}

/// Apply the status sub-resource of a namespaced resource
pub async fn patch_resource_status<T>(
    client: &Client,
    name: &str,
    namespace: &str,
    status: &impl serde::Serialize,
) -> std::result::Result<T, kube::Error>
where
    T: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>
        + Clone
        + serde::de::DeserializeOwned
        + std::fmt::Debug,
    <T as kube::Resource>::DynamicType: Default,
{
    let api: Api<T> = Api::namespaced(client.clone(), namespace);
    let patch = status_apply_patch::<T>(status);
    debug!(%name, %namespace, kind = %T::kind(&Default::default()), "applying status");
    api.patch_status(
        name,
        &PatchParams::apply(FIELD_MANAGER).force(),
        &Patch::Apply(&patch),
    )
    .await
}

// =============================================================================
// Child naming
// =============================================================================

/// NetworkPolicy of a cell
pub fn network_policy_name(cell: &str) -> String {
    format!("{cell}--network")
}

/// Gateway of a cell
pub fn cell_gateway_name(cell: &str) -> String {
    format!("{cell}--gateway")
}

/// TokenService of a cell
pub fn cell_token_service_name(cell: &str) -> String {
    format!("{cell}--sts")
}

/// Deployment of a component
pub fn component_deployment_name(parent: &str, component: &str) -> String {
    format!("{parent}--{component}-deployment")
}

/// Service of a component
pub fn component_service_name(parent: &str, component: &str) -> String {
    format!("{parent}--{component}-service")
}

/// AutoscalePolicy of a component
pub fn component_autoscale_policy_name(parent: &str, component: &str) -> String {
    format!("{parent}--{component}-autoscalepolicy")
}

/// VirtualService of a cell or composite
pub fn virtual_service_name(parent: &str) -> String {
    format!("{parent}--vs")
}

/// `<owner>-<suffix>` naming used by gateways, token services and policies
pub fn suffixed_name(owner: &str, suffix: &str) -> String {
    format!("{owner}-{suffix}")
}

/// Key of a child in `status.childGenerations`
pub fn child_key(kind: &str, name: &str) -> String {
    format!("{kind}/{name}")
}

// =============================================================================
// Ownership and labels
// =============================================================================

/// The controller owner reference of an object, if any
pub fn controller_of(meta: &ObjectMeta) -> Option<&OwnerReference> {
    meta.owner_references
        .as_deref()
        .unwrap_or_default()
        .iter()
        .find(|r| r.controller == Some(true))
}

/// Labels stamped on every child: managed-by plus the given owner labels
pub fn managed_labels<'a>(
    owner_labels: impl IntoIterator<Item = (&'a str, &'a str)>,
) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::from([(
        LABEL_MANAGED_BY.to_string(),
        LABEL_MANAGED_BY_CELLMESH.to_string(),
    )]);
    labels.extend(
        owner_labels
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string())),
    );
    labels
}

/// Compute a deterministic hash of the input string, returning a 16-char hex digest.
///
/// Persisted as a pod template annotation so config changes roll pods.
pub fn deterministic_hash(input: &str) -> String {
    use aws_lc_rs::digest;
    let hash = digest::digest(&digest::SHA256, input.as_bytes());
    hash.as_ref()[..8]
        .iter()
        .fold(String::with_capacity(16), |mut s, b| {
            use std::fmt::Write;
            let _ = write!(s, "{:02x}", b);
            s
        })
}
