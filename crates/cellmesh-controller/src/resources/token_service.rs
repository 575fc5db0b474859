//! Children of a TokenService

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, Service, Volume, VolumeMount,
};
use kube::ResourceExt;
use serde::Serialize;

use cellmesh_common::crd::{InterceptMode, TokenService};
use cellmesh_common::kube_utils::{deterministic_hash, suffixed_name};
use cellmesh_common::Error;

use super::workload::{self, container_port, service_port, PodTemplate};
use super::config_map;

/// Port serving token exchange over HTTP
pub const STS_HTTP_PORT: i32 = 8080;
/// Port serving the sidecar authorization API over gRPC
pub const STS_GRPC_PORT: i32 = 8081;
/// Key of the settings document in the config ConfigMap
pub const STS_CONFIG_KEY: &str = "sts.json";
/// Pod annotation carrying the hash of settings and policies
pub const CONFIG_HASH_ANNOTATION: &str = "mesh.cellery.io/config-hash";

const CONFIG_MOUNT_PATH: &str = "/etc/cellmesh/sts";
const POLICY_MOUNT_PATH: &str = "/etc/cellmesh/opa";

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Settings<'a> {
    token_service: &'a str,
    intercept_mode: InterceptMode,
    unsecured_paths: &'a [String],
}

/// Settings ConfigMap (`<ts>-config`)
pub fn sts_config(
    sts: &TokenService,
    namespace: &str,
    labels: BTreeMap<String, String>,
) -> Result<ConfigMap, Error> {
    let name = sts.name_any();
    let settings = Settings {
        token_service: &name,
        intercept_mode: sts.spec.intercept_mode,
        unsecured_paths: &sts.spec.unsecured_paths,
    };
    let json = serde_json::to_string_pretty(&settings)
        .map_err(|e| Error::serialization_for_kind("ConfigMap", e.to_string()))?;
    Ok(config_map(
        &suffixed_name(&name, "config"),
        namespace,
        labels,
        BTreeMap::from([(STS_CONFIG_KEY.to_string(), json)]),
    ))
}

/// OPA policy ConfigMap (`<ts>-policy`), one `<key>.rego` entry per policy
pub fn sts_policy(sts: &TokenService, namespace: &str, labels: BTreeMap<String, String>) -> ConfigMap {
    let data = sts
        .spec
        .opa_policies
        .iter()
        .map(|p| (format!("{}.rego", p.key), p.policy.clone()))
        .collect();
    config_map(&suffixed_name(&sts.name_any(), "policy"), namespace, labels, data)
}

fn mounted(name: &str, path: &str) -> (Volume, VolumeMount) {
    (
        Volume {
            name: name.to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: name.to_string(),
                default_mode: Some(420),
                ..Default::default()
            }),
            ..Default::default()
        },
        VolumeMount {
            name: name.to_string(),
            mount_path: path.to_string(),
            read_only: Some(true),
            ..Default::default()
        },
    )
}

/// Token service Deployment mounting both ConfigMaps
pub fn sts_deployment(
    sts: &TokenService,
    namespace: &str,
    labels: BTreeMap<String, String>,
    image: &str,
    config: &ConfigMap,
    policy: &ConfigMap,
) -> Deployment {
    let name = sts.name_any();
    let (config_volume, config_mount) = mounted(&config.name_any(), CONFIG_MOUNT_PATH);
    let (policy_volume, policy_mount) = mounted(&policy.name_any(), POLICY_MOUNT_PATH);

    // Serialized data of both maps, so either change rolls the pods
    let fingerprint = serde_json::json!([config.data, policy.data]).to_string();

    workload::deployment(
        &suffixed_name(&name, "deployment"),
        namespace,
        labels,
        PodTemplate {
            app: name.clone(),
            replicas: Some(sts.spec.replicas),
            container: Container {
                name: "sts".to_string(),
                image: Some(image.to_string()),
                ports: Some(vec![
                    container_port(STS_HTTP_PORT),
                    container_port(STS_GRPC_PORT),
                ]),
                volume_mounts: Some(vec![config_mount, policy_mount]),
                ..Default::default()
            },
            volumes: vec![config_volume, policy_volume],
            annotations: BTreeMap::from([(
                CONFIG_HASH_ANNOTATION.to_string(),
                deterministic_hash(&fingerprint),
            )]),
        },
    )
}

/// Token service Service (`<ts>-service`)
pub fn sts_service(sts: &TokenService, namespace: &str, labels: BTreeMap<String, String>) -> Service {
    let name = sts.name_any();
    workload::service(
        &suffixed_name(&name, "service"),
        namespace,
        labels,
        &name,
        vec![
            service_port("http-sts", STS_HTTP_PORT, STS_HTTP_PORT),
            service_port("grpc-authz", STS_GRPC_PORT, STS_GRPC_PORT),
        ],
    )
}
