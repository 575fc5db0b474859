//! Children of a Gateway

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, Secret, Service, Volume, VolumeMount,
};
use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
    IngressServiceBackend, IngressSpec, IngressTLS, ServiceBackendPort,
};
use k8s_openapi::ByteString;
use kube::ResourceExt;
use serde::Serialize;

use cellmesh_common::crd::{ClusterIngress, Gateway, HttpApi, TcpRoute};
use cellmesh_common::crypto::{try_decrypt, PrivateKey};
use cellmesh_common::kube_utils::{deterministic_hash, suffixed_name};
use cellmesh_common::Error;

use super::workload::{self, container_port, service_port, PodTemplate};
use super::{child_meta, config_map};
use crate::apply::ChildResource;

/// Port the gateway Service exposes for HTTP APIs
pub const GATEWAY_HTTP_PORT: i32 = 80;
/// Port the gateway container listens on for HTTP
pub const GATEWAY_CONTAINER_PORT: i32 = 8080;
/// Key of the route table in the gateway ConfigMap
pub const GATEWAY_CONFIG_KEY: &str = "gateway.json";
/// Pod annotation carrying the hash of the route table
pub const CONFIG_HASH_ANNOTATION: &str = "mesh.cellery.io/config-hash";

const CONFIG_VOLUME: &str = "gateway-config";
const CONFIG_MOUNT_PATH: &str = "/etc/cellmesh/gateway";
const TLS_SECRET_TYPE: &str = "kubernetes.io/tls";

/// In-cluster host name of a gateway, also published on its status
pub fn gateway_hostname(gateway: &str) -> String {
    suffixed_name(gateway, "service")
}

/// Route table read by the gateway at startup
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RouteTable<'a> {
    gateway: &'a str,
    http: &'a [HttpApi],
    tcp: &'a [TcpRoute],
}

/// ConfigMap holding the gateway route table
pub fn gateway_config(
    gateway: &Gateway,
    namespace: &str,
    labels: BTreeMap<String, String>,
) -> Result<ConfigMap, Error> {
    let name = gateway.name_any();
    let table = RouteTable {
        gateway: &name,
        http: &gateway.spec.ingress.http,
        tcp: &gateway.spec.ingress.tcp,
    };
    let json = serde_json::to_string_pretty(&table)
        .map_err(|e| Error::serialization_for_kind("ConfigMap", e.to_string()))?;
    Ok(config_map(
        &suffixed_name(&name, "config"),
        namespace,
        labels,
        BTreeMap::from([(GATEWAY_CONFIG_KEY.to_string(), json)]),
    ))
}

/// TLS Secret for the cluster ingress
///
/// `None` when no TLS is declared or it names an existing secret. Key and
/// certificate may be plain, `b64:` or `enc:`; a payload that cannot be
/// opened fails with a configuration error.
pub fn tls_secret(
    gateway: &str,
    namespace: &str,
    labels: BTreeMap<String, String>,
    ingress: &ClusterIngress,
    private_key: Option<&PrivateKey>,
) -> Result<Option<Secret>, Error> {
    let Some(tls) = ingress.tls.as_ref().filter(|t| t.secret.is_none()) else {
        return Ok(None);
    };
    let key = try_decrypt(&tls.key, private_key)?;
    let cert = try_decrypt(&tls.cert, private_key)?;
    Ok(Some(Secret {
        metadata: child_meta(&suffixed_name(gateway, "tls-secret"), namespace, labels),
        type_: Some(TLS_SECRET_TYPE.to_string()),
        data: Some(BTreeMap::from([
            ("tls.key".to_string(), ByteString(key)),
            ("tls.crt".to_string(), ByteString(cert)),
        ])),
        ..Default::default()
    }))
}

/// Name of the Secret the ingress terminates TLS with
fn tls_secret_name(gateway: &str, ingress: &ClusterIngress) -> Option<String> {
    ingress.tls.as_ref().map(|tls| {
        tls.secret
            .clone()
            .unwrap_or_else(|| suffixed_name(gateway, "tls-secret"))
    })
}

/// Gateway Deployment
///
/// The route table hash is stamped on the pod template so a route change
/// rolls the gateway pods.
pub fn gateway_deployment(
    gateway: &Gateway,
    namespace: &str,
    labels: BTreeMap<String, String>,
    image: &str,
    config: &ConfigMap,
) -> Deployment {
    let name = gateway.name_any();
    let config_name = config.name_any();
    let routes = config
        .data
        .as_ref()
        .and_then(|d| d.get(GATEWAY_CONFIG_KEY))
        .map(String::as_str)
        .unwrap_or_default();

    let mut ports = vec![container_port(GATEWAY_CONTAINER_PORT)];
    ports.extend(gateway.spec.ingress.tcp.iter().map(|r| container_port(r.port)));

    let container = Container {
        name: "gateway".to_string(),
        image: Some(image.to_string()),
        ports: Some(ports),
        volume_mounts: Some(vec![VolumeMount {
            name: CONFIG_VOLUME.to_string(),
            mount_path: CONFIG_MOUNT_PATH.to_string(),
            read_only: Some(true),
            ..Default::default()
        }]),
        ..Default::default()
    };

    workload::deployment(
        &suffixed_name(&name, "deployment"),
        namespace,
        labels,
        PodTemplate {
            app: name.clone(),
            replicas: Some(gateway.spec.replicas),
            container,
            volumes: vec![Volume {
                name: CONFIG_VOLUME.to_string(),
                config_map: Some(ConfigMapVolumeSource {
                    name: config_name,
                    default_mode: Some(420),
                    ..Default::default()
                }),
                ..Default::default()
            }],
            annotations: BTreeMap::from([(
                CONFIG_HASH_ANNOTATION.to_string(),
                deterministic_hash(routes),
            )]),
        },
    )
}

/// Gateway Service: HTTP on port 80 plus one port per TCP route
pub fn gateway_service(
    gateway: &Gateway,
    namespace: &str,
    labels: BTreeMap<String, String>,
) -> Service {
    let name = gateway.name_any();
    let mut ports = vec![service_port("http", GATEWAY_HTTP_PORT, GATEWAY_CONTAINER_PORT)];
    ports.extend(
        gateway
            .spec
            .ingress
            .tcp
            .iter()
            .map(|r| service_port(&format!("tcp-{}", r.port), r.port, r.port)),
    );
    workload::service(&gateway_hostname(&name), namespace, labels, &name, ports)
}

/// Ingress exposing the gateway outside the cluster
pub fn gateway_ingress(
    gateway: &str,
    namespace: &str,
    labels: BTreeMap<String, String>,
    ingress: &ClusterIngress,
    ingress_class: Option<&str>,
) -> Ingress {
    let backend = IngressBackend {
        service: Some(IngressServiceBackend {
            name: gateway_hostname(gateway),
            port: Some(ServiceBackendPort {
                number: Some(GATEWAY_HTTP_PORT),
                ..Default::default()
            }),
        }),
        ..Default::default()
    };
    Ingress {
        metadata: child_meta(&suffixed_name(gateway, "ingress"), namespace, labels),
        spec: Some(IngressSpec {
            ingress_class_name: ingress_class.map(str::to_string),
            rules: Some(vec![IngressRule {
                host: Some(ingress.host.clone()),
                http: Some(HTTPIngressRuleValue {
                    paths: vec![HTTPIngressPath {
                        path: Some("/".to_string()),
                        path_type: "Prefix".to_string(),
                        backend,
                    }],
                }),
            }]),
            tls: tls_secret_name(gateway, ingress).map(|secret| {
                vec![IngressTLS {
                    hosts: Some(vec![ingress.host.clone()]),
                    secret_name: Some(secret),
                }]
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

impl ChildResource for Ingress {
    fn owned_fields_match(&self, desired: &Self) -> bool {
        match (self.spec.as_ref(), desired.spec.as_ref()) {
            (Some(o), Some(d)) => {
                (d.ingress_class_name.is_none() || o.ingress_class_name == d.ingress_class_name)
                    && o.rules == d.rules
                    && o.tls == d.tls
            }
            (o, d) => o.is_none() && d.is_none(),
        }
    }

    fn merge_owned_fields(&mut self, desired: &Self) {
        let Some(desired) = desired.spec.as_ref() else {
            return;
        };
        let spec = self.spec.get_or_insert_with(Default::default);
        if desired.ingress_class_name.is_some() {
            spec.ingress_class_name = desired.ingress_class_name.clone();
        }
        spec.rules = desired.rules.clone();
        spec.tls = desired.tls.clone();
    }
}
