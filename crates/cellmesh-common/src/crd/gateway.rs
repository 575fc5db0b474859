//! Gateway CRD
//!
//! A Gateway is the single entry point of a cell. The controller renders
//! its routes into a ConfigMap, runs the gateway Deployment and Service,
//! and, when a cluster ingress is declared, an Ingress with an optional
//! TLS Secret built from (possibly encrypted) key material.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{Condition, ReadyState};
use super::{impl_generation_record, impl_mesh_resource};

/// Gateway specification
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "mesh.cellery.io",
    version = "v1alpha2",
    kind = "Gateway",
    plural = "gateways",
    shortname = "gw",
    namespaced,
    status = "GatewayStatus",
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.status"}"#,
    printcolumn = r#"{"name":"Hostname","type":"string","jsonPath":".status.hostname"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct GatewaySpec {
    /// Gateway replicas
    #[serde(default = "default_gateway_replicas")]
    pub replicas: i32,
    /// Routes exposed by the gateway
    #[serde(default)]
    pub ingress: GatewayIngress,
}

fn default_gateway_replicas() -> i32 {
    1
}

/// Routes exposed by a gateway
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GatewayIngress {
    /// HTTP APIs, matched by context path
    #[serde(default)]
    pub http: Vec<HttpApi>,
    /// TCP port forwards
    #[serde(default)]
    pub tcp: Vec<TcpRoute>,
    /// Expose the gateway outside the cluster
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_ingress: Option<ClusterIngress>,
}

/// An HTTP API routed by context path
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HttpApi {
    /// Context path, e.g. `/employee`
    pub context: String,
    /// Backend host (`host` or `host:port`); inside a Cell a component name
    pub backend: String,
    /// Publish the API on the cluster ingress
    #[serde(default)]
    pub global: bool,
    /// Require a token from the cell's token service
    #[serde(default = "default_true")]
    pub authenticate: bool,
}

fn default_true() -> bool {
    true
}

/// A TCP port forward
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TcpRoute {
    /// Port opened on the gateway
    pub port: i32,
    /// Backend host; inside a Cell a component name
    pub backend_host: String,
    /// Backend port
    pub backend_port: i32,
}

/// Cluster ingress settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterIngress {
    /// Public host name
    pub host: String,
    /// TLS termination
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsConfig>,
}

/// TLS material for the cluster ingress
///
/// Either reference an existing Secret or inline `key`/`cert`. Inline
/// values may be plain, `b64:`-prefixed or `enc:`-prefixed.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TlsConfig {
    /// Existing TLS Secret in the gateway namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    /// PEM private key
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub key: String,
    /// PEM certificate chain
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cert: String,
}

impl GatewaySpec {
    /// Validate the gateway spec
    pub fn validate(&self, _name: &str) -> Result<(), String> {
        if self.replicas < 0 {
            return Err("gateway replicas must not be negative".to_string());
        }
        let mut contexts = std::collections::BTreeSet::new();
        for api in &self.ingress.http {
            if !api.context.starts_with('/') {
                return Err(format!("http context must start with '/': {}", api.context));
            }
            if api.backend.is_empty() {
                return Err(format!("http api {} has no backend", api.context));
            }
            if !contexts.insert(api.context.as_str()) {
                return Err(format!("duplicate http context {}", api.context));
            }
        }
        let mut ports = std::collections::BTreeSet::new();
        for route in &self.ingress.tcp {
            if !(1..=65535).contains(&route.port) || !(1..=65535).contains(&route.backend_port) {
                return Err(format!("tcp route port out of range: {}", route.port));
            }
            if !ports.insert(route.port) {
                return Err(format!("duplicate tcp port {}", route.port));
            }
        }
        if let Some(ingress) = &self.ingress.cluster_ingress {
            if ingress.host.is_empty() {
                return Err("clusterIngress.host is required".to_string());
            }
            if let Some(tls) = &ingress.tls {
                let inline = !tls.key.is_empty() || !tls.cert.is_empty();
                match (&tls.secret, inline) {
                    (Some(_), true) => {
                        return Err("tls.secret and inline tls key/cert are exclusive".to_string())
                    }
                    (None, false) => {
                        return Err("tls requires a secret or an inline key and cert".to_string())
                    }
                    (None, true) if tls.key.is_empty() || tls.cert.is_empty() => {
                        return Err("inline tls requires both key and cert".to_string())
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }
}

/// Observed state of a Gateway
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GatewayStatus {
    /// Aggregate readiness
    #[serde(default)]
    pub status: ReadyState,
    /// In-cluster host name of the gateway Service
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    /// Available gateway replicas
    #[serde(default)]
    pub available_replicas: i32,
    /// Last observed generation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    /// Generations of children at the last reconcile
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub child_generations: BTreeMap<String, i64>,
    /// Status conditions
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl_generation_record!(GatewayStatus);
impl_mesh_resource!(Gateway, GatewayStatus);

#[cfg(test)]
mod tests {
    use super::*;

    fn spec_with_tls(tls: TlsConfig) -> GatewaySpec {
        GatewaySpec {
            replicas: 1,
            ingress: GatewayIngress {
                cluster_ingress: Some(ClusterIngress {
                    host: "hr.example.com".to_string(),
                    tls: Some(tls),
                }),
                ..Default::default()
            },
        }
    }

    #[test]
    fn parses_camel_case_ingress() {
        let spec: GatewaySpec = serde_json::from_value(serde_json::json!({
            "ingress": {
                "http": [{"context": "/employee", "backend": "employee"}],
                "tcp": [{"port": 3306, "backendHost": "db", "backendPort": 3306}],
                "clusterIngress": {"host": "hr.example.com"}
            }
        }))
        .unwrap();
        assert_eq!(spec.replicas, 1);
        assert!(spec.ingress.http[0].authenticate);
        assert_eq!(spec.ingress.tcp[0].backend_host, "db");
        assert!(spec.validate("gw").is_ok());
    }

    #[test]
    fn rejects_bad_routes() {
        let mut spec = GatewaySpec::default();
        spec.ingress.http.push(HttpApi {
            context: "employee".to_string(),
            backend: "employee".to_string(),
            ..Default::default()
        });
        assert!(spec.validate("gw").unwrap_err().contains("must start with"));

        let mut spec = GatewaySpec::default();
        spec.ingress.tcp = vec![
            TcpRoute {
                port: 80,
                backend_host: "a".to_string(),
                backend_port: 80,
            },
            TcpRoute {
                port: 80,
                backend_host: "b".to_string(),
                backend_port: 80,
            },
        ];
        assert!(spec.validate("gw").unwrap_err().contains("duplicate tcp"));
    }

    #[test]
    fn tls_source_is_exclusive() {
        let ok_inline = spec_with_tls(TlsConfig {
            secret: None,
            key: "enc:abc".to_string(),
            cert: "b64:abc".to_string(),
        });
        assert!(ok_inline.validate("gw").is_ok());

        let ok_secret = spec_with_tls(TlsConfig {
            secret: Some("existing".to_string()),
            ..Default::default()
        });
        assert!(ok_secret.validate("gw").is_ok());

        let both = spec_with_tls(TlsConfig {
            secret: Some("existing".to_string()),
            key: "k".to_string(),
            cert: "c".to_string(),
        });
        assert!(both.validate("gw").is_err());

        let half = spec_with_tls(TlsConfig {
            secret: None,
            key: "k".to_string(),
            cert: String::new(),
        });
        assert!(half.validate("gw").is_err());
    }
}
