//! TokenService CRD
//!
//! The token service issues and validates tokens for calls entering and
//! leaving a cell, and evaluates OPA policies for authorization.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{Condition, ReadyState};
use super::{impl_generation_record, impl_mesh_resource};

/// TokenService specification
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "mesh.cellery.io",
    version = "v1alpha2",
    kind = "TokenService",
    plural = "tokenservices",
    shortname = "sts",
    namespaced,
    status = "TokenServiceStatus",
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.status"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct TokenServiceSpec {
    /// Token service replicas
    #[serde(default = "default_sts_replicas")]
    pub replicas: i32,
    /// Which traffic direction is intercepted for token validation
    #[serde(default)]
    pub intercept_mode: InterceptMode,
    /// Paths served without a token
    #[serde(default)]
    pub unsecured_paths: Vec<String>,
    /// OPA policies, keyed by file name
    #[serde(default)]
    pub opa_policies: Vec<OpaPolicy>,
}

fn default_sts_replicas() -> i32 {
    1
}

/// Traffic direction intercepted by the token service
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum InterceptMode {
    /// Only calls entering the cell
    Inbound,
    /// Only calls leaving the cell
    Outbound,
    /// Both directions
    #[default]
    Any,
    /// Token service runs but intercepts nothing
    None,
}

impl std::fmt::Display for InterceptMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Inbound => write!(f, "Inbound"),
            Self::Outbound => write!(f, "Outbound"),
            Self::Any => write!(f, "Any"),
            Self::None => write!(f, "None"),
        }
    }
}

/// A named OPA policy module
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OpaPolicy {
    /// File name of the policy, e.g. `default.rego`
    pub key: String,
    /// Rego source
    pub policy: String,
}

impl TokenServiceSpec {
    /// Validate the token service spec
    pub fn validate(&self, _name: &str) -> Result<(), String> {
        if self.replicas < 0 {
            return Err("token service replicas must not be negative".to_string());
        }
        if let Some(path) = self.unsecured_paths.iter().find(|p| !p.starts_with('/')) {
            return Err(format!("unsecured path must start with '/': {path}"));
        }
        let mut keys = std::collections::BTreeSet::new();
        for policy in &self.opa_policies {
            if policy.key.is_empty() {
                return Err("opa policy key is required".to_string());
            }
            if !keys.insert(policy.key.as_str()) {
                return Err(format!("duplicate opa policy key {}", policy.key));
            }
        }
        Ok(())
    }
}

/// Observed state of a TokenService
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TokenServiceStatus {
    /// Aggregate readiness
    #[serde(default)]
    pub status: ReadyState,
    /// Available token service replicas
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

impl_generation_record!(TokenServiceStatus);
impl_mesh_resource!(TokenService, TokenServiceStatus);
