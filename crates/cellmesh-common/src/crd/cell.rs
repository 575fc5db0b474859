//! Cell CRD
//!
//! A Cell is a unit of deployment: a set of components fronted by a single
//! gateway, guarded by a token service and isolated by a network policy.
//! Cells may depend on other cells in the same namespace; calls to a
//! dependency are routed through its gateway.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::gateway::GatewaySpec;
use super::token_service::TokenServiceSpec;
use super::types::{validate_components, validate_dependencies, ComponentSpec, Condition, ReadyState};
use super::{impl_generation_record, impl_mesh_resource, validate_dns_identifier};

/// Cell specification
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "mesh.cellery.io",
    version = "v1alpha2",
    kind = "Cell",
    plural = "cells",
    namespaced,
    status = "CellStatus",
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.status"}"#,
    printcolumn = r#"{"name":"Gateway","type":"string","jsonPath":".status.gatewayHostname"}"#,
    printcolumn = r#"{"name":"Components","type":"integer","jsonPath":".status.componentCount"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct CellSpec {
    /// Gateway template; routes may name components as backends
    #[serde(default)]
    pub gateway: GatewaySpec,
    /// Token service template
    #[serde(default)]
    pub sts: TokenServiceSpec,
    /// Components run by the cell
    #[serde(default)]
    pub components: Vec<ComponentSpec>,
    /// Names of cells this cell calls
    #[serde(default)]
    pub dependencies: Vec<String>,
}

impl CellSpec {
    /// Validate the cell spec
    pub fn validate(&self, name: &str) -> Result<(), String> {
        validate_dns_identifier(name, false).map_err(|e| format!("cell name: {e}"))?;
        validate_components(&self.components)?;
        validate_dependencies(name, &self.dependencies)?;
        self.gateway.validate(name).map_err(|e| format!("gateway: {e}"))?;
        self.sts.validate(name).map_err(|e| format!("sts: {e}"))
    }

    /// Look up a component by name
    pub fn component(&self, name: &str) -> Option<&ComponentSpec> {
        self.components.iter().find(|c| c.name == name)
    }
}

/// Observed state of a Cell
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CellStatus {
    /// Aggregate readiness
    #[serde(default)]
    pub status: ReadyState,
    /// Host name other cells use to reach this cell
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway_hostname: Option<String>,
    /// Readiness of the cell gateway
    #[serde(default)]
    pub gateway_status: ReadyState,
    /// Declared components
    #[serde(default)]
    pub component_count: i32,
    /// Components with at least one available replica
    #[serde(default)]
    pub active_component_count: i32,
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

impl_generation_record!(CellStatus);
impl_mesh_resource!(Cell, CellStatus);
