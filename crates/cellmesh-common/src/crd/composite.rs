//! Composite CRD
//!
//! A Composite groups components without a gateway or token service of
//! its own. Components are reached directly through their Services.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{validate_components, validate_dependencies, ComponentSpec, Condition, ReadyState};
use super::{impl_generation_record, impl_mesh_resource, validate_dns_identifier};

/// Composite specification
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "mesh.cellery.io",
    version = "v1alpha2",
    kind = "Composite",
    plural = "composites",
    namespaced,
    status = "CompositeStatus",
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.status"}"#,
    printcolumn = r#"{"name":"Components","type":"integer","jsonPath":".status.componentCount"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct CompositeSpec {
    /// Components run by the composite
    #[serde(default)]
    pub components: Vec<ComponentSpec>,
    /// Names of cells this composite calls
    #[serde(default)]
    pub dependencies: Vec<String>,
}

impl CompositeSpec {
    /// Validate the composite spec
    pub fn validate(&self, name: &str) -> Result<(), String> {
        validate_dns_identifier(name, false).map_err(|e| format!("composite name: {e}"))?;
        validate_components(&self.components)?;
        validate_dependencies(name, &self.dependencies)
    }
}

/// Observed state of a Composite
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CompositeStatus {
    /// Aggregate readiness
    #[serde(default)]
    pub status: ReadyState,
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

impl_generation_record!(CompositeStatus);
impl_mesh_resource!(Composite, CompositeStatus);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_composite_is_valid() {
        assert!(CompositeSpec::default().validate("pets").is_ok());
        assert!(CompositeSpec::default().validate("pets--x").is_err());
    }
}
