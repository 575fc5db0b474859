//! AutoscalePolicy CRD
//!
//! Wraps a horizontal pod autoscaler definition. Cells and composites emit
//! one per scaled component; users may also create them directly.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{validate_scaling, Condition, MetricTarget, ReadyState};
use super::{impl_generation_record, impl_mesh_resource};

/// AutoscalePolicy specification
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "mesh.cellery.io",
    version = "v1alpha2",
    kind = "AutoscalePolicy",
    plural = "autoscalepolicies",
    shortname = "asp",
    namespaced,
    status = "AutoscalePolicyStatus",
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.status"}"#,
    printcolumn = r#"{"name":"Current","type":"integer","jsonPath":".status.currentReplicas"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct AutoscalePolicySpec {
    /// Operators may edit this policy and the owning cell will not revert it
    #[serde(default)]
    pub overridable: bool,
    /// Autoscaler definition
    pub policy: HpaPolicy,
}

/// Horizontal pod autoscaler definition
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HpaPolicy {
    /// Lower replica bound
    pub min_replicas: i32,
    /// Upper replica bound
    pub max_replicas: i32,
    /// Workload being scaled
    pub scale_target_ref: ScaleTargetRef,
    /// Metric targets
    #[serde(default)]
    pub metrics: Vec<MetricTarget>,
}

/// Reference to the scaled workload
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScaleTargetRef {
    /// API version of the target, e.g. `apps/v1`
    pub api_version: String,
    /// Kind of the target, e.g. `Deployment`
    pub kind: String,
    /// Name of the target
    pub name: String,
}

impl AutoscalePolicySpec {
    /// Validate the policy
    pub fn validate(&self, _name: &str) -> Result<(), String> {
        let target = &self.policy.scale_target_ref;
        if target.name.is_empty() || target.kind.is_empty() || target.api_version.is_empty() {
            return Err("scaleTargetRef requires apiVersion, kind and name".to_string());
        }
        validate_scaling(
            self.policy.min_replicas,
            self.policy.max_replicas,
            &self.policy.metrics,
        )
    }
}

/// Observed state of an AutoscalePolicy
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AutoscalePolicyStatus {
    /// Aggregate readiness
    #[serde(default)]
    pub status: ReadyState,
    /// Replicas currently running, as seen by the autoscaler
    #[serde(default)]
    pub current_replicas: i32,
    /// Replicas the autoscaler wants
    #[serde(default)]
    pub desired_replicas: i32,
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

impl_generation_record!(AutoscalePolicyStatus);
impl_mesh_resource!(AutoscalePolicy, AutoscalePolicyStatus);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation() {
        let mut spec = AutoscalePolicySpec {
            overridable: false,
            policy: HpaPolicy {
                min_replicas: 1,
                max_replicas: 4,
                scale_target_ref: ScaleTargetRef {
                    api_version: "apps/v1".to_string(),
                    kind: "Deployment".to_string(),
                    name: "hr--employee-deployment".to_string(),
                },
                metrics: vec![MetricTarget {
                    resource: "cpu".to_string(),
                    target_average_utilization: 70,
                }],
            },
        };
        assert!(spec.validate("p").is_ok());

        spec.policy.scale_target_ref.name.clear();
        assert!(spec.validate("p").unwrap_err().contains("scaleTargetRef"));
    }
}
