//! Autoscaling children: component policies and their HPAs

use std::collections::BTreeMap;

use k8s_openapi::api::autoscaling::v2::{
    CrossVersionObjectReference, HorizontalPodAutoscaler, HorizontalPodAutoscalerSpec,
    MetricSpec, MetricTarget as HpaMetricTarget, ResourceMetricSource,
};
use kube::ResourceExt;

use cellmesh_common::crd::{
    AutoscalePolicy, AutoscalePolicySpec, ComponentSpec, HpaPolicy, MetricTarget, ScaleTargetRef,
};
use cellmesh_common::kube_utils::{
    component_autoscale_policy_name, component_deployment_name, suffixed_name,
};

use super::child_meta;
use crate::apply::ChildResource;

/// AutoscalePolicy for an autoscaled component; `None` without scaling
pub fn component_autoscale_policy(
    parent: &str,
    namespace: &str,
    component: &ComponentSpec,
    labels: BTreeMap<String, String>,
) -> Option<AutoscalePolicy> {
    let scaling = component.scaling.as_ref()?;
    let mut policy = AutoscalePolicy::new(
        &component_autoscale_policy_name(parent, &component.name),
        AutoscalePolicySpec {
            overridable: scaling.overridable,
            policy: HpaPolicy {
                min_replicas: scaling.min_replicas,
                max_replicas: scaling.max_replicas,
                scale_target_ref: ScaleTargetRef {
                    api_version: "apps/v1".to_string(),
                    kind: "Deployment".to_string(),
                    name: component_deployment_name(parent, &component.name),
                },
                metrics: scaling.metrics.clone(),
            },
        },
    );
    policy.metadata = child_meta(&policy.name_any(), namespace, labels);
    Some(policy)
}

fn metric_spec(metric: &MetricTarget) -> MetricSpec {
    MetricSpec {
        type_: "Resource".to_string(),
        resource: Some(ResourceMetricSource {
            name: metric.resource.clone(),
            target: HpaMetricTarget {
                type_: "Utilization".to_string(),
                average_utilization: Some(metric.target_average_utilization),
                ..Default::default()
            },
        }),
        ..Default::default()
    }
}

/// HPA (`<policy>-hpa`) realizing an AutoscalePolicy
pub fn policy_hpa(
    policy: &AutoscalePolicy,
    namespace: &str,
    labels: BTreeMap<String, String>,
) -> HorizontalPodAutoscaler {
    let spec = &policy.spec.policy;
    HorizontalPodAutoscaler {
        metadata: child_meta(&suffixed_name(&policy.name_any(), "hpa"), namespace, labels),
        spec: Some(HorizontalPodAutoscalerSpec {
            min_replicas: Some(spec.min_replicas),
            max_replicas: spec.max_replicas,
            scale_target_ref: CrossVersionObjectReference {
                api_version: Some(spec.scale_target_ref.api_version.clone()),
                kind: spec.scale_target_ref.kind.clone(),
                name: spec.scale_target_ref.name.clone(),
            },
            metrics: Some(spec.metrics.iter().map(metric_spec).collect()),
            behavior: None,
        }),
        status: None,
    }
}

/// `(current, desired)` replicas reported by an HPA
pub fn hpa_replicas(hpa: &HorizontalPodAutoscaler) -> (i32, i32) {
    hpa.status
        .as_ref()
        .map(|s| (s.current_replicas.unwrap_or(0), s.desired_replicas))
        .unwrap_or((0, 0))
}

impl ChildResource for HorizontalPodAutoscaler {
    fn owned_fields_match(&self, desired: &Self) -> bool {
        match (self.spec.as_ref(), desired.spec.as_ref()) {
            (Some(o), Some(d)) => {
                o.min_replicas == d.min_replicas
                    && o.max_replicas == d.max_replicas
                    && o.scale_target_ref == d.scale_target_ref
                    && o.metrics == d.metrics
            }
            (o, d) => o.is_none() && d.is_none(),
        }
    }

    fn merge_owned_fields(&mut self, desired: &Self) {
        let Some(desired) = desired.spec.as_ref() else {
            return;
        };
        let spec = self.spec.get_or_insert_with(Default::default);
        spec.min_replicas = desired.min_replicas;
        spec.max_replicas = desired.max_replicas;
        spec.scale_target_ref = desired.scale_target_ref.clone();
        spec.metrics = desired.metrics.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cellmesh_common::crd::ScalingPolicySpec;
    use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscalerStatus;

    fn scaled_component(overridable: bool) -> ComponentSpec {
        ComponentSpec {
            name: "employee".to_string(),
            scaling: Some(ScalingPolicySpec {
                min_replicas: 1,
                max_replicas: 4,
                overridable,
                metrics: vec![MetricTarget {
                    resource: "cpu".to_string(),
                    target_average_utilization: 70,
                }],
            }),
            ..Default::default()
        }
    }

    #[test]
    fn component_policy_targets_component_deployment() {
        let policy =
            component_autoscale_policy("hr", "default", &scaled_component(true), BTreeMap::new())
                .unwrap();
        assert_eq!(
            policy.metadata.name.as_deref(),
            Some("hr--employee-autoscalepolicy")
        );
        assert_eq!(policy.metadata.namespace.as_deref(), Some("default"));
        assert!(policy.spec.overridable);
        assert!(policy.allows_override());
        assert_eq!(
            policy.spec.policy.scale_target_ref.name,
            "hr--employee-deployment"
        );

        let unscaled = ComponentSpec::default();
        assert!(component_autoscale_policy("hr", "default", &unscaled, BTreeMap::new()).is_none());
    }

    #[test]
    fn hpa_mirrors_policy() {
        let policy =
            component_autoscale_policy("hr", "default", &scaled_component(false), BTreeMap::new())
                .unwrap();
        let hpa = policy_hpa(&policy, "default", BTreeMap::new());
        assert_eq!(
            hpa.metadata.name.as_deref(),
            Some("hr--employee-autoscalepolicy-hpa")
        );
        let spec = hpa.spec.clone().unwrap();
        assert_eq!(spec.min_replicas, Some(1));
        assert_eq!(spec.max_replicas, 4);
        assert_eq!(spec.scale_target_ref.kind, "Deployment");
        let metric = &spec.metrics.unwrap()[0];
        assert_eq!(metric.resource.as_ref().unwrap().name, "cpu");
        assert_eq!(
            metric.resource.as_ref().unwrap().target.average_utilization,
            Some(70)
        );
        assert_eq!(hpa_replicas(&hpa), (0, 0));
    }

    #[test]
    fn hpa_status_is_not_drift() {
        let policy =
            component_autoscale_policy("hr", "default", &scaled_component(false), BTreeMap::new())
                .unwrap();
        let desired = policy_hpa(&policy, "default", BTreeMap::new());
        let mut observed = desired.clone();
        observed.status = Some(HorizontalPodAutoscalerStatus {
            current_replicas: Some(2),
            desired_replicas: 3,
            ..Default::default()
        });
        assert!(observed.owned_fields_match(&desired));
        assert_eq!(hpa_replicas(&observed), (2, 3));

        observed.spec.as_mut().unwrap().max_replicas = 10;
        assert!(!observed.owned_fields_match(&desired));
    }
}
