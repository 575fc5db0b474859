//! Cell isolation

use std::collections::BTreeMap;

use k8s_openapi::api::networking::v1::{
    NetworkPolicy, NetworkPolicyIngressRule, NetworkPolicyPeer, NetworkPolicySpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, LabelSelectorRequirement};

use cellmesh_common::kube_utils::network_policy_name;
use cellmesh_common::{LABEL_CELL, LABEL_GATEWAY};

use super::child_meta;
use crate::apply::ChildResource;

/// Policy admitting traffic to a cell's workloads only from the same cell
///
/// The gateway pods are left out of the selector; they are the cell's
/// entry point and accept traffic from anywhere.
pub fn cell_network_policy(
    cell: &str,
    namespace: &str,
    labels: BTreeMap<String, String>,
) -> NetworkPolicy {
    let same_cell = BTreeMap::from([(LABEL_CELL.to_string(), cell.to_string())]);
    NetworkPolicy {
        metadata: child_meta(&network_policy_name(cell), namespace, labels),
        spec: Some(NetworkPolicySpec {
            pod_selector: LabelSelector {
                match_labels: Some(same_cell.clone()),
                match_expressions: Some(vec![LabelSelectorRequirement {
                    key: LABEL_GATEWAY.to_string(),
                    operator: "DoesNotExist".to_string(),
                    values: None,
                }]),
            },
            ingress: Some(vec![NetworkPolicyIngressRule {
                from: Some(vec![NetworkPolicyPeer {
                    pod_selector: Some(LabelSelector {
                        match_labels: Some(same_cell),
                        ..Default::default()
                    }),
                    ..Default::default()
                }]),
                ports: None,
            }]),
            policy_types: Some(vec!["Ingress".to_string()]),
            ..Default::default()
        }),
    }
}

impl ChildResource for NetworkPolicy {
    fn owned_fields_match(&self, desired: &Self) -> bool {
        match (self.spec.as_ref(), desired.spec.as_ref()) {
            (Some(o), Some(d)) => {
                o.pod_selector == d.pod_selector
                    && o.ingress == d.ingress
                    && o.policy_types == d.policy_types
            }
            (o, d) => o.is_none() && d.is_none(),
        }
    }

    fn merge_owned_fields(&mut self, desired: &Self) {
        let Some(desired) = desired.spec.as_ref() else {
            return;
        };
        let spec = self.spec.get_or_insert_with(Default::default);
        spec.pod_selector = desired.pod_selector.clone();
        spec.ingress = desired.ingress.clone();
        spec.policy_types = desired.policy_types.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_excludes_gateway_and_admits_same_cell() {
        let policy = cell_network_policy("hr", "default", BTreeMap::new());
        assert_eq!(policy.metadata.name.as_deref(), Some("hr--network"));

        let spec = policy.spec.unwrap();
        let selector = &spec.pod_selector;
        assert_eq!(selector.match_labels.as_ref().unwrap()[LABEL_CELL], "hr");
        let exclusion = &selector.match_expressions.as_ref().unwrap()[0];
        assert_eq!(exclusion.key, LABEL_GATEWAY);
        assert_eq!(exclusion.operator, "DoesNotExist");

        let peer = &spec.ingress.unwrap()[0].from.clone().unwrap()[0];
        assert_eq!(
            peer.pod_selector.as_ref().unwrap().match_labels.as_ref().unwrap()[LABEL_CELL],
            "hr"
        );
        assert_eq!(spec.policy_types, Some(vec!["Ingress".to_string()]));
    }

    #[test]
    fn egress_added_by_others_is_not_drift() {
        let desired = cell_network_policy("hr", "default", BTreeMap::new());
        let mut observed = desired.clone();
        observed.spec.as_mut().unwrap().egress = Some(vec![Default::default()]);
        assert!(observed.owned_fields_match(&desired));

        observed.spec.as_mut().unwrap().policy_types = None;
        assert!(!observed.owned_fields_match(&desired));
    }
}
