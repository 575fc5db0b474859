//! AutoscalePolicy reconciler

use std::sync::Arc;

use async_trait::async_trait;
use kube::ResourceExt;
use tracing::instrument;

use cellmesh_common::crd::{AutoscalePolicy, AutoscalePolicyStatus};
use cellmesh_common::Error;

use crate::apply::Applier;
use crate::client::StatusClient;
use crate::context::Context;
use crate::controller::{ObjectKey, Reconciler};
use crate::reconcile::{reconcile_parent, Outcome, ParentReconciler};
use crate::resources::autoscale::{hpa_replicas, policy_hpa};
use crate::resources::inherited_labels;

/// Realizes an AutoscalePolicy as a HorizontalPodAutoscaler
pub struct AutoscalePolicyReconciler {
    ctx: Arc<Context>,
}

impl AutoscalePolicyReconciler {
    /// Create a reconciler
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl ParentReconciler for AutoscalePolicyReconciler {
    type Parent = AutoscalePolicy;

    fn parents(&self) -> &dyn StatusClient<AutoscalePolicy> {
        self.ctx.clients.autoscale_policies.as_ref()
    }

    async fn apply_children(
        &self,
        policy: &AutoscalePolicy,
        applier: &mut Applier,
    ) -> Result<Outcome<AutoscalePolicyStatus>, Error> {
        let namespace = policy.namespace().unwrap_or_default();
        let labels = inherited_labels(policy.labels(), []);
        let hpa = applier
            .apply(
                self.ctx.clients.hpas.as_ref(),
                policy_hpa(policy, &namespace, labels),
            )
            .await?;

        let (current_replicas, desired_replicas) = hpa_replicas(&hpa);
        let status = AutoscalePolicyStatus {
            current_replicas,
            desired_replicas,
            ..Default::default()
        };
        Ok(Outcome::ready(status, "autoscaler is in place"))
    }
}

#[async_trait]
impl Reconciler for AutoscalePolicyReconciler {
    #[instrument(skip(self), fields(autoscale_policy = %key))]
    async fn reconcile(&self, key: &ObjectKey) -> Result<(), Error> {
        reconcile_parent(self, key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cellmesh_common::crd::{
        AutoscalePolicySpec, HpaPolicy, MetricTarget, ReadyState, ScaleTargetRef,
    };
    use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscalerStatus;

    use crate::client::fake::FakeCluster;
    use crate::config::MeshConfig;

    fn policy() -> AutoscalePolicy {
        let mut policy = AutoscalePolicy::new(
            "orders",
            AutoscalePolicySpec {
                overridable: false,
                policy: HpaPolicy {
                    min_replicas: 2,
                    max_replicas: 6,
                    scale_target_ref: ScaleTargetRef {
                        api_version: "apps/v1".to_string(),
                        kind: "Deployment".to_string(),
                        name: "orders".to_string(),
                    },
                    metrics: vec![MetricTarget {
                        resource: "memory".to_string(),
                        target_average_utilization: 80,
                    }],
                },
            },
        );
        policy.metadata.namespace = Some("shop".to_string());
        policy
    }

    fn key() -> ObjectKey {
        ObjectKey::new("shop", "orders")
    }

    /// Story: the HPA is created, its replica counts surface on the policy,
    /// and a hand edit to the HPA is reverted
    #[tokio::test]
    async fn story_hpa_follows_policy() {
        let cluster = FakeCluster::new();
        cluster.autoscale_policies.insert(policy());
        let reconciler = AutoscalePolicyReconciler::new(cluster.context(MeshConfig::default()));

        reconciler.reconcile(&key()).await.unwrap();
        let hpa = cluster.hpas.object("shop", "orders-hpa").unwrap();
        assert_eq!(hpa.spec.as_ref().unwrap().max_replicas, 6);
        let status = cluster
            .autoscale_policies
            .object("shop", "orders")
            .unwrap()
            .status
            .unwrap();
        assert_eq!(status.status, ReadyState::Ready);

        cluster.hpas.modify("shop", "orders-hpa", false, |hpa| {
            hpa.status = Some(HorizontalPodAutoscalerStatus {
                current_replicas: Some(3),
                desired_replicas: 4,
                ..Default::default()
            });
        });
        reconciler.reconcile(&key()).await.unwrap();
        let status = cluster
            .autoscale_policies
            .object("shop", "orders")
            .unwrap()
            .status
            .unwrap();
        assert_eq!((status.current_replicas, status.desired_replicas), (3, 4));
        assert_eq!(cluster.hpas.updates(), 0);

        cluster.hpas.modify("shop", "orders-hpa", true, |hpa| {
            hpa.spec.as_mut().unwrap().max_replicas = 20;
        });
        reconciler.reconcile(&key()).await.unwrap();
        assert_eq!(cluster.hpas.updates(), 1);
        let hpa = cluster.hpas.object("shop", "orders-hpa").unwrap();
        assert_eq!(hpa.spec.unwrap().max_replicas, 6);
    }
}
