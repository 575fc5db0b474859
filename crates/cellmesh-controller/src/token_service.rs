//! TokenService reconciler

use std::sync::Arc;

use async_trait::async_trait;
use kube::ResourceExt;
use tracing::instrument;

use cellmesh_common::crd::{TokenService, TokenServiceStatus};
use cellmesh_common::{Error, LABEL_TOKEN_SERVICE};

use crate::apply::Applier;
use crate::client::StatusClient;
use crate::components::REASON_CHILDREN_NOT_READY;
use crate::context::Context;
use crate::controller::{ObjectKey, Reconciler};
use crate::reconcile::{reconcile_parent, Outcome, ParentReconciler};
use crate::resources::inherited_labels;
use crate::resources::token_service::{sts_config, sts_deployment, sts_policy, sts_service};
use crate::resources::workload::available_replicas;

/// Runs the token service of a cell
pub struct TokenServiceReconciler {
    ctx: Arc<Context>,
}

impl TokenServiceReconciler {
    /// Create a reconciler
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl ParentReconciler for TokenServiceReconciler {
    type Parent = TokenService;

    fn parents(&self) -> &dyn StatusClient<TokenService> {
        self.ctx.clients.token_services.as_ref()
    }

    async fn apply_children(
        &self,
        sts: &TokenService,
        applier: &mut Applier,
    ) -> Result<Outcome<TokenServiceStatus>, Error> {
        let clients = &self.ctx.clients;
        let name = sts.name_any();
        let namespace = sts.namespace().unwrap_or_default();
        let labels = inherited_labels(sts.labels(), [(LABEL_TOKEN_SERVICE, name.as_str())]);

        let config = applier
            .apply(
                clients.config_maps.as_ref(),
                sts_config(sts, &namespace, labels.clone())?,
            )
            .await?;
        let policy = applier
            .apply(
                clients.config_maps.as_ref(),
                sts_policy(sts, &namespace, labels.clone()),
            )
            .await?;
        let deployment = applier
            .apply(
                clients.deployments.as_ref(),
                sts_deployment(
                    sts,
                    &namespace,
                    labels.clone(),
                    &self.ctx.config.token_service_image,
                    &config,
                    &policy,
                ),
            )
            .await?;
        applier
            .apply(clients.services.as_ref(), sts_service(sts, &namespace, labels))
            .await?;

        let available = available_replicas(&deployment);
        let status = TokenServiceStatus {
            available_replicas: available,
            ..Default::default()
        };
        Ok(if available > 0 {
            Outcome::ready(status, "token service is available")
        } else {
            Outcome::not_ready(
                status,
                REASON_CHILDREN_NOT_READY,
                "waiting for: token service deployment",
            )
        })
    }
}

#[async_trait]
impl Reconciler for TokenServiceReconciler {
    #[instrument(skip(self), fields(token_service = %key))]
    async fn reconcile(&self, key: &ObjectKey) -> Result<(), Error> {
        reconcile_parent(self, key).await
    }
}
