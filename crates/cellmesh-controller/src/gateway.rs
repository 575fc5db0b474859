//! Gateway reconciler

use std::sync::Arc;

use async_trait::async_trait;
use kube::ResourceExt;
use tracing::instrument;

use cellmesh_common::crd::{Gateway, GatewayStatus};
use cellmesh_common::{Error, LABEL_GATEWAY};

use crate::apply::Applier;
use crate::client::StatusClient;
use crate::components::{Pending, REASON_CHILDREN_NOT_READY};
use crate::context::Context;
use crate::controller::{ObjectKey, Reconciler};
use crate::reconcile::{reconcile_parent, Outcome, ParentReconciler};
use crate::resources::gateway::{
    gateway_config, gateway_deployment, gateway_hostname, gateway_ingress, gateway_service,
    tls_secret,
};
use crate::resources::inherited_labels;
use crate::resources::workload::available_replicas;

/// Runs the gateway of a cell: route table, pods, service and ingress
pub struct GatewayReconciler {
    ctx: Arc<Context>,
}

impl GatewayReconciler {
    /// Create a reconciler
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl ParentReconciler for GatewayReconciler {
    type Parent = Gateway;

    fn parents(&self) -> &dyn StatusClient<Gateway> {
        self.ctx.clients.gateways.as_ref()
    }

    async fn apply_children(
        &self,
        gateway: &Gateway,
        applier: &mut Applier,
    ) -> Result<Outcome<GatewayStatus>, Error> {
        let clients = &self.ctx.clients;
        let config = &self.ctx.config;
        let name = gateway.name_any();
        let namespace = gateway.namespace().unwrap_or_default();
        let labels = inherited_labels(gateway.labels(), [(LABEL_GATEWAY, name.as_str())]);
        let cluster_ingress = gateway.spec.ingress.cluster_ingress.as_ref();

        let route_table = applier
            .apply(
                clients.config_maps.as_ref(),
                gateway_config(gateway, &namespace, labels.clone())?,
            )
            .await?;

        if let Some(ingress) = cluster_ingress {
            let secret = tls_secret(
                &name,
                &namespace,
                labels.clone(),
                ingress,
                config.private_key.as_deref(),
            )?;
            if let Some(secret) = secret {
                applier.apply(clients.secrets.as_ref(), secret).await?;
            }
        }

        let deployment = applier
            .apply(
                clients.deployments.as_ref(),
                gateway_deployment(
                    gateway,
                    &namespace,
                    labels.clone(),
                    &config.gateway_image,
                    &route_table,
                ),
            )
            .await?;

        applier
            .apply(
                clients.services.as_ref(),
                gateway_service(gateway, &namespace, labels.clone()),
            )
            .await?;

        if let Some(ingress) = cluster_ingress {
            applier
                .apply(
                    clients.ingresses.as_ref(),
                    gateway_ingress(
                        &name,
                        &namespace,
                        labels,
                        ingress,
                        config.cluster_ingress_class.as_deref(),
                    ),
                )
                .await?;
        }

        let available = available_replicas(&deployment);
        let status = GatewayStatus {
            hostname: Some(gateway_hostname(&name)),
            available_replicas: available,
            ..Default::default()
        };
        if available > 0 {
            return Ok(Outcome::ready(status, "gateway is available"));
        }
        let mut pending = Pending::default();
        pending.child("gateway deployment");
        let (_, message) = pending.describe();
        Ok(Outcome::not_ready(status, REASON_CHILDREN_NOT_READY, message))
    }
}

#[async_trait]
impl Reconciler for GatewayReconciler {
    #[instrument(skip(self), fields(gateway = %key))]
    async fn reconcile(&self, key: &ObjectKey) -> Result<(), Error> {
        reconcile_parent(self, key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cellmesh_common::crd::{
        ClusterIngress, GatewayIngress, GatewaySpec, HttpApi, ReadyState, TlsConfig,
    };
    use cellmesh_common::crypto::{encrypt, PrivateKey};
    use cellmesh_common::LABEL_CELL;

    use crate::client::fake::FakeCluster;
    use crate::config::MeshConfig;

    fn gateway(ingress: Option<ClusterIngress>) -> Gateway {
        let mut gw = Gateway::new(
            "hr--gateway",
            GatewaySpec {
                replicas: 1,
                ingress: GatewayIngress {
                    http: vec![HttpApi {
                        context: "/employee".to_string(),
                        backend: "hr--employee-service".to_string(),
                        global: false,
                        authenticate: true,
                    }],
                    tcp: vec![],
                    cluster_ingress: ingress,
                },
            },
        );
        gw.metadata.namespace = Some("default".to_string());
        gw.metadata.labels = Some([(LABEL_CELL.to_string(), "hr".to_string())].into());
        gw
    }

    fn key() -> ObjectKey {
        ObjectKey::new("default", "hr--gateway")
    }

    fn status(cluster: &FakeCluster) -> GatewayStatus {
        cluster
            .gateways
            .object("default", "hr--gateway")
            .unwrap()
            .status
            .unwrap()
    }

    /// Story: a gateway converges, becomes ready once its pods are up,
    /// and then stays quiet
    #[tokio::test]
    async fn story_gateway_converges_and_goes_quiet() {
        let cluster = FakeCluster::new();
        cluster.gateways.insert(gateway(None));
        let reconciler = GatewayReconciler::new(cluster.context(MeshConfig::default()));

        reconciler.reconcile(&key()).await.unwrap();
        assert_eq!(cluster.config_maps.len(), 1);
        assert_eq!(cluster.deployments.len(), 1);
        assert_eq!(cluster.services.len(), 1);
        assert_eq!(cluster.ingresses.len(), 0);
        assert_eq!(cluster.secrets.len(), 0);
        let first = status(&cluster);
        assert_eq!(first.status, ReadyState::NotReady);
        assert_eq!(first.hostname.as_deref(), Some("hr--gateway-service"));

        let deployment = cluster
            .deployments
            .object("default", "hr--gateway-deployment")
            .unwrap();
        assert_eq!(deployment.labels()[LABEL_CELL], "hr");
        assert_eq!(deployment.labels()[LABEL_GATEWAY], "hr--gateway");

        cluster.set_available("default", "hr--gateway-deployment", 1);
        reconciler.reconcile(&key()).await.unwrap();
        let ready = status(&cluster);
        assert_eq!(ready.status, ReadyState::Ready);
        assert_eq!(ready.available_replicas, 1);
        assert!(ready.child_generations.contains_key("Deployment/hr--gateway-deployment"));

        let writes = cluster.child_writes();
        let status_writes = cluster.gateways.status_writes();
        reconciler.reconcile(&key()).await.unwrap();
        assert_eq!(cluster.child_writes(), writes);
        assert_eq!(cluster.gateways.status_writes(), status_writes);
    }

    #[tokio::test]
    async fn cluster_ingress_gets_tls_secret_and_ingress() {
        let key_pair = PrivateKey::generate().unwrap();
        let tls = TlsConfig {
            secret: None,
            key: encrypt(b"private", key_pair.public_key()).unwrap(),
            cert: "cert".to_string(),
        };
        let cluster = FakeCluster::new();
        cluster.gateways.insert(gateway(Some(ClusterIngress {
            host: "hr.example.com".to_string(),
            tls: Some(tls),
        })));
        let config = MeshConfig {
            cluster_ingress_class: Some("nginx".to_string()),
            ..Default::default()
        }
        .with_private_key(key_pair);
        let reconciler = GatewayReconciler::new(cluster.context(config));

        reconciler.reconcile(&key()).await.unwrap();
        let secret = cluster
            .secrets
            .object("default", "hr--gateway-tls-secret")
            .unwrap();
        assert_eq!(secret.data.unwrap()["tls.key"].0, b"private");
        let ingress = cluster.ingresses.object("default", "hr--gateway-ingress").unwrap();
        assert_eq!(
            ingress.spec.unwrap().ingress_class_name.as_deref(),
            Some("nginx")
        );
    }

    /// Story: encrypted TLS material without a configured key fails
    /// permanently, after the route table is already in place
    #[tokio::test]
    async fn story_undecryptable_tls_is_fatal() {
        let other = PrivateKey::generate().unwrap();
        let cluster = FakeCluster::new();
        cluster.gateways.insert(gateway(Some(ClusterIngress {
            host: "hr.example.com".to_string(),
            tls: Some(TlsConfig {
                secret: None,
                key: encrypt(b"private", other.public_key()).unwrap(),
                cert: "cert".to_string(),
            }),
        })));
        let reconciler = GatewayReconciler::new(cluster.context(MeshConfig::default()));

        let err = reconciler.reconcile(&key()).await.unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
        assert!(!err.is_retryable());
        assert_eq!(cluster.config_maps.len(), 1);
        assert_eq!(cluster.deployments.len(), 0);
        assert_eq!(cluster.gateways.status_writes(), 0);
    }
}
