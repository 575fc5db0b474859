//! Typed cluster access used by the reconcilers
//!
//! Reads go to the informer cache; writes go to the API server. Reconcilers
//! only see the [`ResourceClient`] and [`StatusClient`] traits so tests can
//! swap in an in-memory cluster.

#[cfg(test)]
pub(crate) mod fake;

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
use k8s_openapi::api::core::v1::{ConfigMap, Secret, Service};
use k8s_openapi::api::networking::v1::{Ingress, NetworkPolicy};
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, PostParams};
use kube::runtime::reflector::{ObjectRef, Store};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;

use cellmesh_common::crd::{
    AutoscalePolicy, Cell, Composite, Gateway, MeshResource, TokenService, VirtualService,
};
use cellmesh_common::kube_utils::{patch_resource_status, FIELD_MANAGER};
use cellmesh_common::Error;

/// Read from cache, write to the API server
#[async_trait]
pub trait ResourceClient<K>: Send + Sync {
    /// Cached object, `None` if absent
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Arc<K>>, Error>;
    /// Create an object
    async fn create(&self, obj: &K) -> Result<K, Error>;
    /// Replace an object (optimistic on `resourceVersion`)
    async fn update(&self, obj: &K) -> Result<K, Error>;
}

/// Status writes for parent resources
#[async_trait]
pub trait StatusClient<K: MeshResource>: ResourceClient<K> {
    /// Persist `status` on `obj`
    async fn update_status(&self, obj: &K, status: &K::Status) -> Result<(), Error>;
}

/// [`ResourceClient`] over a reflector store and `kube::Api`
pub struct KubeResourceClient<K>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    client: Client,
    store: Store<K>,
}

impl<K> KubeResourceClient<K>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    /// Client reading from `store`
    pub fn new(client: Client, store: Store<K>) -> Arc<Self> {
        Arc::new(Self { client, store })
    }
}

fn namespace_of<K: Resource<DynamicType = ()>>(obj: &K) -> Result<String, Error> {
    obj.namespace().ok_or_else(|| {
        Error::internal_with_context(
            "client",
            format!("{} {} has no namespace", K::kind(&()), obj.name_any()),
        )
    })
}

/// A 409 from a write means another writer got there first
fn write_error<K: Resource<DynamicType = ()>>(obj: &K, err: kube::Error) -> Error {
    match err {
        kube::Error::Api(ae) if ae.code == 409 => {
            Error::conflict(K::kind(&()), obj.name_any(), ae.message)
        }
        other => Error::from(other),
    }
}

#[async_trait]
impl<K> ResourceClient<K> for KubeResourceClient<K>
where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static,
{
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Arc<K>>, Error> {
        Ok(self.store.get(&ObjectRef::new(name).within(namespace)))
    }

    async fn create(&self, obj: &K) -> Result<K, Error> {
        let api: Api<K> = Api::namespaced(self.client.clone(), &namespace_of(obj)?);
        let params = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        api.create(&params, obj)
            .await
            .map_err(|e| write_error(obj, e))
    }

    async fn update(&self, obj: &K) -> Result<K, Error> {
        let api: Api<K> = Api::namespaced(self.client.clone(), &namespace_of(obj)?);
        let params = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        api.replace(&obj.name_any(), &params, obj)
            .await
            .map_err(|e| write_error(obj, e))
    }
}

#[async_trait]
impl<K> StatusClient<K> for KubeResourceClient<K>
where
    K: MeshResource,
{
    async fn update_status(&self, obj: &K, status: &K::Status) -> Result<(), Error> {
        patch_resource_status::<K>(&self.client, &obj.name_any(), &namespace_of(obj)?, status)
            .await?;
        Ok(())
    }
}

/// Every typed client a reconciler may need, built once at startup
#[derive(Clone)]
pub struct ClusterClients {
    /// Cells
    pub cells: Arc<dyn StatusClient<Cell>>,
    /// Composites
    pub composites: Arc<dyn StatusClient<Composite>>,
    /// Gateways
    pub gateways: Arc<dyn StatusClient<Gateway>>,
    /// Token services
    pub token_services: Arc<dyn StatusClient<TokenService>>,
    /// Autoscale policies
    pub autoscale_policies: Arc<dyn StatusClient<AutoscalePolicy>>,
    /// Deployments
    pub deployments: Arc<dyn ResourceClient<Deployment>>,
    /// Services
    pub services: Arc<dyn ResourceClient<Service>>,
    /// Horizontal pod autoscalers
    pub hpas: Arc<dyn ResourceClient<HorizontalPodAutoscaler>>,
    /// Network policies
    pub network_policies: Arc<dyn ResourceClient<NetworkPolicy>>,
    /// Config maps
    pub config_maps: Arc<dyn ResourceClient<ConfigMap>>,
    /// Secrets
    pub secrets: Arc<dyn ResourceClient<Secret>>,
    /// Ingresses
    pub ingresses: Arc<dyn ResourceClient<Ingress>>,
    /// Istio virtual services
    pub virtual_services: Arc<dyn ResourceClient<VirtualService>>,
}
