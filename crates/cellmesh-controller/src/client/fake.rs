//! In-memory cluster for reconciler tests

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentStatus};
use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
use k8s_openapi::api::core::v1::{ConfigMap, Secret, Service};
use k8s_openapi::api::networking::v1::{Ingress, NetworkPolicy};
use kube::{Resource, ResourceExt};

use cellmesh_common::crd::{
    AutoscalePolicy, Cell, Composite, Gateway, MeshResource, TokenService, VirtualService,
};
use cellmesh_common::Error;

use super::{ClusterClients, ResourceClient, StatusClient};
use crate::config::MeshConfig;
use crate::context::Context;

/// One kind's worth of objects plus write counters
pub(crate) struct FakeClient<K> {
    objects: Mutex<BTreeMap<(String, String), K>>,
    tracks_generation: bool,
    next_uid: AtomicUsize,
    pub creates: AtomicUsize,
    pub updates: AtomicUsize,
    pub status_writes: AtomicUsize,
}

impl<K> FakeClient<K>
where
    K: Resource + Clone + Send + Sync + 'static,
{
    pub fn new(tracks_generation: bool) -> Arc<Self> {
        Arc::new(Self {
            objects: Mutex::new(BTreeMap::new()),
            tracks_generation,
            next_uid: AtomicUsize::new(0),
            creates: AtomicUsize::new(0),
            updates: AtomicUsize::new(0),
            status_writes: AtomicUsize::new(0),
        })
    }

    fn key(obj: &K) -> (String, String) {
        (obj.namespace().unwrap_or_default(), obj.name_any())
    }

    /// Seed an object as if another actor created it
    pub fn insert(&self, mut obj: K) -> K {
        let meta = obj.meta_mut();
        if meta.uid.is_none() {
            meta.uid = Some(format!("uid-{}", self.next_uid.fetch_add(1, Ordering::SeqCst)));
        }
        if self.tracks_generation && meta.generation.is_none() {
            meta.generation = Some(1);
        }
        meta.resource_version.get_or_insert_with(|| "1".to_string());
        self.objects
            .lock()
            .unwrap()
            .insert(Self::key(&obj), obj.clone());
        obj
    }

    /// Fetch a stored object
    pub fn object(&self, namespace: &str, name: &str) -> Option<K> {
        self.objects
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Change an object out-of-band; `spec_change` bumps its generation
    pub fn modify(&self, namespace: &str, name: &str, spec_change: bool, f: impl FnOnce(&mut K)) {
        let mut objects = self.objects.lock().unwrap();
        let obj = objects
            .get_mut(&(namespace.to_string(), name.to_string()))
            .expect("object to modify");
        f(obj);
        let meta = obj.meta_mut();
        bump(&mut meta.resource_version);
        if spec_change && self.tracks_generation {
            meta.generation = Some(meta.generation.unwrap_or(0) + 1);
        }
    }

    pub fn len(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    pub fn creates(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn updates(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }

    pub fn status_writes(&self) -> usize {
        self.status_writes.load(Ordering::SeqCst)
    }

    /// Total writes of any kind
    pub fn writes(&self) -> usize {
        self.creates() + self.updates() + self.status_writes()
    }
}

fn bump(resource_version: &mut Option<String>) {
    let next = resource_version
        .as_deref()
        .and_then(|rv| rv.parse::<u64>().ok())
        .unwrap_or(0)
        + 1;
    *resource_version = Some(next.to_string());
}

#[async_trait]
impl<K> ResourceClient<K> for FakeClient<K>
where
    K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
{
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Arc<K>>, Error> {
        Ok(self.object(namespace, name).map(Arc::new))
    }

    async fn create(&self, obj: &K) -> Result<K, Error> {
        if self.object(&obj.namespace().unwrap_or_default(), &obj.name_any()).is_some() {
            return Err(Error::conflict(K::kind(&()), obj.name_any(), "already exists"));
        }
        self.creates.fetch_add(1, Ordering::SeqCst);
        Ok(self.insert(obj.clone()))
    }

    async fn update(&self, obj: &K) -> Result<K, Error> {
        let mut objects = self.objects.lock().unwrap();
        let key = Self::key(obj);
        let Some(current) = objects.get(&key) else {
            return Err(Error::internal(format!("{} not found", obj.name_any())));
        };
        let mut stored = obj.clone();
        let generation = current.meta().generation.map(|g| g + 1);
        let meta = stored.meta_mut();
        meta.uid = current.meta().uid.clone();
        meta.resource_version = current.meta().resource_version.clone();
        bump(&mut meta.resource_version);
        meta.generation = generation;
        objects.insert(key, stored.clone());
        self.updates.fetch_add(1, Ordering::SeqCst);
        Ok(stored)
    }
}

#[async_trait]
impl<K> StatusClient<K> for FakeClient<K>
where
    K: MeshResource,
{
    /// Mirrors a status apply by the only status field manager: the stored
    /// status becomes exactly the applied one
    async fn update_status(&self, obj: &K, status: &K::Status) -> Result<(), Error> {
        let mut objects = self.objects.lock().unwrap();
        let Some(stored) = objects.get_mut(&Self::key(obj)) else {
            return Err(Error::internal(format!("{} not found", obj.name_any())));
        };
        stored.set_mesh_status(status.clone());
        bump(&mut stored.meta_mut().resource_version);
        self.status_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// A fake cluster with one [`FakeClient`] per kind
pub(crate) struct FakeCluster {
    pub cells: Arc<FakeClient<Cell>>,
    pub composites: Arc<FakeClient<Composite>>,
    pub gateways: Arc<FakeClient<Gateway>>,
    pub token_services: Arc<FakeClient<TokenService>>,
    pub autoscale_policies: Arc<FakeClient<AutoscalePolicy>>,
    pub deployments: Arc<FakeClient<Deployment>>,
    pub services: Arc<FakeClient<Service>>,
    pub hpas: Arc<FakeClient<HorizontalPodAutoscaler>>,
    pub network_policies: Arc<FakeClient<NetworkPolicy>>,
    pub config_maps: Arc<FakeClient<ConfigMap>>,
    pub secrets: Arc<FakeClient<Secret>>,
    pub ingresses: Arc<FakeClient<Ingress>>,
    pub virtual_services: Arc<FakeClient<VirtualService>>,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self {
            cells: FakeClient::new(true),
            composites: FakeClient::new(true),
            gateways: FakeClient::new(true),
            token_services: FakeClient::new(true),
            autoscale_policies: FakeClient::new(true),
            deployments: FakeClient::new(true),
            services: FakeClient::new(false),
            hpas: FakeClient::new(true),
            network_policies: FakeClient::new(true),
            config_maps: FakeClient::new(false),
            secrets: FakeClient::new(false),
            ingresses: FakeClient::new(true),
            virtual_services: FakeClient::new(true),
        }
    }

    pub fn clients(&self) -> ClusterClients {
        ClusterClients {
            cells: self.cells.clone(),
            composites: self.composites.clone(),
            gateways: self.gateways.clone(),
            token_services: self.token_services.clone(),
            autoscale_policies: self.autoscale_policies.clone(),
            deployments: self.deployments.clone(),
            services: self.services.clone(),
            hpas: self.hpas.clone(),
            network_policies: self.network_policies.clone(),
            config_maps: self.config_maps.clone(),
            secrets: self.secrets.clone(),
            ingresses: self.ingresses.clone(),
            virtual_services: self.virtual_services.clone(),
        }
    }

    /// Reconciler context over this cluster
    pub fn context(&self, config: MeshConfig) -> Arc<Context> {
        Arc::new(Context::new(self.clients(), config))
    }

    /// Report `replicas` available replicas on a Deployment
    pub fn set_available(&self, namespace: &str, name: &str, replicas: i32) {
        self.deployments.modify(namespace, name, false, |d| {
            d.status = Some(DeploymentStatus {
                available_replicas: Some(replicas),
                ..Default::default()
            });
        });
    }

    /// Writes to child kinds (everything except parent status)
    pub fn child_writes(&self) -> usize {
        self.gateways.creates()
            + self.gateways.updates()
            + self.token_services.creates()
            + self.token_services.updates()
            + self.autoscale_policies.creates()
            + self.autoscale_policies.updates()
            + self.deployments.writes()
            + self.services.writes()
            + self.hpas.writes()
            + self.network_policies.writes()
            + self.config_maps.writes()
            + self.secrets.writes()
            + self.ingresses.writes()
            + self.virtual_services.writes()
    }
}
