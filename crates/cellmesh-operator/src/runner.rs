//! Controller runner - wires informers, clients and controllers
//!
//! Every kind gets one informer. Parents enqueue themselves; children
//! enqueue their controlling parent; cells also wake the cells and
//! composites that depend on them. Reconcilers read through the informer
//! caches, so controllers start only after every cache has synced.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::FutureExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
use k8s_openapi::api::core::v1::{ConfigMap, Secret, Service};
use k8s_openapi::api::networking::v1::{Ingress, NetworkPolicy};
use kube::{Api, Client};
use tokio_util::sync::CancellationToken;

use cellmesh_common::crd::{AutoscalePolicy, Cell, Composite, Gateway, TokenService, VirtualService};
use cellmesh_controller::{
    AutoscalePolicyReconciler, CellReconciler, ClusterClients, CompositeReconciler, Context,
    Controller, ControllerHandle, DependentsHandler, EnqueueHandler, EnqueueOwnerHandler,
    GatewayReconciler, Informer, KubeResourceClient, MeshConfig, TokenServiceReconciler,
};

/// A unit of work run until cancellation
pub type Task = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Informers and controllers ready to run
pub struct Runner {
    /// Watch loops feeding the caches
    pub informers: Vec<Task>,
    /// Resolves to `false` if any cache can no longer become ready
    pub caches_synced: Pin<Box<dyn Future<Output = bool> + Send>>,
    /// Controller loops; start them after `caches_synced`
    pub controllers: Vec<Task>,
}

struct Handles {
    cell: ControllerHandle,
    composite: ControllerHandle,
    gateway: ControllerHandle,
    token_service: ControllerHandle,
    autoscale: ControllerHandle,
}

fn depends_on_cell(cell: &Cell, dependency: &str) -> bool {
    cell.spec.dependencies.iter().any(|d| d == dependency)
}

fn composite_depends_on_cell(composite: &Composite, dependency: &str) -> bool {
    composite.spec.dependencies.iter().any(|d| d == dependency)
}

macro_rules! owned_by {
    ($informer:expr, $($handle:expr),+ $(,)?) => {
        $( $informer.add_handler(EnqueueOwnerHandler::new($handle.clone())); )+
    };
}

/// Build every informer and controller for the mesh
pub fn build(client: Client, config: MeshConfig, workers: usize, token: CancellationToken) -> Runner {
    let mut cells = Informer::<Cell>::new(Api::all(client.clone()));
    let mut composites = Informer::<Composite>::new(Api::all(client.clone()));
    let mut gateways = Informer::<Gateway>::new(Api::all(client.clone()));
    let mut token_services = Informer::<TokenService>::new(Api::all(client.clone()));
    let mut autoscale_policies = Informer::<AutoscalePolicy>::new(Api::all(client.clone()));
    let mut deployments = Informer::<Deployment>::new(Api::all(client.clone()));
    let mut services = Informer::<Service>::new(Api::all(client.clone()));
    let mut hpas = Informer::<HorizontalPodAutoscaler>::new(Api::all(client.clone()));
    let mut network_policies = Informer::<NetworkPolicy>::new(Api::all(client.clone()));
    let mut config_maps = Informer::<ConfigMap>::new(Api::all(client.clone()));
    let mut secrets = Informer::<Secret>::new(Api::all(client.clone()));
    let mut ingresses = Informer::<Ingress>::new(Api::all(client.clone()));
    let mut virtual_services = Informer::<VirtualService>::new(Api::all(client.clone()));

    let clients = ClusterClients {
        cells: KubeResourceClient::new(client.clone(), cells.store()),
        composites: KubeResourceClient::new(client.clone(), composites.store()),
        gateways: KubeResourceClient::new(client.clone(), gateways.store()),
        token_services: KubeResourceClient::new(client.clone(), token_services.store()),
        autoscale_policies: KubeResourceClient::new(client.clone(), autoscale_policies.store()),
        deployments: KubeResourceClient::new(client.clone(), deployments.store()),
        services: KubeResourceClient::new(client.clone(), services.store()),
        hpas: KubeResourceClient::new(client.clone(), hpas.store()),
        network_policies: KubeResourceClient::new(client.clone(), network_policies.store()),
        config_maps: KubeResourceClient::new(client.clone(), config_maps.store()),
        secrets: KubeResourceClient::new(client.clone(), secrets.store()),
        ingresses: KubeResourceClient::new(client.clone(), ingresses.store()),
        virtual_services: KubeResourceClient::new(client.clone(), virtual_services.store()),
    };
    let ctx = Arc::new(Context::new(clients, config));

    let controllers = [
        Controller::new("Cell", Arc::new(CellReconciler::new(ctx.clone()))),
        Controller::new("Composite", Arc::new(CompositeReconciler::new(ctx.clone()))),
        Controller::new("Gateway", Arc::new(GatewayReconciler::new(ctx.clone()))),
        Controller::new("TokenService", Arc::new(TokenServiceReconciler::new(ctx.clone()))),
        Controller::new("AutoscalePolicy", Arc::new(AutoscalePolicyReconciler::new(ctx))),
    ];
    let h = Handles {
        cell: controllers[0].handle(),
        composite: controllers[1].handle(),
        gateway: controllers[2].handle(),
        token_service: controllers[3].handle(),
        autoscale: controllers[4].handle(),
    };

    cells.add_handler(EnqueueHandler::new(h.cell.clone()));
    cells.add_handler(DependentsHandler::new(cells.store(), h.cell.clone(), depends_on_cell));
    cells.add_handler(DependentsHandler::new(
        composites.store(),
        h.composite.clone(),
        composite_depends_on_cell,
    ));
    composites.add_handler(EnqueueHandler::new(h.composite.clone()));
    gateways.add_handler(EnqueueHandler::new(h.gateway.clone()));
    token_services.add_handler(EnqueueHandler::new(h.token_service.clone()));
    autoscale_policies.add_handler(EnqueueHandler::new(h.autoscale.clone()));

    owned_by!(gateways, h.cell);
    owned_by!(token_services, h.cell);
    owned_by!(autoscale_policies, h.cell, h.composite);
    owned_by!(deployments, h.cell, h.composite, h.gateway, h.token_service);
    owned_by!(services, h.cell, h.composite, h.gateway, h.token_service);
    owned_by!(hpas, h.autoscale);
    owned_by!(network_policies, h.cell);
    owned_by!(config_maps, h.gateway, h.token_service);
    owned_by!(secrets, h.gateway);
    owned_by!(ingresses, h.gateway);
    owned_by!(virtual_services, h.cell, h.composite);

    let stores_ready: Vec<Pin<Box<dyn Future<Output = bool> + Send>>> = vec![
        ready(cells.store()),
        ready(composites.store()),
        ready(gateways.store()),
        ready(token_services.store()),
        ready(autoscale_policies.store()),
        ready(deployments.store()),
        ready(services.store()),
        ready(hpas.store()),
        ready(network_policies.store()),
        ready(config_maps.store()),
        ready(secrets.store()),
        ready(ingresses.store()),
        ready(virtual_services.store()),
    ];
    let caches_synced = Box::pin(
        futures::future::join_all(stores_ready).map(|ready| ready.into_iter().all(|r| r)),
    );

    let informers: Vec<Task> = vec![
        Box::pin(cells.run(token.clone())),
        Box::pin(composites.run(token.clone())),
        Box::pin(gateways.run(token.clone())),
        Box::pin(token_services.run(token.clone())),
        Box::pin(autoscale_policies.run(token.clone())),
        Box::pin(deployments.run(token.clone())),
        Box::pin(services.run(token.clone())),
        Box::pin(hpas.run(token.clone())),
        Box::pin(network_policies.run(token.clone())),
        Box::pin(config_maps.run(token.clone())),
        Box::pin(secrets.run(token.clone())),
        Box::pin(ingresses.run(token.clone())),
        Box::pin(virtual_services.run(token.clone())),
    ];

    let controllers = controllers
        .into_iter()
        .map(|controller| {
            let token = token.clone();
            Box::pin(async move { controller.run(workers, token).await }) as Task
        })
        .collect();

    Runner {
        informers,
        caches_synced,
        controllers,
    }
}

fn ready<K>(store: kube::runtime::reflector::Store<K>) -> Pin<Box<dyn Future<Output = bool> + Send>>
where
    K: kube::Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
{
    Box::pin(async move { store.wait_until_ready().await.is_ok() })
}
