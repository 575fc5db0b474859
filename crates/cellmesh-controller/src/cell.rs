//! Cell reconciler
//!
//! A cell is applied as: network policy, gateway, token service, every
//! component in declaration order, then routes to its dependencies. The
//! gateway and token service are themselves managed resources, so the
//! cell only writes their spec and reads back their status.

use std::sync::Arc;

use async_trait::async_trait;
use kube::ResourceExt;
use tracing::instrument;

use cellmesh_common::crd::{
    Cell, CellSpec, CellStatus, Gateway, GatewaySpec, ReadyState, TokenService,
};
use cellmesh_common::kube_utils::{
    cell_gateway_name, cell_token_service_name, component_service_name, managed_labels,
};
use cellmesh_common::{Error, LABEL_CELL};

use crate::apply::Applier;
use crate::client::StatusClient;
use crate::components::{apply_components, resolve_dependencies, Pending};
use crate::context::Context;
use crate::controller::{ObjectKey, Reconciler};
use crate::reconcile::{reconcile_parent, Outcome, ParentReconciler};
use crate::resources::child_meta;
use crate::resources::network::cell_network_policy;
use crate::resources::routing::{virtual_service, RouteSource};

/// Drives a Cell and everything it is made of
pub struct CellReconciler {
    ctx: Arc<Context>,
}

impl CellReconciler {
    /// Create a reconciler
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }
}

/// Gateway spec of a cell with component backends resolved to services
///
/// A backend or TCP host naming one of the cell's components is replaced
/// by that component's Service; anything else is taken as a host name.
pub fn cell_gateway_spec(cell: &str, spec: &CellSpec) -> GatewaySpec {
    let resolve = |backend: &mut String| {
        if spec.component(backend).is_some() {
            *backend = component_service_name(cell, backend);
        }
    };
    let mut gateway = spec.gateway.clone();
    for api in &mut gateway.ingress.http {
        resolve(&mut api.backend);
    }
    for route in &mut gateway.ingress.tcp {
        resolve(&mut route.backend_host);
    }
    gateway
}

#[async_trait]
impl ParentReconciler for CellReconciler {
    type Parent = Cell;

    fn parents(&self) -> &dyn StatusClient<Cell> {
        self.ctx.clients.cells.as_ref()
    }

    async fn apply_children(
        &self,
        cell: &Cell,
        applier: &mut Applier,
    ) -> Result<Outcome<CellStatus>, Error> {
        let clients = &self.ctx.clients;
        let name = cell.name_any();
        let namespace = cell.namespace().unwrap_or_default();
        let labels = managed_labels([(LABEL_CELL, name.as_str())]);
        let mut pending = Pending::default();

        applier
            .apply(
                clients.network_policies.as_ref(),
                cell_network_policy(&name, &namespace, labels.clone()),
            )
            .await?;

        let mut gateway = Gateway::new(&cell_gateway_name(&name), cell_gateway_spec(&name, &cell.spec));
        gateway.metadata = child_meta(&gateway.name_any(), &namespace, labels.clone());
        let gateway = applier.apply(clients.gateways.as_ref(), gateway).await?;
        let gateway_status = gateway.status.clone().unwrap_or_default();
        if gateway_status.status != ReadyState::Ready {
            pending.child("gateway");
        }

        let mut sts = TokenService::new(&cell_token_service_name(&name), cell.spec.sts.clone());
        sts.metadata = child_meta(&sts.name_any(), &namespace, labels.clone());
        let sts = applier.apply(clients.token_services.as_ref(), sts).await?;
        if sts.status.as_ref().map(|s| s.status) != Some(ReadyState::Ready) {
            pending.child("token service");
        }

        let components = &cell.spec.components;
        let unavailable =
            apply_components(clients, applier, &name, &namespace, components, &labels).await?;
        let active = components.len() - unavailable.len();
        pending.components(unavailable);

        if !cell.spec.dependencies.is_empty() {
            let (resolved, unresolved) =
                resolve_dependencies(clients, &namespace, &cell.spec.dependencies).await?;
            pending.dependencies(unresolved);
            let source = RouteSource {
                label: LABEL_CELL,
                parent: &name,
            };
            if let Some(vs) = virtual_service(source, &namespace, labels, &[], &resolved) {
                applier.apply(clients.virtual_services.as_ref(), vs).await?;
            }
        }

        let status = CellStatus {
            gateway_hostname: gateway_status.hostname.clone(),
            gateway_status: gateway_status.status,
            component_count: components.len() as i32,
            active_component_count: active as i32,
            ..Default::default()
        };
        if pending.is_empty() {
            return Ok(Outcome::ready(status, "all children are ready"));
        }
        let (reason, message) = pending.describe();
        Ok(Outcome::not_ready(status, reason, message))
    }
}

#[async_trait]
impl Reconciler for CellReconciler {
    #[instrument(skip(self), fields(cell = %key))]
    async fn reconcile(&self, key: &ObjectKey) -> Result<(), Error> {
        reconcile_parent(self, key).await
    }
}
