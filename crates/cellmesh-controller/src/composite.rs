//! Composite reconciler
//!
//! A composite is a set of components without gateway or token service.
//! Its VirtualService routes component names to their services and
//! dependency names to the dependency cell's gateway.

use std::sync::Arc;

use async_trait::async_trait;
use kube::ResourceExt;
use tracing::instrument;

use cellmesh_common::crd::{Composite, CompositeStatus};
use cellmesh_common::kube_utils::managed_labels;
use cellmesh_common::{Error, LABEL_COMPOSITE};

use crate::apply::Applier;
use crate::client::StatusClient;
use crate::components::{apply_components, resolve_dependencies, Pending};
use crate::context::Context;
use crate::controller::{ObjectKey, Reconciler};
use crate::reconcile::{reconcile_parent, Outcome, ParentReconciler};
use crate::resources::routing::{virtual_service, RouteSource};

/// Drives a Composite and its components
pub struct CompositeReconciler {
    ctx: Arc<Context>,
}

impl CompositeReconciler {
    /// Create a reconciler
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl ParentReconciler for CompositeReconciler {
    type Parent = Composite;

    fn parents(&self) -> &dyn StatusClient<Composite> {
        self.ctx.clients.composites.as_ref()
    }

    async fn apply_children(
        &self,
        composite: &Composite,
        applier: &mut Applier,
    ) -> Result<Outcome<CompositeStatus>, Error> {
        let clients = &self.ctx.clients;
        let name = composite.name_any();
        let namespace = composite.namespace().unwrap_or_default();
        let labels = managed_labels([(LABEL_COMPOSITE, name.as_str())]);
        let components = &composite.spec.components;
        let mut pending = Pending::default();

        let unavailable =
            apply_components(clients, applier, &name, &namespace, components, &labels).await?;
        let active = components.len() - unavailable.len();
        pending.components(unavailable);

        let (resolved, unresolved) =
            resolve_dependencies(clients, &namespace, &composite.spec.dependencies).await?;
        pending.dependencies(unresolved);
        let source = RouteSource {
            label: LABEL_COMPOSITE,
            parent: &name,
        };
        if let Some(vs) = virtual_service(source, &namespace, labels, components, &resolved) {
            applier.apply(clients.virtual_services.as_ref(), vs).await?;
        }

        let status = CompositeStatus {
            component_count: components.len() as i32,
            active_component_count: active as i32,
            ..Default::default()
        };
        if pending.is_empty() {
            return Ok(Outcome::ready(status, "all components are available"));
        }
        let (reason, message) = pending.describe();
        Ok(Outcome::not_ready(status, reason, message))
    }
}

#[async_trait]
impl Reconciler for CompositeReconciler {
    #[instrument(skip(self), fields(composite = %key))]
    async fn reconcile(&self, key: &ObjectKey) -> Result<(), Error> {
        reconcile_parent(self, key).await
    }
}
