//! Component and dependency handling shared by cells and composites

use std::collections::BTreeMap;

use tracing::debug;

use cellmesh_common::crd::ComponentSpec;
use cellmesh_common::Error;

use crate::apply::Applier;
use crate::client::ClusterClients;
use crate::resources::autoscale::component_autoscale_policy;
use crate::resources::routing::ResolvedDependency;
use crate::resources::workload::{available_replicas, component_deployment, component_service};

/// Reason reported while a child is not ready yet
pub const REASON_CHILDREN_NOT_READY: &str = "ChildrenNotReady";
/// Reason reported while a dependency has no gateway hostname
pub const REASON_DEPENDENCY_UNRESOLVED: &str = "DependencyUnresolved";

/// Apply Deployment, Service and AutoscalePolicy of every component, in
/// declaration order
///
/// Returns the names of components whose Deployment has no available
/// replica.
pub async fn apply_components(
    clients: &ClusterClients,
    applier: &mut Applier,
    parent: &str,
    namespace: &str,
    components: &[ComponentSpec],
    labels: &BTreeMap<String, String>,
) -> Result<Vec<String>, Error> {
    let mut unavailable = Vec::new();
    for component in components {
        let deployment = applier
            .apply(
                clients.deployments.as_ref(),
                component_deployment(parent, namespace, component, labels.clone()),
            )
            .await?;
        if available_replicas(&deployment) == 0 {
            unavailable.push(component.name.clone());
        }

        if let Some(service) = component_service(parent, namespace, component, labels.clone()) {
            applier.apply(clients.services.as_ref(), service).await?;
        }

        if let Some(policy) = component_autoscale_policy(parent, namespace, component, labels.clone())
        {
            applier
                .apply(clients.autoscale_policies.as_ref(), policy)
                .await?;
        }
    }
    Ok(unavailable)
}

/// Look up the gateway hostname of each dependency cell
///
/// Returns the resolved dependencies and the names still unresolved.
pub async fn resolve_dependencies(
    clients: &ClusterClients,
    namespace: &str,
    dependencies: &[String],
) -> Result<(Vec<ResolvedDependency>, Vec<String>), Error> {
    let mut resolved = Vec::new();
    let mut unresolved = Vec::new();
    for name in dependencies {
        let hostname = clients
            .cells
            .get(namespace, name)
            .await?
            .and_then(|cell| cell.status.as_ref()?.gateway_hostname.clone());
        match hostname {
            Some(gateway_hostname) => resolved.push(ResolvedDependency {
                name: name.clone(),
                gateway_hostname,
            }),
            None => {
                debug!(dependency = %name, "dependency has no gateway hostname yet");
                unresolved.push(name.clone());
            }
        }
    }
    Ok((resolved, unresolved))
}

/// What a parent is still waiting for
#[derive(Debug, Default)]
pub struct Pending {
    children: Vec<String>,
    dependencies: Vec<String>,
}

impl Pending {
    /// Note a child that is not ready
    pub fn child(&mut self, what: impl Into<String>) {
        self.children.push(what.into());
    }

    /// Note components without an available replica
    pub fn components(&mut self, names: Vec<String>) {
        self.children
            .extend(names.into_iter().map(|n| format!("component {n}")));
    }

    /// Note dependencies that have not published a gateway hostname
    pub fn dependencies(&mut self, names: Vec<String>) {
        self.dependencies.extend(names);
    }

    /// Nothing is pending
    pub fn is_empty(&self) -> bool {
        self.children.is_empty() && self.dependencies.is_empty()
    }

    /// Condition reason and message for a not-ready parent
    pub fn describe(&self) -> (&'static str, String) {
        let mut parts = Vec::new();
        if !self.dependencies.is_empty() {
            parts.push(format!(
                "unresolved dependencies: {}",
                self.dependencies.join(", ")
            ));
        }
        if !self.children.is_empty() {
            parts.push(format!("waiting for: {}", self.children.join(", ")));
        }
        let reason = if self.dependencies.is_empty() {
            REASON_CHILDREN_NOT_READY
        } else {
            REASON_DEPENDENCY_UNRESOLVED
        };
        (reason, parts.join("; "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_reason_prefers_dependencies() {
        let mut pending = Pending::default();
        assert!(pending.is_empty());

        pending.components(vec!["api".to_string()]);
        let (reason, message) = pending.describe();
        assert_eq!(reason, REASON_CHILDREN_NOT_READY);
        assert_eq!(message, "waiting for: component api");

        pending.dependencies(vec!["stock".to_string()]);
        let (reason, message) = pending.describe();
        assert_eq!(reason, REASON_DEPENDENCY_UNRESOLVED);
        assert!(message.starts_with("unresolved dependencies: stock"));
    }
}
