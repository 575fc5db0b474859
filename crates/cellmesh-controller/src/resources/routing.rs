//! Istio routes from a cell or composite to its dependencies

use std::collections::BTreeMap;

use cellmesh_common::crd::{
    ComponentSpec, Destination, HttpMatchRequest, HttpRoute, HttpRouteDestination, StringMatch,
    VirtualService, VirtualServiceSpec,
};
use cellmesh_common::kube_utils::{component_service_name, virtual_service_name};

use super::child_meta;
use crate::apply::ChildResource;

/// Istio gateway name meaning "every sidecar in the mesh"
pub const MESH_GATEWAY: &str = "mesh";

/// A dependency whose gateway hostname is known
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedDependency {
    /// Name of the dependency cell, used as the host callers address
    pub name: String,
    /// In-cluster host of the dependency's gateway Service
    pub gateway_hostname: String,
}

/// Which pods a VirtualService applies to
#[derive(Clone, Copy, Debug)]
pub struct RouteSource<'a> {
    /// Label carrying the parent name on its pods
    pub label: &'a str,
    /// Parent name
    pub parent: &'a str,
}

impl RouteSource<'_> {
    fn route(&self, name: &str, host: &str) -> HttpRoute {
        HttpRoute {
            name: Some(name.to_string()),
            match_: vec![HttpMatchRequest {
                authority: Some(StringMatch::prefix(name)),
                source_labels: BTreeMap::from([(self.label.to_string(), self.parent.to_string())]),
                ..Default::default()
            }],
            route: vec![HttpRouteDestination {
                destination: Destination {
                    host: host.to_string(),
                    port: None,
                },
                weight: None,
            }],
        }
    }
}

/// VirtualService of a cell or composite
///
/// Component routes come first, dependency routes after, each in
/// declaration order. `None` when there is nothing to route, since Istio
/// rejects a VirtualService without hosts.
pub fn virtual_service(
    source: RouteSource<'_>,
    namespace: &str,
    labels: BTreeMap<String, String>,
    components: &[ComponentSpec],
    dependencies: &[ResolvedDependency],
) -> Option<VirtualService> {
    let mut hosts = Vec::new();
    let mut http = Vec::new();

    for component in components.iter().filter(|c| !c.ports.is_empty()) {
        hosts.push(component.name.clone());
        http.push(source.route(
            &component.name,
            &component_service_name(source.parent, &component.name),
        ));
    }
    for dependency in dependencies {
        hosts.push(dependency.name.clone());
        http.push(source.route(&dependency.name, &dependency.gateway_hostname));
    }

    if hosts.is_empty() {
        return None;
    }
    Some(VirtualService {
        metadata: child_meta(&virtual_service_name(source.parent), namespace, labels),
        spec: VirtualServiceSpec {
            hosts,
            gateways: vec![MESH_GATEWAY.to_string()],
            http,
        },
    })
}

impl ChildResource for VirtualService {
    fn owned_fields_match(&self, desired: &Self) -> bool {
        self.spec == desired.spec
    }

    fn merge_owned_fields(&mut self, desired: &Self) {
        self.spec = desired.spec.clone();
    }
}
