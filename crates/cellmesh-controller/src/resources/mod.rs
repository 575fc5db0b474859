//! Desired child objects and their field-scoped comparison
//!
//! Builders are pure: they take the parent spec and return the object the
//! controller wants to exist. [`ChildResource`] impls decide which fields
//! of an observed object the controller owns.

pub mod autoscale;
pub mod gateway;
pub mod network;
pub mod routing;
pub mod token_service;
pub mod workload;

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use cellmesh_common::crd::{AutoscalePolicy, Gateway, TokenService};
use cellmesh_common::kube_utils::managed_labels;
use cellmesh_common::{LABEL_CELL, LABEL_COMPONENT, LABEL_COMPOSITE};

use crate::apply::ChildResource;

/// Metadata of a generated child
pub fn child_meta(name: &str, namespace: &str, labels: BTreeMap<String, String>) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        labels: Some(labels),
        ..Default::default()
    }
}

/// Labels for the children of a parent carrying `parent_labels`
///
/// Cell, composite and component labels flow down so a gateway created
/// for a cell stamps the cell label on its own pods.
pub fn inherited_labels<'a>(
    parent_labels: &BTreeMap<String, String>,
    own: impl IntoIterator<Item = (&'a str, &'a str)>,
) -> BTreeMap<String, String> {
    let mut labels = managed_labels(own);
    for key in [LABEL_CELL, LABEL_COMPOSITE, LABEL_COMPONENT] {
        if let Some(value) = parent_labels.get(key) {
            labels.entry(key.to_string()).or_insert_with(|| value.clone());
        }
    }
    labels
}

/// A ConfigMap holding `data`
pub fn config_map(
    name: &str,
    namespace: &str,
    labels: BTreeMap<String, String>,
    data: BTreeMap<String, String>,
) -> ConfigMap {
    ConfigMap {
        metadata: child_meta(name, namespace, labels),
        data: Some(data),
        ..Default::default()
    }
}

impl ChildResource for ConfigMap {
    fn owned_fields_match(&self, desired: &Self) -> bool {
        self.data == desired.data
    }

    fn merge_owned_fields(&mut self, desired: &Self) {
        self.data = desired.data.clone();
    }
}

impl ChildResource for Secret {
    fn owned_fields_match(&self, desired: &Self) -> bool {
        self.data == desired.data && self.type_ == desired.type_
    }

    fn merge_owned_fields(&mut self, desired: &Self) {
        self.data = desired.data.clone();
        self.type_ = desired.type_.clone();
    }
}

impl ChildResource for Gateway {
    fn owned_fields_match(&self, desired: &Self) -> bool {
        self.spec == desired.spec
    }

    fn merge_owned_fields(&mut self, desired: &Self) {
        self.spec = desired.spec.clone();
    }
}

impl ChildResource for TokenService {
    fn owned_fields_match(&self, desired: &Self) -> bool {
        self.spec == desired.spec
    }

    fn merge_owned_fields(&mut self, desired: &Self) {
        self.spec = desired.spec.clone();
    }
}

impl ChildResource for AutoscalePolicy {
    fn owned_fields_match(&self, desired: &Self) -> bool {
        self.spec == desired.spec
    }

    fn merge_owned_fields(&mut self, desired: &Self) {
        self.spec = desired.spec.clone();
    }

    fn allows_override(&self) -> bool {
        self.spec.overridable
    }
}
