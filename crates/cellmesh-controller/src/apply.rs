//! Create-or-update of child objects with ownership and generation tracking
//!
//! Every child is written with a single controller owner reference to its
//! parent. An observed child controlled by someone else is never touched.
//! Field comparison is scoped to what the controller sets, so defaults
//! filled in by the API server do not count as drift.
//!
//! Desired state is not a function of the parent spec alone: routes follow
//! other cells' status and images follow the mesh config. Each child
//! therefore carries a fingerprint of the desired object it was last
//! written from, and the generation shortcut only applies while that
//! fingerprint still matches.

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use k8s_openapi::NamespaceResourceScope;
use kube::{Resource, ResourceExt};
use serde::Serialize;
use tracing::{debug, info};

use cellmesh_common::crd::{GenerationRecord, MeshResource};
use cellmesh_common::kube_utils::{child_key, controller_of, deterministic_hash};
use cellmesh_common::Error;

use crate::client::ResourceClient;

/// Annotation holding the fingerprint of the desired object a child was
/// last written from
pub const DESIRED_HASH_ANNOTATION: &str = "mesh.cellery.io/desired-hash";

/// A child kind with field-scoped comparison
pub trait ChildResource:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + Serialize
    + Send
    + Sync
    + 'static
{
    /// True if every field the controller owns already has the desired value
    fn owned_fields_match(&self, desired: &Self) -> bool;

    /// Copy the owned fields of `desired` into `self`, leaving the rest
    fn merge_owned_fields(&mut self, desired: &Self);

    /// True if users may edit this object without it being reverted
    fn allows_override(&self) -> bool {
        false
    }
}

/// Applies the children of one parent during one reconcile
#[derive(Debug)]
pub struct Applier {
    owner: OwnerReference,
    parent_unchanged: bool,
    recorded: BTreeMap<String, i64>,
    observed: BTreeMap<String, i64>,
}

impl Applier {
    /// Applier for the children of `parent`
    pub fn for_parent<P: MeshResource>(parent: &P) -> Result<Self, Error> {
        let owner = parent.controller_owner_ref(&()).ok_or_else(|| {
            Error::internal_with_context(
                "apply",
                format!("{} {} has no uid", P::kind(&()), parent.name_any()),
            )
        })?;
        let status = parent.mesh_status();
        let parent_unchanged = matches!(
            (status.and_then(|s| s.observed_generation()), parent.meta().generation),
            (Some(observed), Some(current)) if observed == current
        );
        Ok(Self {
            owner,
            parent_unchanged,
            recorded: status
                .map(|s| s.child_generations().clone())
                .unwrap_or_default(),
            observed: BTreeMap::new(),
        })
    }

    /// Owner reference stamped on every child
    pub fn owner(&self) -> &OwnerReference {
        &self.owner
    }

    /// Neither the parent nor this child moved since the last reconcile
    fn unchanged(&self, key: &str, generation: Option<i64>) -> bool {
        self.parent_unchanged && generation.is_some() && self.recorded.get(key).copied() == generation
    }

    /// Generations unchanged and the child was written from this same
    /// desired object
    fn up_to_date<K: ChildResource>(&self, key: &str, observed: &K, fingerprint: &str) -> bool {
        self.unchanged(key, observed.meta().generation)
            && observed.annotations().get(DESIRED_HASH_ANNOTATION).map(String::as_str)
                == Some(fingerprint)
    }

    /// Bring one child to its desired state and return what the cluster holds
    pub async fn apply<K, C>(&mut self, client: &C, mut desired: K) -> Result<Arc<K>, Error>
    where
        K: ChildResource,
        C: ResourceClient<K> + ?Sized,
    {
        let kind = K::kind(&()).to_string();
        let name = desired.name_any();
        let namespace = desired.namespace().ok_or_else(|| {
            Error::internal_with_context("apply", format!("{kind} {name} has no namespace"))
        })?;
        let key = child_key(&kind, &name);
        desired.meta_mut().owner_references = Some(vec![self.owner.clone()]);
        let fingerprint = fingerprint(&desired)?;
        desired
            .annotations_mut()
            .insert(DESIRED_HASH_ANNOTATION.to_string(), fingerprint.clone());

        let applied = match client.get(&namespace, &name).await? {
            None => {
                info!(%kind, %name, %namespace, "creating child");
                Arc::new(client.create(&desired).await?)
            }
            Some(observed) => match controller_of(observed.meta()) {
                Some(controller) if controller.uid != self.owner.uid => {
                    return Err(Error::ownership_conflict(
                        kind,
                        name,
                        format!("{}/{}", controller.kind, controller.name),
                    ));
                }
                None => {
                    info!(%kind, %name, %namespace, "adopting child");
                    let mut adopted = (*observed).clone();
                    adopted
                        .meta_mut()
                        .owner_references
                        .get_or_insert_with(Vec::new)
                        .push(self.owner.clone());
                    merge(&mut adopted, &desired);
                    Arc::new(client.update(&adopted).await?)
                }
                Some(_) if self.up_to_date(&key, observed.as_ref(), &fingerprint) => {
                    debug!(%kind, %name, "child unchanged since last reconcile");
                    observed
                }
                Some(_) if observed.allows_override() && desired.allows_override() => {
                    debug!(%kind, %name, "child is overridable, leaving as is");
                    observed
                }
                Some(_) if owned_match(observed.as_ref(), &desired) => observed,
                Some(_) => {
                    info!(%kind, %name, %namespace, "updating drifted child");
                    let mut updated = (*observed).clone();
                    merge(&mut updated, &desired);
                    Arc::new(client.update(&updated).await?)
                }
            },
        };

        if let Some(generation) = applied.meta().generation {
            self.observed.insert(key, generation);
        }
        Ok(applied)
    }

    /// Child generations to record in the parent status
    pub fn into_child_generations(self) -> BTreeMap<String, i64> {
        self.observed
    }
}

/// Hash of the desired object, taken before the fingerprint is stamped
fn fingerprint<K: ChildResource>(desired: &K) -> Result<String, Error> {
    let json = serde_json::to_string(desired)
        .map_err(|e| Error::serialization_for_kind(K::kind(&()), e.to_string()))?;
    Ok(deterministic_hash(&json))
}

fn subset(desired: &BTreeMap<String, String>, observed: &BTreeMap<String, String>) -> bool {
    desired.iter().all(|(k, v)| observed.get(k) == Some(v))
}

/// Owned fields plus the labels and annotations the controller stamps
fn owned_match<K: ChildResource>(observed: &K, desired: &K) -> bool {
    subset(desired.labels(), observed.labels())
        && subset(desired.annotations(), observed.annotations())
        && observed.owned_fields_match(desired)
}

fn merge<K: ChildResource>(observed: &mut K, desired: &K) {
    let labels = desired.labels().clone();
    observed.labels_mut().extend(labels);
    let annotations = desired.annotations().clone();
    observed.annotations_mut().extend(annotations);
    observed.merge_owned_fields(desired);
}
