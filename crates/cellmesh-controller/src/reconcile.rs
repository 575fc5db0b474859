//! Shared reconcile flow for parent resources
//!
//! Every kind follows the same steps: read the parent from the cache,
//! validate it, apply its children in a fixed order, derive readiness and
//! write the status only when it changed. Kinds only supply the child
//! order and the readiness rule through [`ParentReconciler`].

use async_trait::async_trait;
use kube::{Resource, ResourceExt};
use tracing::{debug, info, warn};

use cellmesh_common::crd::{Condition, GenerationRecord, MeshResource};
use cellmesh_common::Error;

use crate::apply::Applier;
use crate::client::StatusClient;
use crate::controller::ObjectKey;

/// Reason reported when the spec does not validate
pub const REASON_VALIDATION_FAILED: &str = "ValidationFailed";
/// Reason reported when every child is ready
pub const REASON_READY: &str = "Ready";

/// Status computed by a kind from its applied children
#[derive(Clone, Debug)]
pub struct Outcome<S> {
    /// Kind-specific status fields; bookkeeping fields are filled in after
    pub status: S,
    /// Aggregate readiness
    pub ready: bool,
    /// Condition reason
    pub reason: String,
    /// Condition message
    pub message: String,
}

impl<S> Outcome<S> {
    /// Ready outcome
    pub fn ready(status: S, message: impl Into<String>) -> Self {
        Self {
            status,
            ready: true,
            reason: REASON_READY.to_string(),
            message: message.into(),
        }
    }

    /// Not-ready outcome with the given reason
    pub fn not_ready(status: S, reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            ready: false,
            reason: reason.into(),
            message: message.into(),
        }
    }
}

/// Per-kind part of a parent reconcile
#[async_trait]
pub trait ParentReconciler: Send + Sync {
    /// Parent kind
    type Parent: MeshResource;

    /// Client for the parent kind
    fn parents(&self) -> &dyn StatusClient<Self::Parent>;

    /// Apply every child in order and compute the resulting status
    async fn apply_children(
        &self,
        parent: &Self::Parent,
        applier: &mut Applier,
    ) -> Result<Outcome<<Self::Parent as MeshResource>::Status>, Error>;
}

/// Run one reconcile of the parent named by `key`
pub async fn reconcile_parent<R>(reconciler: &R, key: &ObjectKey) -> Result<(), Error>
where
    R: ParentReconciler + ?Sized,
{
    let kind = R::Parent::kind(&());
    let Some(cached) = reconciler.parents().get(&key.namespace, &key.name).await? else {
        info!(%kind, %key, "resource no longer exists");
        return Ok(());
    };
    let parent = (*cached).clone();
    let previous = parent.mesh_status().cloned();
    let previous_conditions = previous
        .as_ref()
        .map(|s| s.conditions().to_vec())
        .unwrap_or_default();

    if let Err(message) = parent.validate_spec() {
        warn!(%kind, %key, error = %message, "spec validation failed");
        let mut status = previous.clone().unwrap_or_default();
        let children = status.child_generations().clone();
        status.set_observed(parent.meta().generation, children);
        status.set_ready(Condition::ready(
            false,
            REASON_VALIDATION_FAILED,
            message.clone(),
            &previous_conditions,
        ));
        write_status(reconciler, &parent, previous.as_ref(), &status).await?;
        return Err(Error::validation_for(key.to_string(), message));
    }

    let mut applier = Applier::for_parent(&parent)?;
    let outcome = reconciler.apply_children(&parent, &mut applier).await?;

    let mut status = outcome.status;
    status.set_observed(parent.meta().generation, applier.into_child_generations());
    status.set_ready(Condition::ready(
        outcome.ready,
        outcome.reason,
        outcome.message,
        &previous_conditions,
    ));
    write_status(reconciler, &parent, previous.as_ref(), &status).await
}

async fn write_status<R>(
    reconciler: &R,
    parent: &R::Parent,
    previous: Option<&<R::Parent as MeshResource>::Status>,
    status: &<R::Parent as MeshResource>::Status,
) -> Result<(), Error>
where
    R: ParentReconciler + ?Sized,
{
    if previous == Some(status) {
        debug!(name = %parent.name_any(), "status unchanged");
        return Ok(());
    }
    info!(
        kind = %R::Parent::kind(&()),
        name = %parent.name_any(),
        state = %status.ready_state(),
        "updating status"
    );
    reconciler.parents().update_status(parent, status).await
}
