//! Custom Resource Definitions for cellmesh
//!
//! Five namespaced kinds are managed by the controllers (Cell, Composite,
//! Gateway, TokenService, AutoscalePolicy). `VirtualService` is the Istio
//! routing type the cell and composite controllers emit; only the fields
//! we own are modelled.

mod autoscale_policy;
mod cell;
mod composite;
mod gateway;
mod istio;
mod token_service;
mod types;

use std::collections::BTreeMap;

use k8s_openapi::NamespaceResourceScope;
use kube::Resource;
use serde::de::DeserializeOwned;
use serde::Serialize;

pub use autoscale_policy::{
    AutoscalePolicy, AutoscalePolicySpec, AutoscalePolicyStatus, HpaPolicy, ScaleTargetRef,
};
pub use cell::{Cell, CellSpec, CellStatus};
pub use composite::{Composite, CompositeSpec, CompositeStatus};
pub use gateway::{
    ClusterIngress, Gateway, GatewayIngress, GatewaySpec, GatewayStatus, HttpApi, TcpRoute,
    TlsConfig,
};
pub use istio::{
    Destination, HttpMatchRequest, HttpRoute, HttpRouteDestination, PortSelector, StringMatch,
    VirtualService, VirtualServiceSpec,
};
pub use token_service::{
    InterceptMode, OpaPolicy, TokenService, TokenServiceSpec, TokenServiceStatus,
};
pub use types::{
    ComponentSpec, Condition, ConditionStatus, ContainerSpec, MetricTarget, PortSpec, Protocol,
    ReadyState, ScalingPolicySpec, CONDITION_READY,
};

/// Status bookkeeping every managed resource carries
///
/// The controllers compare `observed_generation` with `metadata.generation`
/// and each child's generation with `child_generations` to skip field
/// comparisons for pairs that have not moved since the last reconcile.
pub trait GenerationRecord {
    /// Parent generation at the last successful reconcile
    fn observed_generation(&self) -> Option<i64>;
    /// `Kind/name -> generation` for each child at the last reconcile
    fn child_generations(&self) -> &BTreeMap<String, i64>;
    /// Current conditions
    fn conditions(&self) -> &[Condition];
    /// Aggregate readiness
    fn ready_state(&self) -> ReadyState;

    /// Record the generations seen by a completed reconcile
    fn set_observed(&mut self, generation: Option<i64>, children: BTreeMap<String, i64>);
    /// Replace the `Ready` condition and the aggregate state derived from it
    fn set_ready(&mut self, condition: Condition);
}

/// A parent resource driven by a cellmesh controller
pub trait MeshResource:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + std::fmt::Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
    /// Status subresource type
    type Status: GenerationRecord
        + Clone
        + Default
        + PartialEq
        + std::fmt::Debug
        + Serialize
        + Send
        + Sync;

    /// Persisted status, if any
    fn mesh_status(&self) -> Option<&Self::Status>;

    /// Replace the status
    fn set_mesh_status(&mut self, status: Self::Status);

    /// Validate the spec; the message is surfaced on the status
    fn validate_spec(&self) -> Result<(), String>;
}

macro_rules! impl_generation_record {
    ($status:ty) => {
        impl $crate::crd::GenerationRecord for $status {
            fn observed_generation(&self) -> Option<i64> {
                self.observed_generation
            }
            fn child_generations(&self) -> &std::collections::BTreeMap<String, i64> {
                &self.child_generations
            }
            fn conditions(&self) -> &[$crate::crd::Condition] {
                &self.conditions
            }
            fn ready_state(&self) -> $crate::crd::ReadyState {
                self.status
            }
            fn set_observed(
                &mut self,
                generation: Option<i64>,
                children: std::collections::BTreeMap<String, i64>,
            ) {
                self.observed_generation = generation;
                self.child_generations = children;
            }
            fn set_ready(&mut self, condition: $crate::crd::Condition) {
                self.status = $crate::crd::ReadyState::from_ready(
                    condition.status == $crate::crd::ConditionStatus::True,
                );
                self.conditions.retain(|c| c.type_ != condition.type_);
                self.conditions.push(condition);
            }
        }
    };
}
pub(crate) use impl_generation_record;

macro_rules! impl_mesh_resource {
    ($kind:ty, $status:ty) => {
        impl $crate::crd::MeshResource for $kind {
            type Status = $status;

            fn mesh_status(&self) -> Option<&Self::Status> {
                self.status.as_ref()
            }

            fn set_mesh_status(&mut self, status: Self::Status) {
                self.status = Some(status);
            }

            fn validate_spec(&self) -> Result<(), String> {
                self.spec.validate(&kube::ResourceExt::name_any(self))
            }
        }
    };
}
pub(crate) use impl_mesh_resource;

/// Validate a DNS-style identifier (lowercase alphanumeric with hyphens).
///
/// Rules:
/// - Must not be empty
/// - Must start with a lowercase letter
/// - May contain lowercase letters, digits, and hyphens
/// - Must not end with a hyphen (if `allow_trailing_hyphen` is false)
pub(crate) fn validate_dns_identifier(s: &str, allow_trailing_hyphen: bool) -> Result<(), String> {
    if s.is_empty() {
        return Err("identifier cannot be empty".to_string());
    }

    let mut chars = s.chars();

    match chars.next() {
        Some(c) if c.is_ascii_lowercase() => {}
        _ => {
            return Err(format!(
                "identifier must start with lowercase letter: {}",
                s
            ))
        }
    }

    for c in chars {
        if !c.is_ascii_lowercase() && !c.is_ascii_digit() && c != '-' {
            return Err(format!(
                "identifier must be lowercase alphanumeric with hyphens: {}",
                s
            ));
        }
    }

    if !allow_trailing_hyphen && s.ends_with('-') {
        return Err(format!("identifier cannot end with hyphen: {}", s));
    }

    // Children are named `<parent>--<component>-deployment`; a double hyphen
    // inside a user-chosen name would make those names ambiguous.
    if s.contains("--") {
        return Err(format!("identifier cannot contain '--': {}", s));
    }

    Ok(())
}
