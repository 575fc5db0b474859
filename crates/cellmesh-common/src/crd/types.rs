//! Shared types used by several cellmesh CRDs

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::validate_dns_identifier;

/// Condition type reported by every cellmesh resource
pub const CONDITION_READY: &str = "Ready";

/// Aggregate readiness of a managed resource
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ReadyState {
    /// Every required child reports ready
    Ready,
    /// At least one required child is missing or not ready
    #[default]
    NotReady,
}

impl ReadyState {
    /// Map a boolean readiness to a state
    pub fn from_ready(ready: bool) -> Self {
        if ready {
            Self::Ready
        } else {
            Self::NotReady
        }
    }
}

impl std::fmt::Display for ReadyState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ready => write!(f, "Ready"),
            Self::NotReady => write!(f, "NotReady"),
        }
    }
}

/// Condition status following Kubernetes conventions
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Kubernetes-style condition for status reporting
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Condition {
    /// Type of condition (e.g., Ready)
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Machine-readable reason for the condition
    pub reason: String,

    /// Human-readable message
    pub message: String,

    /// Last time the condition transitioned
    #[serde(rename = "lastTransitionTime")]
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// Create a new condition with the current timestamp
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Utc::now(),
        }
    }

    /// Build the `Ready` condition, keeping the transition time of `previous`
    /// when the status did not flip.
    ///
    /// Without this, every reconcile would produce a fresh timestamp and the
    /// status comparison would never suppress a write.
    pub fn ready(
        ready: bool,
        reason: impl Into<String>,
        message: impl Into<String>,
        previous: &[Condition],
    ) -> Self {
        let status = if ready {
            ConditionStatus::True
        } else {
            ConditionStatus::False
        };
        let mut condition = Self::new(CONDITION_READY, status, reason, message);
        if let Some(prev) = previous
            .iter()
            .find(|c| c.type_ == CONDITION_READY && c.status == condition.status)
        {
            condition.last_transition_time = prev.last_transition_time;
        }
        condition
    }
}

/// Application protocol exposed on a component port
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    /// Plain HTTP/1.1 or HTTP/2
    #[default]
    Http,
    /// gRPC over HTTP/2
    Grpc,
    /// Opaque TCP
    Tcp,
}

impl Protocol {
    /// Port name prefix understood by the mesh sidecars
    pub fn port_prefix(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Grpc => "grpc",
            Self::Tcp => "tcp",
        }
    }
}

/// A port exposed by a component
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PortSpec {
    /// Port name, unique within the component
    pub name: String,
    /// Application protocol
    #[serde(default)]
    pub protocol: Protocol,
    /// Port exposed on the Service
    pub port: i32,
    /// Container port; defaults to `port`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_port: Option<i32>,
}

impl PortSpec {
    /// Effective container port
    pub fn container_port(&self) -> i32 {
        self.target_port.unwrap_or(self.port)
    }
}

/// The single container run by a component
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ContainerSpec {
    /// Container image
    pub image: String,
    /// Entrypoint override
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
    /// Arguments
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    /// Environment variables
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

/// Resource metric target for autoscaling
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MetricTarget {
    /// Resource name: `cpu` or `memory`
    pub resource: String,
    /// Target average utilization in percent
    pub target_average_utilization: i32,
}

impl MetricTarget {
    fn validate(&self) -> Result<(), String> {
        if self.resource != "cpu" && self.resource != "memory" {
            return Err(format!(
                "metric resource must be cpu or memory, got {}",
                self.resource
            ));
        }
        if !(1..=100).contains(&self.target_average_utilization) {
            return Err(format!(
                "targetAverageUtilization must be between 1 and 100, got {}",
                self.target_average_utilization
            ));
        }
        Ok(())
    }
}

/// Autoscaling declared inline on a component
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScalingPolicySpec {
    /// Lower replica bound
    pub min_replicas: i32,
    /// Upper replica bound
    pub max_replicas: i32,
    /// Allow operators to edit the generated AutoscalePolicy without it being reverted
    #[serde(default)]
    pub overridable: bool,
    /// Metric targets
    #[serde(default)]
    pub metrics: Vec<MetricTarget>,
}

/// Validate replica bounds and metrics shared by inline and standalone policies
pub(crate) fn validate_scaling(min: i32, max: i32, metrics: &[MetricTarget]) -> Result<(), String> {
    if min < 1 {
        return Err(format!("minReplicas must be at least 1, got {min}"));
    }
    if max < min {
        return Err(format!(
            "maxReplicas ({max}) must not be less than minReplicas ({min})"
        ));
    }
    if metrics.is_empty() {
        return Err("at least one metric is required".to_string());
    }
    metrics.iter().try_for_each(MetricTarget::validate)
}

/// An application component declared by a Cell or Composite
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ComponentSpec {
    /// Component name, unique within the parent
    pub name: String,
    /// Replica count when no scaling policy is declared
    #[serde(default = "default_replicas")]
    pub replicas: i32,
    /// Workload container
    pub container: ContainerSpec,
    /// Exposed ports
    #[serde(default)]
    pub ports: Vec<PortSpec>,
    /// Optional autoscaling
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scaling: Option<ScalingPolicySpec>,
}

fn default_replicas() -> i32 {
    1
}

impl ComponentSpec {
    /// Validate the component
    pub fn validate(&self) -> Result<(), String> {
        validate_dns_identifier(&self.name, false)
            .map_err(|e| format!("component name: {e}"))?;
        if self.container.image.is_empty() {
            return Err(format!("component {}: container image is required", self.name));
        }
        if self.replicas < 0 {
            return Err(format!("component {}: replicas must not be negative", self.name));
        }
        let mut seen = std::collections::BTreeSet::new();
        for port in &self.ports {
            if !(1..=65535).contains(&port.port) || !(1..=65535).contains(&port.container_port()) {
                return Err(format!(
                    "component {}: port {} is out of range",
                    self.name, port.name
                ));
            }
            if !seen.insert(port.name.as_str()) {
                return Err(format!(
                    "component {}: duplicate port name {}",
                    self.name, port.name
                ));
            }
        }
        if let Some(scaling) = &self.scaling {
            validate_scaling(scaling.min_replicas, scaling.max_replicas, &scaling.metrics)
                .map_err(|e| format!("component {}: {e}", self.name))?;
        }
        Ok(())
    }
}

/// Validate a list of components: each valid, names unique
pub(crate) fn validate_components(components: &[ComponentSpec]) -> Result<(), String> {
    let mut names = std::collections::BTreeSet::new();
    for component in components {
        component.validate()?;
        if !names.insert(component.name.as_str()) {
            return Err(format!("duplicate component name {}", component.name));
        }
    }
    Ok(())
}

/// Validate dependency names
pub(crate) fn validate_dependencies(owner: &str, dependencies: &[String]) -> Result<(), String> {
    for dep in dependencies {
        validate_dns_identifier(dep, false).map_err(|e| format!("dependency: {e}"))?;
        if dep == owner {
            return Err(format!("{owner} cannot depend on itself"));
        }
    }
    Ok(())
}
