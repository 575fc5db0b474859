//! Istio VirtualService, reduced to the routing fields cellmesh owns

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// VirtualService specification
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "networking.istio.io",
    version = "v1beta1",
    kind = "VirtualService",
    plural = "virtualservices",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct VirtualServiceSpec {
    /// Hosts the routes apply to
    #[serde(default)]
    pub hosts: Vec<String>,
    /// Sidecars and gateways the routes are pushed to
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub gateways: Vec<String>,
    /// HTTP routes, evaluated in order
    #[serde(default)]
    pub http: Vec<HttpRoute>,
}

/// An ordered HTTP route
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HttpRoute {
    /// Route name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Match conditions, any of which selects the route
    #[serde(rename = "match", default, skip_serializing_if = "Vec::is_empty")]
    pub match_: Vec<HttpMatchRequest>,
    /// Destinations
    #[serde(default)]
    pub route: Vec<HttpRouteDestination>,
}

/// HTTP match conditions
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HttpMatchRequest {
    /// Authority (Host header) match
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authority: Option<StringMatch>,
    /// URI match
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<StringMatch>,
    /// Source workload labels
    #[serde(default, skip_serializing_if = "std::collections::BTreeMap::is_empty")]
    pub source_labels: std::collections::BTreeMap<String, String>,
}

/// String match, exactly one field set
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StringMatch {
    /// Exact match
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exact: Option<String>,
    /// Prefix match
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
}

/// Weighted destination of a route
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HttpRouteDestination {
    /// Target service
    pub destination: Destination,
    /// Relative weight
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<i32>,
}

/// Target service of a route
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Destination {
    /// Service host name
    pub host: String,
    /// Service port
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<PortSelector>,
}

/// Port of a destination
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PortSelector {
    /// Port number
    pub number: u32,
}

impl StringMatch {
    /// Exact string match
    pub fn exact(value: impl Into<String>) -> Self {
        Self {
            exact: Some(value.into()),
            prefix: None,
        }
    }

    /// Prefix string match
    pub fn prefix(value: impl Into<String>) -> Self {
        Self {
            exact: None,
            prefix: Some(value.into()),
        }
    }
}
