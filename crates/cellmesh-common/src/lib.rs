//! Common types for cellmesh: CRDs, errors, crypto, and Kubernetes utilities

#![deny(missing_docs)]

pub mod crd;
pub mod crypto;
pub mod error;
pub mod kube_utils;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// API group of every cellmesh custom resource
pub const MESH_GROUP: &str = "mesh.cellery.io";

/// Namespace holding the operator configuration and private key
pub const DEFAULT_SYSTEM_NAMESPACE: &str = "cellery-system";

/// Label marking objects created by the cellmesh controllers
pub const LABEL_MANAGED_BY: &str = "mesh.cellery.io/managed-by";

/// Value of [`LABEL_MANAGED_BY`]
pub const LABEL_MANAGED_BY_CELLMESH: &str = "cellmesh";

/// Label carrying the owning cell name
pub const LABEL_CELL: &str = "mesh.cellery.io/cell";

/// Label carrying the owning composite name
pub const LABEL_COMPOSITE: &str = "mesh.cellery.io/composite";

/// Label carrying the owning gateway name
pub const LABEL_GATEWAY: &str = "mesh.cellery.io/gateway";

/// Label carrying the owning token service name
pub const LABEL_TOKEN_SERVICE: &str = "mesh.cellery.io/token-service";

/// Label carrying the component name
pub const LABEL_COMPONENT: &str = "mesh.cellery.io/component";

/// Label used as the pod selector of every generated workload
pub const LABEL_APP: &str = "app";
