//! Shared reconciler context

use crate::client::ClusterClients;
use crate::config::MeshConfig;

/// Clients and settings handed to every reconciler
#[derive(Clone)]
pub struct Context {
    /// Typed cluster clients
    pub clients: ClusterClients,
    /// Mesh settings
    pub config: MeshConfig,
}

impl Context {
    /// Create a context
    pub fn new(clients: ClusterClients, config: MeshConfig) -> Self {
        Self { clients, config }
    }
}
