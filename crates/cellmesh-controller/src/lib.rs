//! Controllers for cellmesh resources
//!
//! This crate provides the work queue, the generic controller loop and a
//! reconciler per managed kind. The operator binary wires them to
//! informers; tests drive the reconcilers against an in-memory cluster.
//!
//! Related crates:
//! - `cellmesh-common`: CRD types, errors, crypto and naming helpers
//! - `cellmesh-operator`: process wiring

pub mod apply;
pub mod autoscale;
pub mod cell;
pub mod client;
pub mod components;
pub mod composite;
pub mod config;
pub mod context;
pub mod controller;
pub mod gateway;
pub mod informer;
pub mod reconcile;
pub mod resources;
pub mod token_service;
pub mod workqueue;

pub use autoscale::AutoscalePolicyReconciler;
pub use cell::CellReconciler;
pub use client::{ClusterClients, KubeResourceClient, ResourceClient, StatusClient};
pub use composite::CompositeReconciler;
pub use config::MeshConfig;
pub use context::Context;
pub use controller::{Controller, ControllerHandle, ObjectKey, Reconciler};
pub use gateway::GatewayReconciler;
pub use informer::{DependentsHandler, EnqueueHandler, EnqueueOwnerHandler, EventHandler, Informer};
pub use token_service::TokenServiceReconciler;
pub use workqueue::WorkQueue;

// Re-export common error types
pub use cellmesh_common::{Error, Result};
