//! Generic controller loop
//!
//! A [`Controller`] owns a [`WorkQueue`] and runs a fixed number of worker
//! tasks that hand keys to a [`Reconciler`]. Informer callbacks feed the
//! queue through a cloneable [`ControllerHandle`].

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use kube::{Resource, ResourceExt};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[cfg(test)]
use mockall::automock;

use cellmesh_common::kube_utils::controller_of;
use cellmesh_common::{Error, MESH_GROUP};

use crate::workqueue::WorkQueue;

/// `namespace/name` of a parent resource
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ObjectKey {
    /// Namespace of the object
    pub namespace: String,
    /// Name of the object
    pub name: String,
}

impl ObjectKey {
    /// Build a key from its parts
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Key of a namespaced object; `None` for cluster-scoped objects
    pub fn from_resource<K: Resource>(obj: &K) -> Option<Self> {
        Some(Self::new(obj.namespace()?, obj.name_any()))
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl FromStr for ObjectKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((ns, name)) if !ns.is_empty() && !name.is_empty() && !name.contains('/') => {
                Ok(Self::new(ns, name))
            }
            _ => Err(Error::validation_for(s, "expected a namespace/name key")),
        }
    }
}

/// Drives one resource toward its declared state
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Reconciler: Send + Sync {
    /// Reconcile the object named by `key`
    ///
    /// Returning a retryable error requeues the key with backoff; any other
    /// error drops it until the object changes again.
    async fn reconcile(&self, key: &ObjectKey) -> Result<(), Error>;
}

/// Enqueue side of a controller, handed to informer callbacks
#[derive(Clone, Debug)]
pub struct ControllerHandle {
    kind: &'static str,
    queue: WorkQueue,
}

impl ControllerHandle {
    /// Kind this controller reconciles
    pub fn kind(&self) -> &'static str {
        self.kind
    }

    /// Enqueue an object by its key
    pub fn enqueue<K: Resource>(&self, obj: &K) {
        match ObjectKey::from_resource(obj) {
            Some(key) => self.queue.add(key.to_string()),
            None => warn!(
                controller = self.kind,
                name = %obj.name_any(),
                "ignoring object without namespace"
            ),
        }
    }

    /// Enqueue a raw `namespace/name` key
    pub fn enqueue_key(&self, key: impl Into<String>) {
        self.queue.add(key);
    }

    /// Enqueue the parent controlling `obj`, if it is of this controller's kind
    ///
    /// Istio and Gateway API both have a `Gateway` kind, so the owner's API
    /// group must be ours as well.
    pub fn enqueue_controller_of<K: Resource>(&self, obj: &K) {
        let Some(owner) = controller_of(obj.meta()) else {
            return;
        };
        let in_group = owner
            .api_version
            .split_once('/')
            .is_some_and(|(group, _)| group == MESH_GROUP);
        if owner.kind != self.kind || !in_group {
            return;
        }
        if let Some(ns) = obj.namespace() {
            self.queue.add(format!("{}/{}", ns, owner.name));
        }
    }
}

/// A work-queue driven controller for one kind
#[derive(Clone)]
pub struct Controller {
    kind: &'static str,
    queue: WorkQueue,
    reconciler: Arc<dyn Reconciler>,
}

impl Controller {
    /// Controller named after the kind it reconciles
    pub fn new(kind: &'static str, reconciler: Arc<dyn Reconciler>) -> Self {
        Self::with_queue(kind, reconciler, WorkQueue::new())
    }

    /// Controller over an existing queue
    pub fn with_queue(kind: &'static str, reconciler: Arc<dyn Reconciler>, queue: WorkQueue) -> Self {
        Self {
            kind,
            queue,
            reconciler,
        }
    }

    /// Enqueue side of this controller
    pub fn handle(&self) -> ControllerHandle {
        ControllerHandle {
            kind: self.kind,
            queue: self.queue.clone(),
        }
    }

    /// The underlying queue
    pub fn queue(&self) -> &WorkQueue {
        &self.queue
    }

    /// Run `workers` workers until `token` is cancelled
    ///
    /// Items being reconciled when the token fires run to completion.
    pub async fn run(&self, workers: usize, token: CancellationToken) {
        let workers = workers.max(1);
        info!(controller = self.kind, workers, "starting controller");

        let mut set = JoinSet::new();
        for worker in 0..workers {
            let this = self.clone();
            let token = token.clone();
            set.spawn(async move { this.run_worker(worker, token).await });
        }

        token.cancelled().await;
        self.queue.shutdown();
        while let Some(joined) = set.join_next().await {
            if let Err(e) = joined {
                error!(controller = self.kind, error = %e, "worker task failed");
            }
        }
        info!(controller = self.kind, "controller stopped");
    }

    async fn run_worker(&self, worker: usize, token: CancellationToken) {
        debug!(controller = self.kind, worker, "worker started");
        while !token.is_cancelled() {
            let next = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                next = self.queue.get() => next,
            };
            match next {
                (Some(key), _) => {
                    self.process_key(&key).await;
                    self.queue.done(&key);
                }
                (None, _) => break,
            }
        }
        debug!(controller = self.kind, worker, "worker stopped");
    }

    /// Take one key off the queue and process it
    ///
    /// Returns `false` once the queue is shut down.
    pub async fn process_next_item(&self) -> bool {
        match self.queue.get().await {
            (Some(key), _) => {
                self.process_key(&key).await;
                self.queue.done(&key);
                true
            }
            (None, _) => false,
        }
    }

    async fn process_key(&self, key: &str) {
        let object_key = match key.parse::<ObjectKey>() {
            Ok(k) => k,
            Err(e) => {
                error!(controller = self.kind, key, error = %e, "dropping malformed key");
                self.queue.forget(key);
                return;
            }
        };

        let reconciler = &self.reconciler;
        let outcome = AssertUnwindSafe(async { reconciler.reconcile(&object_key).await })
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(())) => {
                debug!(controller = self.kind, key, "reconciled");
                self.queue.forget(key);
            }
            Ok(Err(e)) if e.is_retryable() => {
                let delay = self.queue.add_rate_limited(key);
                warn!(
                    controller = self.kind,
                    key,
                    error = %e,
                    retry_in = ?delay,
                    requeues = self.queue.num_requeues(key),
                    "reconcile failed, requeueing"
                );
            }
            Ok(Err(e)) => {
                error!(
                    controller = self.kind,
                    key,
                    error = %e,
                    "reconcile failed; not retrying until the resource changes"
                );
                self.queue.forget(key);
            }
            Err(panic) => {
                error!(
                    controller = self.kind,
                    key,
                    panic = panic_message(panic.as_ref()),
                    "reconciler panicked"
                );
                self.queue.forget(key);
            }
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}
