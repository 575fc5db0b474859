//! Change notification on top of the kube-runtime watcher
//!
//! An [`Informer`] keeps a `reflector::Store` current and turns raw watch
//! events into add/update/delete callbacks. After a relist, objects that
//! vanished while the watch was down are reported as deletes.

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

use futures::StreamExt;
use kube::runtime::reflector::{self, ObjectRef, Store};
use kube::runtime::watcher::Event;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::controller::ControllerHandle;

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
/// so the API server closes idle watches before the client gives up.
pub const WATCH_TIMEOUT_SECS: u32 = 25;

/// Callbacks for changes to objects of kind `K`
pub trait EventHandler<K>: Send + Sync {
    /// A new object appeared
    fn on_add(&self, obj: &K);
    /// An object changed (or was re-listed)
    fn on_update(&self, old: &K, new: &K);
    /// An object was removed
    fn on_delete(&self, obj: &K);
}

/// Applies watch events to a store and fans them out to handlers
pub struct EventDispatcher<K>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    reader: Store<K>,
    writer: reflector::store::Writer<K>,
    handlers: Vec<Arc<dyn EventHandler<K>>>,
    relist: Option<Vec<K>>,
}

impl<K> Default for EventDispatcher<K>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    fn default() -> Self {
        let (reader, writer) = reflector::store();
        Self {
            reader,
            writer,
            handlers: Vec::new(),
            relist: None,
        }
    }
}

impl<K> EventDispatcher<K>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    /// Read handle on the cache
    pub fn store(&self) -> Store<K> {
        self.reader.clone()
    }

    /// Register a handler
    pub fn add_handler(&mut self, handler: Arc<dyn EventHandler<K>>) {
        self.handlers.push(handler);
    }

    /// Apply one watch event
    pub fn dispatch(&mut self, event: Event<K>) {
        match &event {
            Event::Apply(obj) => {
                let old = self.reader.get(&ObjectRef::from_obj(obj));
                self.writer.apply_watcher_event(&event);
                match old {
                    Some(old) => self.each(|h| h.on_update(&old, obj)),
                    None => self.each(|h| h.on_add(obj)),
                }
            }
            Event::Delete(obj) => {
                self.writer.apply_watcher_event(&event);
                self.each(|h| h.on_delete(obj));
            }
            Event::Init => {
                self.relist = Some(Vec::new());
                self.writer.apply_watcher_event(&event);
            }
            Event::InitApply(obj) => {
                self.relist.get_or_insert_with(Vec::new).push(obj.clone());
                self.writer.apply_watcher_event(&event);
            }
            Event::InitDone => {
                let mut previous: HashMap<ObjectRef<K>, Arc<K>> = self
                    .reader
                    .state()
                    .into_iter()
                    .map(|obj| (ObjectRef::from_obj(obj.as_ref()), obj))
                    .collect();
                self.writer.apply_watcher_event(&event);

                let listed = self.relist.take().unwrap_or_default();
                debug!(
                    kind = %K::kind(&()),
                    listed = listed.len(),
                    cached = previous.len(),
                    "relist complete"
                );
                for obj in &listed {
                    match previous.remove(&ObjectRef::from_obj(obj)) {
                        Some(old) => self.each(|h| h.on_update(&old, obj)),
                        None => self.each(|h| h.on_add(obj)),
                    }
                }
                for gone in previous.values() {
                    self.each(|h| h.on_delete(gone));
                }
            }
        }
    }

    fn each(&self, f: impl Fn(&dyn EventHandler<K>)) {
        for handler in &self.handlers {
            f(handler.as_ref());
        }
    }
}

/// Watches one kind and keeps its cache and handlers current
pub struct Informer<K>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    api: Api<K>,
    dispatcher: EventDispatcher<K>,
}

impl<K> Informer<K>
where
    K: Resource<DynamicType = ()> + Clone + Debug + DeserializeOwned + Send + Sync + 'static,
{
    /// Informer over `api` (namespaced or all namespaces)
    pub fn new(api: Api<K>) -> Self {
        Self {
            api,
            dispatcher: EventDispatcher::default(),
        }
    }

    /// Read handle on the cache
    pub fn store(&self) -> Store<K> {
        self.dispatcher.store()
    }

    /// Register a handler
    pub fn add_handler(&mut self, handler: Arc<dyn EventHandler<K>>) {
        self.dispatcher.add_handler(handler);
    }

    /// Watch until `token` is cancelled
    pub async fn run(mut self, token: CancellationToken) {
        let kind = K::kind(&()).to_string();
        info!(%kind, "starting informer");
        let stream = watcher(
            self.api.clone(),
            watcher::Config::default().timeout(WATCH_TIMEOUT_SECS),
        )
        .default_backoff();
        futures::pin_mut!(stream);

        loop {
            let next = tokio::select! {
                _ = token.cancelled() => break,
                next = stream.next() => next,
            };
            match next {
                Some(Ok(event)) => self.dispatcher.dispatch(event),
                Some(Err(e)) => warn!(%kind, error = %e, "watch error, retrying"),
                None => break,
            }
        }
        info!(%kind, "informer stopped");
    }
}

/// Enqueues the object itself on every change
pub struct EnqueueHandler {
    controller: ControllerHandle,
}

impl EnqueueHandler {
    /// Handler feeding `controller`
    pub fn new(controller: ControllerHandle) -> Arc<Self> {
        Arc::new(Self { controller })
    }
}

impl<K: Resource> EventHandler<K> for EnqueueHandler {
    fn on_add(&self, obj: &K) {
        self.controller.enqueue(obj);
    }

    fn on_update(&self, old: &K, new: &K) {
        // Periodic relists replay unchanged objects
        if old.resource_version() == new.resource_version() {
            return;
        }
        self.controller.enqueue(new);
    }

    fn on_delete(&self, obj: &K) {
        self.controller.enqueue(obj);
    }
}

/// Enqueues the controlling parent of a child object
pub struct EnqueueOwnerHandler {
    controller: ControllerHandle,
}

impl EnqueueOwnerHandler {
    /// Handler feeding `controller`
    pub fn new(controller: ControllerHandle) -> Arc<Self> {
        Arc::new(Self { controller })
    }
}

impl<K: Resource> EventHandler<K> for EnqueueOwnerHandler {
    fn on_add(&self, obj: &K) {
        self.controller.enqueue_controller_of(obj);
    }

    fn on_update(&self, old: &K, new: &K) {
        if old.resource_version() == new.resource_version() {
            return;
        }
        // Ownership may have moved; both parents need to hear about it
        self.controller.enqueue_controller_of(old);
        self.controller.enqueue_controller_of(new);
    }

    fn on_delete(&self, obj: &K) {
        self.controller.enqueue_controller_of(obj);
    }
}

/// Enqueues objects of kind `P` that reference a changed object by name
///
/// Used to wake cells and composites when a cell they depend on changes.
pub struct DependentsHandler<P>
where
    P: Resource<DynamicType = ()> + Clone + 'static,
{
    dependents: Store<P>,
    controller: ControllerHandle,
    depends_on: fn(&P, &str) -> bool,
}

impl<P> DependentsHandler<P>
where
    P: Resource<DynamicType = ()> + Clone + 'static,
{
    /// Handler enqueueing every `P` in `dependents` for which `depends_on`
    /// holds
    pub fn new(
        dependents: Store<P>,
        controller: ControllerHandle,
        depends_on: fn(&P, &str) -> bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            dependents,
            controller,
            depends_on,
        })
    }

    fn enqueue_dependents<K: Resource>(&self, changed: &K) {
        let namespace = changed.namespace();
        let name = changed.name_any();
        for dependent in self.dependents.state() {
            if dependent.namespace() == namespace && (self.depends_on)(&dependent, &name) {
                self.controller.enqueue(dependent.as_ref());
            }
        }
    }
}

impl<K, P> EventHandler<K> for DependentsHandler<P>
where
    K: Resource,
    P: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
{
    fn on_add(&self, obj: &K) {
        self.enqueue_dependents(obj);
    }

    fn on_update(&self, old: &K, new: &K) {
        if old.resource_version() == new.resource_version() {
            return;
        }
        self.enqueue_dependents(new);
    }

    fn on_delete(&self, obj: &K) {
        self.enqueue_dependents(obj);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use cellmesh_common::crd::{Cell, CellSpec, Composite, CompositeSpec};
    use k8s_openapi::api::core::v1::Service;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};

    use crate::controller::Controller;
    use crate::workqueue::WorkQueue;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<String>>);

    impl<K: Resource> EventHandler<K> for Recorder {
        fn on_add(&self, obj: &K) {
            self.0.lock().unwrap().push(format!("add {}", obj.name_any()));
        }
        fn on_update(&self, _old: &K, new: &K) {
            self.0.lock().unwrap().push(format!("update {}", new.name_any()));
        }
        fn on_delete(&self, obj: &K) {
            self.0.lock().unwrap().push(format!("delete {}", obj.name_any()));
        }
    }

    fn cell(name: &str, rv: &str, deps: &[&str]) -> Cell {
        let mut cell = Cell::new(
            name,
            CellSpec {
                dependencies: deps.iter().map(|d| d.to_string()).collect(),
                ..Default::default()
            },
        );
        cell.metadata.namespace = Some("default".to_string());
        cell.metadata.resource_version = Some(rv.to_string());
        cell
    }

    fn handle() -> (ControllerHandle, WorkQueue) {
        struct Noop;
        #[async_trait::async_trait]
        impl crate::controller::Reconciler for Noop {
            async fn reconcile(
                &self,
                _key: &crate::controller::ObjectKey,
            ) -> Result<(), cellmesh_common::Error> {
                Ok(())
            }
        }
        let queue = WorkQueue::new();
        let ctrl = Controller::with_queue("Cell", Arc::new(Noop), queue.clone());
        (ctrl.handle(), queue)
    }

    async fn drain(queue: &WorkQueue) -> Vec<String> {
        let mut keys = Vec::new();
        while !queue.is_empty() {
            if let (Some(key), _) = queue.get().await {
                queue.done(&key);
                keys.push(key);
            }
        }
        keys.sort();
        keys
    }

    /// Story: a relist reports changes, additions and deletions that
    /// happened while the watch was disconnected
    #[test]
    fn story_relist_synthesizes_deletes() {
        let recorder = Arc::new(Recorder::default());
        let mut dispatcher = EventDispatcher::<Cell>::default();
        dispatcher.add_handler(recorder.clone());

        dispatcher.dispatch(Event::Apply(cell("hr", "1", &[])));
        dispatcher.dispatch(Event::Apply(cell("stock", "1", &[])));
        dispatcher.dispatch(Event::Apply(cell("hr", "2", &[])));
        assert_eq!(dispatcher.store().state().len(), 2);

        dispatcher.dispatch(Event::Init);
        dispatcher.dispatch(Event::InitApply(cell("hr", "3", &[])));
        dispatcher.dispatch(Event::InitApply(cell("pets", "1", &[])));
        dispatcher.dispatch(Event::InitDone);

        let events = recorder.0.lock().unwrap().clone();
        assert_eq!(
            events,
            vec![
                "add hr",
                "add stock",
                "update hr",
                "update hr",
                "add pets",
                "delete stock",
            ]
        );
        let mut names: Vec<_> = dispatcher
            .store()
            .state()
            .iter()
            .map(|c| c.name_any())
            .collect();
        names.sort();
        assert_eq!(names, vec!["hr", "pets"]);
    }

    #[test]
    fn delete_event_removes_from_store() {
        let recorder = Arc::new(Recorder::default());
        let mut dispatcher = EventDispatcher::<Cell>::default();
        dispatcher.add_handler(recorder.clone());

        dispatcher.dispatch(Event::Apply(cell("hr", "1", &[])));
        dispatcher.dispatch(Event::Delete(cell("hr", "1", &[])));
        assert!(dispatcher.store().state().is_empty());
        assert_eq!(recorder.0.lock().unwrap().last().unwrap(), "delete hr");
    }

    #[tokio::test]
    async fn enqueue_handler_ignores_resync() {
        let (controller, queue) = handle();
        let handler = EnqueueHandler::new(controller);

        EventHandler::<Cell>::on_update(handler.as_ref(), &cell("hr", "1", &[]), &cell("hr", "1", &[]));
        assert!(queue.is_empty());

        EventHandler::<Cell>::on_update(handler.as_ref(), &cell("hr", "1", &[]), &cell("hr", "2", &[]));
        assert_eq!(drain(&queue).await, vec!["default/hr"]);
    }

    #[tokio::test]
    async fn owner_handler_enqueues_controlling_parent() {
        let (controller, queue) = handle();
        let handler = EnqueueOwnerHandler::new(controller);

        let service = Service {
            metadata: ObjectMeta {
                name: Some("hr--api-service".to_string()),
                namespace: Some("default".to_string()),
                owner_references: Some(vec![OwnerReference {
                    api_version: "mesh.cellery.io/v1alpha2".to_string(),
                    kind: "Cell".to_string(),
                    name: "hr".to_string(),
                    uid: "u".to_string(),
                    controller: Some(true),
                    block_owner_deletion: Some(true),
                }]),
                ..Default::default()
            },
            ..Default::default()
        };
        handler.on_delete(&service);
        assert_eq!(drain(&queue).await, vec!["default/hr"]);
    }

    /// Story: when a cell publishes its gateway, the cells and composites
    /// depending on it are reconciled again
    #[tokio::test]
    async fn story_dependency_change_wakes_dependents() {
        let mut cells = EventDispatcher::<Cell>::default();
        cells.dispatch(Event::Apply(cell("hr", "1", &["stock"])));
        cells.dispatch(Event::Apply(cell("pets", "1", &[])));

        let mut composites = EventDispatcher::<Composite>::default();
        let mut composite = Composite::new(
            "portal",
            CompositeSpec {
                dependencies: vec!["stock".to_string()],
                ..Default::default()
            },
        );
        composite.metadata.namespace = Some("default".to_string());
        composites.dispatch(Event::Apply(composite));

        let (cell_ctrl, cell_queue) = handle();
        let (composite_ctrl, composite_queue) = handle();
        let cell_dependents = DependentsHandler::new(cells.store(), cell_ctrl, |c: &Cell, dep| {
            c.spec.dependencies.iter().any(|d| d == dep)
        });
        let composite_dependents =
            DependentsHandler::new(composites.store(), composite_ctrl, |c: &Composite, dep| {
                c.spec.dependencies.iter().any(|d| d == dep)
            });

        let stock = cell("stock", "7", &[]);
        EventHandler::<Cell>::on_add(cell_dependents.as_ref(), &stock);
        EventHandler::<Cell>::on_add(composite_dependents.as_ref(), &stock);

        assert_eq!(drain(&cell_queue).await, vec!["default/hr"]);
        assert_eq!(drain(&composite_queue).await, vec!["default/portal"]);
    }
}
