//! Kubernetes resource watchers.
//!
//! An `Informer` keeps a reflector store in sync with the API server and turns
//! the raw watch stream into add/update/delete notifications. `EventHandlers`
//! funnels those notifications into the work queue: InferenceJob changes
//! enqueue the job directly, Deployment changes go through the owner resolver.
//!
//! Objects that disappear while the watch is down are only noticed when the
//! next relist completes; they are delivered as deletion tombstones carrying
//! the last state the cache knew about.

use crate::cache::object_key;
use crate::error::ControllerError;
use crate::owner::OwnerResolver;
use crate::workqueue::WorkQueue;
use crds::InferenceJob;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use kube::{Api, Resource, ResourceExt};
use kube_runtime::reflector::{self, store::Writer, ObjectRef, Store};
use kube_runtime::{watcher, WatchStreamExt};
use serde::de::DeserializeOwned;
use std::collections::HashSet;
use std::fmt::Debug;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// An object delivered with a deletion: either the live final state, or a
/// tombstone for an object whose deletion was only inferred.
#[derive(Debug, Clone)]
pub enum ObjectEvent<K> {
    /// Final state observed directly
    Live(Arc<K>),
    /// Deleted while the watch was down; `last_known` is the cached state, if any
    Tombstone {
        /// Key the object was cached under
        key: String,
        /// Last cached copy of the object
        last_known: Option<Arc<K>>,
    },
}

impl<K> ObjectEvent<K> {
    /// Recovers the object, unwrapping tombstones.
    pub fn into_object(self) -> Result<Arc<K>, ControllerError> {
        match self {
            Self::Live(object) => Ok(object),
            Self::Tombstone { key, last_known } => {
                let object = last_known.ok_or(ControllerError::TombstoneDecode(key))?;
                Ok(object)
            }
        }
    }
}

/// A change observed by an informer.
#[derive(Debug, Clone)]
pub enum Notification<K> {
    /// First time the object is seen
    Added(Arc<K>),
    /// Object already cached; `old` is the previous cached copy
    Updated {
        /// Previous cached copy
        old: Arc<K>,
        /// Newly observed copy
        new: Arc<K>,
    },
    /// Object is gone
    Deleted(ObjectEvent<K>),
}

/// Applies watch events to a store and derives notifications from them.
///
/// Notifications are computed against the store as it was before the event,
/// so updates carry the previous copy. Relisted objects are held back until
/// the relist completes and the new snapshot is visible to readers.
pub struct Reflector<K>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    reader: Store<K>,
    writer: Writer<K>,
    relisted: HashSet<ObjectRef<K>>,
    pending: Vec<Notification<K>>,
}

impl<K> Reflector<K>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    /// Creates an empty, not yet synced, reflector.
    pub fn new() -> Self {
        let (reader, writer) = reflector::store();
        Self {
            reader,
            writer,
            relisted: HashSet::new(),
            pending: Vec::new(),
        }
    }

    /// Reader half of the store.
    pub fn store(&self) -> Store<K> {
        self.reader.clone()
    }

    fn added_or_updated(&self, object: K) -> Notification<K> {
        let new = Arc::new(object);
        match self.reader.get(&ObjectRef::from_obj(new.as_ref())) {
            Some(old) => Notification::Updated { old, new },
            None => Notification::Added(new),
        }
    }

    /// Applies `event` to the store and returns the notifications to dispatch.
    pub fn observe(&mut self, event: watcher::Event<K>) -> Vec<Notification<K>> {
        let notifications = match &event {
            watcher::Event::Apply(object) => vec![self.added_or_updated(object.clone())],
            watcher::Event::Delete(object) => {
                vec![Notification::Deleted(ObjectEvent::Live(Arc::new(object.clone())))]
            }
            watcher::Event::Init => {
                self.relisted.clear();
                self.pending.clear();
                Vec::new()
            }
            watcher::Event::InitApply(object) => {
                self.relisted.insert(ObjectRef::from_obj(object));
                let notification = self.added_or_updated(object.clone());
                self.pending.push(notification);
                Vec::new()
            }
            watcher::Event::InitDone => {
                let mut notifications = std::mem::take(&mut self.pending);
                for cached in self.reader.state() {
                    if !self.relisted.contains(&ObjectRef::from_obj(cached.as_ref())) {
                        notifications.push(Notification::Deleted(ObjectEvent::Tombstone {
                            key: object_key(cached.as_ref()),
                            last_known: Some(cached),
                        }));
                    }
                }
                self.relisted.clear();
                notifications
            }
        };
        self.writer.apply_watcher_event(&event);
        notifications
    }
}

impl<K> Default for Reflector<K>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Watches one resource type and keeps its store up to date.
pub struct Informer<K>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    api: Api<K>,
    reflector: Reflector<K>,
    resource_name: &'static str,
}

impl<K> Informer<K>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    /// Creates an informer over `api`.
    pub fn new(api: Api<K>, resource_name: &'static str) -> Self {
        Self {
            api,
            reflector: Reflector::new(),
            resource_name,
        }
    }

    /// Reader half of the informer's store.
    pub fn store(&self) -> Store<K> {
        self.reflector.store()
    }

    /// Runs the watch, calling `handler` for each notification after the
    /// store reflects it. Watch errors are logged and retried with backoff.
    pub async fn run<F>(mut self, handler: F) -> Result<(), ControllerError>
    where
        F: Fn(Notification<K>) + Send,
    {
        info!("Starting {} watcher", self.resource_name);

        let mut stream = watcher(self.api.clone(), watcher::Config::default())
            .default_backoff()
            .boxed();

        while let Some(result) = stream.next().await {
            match result {
                Ok(event) => {
                    if matches!(event, watcher::Event::InitDone) {
                        debug!("{} watcher initialization complete", self.resource_name);
                    }
                    for notification in self.reflector.observe(event) {
                        handler(notification);
                    }
                }
                Err(e) => warn!("{} watcher stream error: {}", self.resource_name, e),
            }
        }

        Err(ControllerError::Watch(format!(
            "{} watch stream ended",
            self.resource_name
        )))
    }
}

/// Routes informer notifications into the work queue.
#[derive(Debug, Clone)]
pub struct EventHandlers {
    queue: WorkQueue,
    owners: OwnerResolver,
}

impl EventHandlers {
    /// Creates handlers enqueueing into `queue`.
    pub fn new(queue: WorkQueue, owners: OwnerResolver) -> Self {
        Self { queue, owners }
    }

    fn enqueue_inference_job(&self, job: &InferenceJob) {
        let key = object_key(job);
        debug!("Enqueueing InferenceJob {}", key);
        self.queue.add(key);
    }

    /// InferenceJob added or updated: enqueue it. Deletions need no work.
    pub fn on_inference_job(&self, notification: Notification<InferenceJob>) {
        match notification {
            Notification::Added(job) | Notification::Updated { new: job, .. } => {
                self.enqueue_inference_job(&job);
            }
            Notification::Deleted(_) => {}
        }
    }

    /// Deployment changed: enqueue its controlling InferenceJob.
    ///
    /// Updates whose resource version did not move are resync replays of an
    /// unchanged object and are dropped.
    pub fn on_deployment(&self, notification: Notification<Deployment>) {
        match notification {
            Notification::Added(deployment) => {
                self.owners.handle_object(ObjectEvent::Live(deployment));
            }
            Notification::Updated { old, new } => {
                if old.resource_version() == new.resource_version() {
                    return;
                }
                self.owners.handle_object(ObjectEvent::Live(new));
            }
            Notification::Deleted(event) => {
                self.owners.handle_object(event);
            }
        }
    }
}
