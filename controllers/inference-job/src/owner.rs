//! Ownership between InferenceJobs and the Deployments they control.
//!
//! `Scheme` is built once at startup and describes the controlling kind; it
//! is handed to everything that reads or writes owner references instead of
//! being looked up from global state. `OwnerResolver` maps a change on an
//! owned object back to the InferenceJob that controls it and enqueues that
//! job, so Deployment drift is corrected without a separate reconcile path.

use crate::cache::{object_key, Listers};
use crate::error::ControllerError;
use crate::watcher::ObjectEvent;
use crate::workqueue::WorkQueue;
use crds::InferenceJob;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::{Resource, ResourceExt};
use std::sync::Arc;
use tracing::{debug, error};

/// Type information for the controlling kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scheme {
    group: String,
    api_version: String,
    kind: String,
}

impl Scheme {
    /// Registers the InferenceJob kind.
    pub fn register() -> Self {
        Self {
            group: InferenceJob::group(&()).to_string(),
            api_version: InferenceJob::api_version(&()).to_string(),
            kind: InferenceJob::kind(&()).to_string(),
        }
    }

    /// Kind of the controlling resource.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// The owner reference flagged as controller, if any.
    pub fn controller_of(meta: &ObjectMeta) -> Option<&OwnerReference> {
        meta.owner_references
            .as_deref()
            .unwrap_or_default()
            .iter()
            .find(|owner| owner.controller == Some(true))
    }

    /// Whether `owner` points at a resource of the registered kind.
    pub fn is_owner_kind(&self, owner: &OwnerReference) -> bool {
        let owner_group = owner.api_version.split_once('/').map_or("", |(group, _)| group);
        owner.kind == self.kind && owner_group == self.group
    }

    /// Whether `meta` names `job` as its controller (matched by UID).
    pub fn is_controlled_by(&self, meta: &ObjectMeta, job: &InferenceJob) -> bool {
        match (Self::controller_of(meta), job.meta().uid.as_deref()) {
            (Some(owner), Some(uid)) => self.is_owner_kind(owner) && owner.uid == uid,
            _ => false,
        }
    }

    /// Controller owner reference pointing at `job`.
    pub fn controller_ref(&self, job: &InferenceJob) -> Result<OwnerReference, ControllerError> {
        let uid = job
            .meta()
            .uid
            .clone()
            .ok_or(ControllerError::MissingObjectKey(".metadata.uid"))?;
        Ok(OwnerReference {
            api_version: self.api_version.clone(),
            kind: self.kind.clone(),
            name: job.name_any(),
            uid,
            controller: Some(true),
            block_owner_deletion: Some(true),
        })
    }
}

/// Re-enqueues the InferenceJob controlling a changed object.
#[derive(Debug, Clone)]
pub struct OwnerResolver {
    scheme: Arc<Scheme>,
    listers: Listers,
    queue: WorkQueue,
}

impl OwnerResolver {
    /// Creates a resolver looking owners up in `listers` and enqueueing into `queue`.
    pub fn new(scheme: Arc<Scheme>, listers: Listers, queue: WorkQueue) -> Self {
        Self {
            scheme,
            listers,
            queue,
        }
    }

    /// Handles an added, updated or deleted object.
    ///
    /// Returns the key of the InferenceJob that was enqueued, if any. Objects
    /// without a matching controller, and orphans whose owner is gone, are
    /// ignored.
    pub fn handle_object<K: Resource>(&self, event: ObjectEvent<K>) -> Option<String> {
        let object = match event.into_object() {
            Ok(object) => object,
            Err(e) => {
                error!("{}", e);
                return None;
            }
        };
        debug!("Processing object: {}", object.name_any());

        let owner = Scheme::controller_of(object.meta())?;
        if !self.scheme.is_owner_kind(owner) {
            return None;
        }

        let namespace = object.meta().namespace.as_deref().unwrap_or_default();
        let Some(job) = self.listers.inference_job(namespace, &owner.name) else {
            debug!(
                "ignoring orphaned object '{}/{}' of {} '{}'",
                namespace,
                object.name_any(),
                self.scheme.kind(),
                owner.name
            );
            return None;
        };

        let key = object_key(job.as_ref());
        self.queue.add(key.clone());
        Some(key)
    }
}
