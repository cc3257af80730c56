//! Read-only cache accessors and object keys.
//!
//! The stores are filled by the informers in `watcher` and shared by every
//! worker. Objects come back as `Arc`s of the cached copy: they must never be
//! mutated, clone before changing anything.

use crate::error::ControllerError;
use crds::InferenceJob;
use k8s_openapi::api::apps::v1::Deployment;
use kube::{Resource, ResourceExt};
use kube_runtime::reflector::{ObjectRef, Store};
use std::sync::Arc;

/// Builds the work queue key of an object: `namespace/name`, or just `name`
/// for cluster-scoped objects.
pub fn object_key<K: Resource>(obj: &K) -> String {
    match obj.meta().namespace.as_deref() {
        Some(namespace) if !namespace.is_empty() => format!("{}/{}", namespace, obj.name_any()),
        _ => obj.name_any(),
    }
}

/// Splits a work queue key into `(namespace, name)`.
///
/// A key without a `/` is cluster-scoped and yields an empty namespace.
pub fn split_key(key: &str) -> Result<(&str, &str), ControllerError> {
    let mut parts = key.split('/');
    let parsed = match (parts.next(), parts.next(), parts.next()) {
        (Some(name), None, None) => ("", name),
        (Some(namespace), Some(name), None) => (namespace, name),
        _ => return Err(ControllerError::InvalidKey(key.to_string())),
    };
    if parsed.1.is_empty() {
        return Err(ControllerError::InvalidKey(key.to_string()));
    }
    Ok(parsed)
}

fn lookup<K>(store: &Store<K>, namespace: &str, name: &str) -> Option<Arc<K>>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    let obj_ref = ObjectRef::new(name);
    let obj_ref = if namespace.is_empty() {
        obj_ref
    } else {
        obj_ref.within(namespace)
    };
    store.get(&obj_ref)
}

/// Typed lookups into the InferenceJob and Deployment caches.
#[derive(Clone)]
pub struct Listers {
    inference_jobs: Store<InferenceJob>,
    deployments: Store<Deployment>,
}

impl std::fmt::Debug for Listers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listers")
            .field("inference_jobs", &self.inference_jobs.len())
            .field("deployments", &self.deployments.len())
            .finish()
    }
}

impl Listers {
    /// Wraps the two informer stores.
    pub fn new(inference_jobs: Store<InferenceJob>, deployments: Store<Deployment>) -> Self {
        Self {
            inference_jobs,
            deployments,
        }
    }

    /// Cached InferenceJob `namespace/name`, if present.
    pub fn inference_job(&self, namespace: &str, name: &str) -> Option<Arc<InferenceJob>> {
        lookup(&self.inference_jobs, namespace, name)
    }

    /// Cached Deployment `namespace/name`, if present.
    pub fn deployment(&self, namespace: &str, name: &str) -> Option<Arc<Deployment>> {
        lookup(&self.deployments, namespace, name)
    }

    /// Blocks until both caches have completed their initial list.
    ///
    /// Fails if an informer stops before ever syncing.
    pub async fn wait_for_cache_sync(&self) -> Result<(), ControllerError> {
        self.inference_jobs
            .wait_until_ready()
            .await
            .map_err(|e| ControllerError::CacheSync(format!("InferenceJob cache: {e}")))?;
        self.deployments
            .wait_until_ready()
            .await
            .map_err(|e| ControllerError::CacheSync(format!("Deployment cache: {e}")))?;
        Ok(())
    }
}
