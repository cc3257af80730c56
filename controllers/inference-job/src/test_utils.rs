//! Test utilities for unit testing the controller
//!
//! This module provides helpers for creating test data, pre-synced caches and
//! in-memory stand-ins for the API calls a sync issues.

use crate::backoff::ItemExponentialBackoff;
use crate::cache::Listers;
use crate::client::WorkloadClient;
use crate::error::ControllerError;
use crate::owner::Scheme;
use crate::reconciler::Reconciler;
use crate::recorder::{EventSink, Severity};
use crate::workqueue::WorkQueue;
use crds::{InferenceJob, InferenceJobSpec};
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, DeploymentStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::Resource;
use kube_runtime::reflector::{self, store::Writer, Store};
use kube_runtime::watcher;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Helper to create a test InferenceJob with a stable uid
pub fn create_test_inference_job(
    namespace: &str,
    name: &str,
    deployment_name: &str,
    replicas: Option<i32>,
    image: &str,
) -> InferenceJob {
    InferenceJob {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            uid: Some(format!("uid-{namespace}-{name}")),
            ..Default::default()
        },
        spec: InferenceJobSpec {
            deployment_name: deployment_name.to_string(),
            replicas,
            image_to_deploy: image.to_string(),
        },
        status: None,
    }
}

/// Helper to create a test Deployment, optionally controlled by `owner`
pub fn create_test_deployment(
    namespace: &str,
    name: &str,
    owner: Option<&InferenceJob>,
    replicas: Option<i32>,
    available: i32,
) -> Deployment {
    let owner_references = owner.map(|job| vec![Scheme::register().controller_ref(job).unwrap()]);
    Deployment {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            owner_references,
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas,
            ..Default::default()
        }),
        status: Some(DeploymentStatus {
            available_replicas: Some(available),
            ..Default::default()
        }),
    }
}

/// Store that has completed an initial list containing `objects`.
///
/// The writer is returned so callers can keep applying events.
pub fn store_with<K>(objects: Vec<K>) -> (Store<K>, Writer<K>)
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    let (store, mut writer) = reflector::store();
    writer.apply_watcher_event(&watcher::Event::Init);
    for object in objects {
        writer.apply_watcher_event(&watcher::Event::InitApply(object));
    }
    writer.apply_watcher_event(&watcher::Event::InitDone);
    (store, writer)
}

/// Store that has never synced
pub fn unsynced_store<K>() -> (Store<K>, Writer<K>)
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    reflector::store()
}

/// Queue with the default backoff
pub fn test_queue() -> WorkQueue {
    WorkQueue::new("test", ItemExponentialBackoff::default())
}

/// Synced listers over the given objects
pub fn test_listers(jobs: Vec<InferenceJob>, deployments: Vec<Deployment>) -> Listers {
    let (jobs, _) = store_with(jobs);
    let (deployments, _) = store_with(deployments);
    Listers::new(jobs, deployments)
}

/// In-memory `WorkloadClient` recording every write.
#[derive(Debug, Clone, Default)]
pub struct FakeWorkloadClient {
    created: Arc<Mutex<Vec<Deployment>>>,
    updated: Arc<Mutex<Vec<Deployment>>>,
    status_updates: Arc<Mutex<Vec<InferenceJob>>>,
    fail_writes: Arc<AtomicBool>,
    panic_on_write: Arc<AtomicBool>,
}

impl FakeWorkloadClient {
    /// Makes every subsequent write fail with an API error
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Makes every subsequent write panic
    pub fn panic_on_write(&self, panic: bool) {
        self.panic_on_write.store(panic, Ordering::SeqCst);
    }

    pub fn created(&self) -> Vec<Deployment> {
        self.created.lock().unwrap().clone()
    }

    pub fn updated(&self) -> Vec<Deployment> {
        self.updated.lock().unwrap().clone()
    }

    pub fn status_updates(&self) -> Vec<InferenceJob> {
        self.status_updates.lock().unwrap().clone()
    }

    /// Total number of write calls that succeeded
    pub fn writes(&self) -> usize {
        self.created().len() + self.updated().len() + self.status_updates().len()
    }

    fn check(&self) -> Result<(), ControllerError> {
        assert!(
            !self.panic_on_write.load(Ordering::SeqCst),
            "write issued while panic_on_write is set"
        );
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(ControllerError::Kube(kube::Error::Service(
                "connection refused".into(),
            )));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl WorkloadClient for FakeWorkloadClient {
    async fn create_deployment(
        &self,
        _namespace: &str,
        deployment: &Deployment,
    ) -> Result<Deployment, ControllerError> {
        self.check()?;
        self.created.lock().unwrap().push(deployment.clone());
        Ok(deployment.clone())
    }

    async fn update_deployment(
        &self,
        _namespace: &str,
        deployment: &Deployment,
    ) -> Result<Deployment, ControllerError> {
        self.check()?;
        self.updated.lock().unwrap().push(deployment.clone());
        Ok(deployment.clone())
    }

    async fn update_inference_job_status(
        &self,
        job: &InferenceJob,
    ) -> Result<InferenceJob, ControllerError> {
        self.check()?;
        self.status_updates.lock().unwrap().push(job.clone());
        Ok(job.clone())
    }
}

/// A recorded event: severity, reason and message
pub type RecordedEvent = (Severity, String, String);

/// `EventSink` keeping events in memory.
#[derive(Debug, Clone, Default)]
pub struct RecordingEventSink {
    events: Arc<Mutex<Vec<RecordedEvent>>>,
}

impl RecordingEventSink {
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn warnings(&self) -> Vec<RecordedEvent> {
        self.events()
            .into_iter()
            .filter(|(severity, _, _)| *severity == Severity::Warning)
            .collect()
    }
}

#[async_trait::async_trait]
impl EventSink for RecordingEventSink {
    async fn record(&self, _job: &InferenceJob, severity: Severity, reason: &str, message: &str) {
        self.events
            .lock()
            .unwrap()
            .push((severity, reason.to_string(), message.to_string()));
    }
}

/// Synced caches plus fakes for everything a `Reconciler` writes to.
///
/// The Deployment cache stays writable so tests can change the cluster
/// between syncs.
#[derive(Clone)]
pub struct ReconcilerFixture {
    pub listers: Listers,
    pub client: FakeWorkloadClient,
    pub events: RecordingEventSink,
    deployments: Arc<Mutex<Writer<Deployment>>>,
}

impl std::fmt::Debug for ReconcilerFixture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconcilerFixture")
            .field("listers", &self.listers)
            .finish_non_exhaustive()
    }
}

impl ReconcilerFixture {
    pub fn new(jobs: Vec<InferenceJob>, deployments: Vec<Deployment>) -> Self {
        let (jobs, _) = store_with(jobs);
        let (deployments, deployments_writer) = store_with(deployments);
        Self {
            listers: Listers::new(jobs, deployments),
            client: FakeWorkloadClient::default(),
            events: RecordingEventSink::default(),
            deployments: Arc::new(Mutex::new(deployments_writer)),
        }
    }

    /// Adds or replaces `deployment` in the Deployment cache
    pub fn apply_deployment(&self, deployment: Deployment) {
        self.deployments
            .lock()
            .unwrap()
            .apply_watcher_event(&watcher::Event::Apply(deployment));
    }

    /// Removes `deployment` from the Deployment cache
    pub fn delete_deployment(&self, deployment: Deployment) {
        self.deployments
            .lock()
            .unwrap()
            .apply_watcher_event(&watcher::Event::Delete(deployment));
    }

    /// Reconciler sharing this fixture's caches and fakes
    pub fn reconciler(&self) -> Reconciler {
        Reconciler::new(
            self.listers.clone(),
            Box::new(self.client.clone()),
            Box::new(self.events.clone()),
            Arc::new(Scheme::register()),
        )
    }
}
