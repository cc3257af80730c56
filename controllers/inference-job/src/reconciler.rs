//! Reconciliation logic for InferenceJob CRDs.
//!
//! `Reconciler::sync` compares an InferenceJob with the Deployment it
//! controls and converges the two: the Deployment is created when missing and
//! rescaled when its replica count drifts, then the observed availability is
//! mirrored into the job's status.
//!
//! Every read comes from the informer caches, which may lag the cluster. A
//! sync therefore never assumes its writes are visible; the resulting watch
//! events enqueue the job again and the next pass sees the new state.

use crate::cache::{split_key, Listers};
use crate::client::WorkloadClient;
use crate::error::ControllerError;
use crate::owner::Scheme;
use crate::recorder::{EventSink, Severity};
use crds::{InferenceJob, InferenceJobStatus};
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::ResourceExt;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

/// Event reason used when an InferenceJob is synced
pub const SUCCESS_SYNCED: &str = "Synced";

/// Event reason used when the target Deployment exists but is owned by someone else
pub const ERR_RESOURCE_EXISTS: &str = "ErrResourceExists";

/// Event reason used once an ownership conflict outlasts the fast retries
pub const ERR_RESOURCE_CONFLICT_PERSISTS: &str = "ErrResourceConflictPersists";

/// Event message used when an InferenceJob is synced
pub const MESSAGE_RESOURCE_SYNCED: &str = "InferenceJob synced successfully";

/// Replica count the API server defaults a Deployment to when unset
const DEFAULT_DEPLOYMENT_REPLICAS: i32 = 1;

/// Reconciles InferenceJob resources.
pub struct Reconciler {
    listers: Listers,
    client: Box<dyn WorkloadClient>,
    events: Box<dyn EventSink>,
    scheme: Arc<Scheme>,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("listers", &self.listers)
            .field("scheme", &self.scheme)
            .finish_non_exhaustive()
    }
}

impl Reconciler {
    /// Creates a new reconciler instance.
    pub fn new(
        listers: Listers,
        client: Box<dyn WorkloadClient>,
        events: Box<dyn EventSink>,
        scheme: Arc<Scheme>,
    ) -> Self {
        Self {
            listers,
            client,
            events,
            scheme,
        }
    }

    /// Syncs the InferenceJob identified by `key` (`namespace/name`).
    ///
    /// Returns `Ok` when the job is converged or when retrying could not help
    /// (malformed key, job deleted, missing deployment name); those cases are
    /// logged and picked up again on the job's next change. Errors are meant
    /// to be retried with backoff.
    pub async fn sync(&self, key: &str) -> Result<(), ControllerError> {
        let (namespace, name) = match split_key(key) {
            Ok(parts) => parts,
            Err(e) => {
                error!("{}", e);
                return Ok(());
            }
        };

        let Some(job) = self.listers.inference_job(namespace, name) else {
            info!("InferenceJob '{}' in work queue no longer exists", key);
            return Ok(());
        };

        let deployment_name = job.spec.deployment_name.as_str();
        if deployment_name.is_empty() {
            // Requeueing cannot fix this; the next update to the job enqueues it again
            error!("{}: deployment name must be specified", key);
            return Ok(());
        }

        let deployment = match self.listers.deployment(namespace, deployment_name) {
            None => {
                info!("Creating Deployment {}/{} for InferenceJob {}", namespace, deployment_name, name);
                let desired = self.new_deployment(&job)?;
                Arc::new(self.client.create_deployment(namespace, &desired).await?)
            }
            Some(existing) => {
                if !self.scheme.is_controlled_by(&existing.metadata, &job) {
                    let err = ControllerError::ResourceExists(deployment_name.to_string());
                    self.events
                        .record(&job, Severity::Warning, ERR_RESOURCE_EXISTS, &err.to_string())
                        .await;
                    return Err(err);
                }

                match needs_scale(&job, &existing) {
                    Some(replicas) => {
                        debug!(
                            "InferenceJob {} replicas: {}, deployment replicas: {}",
                            name,
                            replicas,
                            deployment_replicas(&existing)
                        );
                        let desired = self.new_deployment(&job)?;
                        Arc::new(self.client.update_deployment(namespace, &desired).await?)
                    }
                    None => existing,
                }
            }
        };

        self.update_inference_job_status(&job, &deployment).await?;

        self.events
            .record(&job, Severity::Normal, SUCCESS_SYNCED, MESSAGE_RESOURCE_SYNCED)
            .await;
        Ok(())
    }

    /// Reports that the job behind `key` keeps conflicting with a Deployment
    /// it does not control and is now only retried every `retry_every`.
    pub async fn report_persistent_conflict(
        &self,
        key: &str,
        err: &ControllerError,
        attempts: u32,
        retry_every: Duration,
    ) {
        let Ok((namespace, name)) = split_key(key) else {
            return;
        };
        let Some(job) = self.listers.inference_job(namespace, name) else {
            return;
        };
        let message = format!("{err} after {attempts} attempts; retrying every {retry_every:?}");
        self.events
            .record(&job, Severity::Warning, ERR_RESOURCE_CONFLICT_PERSISTS, &message)
            .await;
    }

    /// Mirrors the Deployment's available replicas into the job status.
    ///
    /// The cached job is shared with every other reader, so the change is made
    /// on a copy. Nothing is written when the status already matches.
    async fn update_inference_job_status(
        &self,
        job: &InferenceJob,
        deployment: &Deployment,
    ) -> Result<(), ControllerError> {
        let status = InferenceJobStatus {
            available_replicas: available_replicas(deployment),
        };
        if job.status.as_ref() == Some(&status) {
            return Ok(());
        }

        let mut job_copy = job.clone();
        job_copy.status = Some(status);
        self.client.update_inference_job_status(&job_copy).await?;
        Ok(())
    }

    /// Builds the Deployment an InferenceJob asks for, owned by that job.
    pub fn new_deployment(&self, job: &InferenceJob) -> Result<Deployment, ControllerError> {
        let image = job.spec.image_to_deploy.clone();
        let labels = BTreeMap::from([
            ("app".to_string(), image.clone()),
            ("controller".to_string(), job.name_any()),
        ]);

        Ok(Deployment {
            metadata: ObjectMeta {
                name: Some(job.spec.deployment_name.clone()),
                namespace: job.namespace(),
                owner_references: Some(vec![self.scheme.controller_ref(job)?]),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                replicas: job.spec.replicas,
                selector: LabelSelector {
                    match_labels: Some(labels.clone()),
                    ..Default::default()
                },
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(labels),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        containers: vec![Container {
                            name: container_name(&image).to_string(),
                            image: Some(image),
                            ..Default::default()
                        }],
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        })
    }
}

/// Container name derived from an image reference: the part before the first `:`.
fn container_name(image: &str) -> &str {
    image.split(':').next().unwrap_or(image)
}

fn deployment_replicas(deployment: &Deployment) -> i32 {
    deployment
        .spec
        .as_ref()
        .and_then(|spec| spec.replicas)
        .unwrap_or(DEFAULT_DEPLOYMENT_REPLICAS)
}

fn available_replicas(deployment: &Deployment) -> i32 {
    deployment
        .status
        .as_ref()
        .and_then(|status| status.available_replicas)
        .unwrap_or(0)
}

/// Replica count to scale to, if the job manages replicas and the Deployment drifted.
fn needs_scale(job: &InferenceJob, deployment: &Deployment) -> Option<i32> {
    job.spec
        .replicas
        .filter(|replicas| *replicas != deployment_replicas(deployment))
}
