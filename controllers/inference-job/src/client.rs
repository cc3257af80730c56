//! Write access to the Kubernetes API.
//!
//! The reconciler only reads from the informer caches; every change goes
//! through `WorkloadClient`. The trait exists so unit tests can observe the
//! writes a sync issues without a cluster.

use crate::error::ControllerError;
use crds::{InferenceJob, InferenceJobStatus};
use k8s_openapi::api::apps::v1::Deployment;
use kube::api::{Patch, PatchParams, PostParams};
use kube::{Api, Client, ResourceExt};
use serde_json::json;
use tracing::debug;

/// Write calls issued by the reconciler.
#[async_trait::async_trait]
pub trait WorkloadClient: Send + Sync {
    /// Creates `deployment` in `namespace`.
    async fn create_deployment(
        &self,
        namespace: &str,
        deployment: &Deployment,
    ) -> Result<Deployment, ControllerError>;

    /// Replaces the Deployment named by `deployment` in `namespace`.
    async fn update_deployment(
        &self,
        namespace: &str,
        deployment: &Deployment,
    ) -> Result<Deployment, ControllerError>;

    /// Writes `job.status` through the status subresource. Spec changes on
    /// `job` are never sent.
    async fn update_inference_job_status(
        &self,
        job: &InferenceJob,
    ) -> Result<InferenceJob, ControllerError>;
}

/// `WorkloadClient` backed by the Kubernetes API server.
#[derive(Clone)]
pub struct KubeWorkloadClient {
    client: Client,
}

impl std::fmt::Debug for KubeWorkloadClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeWorkloadClient").finish_non_exhaustive()
    }
}

impl KubeWorkloadClient {
    /// Creates a client using `client` for every call.
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn deployments(&self, namespace: &str) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait::async_trait]
impl WorkloadClient for KubeWorkloadClient {
    async fn create_deployment(
        &self,
        namespace: &str,
        deployment: &Deployment,
    ) -> Result<Deployment, ControllerError> {
        debug!("Creating Deployment {}/{}", namespace, deployment.name_any());
        let created = self
            .deployments(namespace)
            .create(&PostParams::default(), deployment)
            .await?;
        Ok(created)
    }

    async fn update_deployment(
        &self,
        namespace: &str,
        deployment: &Deployment,
    ) -> Result<Deployment, ControllerError> {
        let name = deployment.name_any();
        debug!("Updating Deployment {}/{}", namespace, name);
        let updated = self
            .deployments(namespace)
            .replace(&name, &PostParams::default(), deployment)
            .await?;
        Ok(updated)
    }

    async fn update_inference_job_status(
        &self,
        job: &InferenceJob,
    ) -> Result<InferenceJob, ControllerError> {
        let name = job.name_any();
        let namespace = job
            .namespace()
            .ok_or(ControllerError::MissingObjectKey(".metadata.namespace"))?;
        let status = job.status.clone().unwrap_or_else(InferenceJobStatus::default);

        let status_patch = json!({
            "status": status
        });

        let api: Api<InferenceJob> = Api::namespaced(self.client.clone(), &namespace);
        let updated = api
            .patch_status(&name, &PatchParams::default(), &Patch::Merge(&status_patch))
            .await?;
        Ok(updated)
    }
}
