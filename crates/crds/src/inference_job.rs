//! InferenceJob CRD
//!
//! Declares a workload (image + replica count) that the controller realises
//! as an `apps/v1` Deployment owned by the InferenceJob.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// API group of the InferenceJob CRD
pub const GROUP: &str = "samplecontroller.k8s.io";

/// API version of the InferenceJob CRD
pub const VERSION: &str = "v1alpha1";

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[kube(
    group = "samplecontroller.k8s.io",
    version = "v1alpha1",
    kind = "InferenceJob",
    namespaced,
    status = "InferenceJobStatus",
    printcolumn = r#"{"name":"Deployment","type":"string","jsonPath":".spec.deploymentName"}"#,
    printcolumn = r#"{"name":"Available","type":"integer","jsonPath":".status.availableReplicas"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct InferenceJobSpec {
    /// Name of the Deployment managed for this job
    #[serde(default)]
    pub deployment_name: String,

    /// Desired replica count (unset leaves the Deployment's own default)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    /// Container image to deploy, e.g. `nginx:latest`
    #[serde(default)]
    pub image_to_deploy: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct InferenceJobStatus {
    /// Available replicas last observed on the managed Deployment
    #[serde(default)]
    pub available_replicas: i32,
}
