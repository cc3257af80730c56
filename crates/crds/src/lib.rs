//! InferenceJob CRD Definitions
//!
//! Kubernetes Custom Resource Definitions for the InferenceJob controller.

pub mod inference_job;

pub use inference_job::*;
