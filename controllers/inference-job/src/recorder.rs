//! Operator-visible diagnostics as Kubernetes Events.
//!
//! Recording is fire-and-forget: a failure to publish is logged and never
//! turns a sync into a failure.

use crds::InferenceJob;
use kube::{Client, Resource, ResourceExt};
use kube_runtime::events::{Event, EventType, Recorder, Reporter};
use tracing::{info, warn};

/// Event severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Routine progress
    Normal,
    /// Something the operator should look at
    Warning,
}

impl From<Severity> for EventType {
    fn from(severity: Severity) -> Self {
        match severity {
            Severity::Normal => EventType::Normal,
            Severity::Warning => EventType::Warning,
        }
    }
}

/// Sink for diagnostic events about an InferenceJob.
#[async_trait::async_trait]
pub trait EventSink: Send + Sync {
    /// Records an event against `job`.
    async fn record(&self, job: &InferenceJob, severity: Severity, reason: &str, message: &str);
}

/// `EventSink` publishing through the events.k8s.io API.
pub struct KubeEventSink {
    recorder: Recorder,
}

impl std::fmt::Debug for KubeEventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeEventSink").finish_non_exhaustive()
    }
}

impl KubeEventSink {
    /// Creates a sink reporting as `controller_name` from this pod.
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait::async_trait]
impl EventSink for KubeEventSink {
    async fn record(&self, job: &InferenceJob, severity: Severity, reason: &str, message: &str) {
        info!(
            "Event({}/{}): type: {:?} reason: {} {}",
            job.namespace().unwrap_or_default(),
            job.name_any(),
            severity,
            reason,
            message
        );

        let event = Event {
            type_: severity.into(),
            reason: reason.to_string(),
            note: Some(message.to_string()),
            action: "Reconcile".to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, &job.object_ref(&())).await {
            warn!("Failed to record event {} for InferenceJob {}: {}", reason, job.name_any(), e);
        }
    }
}
