//! InferenceJob Controller
//!
//! Reconciles `InferenceJob` CRDs into owned Deployments:
//! - Creates the Deployment named by the job when it is missing
//! - Scales it when its replica count drifts from the job's
//! - Mirrors the Deployment's available replicas into the job status
//!
//! Deployments with the requested name that the job does not control are
//! never touched; the conflict is reported as a Warning event on the job.

mod backoff;
mod cache;
mod client;
mod config;
mod controller;
mod error;
mod owner;
mod reconciler;
mod recorder;
#[cfg(test)]
mod test_utils;
mod watcher;
mod workqueue;

use crate::config::ControllerConfig;
use crate::error::ControllerError;
use controller::Controller;
use kube::Client;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    if rustls::crypto::ring::default_provider().install_default().is_err() {
        warn!("A rustls crypto provider was already installed");
    }

    info!("Starting InferenceJob Controller");

    let config = ControllerConfig::from_env()?;
    info!("Configuration:");
    info!("  Namespace: {}", config.namespace.as_deref().unwrap_or("all namespaces"));
    info!("  Workers: {}", config.workers);
    info!("  Max conflict retries: {}", config.max_conflict_retries);
    info!("  Retry backoff: {:?} to {:?}", config.base_delay, config.max_delay);
    info!("  Overall retry rate: {}/s, burst {}", config.qps, config.burst);

    let client = Client::try_default().await?;
    let controller = Controller::new(client, &config);
    controller.run(config.workers, shutdown_signal()).await?;

    info!("InferenceJob Controller stopped");
    Ok(())
}

/// Resolves on Ctrl-C or, on Unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl-C, shutting down"),
        () = terminate => info!("Received SIGTERM, shutting down"),
    }
}
