//! Main controller implementation.
//!
//! This module contains the `Controller` struct that wires the informers,
//! the work queue and the reconciler together and runs the worker pool.
//!
//! Workers never share a key: the queue hands a key to one worker at a time
//! and holds back re-adds until that worker calls `done`.

use crate::backoff::{BucketRateLimiter, ItemExponentialBackoff, RateLimiter};
use crate::cache::Listers;
use crate::client::KubeWorkloadClient;
use crate::config::ControllerConfig;
use crate::error::ControllerError;
use crate::owner::{OwnerResolver, Scheme};
use crate::reconciler::Reconciler;
use crate::recorder::KubeEventSink;
use crate::watcher::{EventHandlers, Informer};
use crate::workqueue::WorkQueue;
use crds::InferenceJob;
use futures::FutureExt;
use k8s_openapi::api::apps::v1::Deployment;
use kube::{Api, Client};
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Name the controller reports events under
pub const CONTROLLER_NAME: &str = "inference-job-controller";

/// Name of the work queue
const QUEUE_NAME: &str = "InferenceJobs";

/// Consecutive ownership conflicts per key, shared by all workers.
///
/// Kept apart from the queue's failure count so transient API errors do not
/// eat into the conflict budget.
#[derive(Debug, Clone, Default)]
struct ConflictCounter {
    counts: Arc<Mutex<HashMap<String, u32>>>,
}

impl ConflictCounter {
    fn counts(&self) -> MutexGuard<'_, HashMap<String, u32>> {
        self.counts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records one more conflict for `key` and returns the streak length.
    fn record(&self, key: &str) -> u32 {
        let mut counts = self.counts();
        let count = counts.entry(key.to_string()).or_insert(0);
        *count = count.saturating_add(1);
        *count
    }

    fn reset(&self, key: &str) {
        self.counts().remove(key);
    }

    #[cfg(test)]
    fn get(&self, key: &str) -> u32 {
        self.counts().get(key).copied().unwrap_or(0)
    }
}

/// Pulls keys off the queue and syncs them one at a time.
#[derive(Debug, Clone)]
struct Worker {
    queue: WorkQueue,
    reconciler: Arc<Reconciler>,
    conflicts: ConflictCounter,
    max_conflict_retries: u32,
}

impl Worker {
    async fn run(self) {
        while self.process_next_work_item().await {}
    }

    /// Processes one key. Returns `false` once the queue has shut down.
    ///
    /// A panicking sync is treated as a retryable failure of that key; the
    /// worker keeps running and the key is always released.
    async fn process_next_work_item(&self) -> bool {
        let Some(key) = self.queue.get().await else {
            return false;
        };

        let result = match AssertUnwindSafe(self.reconciler.sync(&key)).catch_unwind().await {
            Ok(result) => result,
            Err(_) => Err(ControllerError::SyncPanicked(key.clone())),
        };
        self.handle_result(&key, result).await;
        self.queue.done(&key);
        true
    }

    async fn handle_result(&self, key: &str, result: Result<(), ControllerError>) {
        match result {
            Ok(()) => {
                self.conflicts.reset(key);
                self.queue.forget(key);
                info!("Successfully synced '{}'", key);
            }
            Err(e) if e.is_conflict() => self.handle_conflict(key, &e).await,
            Err(e) if e.is_retryable() => {
                self.conflicts.reset(key);
                self.queue.add_rate_limited(key);
                error!("error syncing '{}': {}, requeuing", key, e);
            }
            Err(e) => {
                self.conflicts.reset(key);
                self.queue.forget(key);
                error!("error syncing '{}': {}, dropping", key, e);
            }
        }
    }

    /// Ownership conflicts are retried with backoff up to the cap, then at the
    /// backoff ceiling for as long as they last. Removing the conflicting
    /// Deployment does not enqueue the job, so the slow retry is what picks
    /// the change up.
    async fn handle_conflict(&self, key: &str, e: &ControllerError) {
        let attempts = self.conflicts.record(key);
        if attempts <= self.max_conflict_retries {
            self.queue.add_rate_limited(key);
            error!("error syncing '{}': {}, requeuing", key, e);
            return;
        }

        let retry_every = self.queue.max_delay();
        if attempts == self.max_conflict_retries.saturating_add(1) {
            self.reconciler
                .report_persistent_conflict(key, e, attempts, retry_every)
                .await;
        }
        error!(
            "error syncing '{}': {}, still conflicting after {} attempts, retrying in {:?}",
            key, e, attempts, retry_every
        );
        self.queue.add_after(key, retry_every);
    }
}

/// Main controller for InferenceJob management.
pub struct Controller {
    queue: WorkQueue,
    listers: Listers,
    reconciler: Arc<Reconciler>,
    informers: Vec<JoinHandle<Result<(), ControllerError>>>,
    max_conflict_retries: u32,
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("queue", &self.queue)
            .field("informers", &self.informers.len())
            .finish_non_exhaustive()
    }
}

impl Controller {
    /// Creates a new controller instance and starts its informers.
    pub fn new(client: Client, config: &ControllerConfig) -> Self {
        info!("Initializing InferenceJob Controller");

        let (inference_job_api, deployment_api): (Api<InferenceJob>, Api<Deployment>) =
            match config.namespace.as_deref() {
                Some(ns) => (Api::namespaced(client.clone(), ns), Api::namespaced(client.clone(), ns)),
                None => (Api::all(client.clone()), Api::all(client.clone())),
            };

        let inference_job_informer = Informer::new(inference_job_api, "InferenceJob");
        let deployment_informer = Informer::new(deployment_api, "Deployment");
        let listers = Listers::new(inference_job_informer.store(), deployment_informer.store());

        let scheme = Arc::new(Scheme::register());
        let queue = WorkQueue::new(
            QUEUE_NAME,
            RateLimiter::new(
                ItemExponentialBackoff::new(config.base_delay, config.max_delay),
                BucketRateLimiter::new(config.qps, config.burst),
            ),
        );

        let reconciler = Reconciler::new(
            listers.clone(),
            Box::new(KubeWorkloadClient::new(client.clone())),
            Box::new(KubeEventSink::new(client, CONTROLLER_NAME)),
            Arc::clone(&scheme),
        );

        info!("Setting up event handlers");
        let owners = OwnerResolver::new(scheme, listers.clone(), queue.clone());
        let handlers = EventHandlers::new(queue.clone(), owners);

        let inference_job_handlers = handlers.clone();
        let informers = vec![
            tokio::spawn(inference_job_informer.run(move |n| inference_job_handlers.on_inference_job(n))),
            tokio::spawn(deployment_informer.run(move |n| handlers.on_deployment(n))),
        ];

        Self::from_parts(queue, listers, Arc::new(reconciler), informers, config.max_conflict_retries)
    }

    /// Assembles a controller from already running parts.
    pub(crate) fn from_parts(
        queue: WorkQueue,
        listers: Listers,
        reconciler: Arc<Reconciler>,
        informers: Vec<JoinHandle<Result<(), ControllerError>>>,
        max_conflict_retries: u32,
    ) -> Self {
        Self {
            queue,
            listers,
            reconciler,
            informers,
            max_conflict_retries,
        }
    }

    /// Runs `workers` workers until `shutdown` resolves.
    ///
    /// Workers only start once both caches have synced; failing to sync is
    /// fatal. On shutdown the queue stops accepting work and the call returns
    /// after every worker has finished its current item.
    pub async fn run<S>(self, workers: usize, shutdown: S) -> Result<(), ControllerError>
    where
        S: Future<Output = ()>,
    {
        info!("Starting InferenceJob controller");
        tokio::pin!(shutdown);

        info!("Waiting for informer caches to sync");
        tokio::select! {
            synced = self.listers.wait_for_cache_sync() => {
                if let Err(e) = synced {
                    self.stop_informers();
                    return Err(e);
                }
            }
            () = &mut shutdown => {
                info!("Shutdown requested before caches synced");
                self.queue.shut_down();
                self.stop_informers();
                return Ok(());
            }
        }

        info!("Starting {} workers", workers);
        let conflicts = ConflictCounter::default();
        let handles: Vec<_> = (0..workers)
            .map(|_| {
                let worker = Worker {
                    queue: self.queue.clone(),
                    reconciler: Arc::clone(&self.reconciler),
                    conflicts: conflicts.clone(),
                    max_conflict_retries: self.max_conflict_retries,
                };
                tokio::spawn(worker.run())
            })
            .collect();
        info!("Started workers");

        shutdown.await;
        info!("Shutting down workers");
        self.queue.shut_down();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("Worker task failed: {}", e);
            }
        }
        self.stop_informers();
        info!("Workers stopped");

        Ok(())
    }

    fn stop_informers(&self) {
        for informer in &self.informers {
            informer.abort();
        }
    }
}
