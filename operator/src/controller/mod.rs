//! Watch load tests and the resources they own, reconciling each load test as it changes.
pub mod backoff;
pub mod cleanup;
pub mod namespace;
pub mod owners;
pub mod reconciler;

use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::{batch::v1::Job, core::v1::Pod};
use kube::{
    runtime::{
        controller::{Config as ControllerConfig, Error as ControllerError},
        predicates, reflector, watcher, Controller, WatchStreamExt,
    },
    Api, Client,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use backoff::RetryBackoff;
pub use owners::{owner_of_job, owner_of_pod, Key};
pub use reconciler::{error_policy, reconcile, reconcile_load_test, Error, Outcome};

use crate::{
    backends::Registry,
    labels::MANAGED_BY_LABEL_SELECTOR,
    loadtest::LoadTest,
    metrics::Reporter,
    utils::{Clock, Context, Settings},
};

/// Dependencies and tuning of the controller.
pub struct Options {
    /// Kube client
    pub k_client: Client,
    /// Clock that provide the current time
    pub clock: Arc<dyn Clock>,
    /// Backends by load test type
    pub registry: Arc<Registry>,
    /// Sink for controller metrics
    pub reporter: Arc<dyn Reporter>,
    /// Reconcile settings
    pub settings: Settings,
    /// Number of concurrent reconciles.
    pub workers: usize,
}

/// Run the controller until the shutdown token is cancelled.
///
/// Reconciles in progress are completed before returning.
pub async fn run(options: Options, shutdown: CancellationToken) -> anyhow::Result<()> {
    let Options {
        k_client,
        clock,
        registry,
        reporter,
        settings,
        workers,
    } = options;

    let managed = watcher::Config::default().labels(MANAGED_BY_LABEL_SELECTOR);
    let (jobs, job_writer) = reflector::store();
    let job_events = reflector(
        job_writer,
        watcher(Api::<Job>::all(k_client.clone()), managed.clone()),
    )
    .default_backoff()
    .touched_objects()
    .predicate_filter(predicates::resource_version);
    let pod_events = watcher(Api::<Pod>::all(k_client.clone()), managed)
        .default_backoff()
        .touched_objects()
        .predicate_filter(predicates::resource_version);

    let concurrency = u16::try_from(workers.max(1)).unwrap_or(u16::MAX);
    info!(workers = concurrency, "starting controller");

    let cx = Arc::new(Context {
        k_client: k_client.clone(),
        clock,
        registry,
        reporter,
        backoff: RetryBackoff::default(),
        settings,
    });
    Controller::new(Api::<LoadTest>::all(k_client), watcher::Config::default())
        .with_config(ControllerConfig::default().concurrency(concurrency))
        // Owner references name the cluster scoped load test, the resources live in its namespace.
        .watches_stream(job_events, |job| owner_of_job(&job))
        .watches_stream(pod_events, move |pod| owner_of_pod(&jobs, &pod))
        .graceful_shutdown_on(shutdown.cancelled_owned())
        .run(reconcile, error_policy, cx)
        .for_each(|res| async move {
            match res {
                Ok((load_test, action)) => debug!(load_test = %load_test.name, ?action, "reconciled"),
                // Logged and retried by the error policy.
                Err(ControllerError::ReconcilerFailed(..)) => {}
                Err(ControllerError::ObjectNotFound(load_test)) => {
                    debug!(load_test = %load_test.name, "load test no longer exists")
                }
                Err(err) => warn!(%err, "controller error"),
            }
        })
        .await;

    info!("controller stopped");
    Ok(())
}
