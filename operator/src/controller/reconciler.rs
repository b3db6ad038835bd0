use std::{any::Any, panic::AssertUnwindSafe, sync::Arc, time::Duration};

use futures::FutureExt;
use kube::{
    api::PostParams,
    runtime::{controller::Action, reflector::ObjectRef},
    Api, ResourceExt,
};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::{cleanup, namespace::ensure_namespace};
use crate::{
    backends::{self, Backend},
    loadtest::{LoadTest, LoadTestPhase, LoadTestStatus},
    metrics::ReconcileResult,
    utils::{delete_if_present, is_conflict, is_not_found, Context},
};

/// Errors produced by the reconcile function.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Backend error: {source}")]
    Backend {
        #[from]
        source: backends::Error,
    },
    #[error("Kube error: {source}")]
    Kube {
        #[from]
        source: kube::Error,
    },
    #[error("App error: {source}")]
    App {
        #[from]
        source: anyhow::Error,
    },
    /// Reconcile did not complete in time.
    #[error("reconcile timed out after {0:?}")]
    Timeout(Duration),
    /// Reconcile panicked.
    #[error("reconcile panicked: {0}")]
    Panic(String),
}

/// How a reconcile ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Resources and status are up to date.
    Synced,
    /// The load test was past retention and has been deleted.
    Deleted,
    /// Nothing was done, a newer version of the load test will be delivered.
    Dropped(&'static str),
}

/// URL the load generator uploads its report to.
pub fn report_url(proxy_url: Option<&str>, name: &str) -> Option<String> {
    proxy_url
        .filter(|url| !url.is_empty())
        .map(|url| format!("{}/load-test/{name}/report", url.trim_end_matches('/')))
}

/// Perform a reconcile pass for one load test.
pub async fn reconcile_load_test(load_test: &LoadTest, cx: &Context) -> Result<Outcome, Error> {
    let name = load_test.name_any();

    if cleanup::expired(load_test, cx.clock.now(), cx.settings.cleanup_threshold) {
        info!(load_test = %name, phase = %load_test.status_or_default().phase, "deleting load test past retention");
        let load_tests: Api<LoadTest> = Api::all(cx.k_client.clone());
        delete_if_present(&load_tests, &name).await?;
        return Ok(Outcome::Deleted);
    }

    let backend = cx.registry.get(load_test.spec.load_test_type)?;
    let mut status = load_test.status_or_default();

    if status.namespace.is_empty() {
        let assigned = ensure_namespace(
            cx.k_client.clone(),
            load_test,
            &cx.settings.namespace_annotations,
        )
        .await?;
        if assigned.created {
            cx.reporter.load_test_created(load_test.spec.load_test_type);
        }
        status.namespace = assigned.name;
        status.phase = LoadTestPhase::Creating;
        // Resources are created once the cached load test carries the namespace.
        return write_status(cx, load_test, status).await;
    }

    let synced = sync(backend.as_ref(), cx, load_test, &mut status).await;
    // Progress made before a failure is persisted too.
    let written = write_status(cx, load_test, status).await;
    synced?;
    written
}

async fn sync(
    backend: &dyn Backend,
    cx: &Context,
    load_test: &LoadTest,
    status: &mut LoadTestStatus,
) -> Result<(), Error> {
    if !status.phase.is_terminal() {
        let url = report_url(cx.settings.proxy_url.as_deref(), &load_test.name_any());
        backend.sync(load_test, url.as_deref()).await?;
    }
    backend.sync_status(load_test, status).await?;
    Ok(())
}

async fn write_status(
    cx: &Context,
    load_test: &LoadTest,
    status: LoadTestStatus,
) -> Result<Outcome, Error> {
    let previous = load_test.status_or_default().phase;
    if load_test.status.as_ref() == Some(&status) {
        return Ok(Outcome::Synced);
    }
    let name = load_test.name_any();
    let phase = status.phase;
    let mut updated = load_test.clone();
    updated.status = Some(status);
    let data = serde_json::to_vec(&updated).map_err(anyhow::Error::from)?;

    let load_tests: Api<LoadTest> = Api::all(cx.k_client.clone());
    match load_tests
        .replace_status(&name, &PostParams::default(), data)
        .await
    {
        Ok(_) => {
            if phase != previous {
                info!(load_test = %name, from = %previous, to = %phase, "phase changed");
                if phase.is_terminal() && !previous.is_terminal() {
                    cx.reporter
                        .load_test_finished(load_test.spec.load_test_type, phase);
                }
            }
            Ok(Outcome::Synced)
        }
        Err(err) if is_conflict(&err) => {
            debug!(load_test = %name, "status update conflict");
            Ok(Outcome::Dropped("conflict"))
        }
        Err(err) if is_not_found(&err) => {
            debug!(load_test = %name, "load test deleted before status update");
            Ok(Outcome::Dropped("not found"))
        }
        Err(err) => Err(err.into()),
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_owned()
    }
}

/// Reconcile a load test on behalf of the controller.
///
/// A panic or a reconcile running past the sync timeout is returned as an error and retried
/// like any other failure.
pub async fn reconcile(load_test: Arc<LoadTest>, cx: Arc<Context>) -> Result<Action, Error> {
    let key = ObjectRef::from_obj(load_test.as_ref());
    let start = Instant::now();
    let timeout = cx.settings.sync_timeout;
    let result = AssertUnwindSafe(tokio::time::timeout(
        timeout,
        reconcile_load_test(&load_test, &cx),
    ))
    .catch_unwind()
    .await;
    let result = match result {
        Ok(Ok(result)) => result,
        Ok(Err(_)) => Err(Error::Timeout(timeout)),
        Err(panic) => Err(Error::Panic(panic_message(panic))),
    };

    let (reported, result) = match result {
        Ok(Outcome::Dropped(reason)) => {
            debug!(load_test = %key.name, reason, "reconcile dropped");
            (ReconcileResult::Dropped, Ok(Action::await_change()))
        }
        Ok(Outcome::Deleted) => (ReconcileResult::Ok, Ok(Action::await_change())),
        Ok(Outcome::Synced) => {
            debug!(load_test = %key.name, "reconcile success");
            (
                ReconcileResult::Ok,
                Ok(Action::requeue(cx.settings.resync_period)),
            )
        }
        Err(err) => (ReconcileResult::Err, Err(err)),
    };
    if result.is_ok() {
        cx.backoff.reset(&key);
    }
    cx.reporter.reconciled(reported, start.elapsed());
    cx.reporter.retries_pending(cx.backoff.pending());
    result
}

/// Retry a failed reconcile after a delay growing with each consecutive failure.
pub fn error_policy(load_test: Arc<LoadTest>, err: &Error, cx: Arc<Context>) -> Action {
    let key = ObjectRef::from_obj(load_test.as_ref());
    let failures = cx.backoff.failures(&key);
    let delay = cx.backoff.next_delay(&key);
    if matches!(err, Error::Panic(_)) {
        error!(load_test = %key.name, failures, ?delay, %err, "reconcile panicked");
    } else {
        warn!(load_test = %key.name, failures, ?delay, %err, "reconcile error");
    }
    cx.reporter.retries_pending(cx.backoff.pending());
    Action::requeue(delay)
}
