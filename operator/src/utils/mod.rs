//! Utils is shared functions and constants for the controller

use std::{collections::BTreeMap, fmt::Debug, sync::Arc, time::Duration};

use k8s_openapi::chrono::{DateTime, Utc};
use kube::{
    api::{DeleteParams, PostParams},
    Api, Client, Resource,
};
use serde::{de::DeserializeOwned, Serialize};
use tracing::debug;

use crate::{backends::Registry, controller::RetryBackoff, metrics::Reporter};

/// Operator Context
pub struct Context {
    /// Kube client
    pub k_client: Client,
    /// Clock that provide the current time
    pub clock: Arc<dyn Clock>,
    /// Backends by load test type
    pub registry: Arc<Registry>,
    /// Sink for controller metrics
    pub reporter: Arc<dyn Reporter>,
    /// Failures of load tests waiting for a retry
    pub backoff: RetryBackoff,
    /// Reconcile settings
    pub settings: Settings,
}

/// Settings of the reconcile loop.
#[derive(Clone, Debug)]
pub struct Settings {
    /// Age after which finished load tests are deleted, zero disables cleanup.
    pub cleanup_threshold: Duration,
    /// Base URL of the proxy serving reports.
    pub proxy_url: Option<String>,
    /// Upper bound of a single reconcile.
    pub sync_timeout: Duration,
    /// Interval at which a reconciled load test is reconciled again.
    pub resync_period: Duration,
    /// Annotations added to every load test namespace.
    pub namespace_annotations: BTreeMap<String, String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            cleanup_threshold: Duration::from_secs(60 * 60),
            proxy_url: None,
            sync_timeout: Duration::from_secs(60),
            resync_period: Duration::from_secs(30),
            namespace_annotations: Default::default(),
        }
    }
}

/// Provides the current time.
pub trait Clock: Send + Sync {
    /// Report the current time.
    fn now(&self) -> DateTime<Utc>;
}

/// Provides the current time using real time.
pub struct UtcClock;
impl Clock for UtcClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Create a resource unless a resource with the same name already exists.
///
/// Returns true if the resource was created by this call.
pub async fn create_if_absent<K>(api: &Api<K>, resource: &K) -> Result<bool, kube::Error>
where
    K: Resource + Clone + DeserializeOwned + Serialize + Debug,
{
    match api.create(&PostParams::default(), resource).await {
        Ok(_) => Ok(true),
        Err(err) if is_already_exists(&err) => {
            debug!(name = ?resource.meta().name, "resource already exists");
            Ok(false)
        }
        Err(err) => Err(err),
    }
}

/// Delete a resource, a missing resource is not an error.
pub async fn delete_if_present<K>(api: &Api<K>, name: &str) -> Result<(), kube::Error>
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    match api.delete(name, &DeleteParams::background()).await {
        Ok(_) => Ok(()),
        Err(err) if is_not_found(&err) => Ok(()),
        Err(err) => Err(err),
    }
}

/// Reports whether the API server rejected a request because the object does not exist.
pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(err) if err.reason == "NotFound" || err.code == 404)
}

/// Reports whether the API server rejected a request because the object already exists.
pub fn is_already_exists(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(err) if err.reason == "AlreadyExists")
}

/// Reports whether the API server rejected an update made against a stale version.
pub fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(err) if err.reason == "Conflict")
}
