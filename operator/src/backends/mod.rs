//! Backends create and inspect the resources of a load test for one load generation tool.
pub mod fake;
pub mod ghz;
pub mod jmeter;
pub mod k6;
pub mod locust;
pub mod phase;
mod registry;
pub mod resources;

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Namespace, Toleration};
use kube::{Api, Client};
use tracing::debug;

pub use registry::Registry;

use crate::{
    loadtest::{ImageDetails, LoadTest, LoadTestPhase, LoadTestSpec, LoadTestStatus, LoadTestType},
    utils::{Clock, UtcClock},
};

use self::resources::Resources;

/// Errors produced by backends and the registry.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A backend for the type was registered twice.
    #[error("backend already registered: {0}")]
    AlreadyRegistered(LoadTestType),
    /// No backend handles the type.
    #[error("no backend registered for type {0}")]
    NotRegistered(LoadTestType),
    /// Spec was rejected by the backend.
    #[error("invalid load test spec: {0}")]
    InvalidSpec(String),
    #[error("App error: {source}")]
    App {
        #[from]
        source: anyhow::Error,
    },
    #[error("Kube error: {source}")]
    Kube {
        #[from]
        source: kube::Error,
    },
}

/// Load generation tool able to run a load test.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Type of load test handled by this backend.
    fn load_test_type(&self) -> LoadTestType;

    /// Validate a submitted spec and fill in defaults.
    fn transform_spec(&self, spec: &mut LoadTestSpec) -> Result<(), Error>;

    /// Create the resources of the load test unless they already exist.
    async fn sync(&self, load_test: &LoadTest, report_url: Option<&str>) -> Result<(), Error>;

    /// Recompute the status of the load test from the resources it owns.
    async fn sync_status(
        &self,
        load_test: &LoadTest,
        status: &mut LoadTestStatus,
    ) -> Result<(), Error>;
}

/// Image and resource overrides for one backend.
#[derive(Clone, Debug, Default)]
pub struct BackendOverrides {
    /// Image of the master, or of the single job.
    pub master_image: ImageDetails,
    /// Image of the workers.
    pub worker_image: ImageDetails,
    /// Resources of the master, or of the single job.
    pub master_resources: Resources,
    /// Resources of the workers.
    pub worker_resources: Resources,
}

/// Dependencies shared by every backend, injected once at startup.
#[derive(Clone)]
pub struct BackendContext {
    /// Kube client
    pub k_client: Client,
    /// Clock that provide the current time
    pub clock: Arc<dyn Clock>,
    /// Annotations of every load generator pod.
    pub pod_annotations: BTreeMap<String, String>,
    /// Node selector of every load generator pod.
    pub node_selector: BTreeMap<String, String>,
    /// Tolerations of every load generator pod.
    pub tolerations: Vec<Toleration>,
    /// Per backend image and resource overrides.
    pub overrides: HashMap<LoadTestType, BackendOverrides>,
    /// How long worker pods may take to become ready.
    pub worker_readiness_timeout: Duration,
}

impl BackendContext {
    /// Context with default settings.
    pub fn new(k_client: Client) -> Self {
        Self {
            k_client,
            clock: Arc::new(UtcClock),
            pod_annotations: BTreeMap::new(),
            node_selector: BTreeMap::new(),
            tolerations: Vec::new(),
            overrides: HashMap::new(),
            worker_readiness_timeout: Duration::from_secs(10 * 60),
        }
    }

    /// Overrides of the given backend.
    pub fn overrides(&self, load_test_type: LoadTestType) -> BackendOverrides {
        self.overrides
            .get(&load_test_type)
            .cloned()
            .unwrap_or_default()
    }
}

/// Checks shared by every backend before a phase is recomputed.
///
/// Returns false when the phase is settled and must not be recomputed.
pub(crate) async fn prepare_status(
    cx: &BackendContext,
    status: &mut LoadTestStatus,
) -> Result<bool, Error> {
    if status.namespace.is_empty() {
        return Ok(false);
    }
    let namespaces: Api<Namespace> = Api::all(cx.k_client.clone());
    if namespaces.get_opt(&status.namespace).await?.is_none() {
        debug!(namespace = %status.namespace, "namespace is gone");
        status.phase = LoadTestPhase::Finished;
        return Ok(false);
    }
    Ok(status.phase != LoadTestPhase::Errored)
}

/// Validation shared by every backend.
pub(crate) fn require_distributed_pods(spec: &LoadTestSpec) -> Result<i32, Error> {
    match spec.distributed_pods {
        Some(pods) if pods >= 1 => Ok(pods),
        _ => Err(Error::InvalidSpec(
            "LoadTest must specify 1 or more DistributedPods".to_owned(),
        )),
    }
}

/// Validation shared by every backend running a test script.
pub(crate) fn require_test_file(spec: &LoadTestSpec) -> Result<(), Error> {
    match &spec.test_file {
        Some(file) if !file.0.is_empty() => Ok(()),
        _ => Err(Error::InvalidSpec("LoadTest TestFile is required".to_owned())),
    }
}

/// Fill in an image left empty by the submitter.
pub(crate) fn default_image(image: &mut ImageDetails, default: &ImageDetails) {
    if image.is_empty() {
        *image = default.clone();
    }
}

/// Image configured for the backend, or the built in default.
pub(crate) fn configured_image(configured: &ImageDetails, default: (&str, &str)) -> ImageDetails {
    if configured.is_empty() {
        ImageDetails::new(default.0, default.1)
    } else {
        configured.clone()
    }
}
