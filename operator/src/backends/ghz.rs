//! Ghz backend, benchmarks a gRPC service from a single job.
use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::{
    batch::v1::Job,
    core::v1::{ConfigMap, Container},
};
use kube::{Api, ResourceExt};
use tracing::{info, warn};

use super::{
    configured_image, default_image,
    phase::{job_status, phase_from_job},
    prepare_status, require_distributed_pods, require_test_file,
    resources::{self, TEST_DATA_CONFIG_MAP, TEST_DATA_VOLUME, TEST_FILE_CONFIG_MAP, TEST_FILE_VOLUME},
    Backend, BackendContext, BackendOverrides, Error,
};
use crate::{
    loadtest::{
        ImageDetails, LoadTest, LoadTestPhase, LoadTestPodsStatus, LoadTestSpec, LoadTestStatus,
        LoadTestType,
    },
    utils::create_if_absent,
};

/// Name of the job created by the ghz backend.
pub const GHZ_JOB_NAME: &str = "loadtest-job";
const DEFAULT_IMAGE: (&str, &str) = ("hellofresh/kangal-ghz", "latest");
const CONFIG_FILE: &str = "config";
const TEST_DATA_FILE: &str = "testdata.protoset";
const ARGS: [&str; 3] = ["--config=/data/config", "--output=/results", "--format=html"];

/// Backend running ghz.
pub struct Ghz {
    cx: BackendContext,
    image: ImageDetails,
    overrides: BackendOverrides,
}

impl Ghz {
    /// Create a ghz backend.
    pub fn new(cx: BackendContext) -> Self {
        let overrides = cx.overrides(LoadTestType::Ghz);
        Self {
            image: configured_image(&overrides.master_image, DEFAULT_IMAGE),
            overrides,
            cx,
        }
    }

    fn job(&self, load_test: &LoadTest, report_url: Option<&str>) -> Job {
        let image = if load_test.spec.master_config.is_empty() {
            warn!(
                load_test = %load_test.name_any(),
                image = %self.image,
                "master config is empty, using default image"
            );
            self.image.to_string()
        } else {
            load_test.spec.master_config.to_string()
        };

        let (mut volumes, mut mounts) = (Vec::new(), Vec::new());
        let (volume, mount) =
            resources::file_volume_and_mount(TEST_FILE_VOLUME, TEST_FILE_CONFIG_MAP, CONFIG_FILE);
        volumes.push(volume);
        mounts.push(mount);
        if load_test.spec.test_data.is_some() {
            let (volume, mount) = resources::file_volume_and_mount(
                TEST_DATA_VOLUME,
                TEST_DATA_CONFIG_MAP,
                TEST_DATA_FILE,
            );
            volumes.push(volume);
            mounts.push(mount);
        }

        let labels = BTreeMap::from([("name".to_owned(), GHZ_JOB_NAME.to_owned())]);
        resources::job(
            &self.cx,
            load_test,
            GHZ_JOB_NAME,
            labels,
            load_test.distributed_pods(),
            Container {
                name: "ghz".to_owned(),
                image: Some(image),
                args: Some(ARGS.iter().map(|arg| arg.to_string()).collect()),
                env: Some(resources::report_env(report_url)),
                resources: self.overrides.master_resources.requirements(),
                volume_mounts: Some(mounts),
                ..Default::default()
            },
            volumes,
        )
    }
}

#[async_trait]
impl Backend for Ghz {
    fn load_test_type(&self) -> LoadTestType {
        LoadTestType::Ghz
    }

    fn transform_spec(&self, spec: &mut LoadTestSpec) -> Result<(), Error> {
        require_distributed_pods(spec)?;
        require_test_file(spec)?;
        default_image(&mut spec.master_config, &self.image);
        Ok(())
    }

    async fn sync(&self, load_test: &LoadTest, report_url: Option<&str>) -> Result<(), Error> {
        let Some(ns) = load_test.assigned_namespace() else {
            return Ok(());
        };
        let jobs: Api<Job> = Api::namespaced(self.cx.k_client.clone(), ns);
        if jobs.get_opt(GHZ_JOB_NAME).await?.is_some() {
            return Ok(());
        }

        let config_maps: Api<ConfigMap> = Api::namespaced(self.cx.k_client.clone(), ns);
        let test_file = load_test.spec.test_file.as_ref().map(|f| f.0.as_slice());
        let config = resources::file_config_map(
            load_test,
            TEST_FILE_CONFIG_MAP,
            CONFIG_FILE,
            test_file.unwrap_or_default(),
        )?;
        create_if_absent(&config_maps, &config).await?;
        if let Some(test_data) = &load_test.spec.test_data {
            let data = resources::file_config_map(
                load_test,
                TEST_DATA_CONFIG_MAP,
                TEST_DATA_FILE,
                &test_data.0,
            )?;
            create_if_absent(&config_maps, &data).await?;
        }

        create_if_absent(&jobs, &self.job(load_test, report_url)).await?;
        info!(load_test = %load_test.name_any(), namespace = ns, "created ghz resources");
        Ok(())
    }

    async fn sync_status(
        &self,
        load_test: &LoadTest,
        status: &mut LoadTestStatus,
    ) -> Result<(), Error> {
        if !prepare_status(&self.cx, status).await? {
            return Ok(());
        }
        let jobs: Api<Job> = Api::namespaced(self.cx.k_client.clone(), &status.namespace);
        let Some(job) = jobs.get_opt(GHZ_JOB_NAME).await? else {
            status.phase = LoadTestPhase::Creating;
            return Ok(());
        };
        let job_status = job_status(&job);
        status.phase = phase_from_job(&job_status);
        status.pods = LoadTestPodsStatus {
            current: job_status.active.unwrap_or_default(),
            desired: load_test.distributed_pods(),
        };
        status.job_status = job_status;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::{api::batch::v1::JobStatus, ByteString};

    use crate::utils::test::{load_test, offline_client, FakeApiServer};

    fn ghz_load_test() -> LoadTest {
        let mut lt = load_test("loadtest-swift-heron", LoadTestType::Ghz);
        lt.spec.test_file = Some(ByteString(br#"{"proto": "greeter.proto"}"#.to_vec()));
        lt.spec.test_data = Some(ByteString(b"protoset".to_vec()));
        lt
    }

    #[tokio::test]
    async fn transform_fills_default_image() {
        let backend = Ghz::new(BackendContext::new(offline_client()));
        let mut spec = ghz_load_test().spec;
        backend.transform_spec(&mut spec).unwrap();
        assert_eq!(spec.master_config.to_string(), "hellofresh/kangal-ghz:latest");

        spec.test_file = None;
        assert!(backend.transform_spec(&mut spec).is_err());
    }

    #[tokio::test]
    async fn sync_creates_config_and_job_once() {
        let (client, server) = FakeApiServer::start();
        server.add_namespace("loadtest-swift-heron");
        let backend = Ghz::new(BackendContext::new(client));
        let lt = ghz_load_test();

        backend.sync(&lt, None).await.unwrap();
        backend.sync(&lt, None).await.unwrap();

        assert_eq!(server.count("configmaps", Some("loadtest-swift-heron")), 2);
        assert_eq!(server.created("jobs"), 1);
        let config: ConfigMap = server
            .get("configmaps", Some("loadtest-swift-heron"), TEST_FILE_CONFIG_MAP)
            .unwrap();
        assert!(config.binary_data.unwrap().contains_key("config"));
        let job: Job = server
            .get("jobs", Some("loadtest-swift-heron"), GHZ_JOB_NAME)
            .unwrap();
        let container = &job.spec.unwrap().template.spec.unwrap().containers[0];
        assert_eq!(container.volume_mounts.as_ref().map(Vec::len), Some(2));
    }

    #[tokio::test]
    async fn failed_job_is_errored() {
        let (client, server) = FakeApiServer::start();
        server.add_namespace("loadtest-swift-heron");
        let backend = Ghz::new(BackendContext::new(client));
        let lt = ghz_load_test();
        backend.sync(&lt, None).await.unwrap();
        server.set_job_status(
            "loadtest-swift-heron",
            GHZ_JOB_NAME,
            JobStatus {
                failed: Some(1),
                ..Default::default()
            },
        );
        let mut status = lt.status_or_default();
        backend.sync_status(&lt, &mut status).await.unwrap();
        assert_eq!(status.phase, LoadTestPhase::Errored);
    }

    #[tokio::test]
    async fn protoset_is_stored_unchanged() {
        let (client, server) = FakeApiServer::start();
        server.add_namespace("loadtest-swift-heron");
        let backend = Ghz::new(BackendContext::new(client));
        let mut lt = ghz_load_test();
        let protoset = vec![0x0a, 0xc2, 0x01, 0x0a, 0xff, 0xfe, 0x80, 0x12];
        lt.spec.test_data = Some(ByteString(protoset.clone()));

        backend.sync(&lt, None).await.unwrap();

        let data: ConfigMap = server
            .get("configmaps", Some("loadtest-swift-heron"), TEST_DATA_CONFIG_MAP)
            .unwrap();
        assert_eq!(
            data.binary_data.unwrap().get(TEST_DATA_FILE),
            Some(&ByteString(protoset))
        );
    }
}
