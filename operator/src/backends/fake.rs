//! Fake backend, runs a job that sleeps. Used to exercise the controller without load.
use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::{batch::v1::Job, core::v1::Container};
use kube::{Api, ResourceExt};
use tracing::info;

use super::{
    phase::{job_status, phase_from_job},
    prepare_status, require_distributed_pods, resources, Backend, BackendContext, Error,
};
use crate::{
    loadtest::{LoadTest, LoadTestPhase, LoadTestPodsStatus, LoadTestSpec, LoadTestStatus, LoadTestType},
    utils::create_if_absent,
};

/// Name of the job created by the fake backend.
pub const FAKE_JOB_NAME: &str = "loadtest-master";
const IMAGE: &str = "alpine:3.12.0";

/// Backend running a job that does nothing but sleep.
pub struct Fake {
    cx: BackendContext,
}

impl Fake {
    /// Create a fake backend.
    pub fn new(cx: BackendContext) -> Self {
        Self { cx }
    }

    fn job(&self, load_test: &LoadTest, report_url: Option<&str>) -> Job {
        let labels = BTreeMap::from([("name".to_owned(), FAKE_JOB_NAME.to_owned())]);
        resources::job(
            &self.cx,
            load_test,
            FAKE_JOB_NAME,
            labels,
            1,
            Container {
                name: "fake".to_owned(),
                image: Some(IMAGE.to_owned()),
                command: Some(vec!["sleep".to_owned(), "10".to_owned()]),
                env: Some(resources::report_env(report_url)),
                ..Default::default()
            },
            vec![],
        )
    }
}

#[async_trait]
impl Backend for Fake {
    fn load_test_type(&self) -> LoadTestType {
        LoadTestType::Fake
    }

    fn transform_spec(&self, spec: &mut LoadTestSpec) -> Result<(), Error> {
        require_distributed_pods(spec)?;
        Ok(())
    }

    async fn sync(&self, load_test: &LoadTest, report_url: Option<&str>) -> Result<(), Error> {
        let Some(ns) = load_test.assigned_namespace() else {
            return Ok(());
        };
        let jobs: Api<Job> = Api::namespaced(self.cx.k_client.clone(), ns);
        if jobs.get_opt(FAKE_JOB_NAME).await?.is_some() {
            return Ok(());
        }
        if create_if_absent(&jobs, &self.job(load_test, report_url)).await? {
            info!(load_test = %load_test.name_any(), namespace = ns, "created fake job");
        }
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
        let Some(job) = jobs.get_opt(FAKE_JOB_NAME).await? else {
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
