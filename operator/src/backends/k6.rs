//! K6 backend, shards the test across N jobs using execution segments.
use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::{
    api::{
        batch::v1::Job,
        core::v1::{
            Affinity, ConfigMap, Container, PodAffinityTerm, PodAntiAffinity, Secret,
            WeightedPodAffinityTerm,
        },
    },
    apimachinery::pkg::apis::meta::v1::LabelSelector,
};
use kube::{api::ListParams, Api, ResourceExt};
use tracing::info;

use super::{
    configured_image, default_image,
    phase::{job_status, phase_from_jobs, pods_from_jobs, representative_job},
    prepare_status, require_distributed_pods, require_test_file,
    resources::{self, TEST_DATA_CONFIG_MAP, TEST_DATA_VOLUME, TEST_FILE_CONFIG_MAP, TEST_FILE_VOLUME},
    Backend, BackendContext, BackendOverrides, Error,
};
use crate::{
    labels::selector_labels,
    loadtest::{ImageDetails, LoadTest, LoadTestSpec, LoadTestStatus, LoadTestType},
    utils::create_if_absent,
};

const JOB_NAME: &str = "loadtest-job";
const JOB_LABEL_SELECTOR: &str = "name=loadtest-job";
const WORKER_APP: &str = "loadtest-worker-pod";
const DEFAULT_IMAGE: (&str, &str) = ("loadimpact/k6", "latest");
const SCRIPT_FILE: &str = "test.js";
const TEST_DATA_FILE: &str = "testdata";

/// Name of the job running shard `index`.
pub fn job_name(index: i32) -> String {
    format!("{JOB_NAME}-{index}")
}

fn fraction(numerator: i32, total: i32) -> String {
    match numerator {
        0 => "0".to_owned(),
        n if n == total => "1".to_owned(),
        n => format!("{n}/{total}"),
    }
}

/// Arguments selecting the execution segment run by shard `index` of `total`.
pub fn segment_args(index: i32, total: i32) -> Vec<String> {
    vec![
        "--execution-segment".to_owned(),
        format!("{}:{}", fraction(index, total), fraction(index + 1, total)),
    ]
}

/// Arguments describing every execution segment of a test split in `total` shards.
pub fn sequence_args(total: i32) -> Vec<String> {
    let sequence: Vec<_> = (0..=total).map(|i| fraction(i, total)).collect();
    vec![
        "--execution-segment-sequence".to_owned(),
        sequence.join(","),
    ]
}

/// Backend running k6.
pub struct K6 {
    cx: BackendContext,
    image: ImageDetails,
    overrides: BackendOverrides,
}

impl K6 {
    /// Create a k6 backend.
    pub fn new(cx: BackendContext) -> Self {
        let overrides = cx.overrides(LoadTestType::K6);
        Self {
            image: configured_image(&overrides.master_image, DEFAULT_IMAGE),
            overrides,
            cx,
        }
    }

    fn args(load_test: &LoadTest, index: i32) -> Vec<String> {
        let mut args = vec!["run".to_owned(), format!("/data/{SCRIPT_FILE}")];
        if let Some(duration) = load_test.spec.duration.filter(|d| !d.is_zero()) {
            args.push("--duration".to_owned());
            args.push(humantime::format_duration(duration).to_string().replace(' ', ""));
        }
        let total = load_test.distributed_pods();
        if total > 1 {
            args.extend(segment_args(index, total));
            args.extend(sequence_args(total));
        }
        args
    }

    fn job(&self, load_test: &LoadTest, report_url: Option<&str>, index: i32) -> Job {
        let image = if load_test.spec.master_config.is_empty() {
            self.image.to_string()
        } else {
            load_test.spec.master_config.to_string()
        };

        let (mut volumes, mut mounts) = (Vec::new(), Vec::new());
        let (volume, mount) =
            resources::file_volume_and_mount(TEST_FILE_VOLUME, TEST_FILE_CONFIG_MAP, SCRIPT_FILE);
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

        let mut labels = selector_labels(WORKER_APP);
        labels.insert("name".to_owned(), JOB_NAME.to_owned());

        let mut job = resources::job(
            &self.cx,
            load_test,
            &job_name(index),
            labels,
            1,
            Container {
                name: "k6".to_owned(),
                image: Some(image),
                args: Some(Self::args(load_test, index)),
                env: Some(resources::report_env(report_url)),
                env_from: resources::env_from(load_test),
                resources: self.overrides.master_resources.requirements(),
                volume_mounts: Some(mounts),
                ..Default::default()
            },
            volumes,
        );
        if let Some(pod) = job
            .spec
            .as_mut()
            .and_then(|spec| spec.template.spec.as_mut())
        {
            pod.affinity = Some(spread_workers());
        }
        job
    }
}

// Prefer one shard per node.
fn spread_workers() -> Affinity {
    Affinity {
        pod_anti_affinity: Some(PodAntiAffinity {
            preferred_during_scheduling_ignored_during_execution: Some(vec![
                WeightedPodAffinityTerm {
                    weight: 1,
                    pod_affinity_term: PodAffinityTerm {
                        label_selector: Some(LabelSelector {
                            match_labels: Some(BTreeMap::from([(
                                "app".to_owned(),
                                WORKER_APP.to_owned(),
                            )])),
                            ..Default::default()
                        }),
                        topology_key: "kubernetes.io/hostname".to_owned(),
                        ..Default::default()
                    },
                },
            ]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[async_trait]
impl Backend for K6 {
    fn load_test_type(&self) -> LoadTestType {
        LoadTestType::K6
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
        let total = load_test.distributed_pods();
        let existing = jobs
            .list(&ListParams::default().labels(JOB_LABEL_SELECTOR))
            .await?;
        if existing.items.len() >= total as usize {
            return Ok(());
        }

        let config_maps: Api<ConfigMap> = Api::namespaced(self.cx.k_client.clone(), ns);
        let script = load_test.spec.test_file.as_ref().map(|f| f.0.as_slice());
        let script = resources::file_config_map(
            load_test,
            TEST_FILE_CONFIG_MAP,
            SCRIPT_FILE,
            script.unwrap_or_default(),
        )?;
        create_if_absent(&config_maps, &script).await?;
        if let Some(test_data) = &load_test.spec.test_data {
            let data = resources::file_config_map(
                load_test,
                TEST_DATA_CONFIG_MAP,
                TEST_DATA_FILE,
                &test_data.0,
            )?;
            create_if_absent(&config_maps, &data).await?;
        }
        if let Some(secret) = resources::env_secret(load_test) {
            let secrets: Api<Secret> = Api::namespaced(self.cx.k_client.clone(), ns);
            create_if_absent(&secrets, &secret).await?;
        }

        for index in 0..total {
            create_if_absent(&jobs, &self.job(load_test, report_url, index)).await?;
        }
        info!(
            load_test = %load_test.name_any(),
            namespace = ns,
            jobs = total,
            "created k6 resources"
        );
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
        let jobs = jobs
            .list(&ListParams::default().labels(JOB_LABEL_SELECTOR))
            .await?
            .items;

        status.phase = phase_from_jobs(&jobs);
        status.pods = pods_from_jobs(&jobs, load_test.distributed_pods());
        if let Some(job) = representative_job(&jobs) {
            status.job_status = job_status(job);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use expect_test::expect;
    use k8s_openapi::{api::batch::v1::JobStatus, ByteString};

    use crate::{
        loadtest::LoadTestPhase,
        utils::test::{load_test, FakeApiServer},
    };

    fn k6_load_test(pods: i32) -> LoadTest {
        let mut lt = load_test("loadtest-eager-lynx", LoadTestType::K6);
        lt.spec.distributed_pods = Some(pods);
        lt.spec.test_file = Some(ByteString(b"export default function() {}".to_vec()));
        lt.spec.env_vars = BTreeMap::from([("TOKEN".to_owned(), "secret".to_owned())]);
        lt
    }

    #[test]
    fn segments_cover_the_whole_test() {
        expect![[r#"
            [
                "--execution-segment",
                "0:1/3",
            ]
        "#]]
        .assert_debug_eq(&segment_args(0, 3));
        expect![[r#"
            [
                "--execution-segment",
                "1/3:2/3",
            ]
        "#]]
        .assert_debug_eq(&segment_args(1, 3));
        expect![[r#"
            [
                "--execution-segment",
                "2/3:1",
            ]
        "#]]
        .assert_debug_eq(&segment_args(2, 3));
        expect![[r#"
            [
                "--execution-segment-sequence",
                "0,1/3,2/3,1",
            ]
        "#]]
        .assert_debug_eq(&sequence_args(3));
    }

    #[test]
    fn single_shard_has_no_segments() {
        let mut lt = k6_load_test(1);
        lt.spec.duration = Some(Duration::from_secs(90));
        expect![[r#"
            [
                "run",
                "/data/test.js",
                "--duration",
                "1m30s",
            ]
        "#]]
        .assert_debug_eq(&K6::args(&lt, 0));
    }

    #[tokio::test]
    async fn sync_creates_one_job_per_shard() {
        let (client, server) = FakeApiServer::start();
        server.add_namespace("loadtest-eager-lynx");
        let backend = K6::new(BackendContext::new(client));
        let lt = k6_load_test(3);

        backend.sync(&lt, None).await.unwrap();
        backend.sync(&lt, None).await.unwrap();

        assert_eq!(server.count("jobs", Some("loadtest-eager-lynx")), 3);
        assert_eq!(server.created("jobs"), 3);
        assert_eq!(server.created("secrets"), 1);
        let job: Job = server
            .get("jobs", Some("loadtest-eager-lynx"), "loadtest-job-2")
            .unwrap();
        let pod = job.spec.unwrap().template.spec.unwrap();
        assert!(pod.affinity.is_some());
        let args = pod.containers[0].args.clone().unwrap();
        assert!(args.contains(&"2/3:1".to_owned()));
    }

    #[tokio::test]
    async fn status_combines_shards() {
        let (client, server) = FakeApiServer::start();
        server.add_namespace("loadtest-eager-lynx");
        let backend = K6::new(BackendContext::new(client));
        let lt = k6_load_test(2);
        backend.sync(&lt, None).await.unwrap();

        let finished = JobStatus {
            succeeded: Some(1),
            ..Default::default()
        };
        let running = JobStatus {
            active: Some(1),
            ..Default::default()
        };
        server.set_job_status("loadtest-eager-lynx", "loadtest-job-0", finished.clone());
        server.set_job_status("loadtest-eager-lynx", "loadtest-job-1", running.clone());
        let mut status = lt.status_or_default();
        backend.sync_status(&lt, &mut status).await.unwrap();
        assert_eq!(status.phase, LoadTestPhase::Running);
        assert_eq!(status.job_status, running);
        assert_eq!(status.pods.current, 1);
        assert_eq!(status.pods.desired, 2);

        server.set_job_status("loadtest-eager-lynx", "loadtest-job-1", finished);
        backend.sync_status(&lt, &mut status).await.unwrap();
        assert_eq!(status.phase, LoadTestPhase::Finished);
    }
}
