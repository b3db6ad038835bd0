//! JMeter backend, a master job driving a fixed set of worker pods.
//!
//! CSV test data is stored gzipped. Each worker receives its own share of the records in a
//! config map, unpacked into `/testdata` by an init container before JMeter starts.
use std::{
    collections::BTreeMap,
    io::{Read, Write},
};

use anyhow::Context as _;
use async_trait::async_trait;
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use k8s_openapi::{
    api::{
        batch::v1::Job,
        core::v1::{
            ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, EmptyDirVolumeSource,
            Pod, PodSpec, Secret, Service, ServicePort, ServiceSpec, Volume, VolumeMount,
        },
    },
    apimachinery::pkg::util::intstr::IntOrString,
};
use kube::{api::ListParams, Api, ResourceExt};
use tracing::{info, warn};

use super::{
    configured_image, default_image,
    phase::{job_status, phase_from_job},
    prepare_status, require_distributed_pods, require_test_file,
    resources::{self, env_var, TEST_DATA_CONFIG_MAP, TEST_FILE_CONFIG_MAP},
    Backend, BackendContext, BackendOverrides, Error,
};
use crate::{
    labels::{app_label_selector, selector_labels},
    loadtest::{
        ImageDetails, LoadTest, LoadTestPhase, LoadTestPodsStatus, LoadTestSpec, LoadTestStatus,
        LoadTestType,
    },
    utils::create_if_absent,
};

const MASTER_JOB_NAME: &str = "loadtest-master";
const WORKER_NAME: &str = "loadtest-worker";
const WORKER_APP: &str = "loadtest-worker-pod";
const WORKER_SERVICE_NAME: &str = "loadtest-workers";
const DEFAULT_MASTER_IMAGE: (&str, &str) = ("hellofresh/kangal-jmeter-master", "latest");
const DEFAULT_WORKER_IMAGE: (&str, &str) = ("hellofresh/kangal-jmeter-worker", "latest");
const TEST_FILE: &str = "test.jmx";
const TEST_DATA_FILE: &str = "testdata.csv";
const TEST_DATA_ARCHIVE: &str = "testdata.csv.gz";
const TEST_DATA_DIR: &str = "/testdata";
const TEST_DATA_ARCHIVE_DIR: &str = "/testdatatmp";
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const SERVER_PORT: i32 = 1099;
const RMI_PORT: i32 = 50000;

// Reasons a worker container may wait for while still on its way to running.
const STARTING_REASONS: [&str; 3] = ["Pending", "ContainerCreating", "PodInitializing"];

/// Gzip CSV test data, data that is already gzipped is returned unchanged.
pub fn compress_test_data(data: &[u8]) -> Result<Vec<u8>, Error> {
    if data.starts_with(&GZIP_MAGIC) {
        return Ok(data.to_vec());
    }
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(data)
        .context("failed to compress test data")?;
    Ok(encoder.finish().context("failed to compress test data")?)
}

fn uncompressed(data: &[u8]) -> Box<dyn Read + Send + '_> {
    if data.starts_with(&GZIP_MAGIC) {
        Box::new(GzDecoder::new(data))
    } else {
        Box::new(data)
    }
}

/// Split CSV test data into `chunks` gzipped parts of whole records, one per worker.
///
/// Record counts of the parts differ by at most one, a part without records is empty.
pub fn split_test_data(data: &[u8], chunks: usize) -> Result<Vec<Vec<u8>>, Error> {
    let chunks = chunks.max(1);
    let records = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(uncompressed(data))
        .into_byte_records()
        .collect::<Result<Vec<_>, _>>()
        .context("failed to parse csv test data")?;

    let (size, extra) = (records.len() / chunks, records.len() % chunks);
    let mut records = records.into_iter();
    (0..chunks)
        .map(|index| -> Result<Vec<u8>, Error> {
            let take = size + usize::from(index < extra);
            if take == 0 {
                return Ok(Vec::new());
            }
            let mut writer = csv::WriterBuilder::new()
                .flexible(true)
                .from_writer(GzEncoder::new(Vec::new(), Compression::default()));
            for record in records.by_ref().take(take) {
                writer
                    .write_byte_record(&record)
                    .context("failed to write csv test data")?;
            }
            let encoder = writer
                .into_inner()
                .map_err(|err| err.into_error())
                .context("failed to write csv test data")?;
            Ok(encoder.finish().context("failed to compress test data")?)
        })
        .collect()
}

fn worker_pod_name(index: usize) -> String {
    format!("{WORKER_NAME}-{index:03}")
}

fn test_data_config_map_name(index: usize) -> String {
    format!("{TEST_DATA_CONFIG_MAP}-{index:03}")
}

/// Backend running JMeter in distributed mode.
pub struct JMeter {
    cx: BackendContext,
    master_image: ImageDetails,
    worker_image: ImageDetails,
    overrides: BackendOverrides,
}

impl JMeter {
    /// Create a JMeter backend.
    pub fn new(cx: BackendContext) -> Self {
        let overrides = cx.overrides(LoadTestType::JMeter);
        Self {
            master_image: configured_image(&overrides.master_image, DEFAULT_MASTER_IMAGE),
            worker_image: configured_image(&overrides.worker_image, DEFAULT_WORKER_IMAGE),
            overrides,
            cx,
        }
    }

    fn worker_pod(&self, load_test: &LoadTest, index: usize, test_data: Option<&str>) -> Pod {
        let image = if load_test.spec.worker_config.is_empty() {
            self.worker_image.to_string()
        } else {
            load_test.spec.worker_config.to_string()
        };
        let mount = |name: &str, path: &str| VolumeMount {
            name: name.to_owned(),
            mount_path: path.to_owned(),
            ..Default::default()
        };
        let (volumes, mounts, init_containers) = match test_data {
            Some(config_map) => (
                Some(vec![
                    Volume {
                        name: "testdatatmp".to_owned(),
                        config_map: Some(ConfigMapVolumeSource {
                            name: Some(config_map.to_owned()),
                            ..Default::default()
                        }),
                        ..Default::default()
                    },
                    Volume {
                        name: "testdata".to_owned(),
                        empty_dir: Some(EmptyDirVolumeSource::default()),
                        ..Default::default()
                    },
                ]),
                Some(vec![mount("testdata", TEST_DATA_DIR)]),
                Some(vec![Container {
                    name: "convert-data-back-to-csv".to_owned(),
                    image: Some("alpine:latest".to_owned()),
                    command: Some(vec!["/bin/sh".to_owned()]),
                    args: Some(vec![
                        "-c".to_owned(),
                        format!(
                            "zcat {TEST_DATA_ARCHIVE_DIR}/{TEST_DATA_ARCHIVE} > {TEST_DATA_DIR}/{TEST_DATA_FILE}"
                        ),
                    ]),
                    volume_mounts: Some(vec![
                        mount("testdatatmp", TEST_DATA_ARCHIVE_DIR),
                        mount("testdata", TEST_DATA_DIR),
                    ]),
                    ..Default::default()
                }]),
            ),
            None => (None, None, None),
        };

        let labels = selector_labels(WORKER_APP);
        let mut metadata = resources::owned_meta(load_test, &worker_pod_name(index), labels);
        metadata.annotations =
            (!self.cx.pod_annotations.is_empty()).then(|| self.cx.pod_annotations.clone());
        Pod {
            metadata,
            spec: Some(resources::pod_spec(
                &self.cx,
                PodSpec {
                    containers: vec![Container {
                        name: WORKER_NAME.to_owned(),
                        image: Some(image),
                        image_pull_policy: Some("Always".to_owned()),
                        ports: Some(vec![
                            ContainerPort {
                                container_port: SERVER_PORT,
                                ..Default::default()
                            },
                            ContainerPort {
                                container_port: RMI_PORT,
                                ..Default::default()
                            },
                        ]),
                        env_from: resources::env_from(load_test),
                        resources: self.overrides.worker_resources.requirements(),
                        volume_mounts: mounts,
                        ..Default::default()
                    }],
                    init_containers,
                    volumes,
                    ..Default::default()
                },
            )),
            ..Default::default()
        }
    }

    fn worker_service(&self, load_test: &LoadTest) -> Service {
        let port = |name: &str, port: i32| ServicePort {
            name: Some(name.to_owned()),
            port,
            target_port: Some(IntOrString::Int(port)),
            ..Default::default()
        };
        Service {
            metadata: resources::owned_meta(
                load_test,
                WORKER_SERVICE_NAME,
                selector_labels(WORKER_APP),
            ),
            spec: Some(ServiceSpec {
                cluster_ip: Some("None".to_owned()),
                selector: Some(selector_labels(WORKER_APP)),
                ports: Some(vec![port("server", SERVER_PORT), port("rmi", RMI_PORT)]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn master_job(&self, load_test: &LoadTest, report_url: Option<&str>) -> Job {
        let image = if load_test.spec.master_config.is_empty() {
            self.master_image.to_string()
        } else {
            load_test.spec.master_config.to_string()
        };
        let mut env = vec![
            env_var("WORKER_SVC_NAME", WORKER_SERVICE_NAME),
            env_var("USE_WORKERS", "true"),
        ];
        env.extend(resources::report_env(report_url));

        let (volume, mut mount) =
            resources::file_volume_and_mount("tests", TEST_FILE_CONFIG_MAP, TEST_FILE);
        mount.mount_path = format!("/tests/{TEST_FILE}");
        resources::job(
            &self.cx,
            load_test,
            MASTER_JOB_NAME,
            BTreeMap::from([("name".to_owned(), MASTER_JOB_NAME.to_owned())]),
            1,
            Container {
                name: MASTER_JOB_NAME.to_owned(),
                image: Some(image),
                image_pull_policy: Some("Always".to_owned()),
                env: Some(env),
                env_from: resources::env_from(load_test),
                resources: self.overrides.master_resources.requirements(),
                volume_mounts: Some(vec![mount]),
                ..Default::default()
            },
            vec![volume],
        )
    }

    // Errored when a worker failed to start or did not start in time.
    fn workers_failed(&self, pods: &[Pod], phase: LoadTestPhase) -> bool {
        let now = self.cx.clock.now();
        pods.iter().any(|pod| {
            let Some(status) = &pod.status else {
                return false;
            };
            let crashed = status
                .container_statuses
                .iter()
                .flatten()
                .filter_map(|c| c.state.as_ref()?.waiting.as_ref()?.reason.as_deref())
                .any(|reason| !STARTING_REASONS.contains(&reason));
            if crashed {
                warn!(pod = %pod.name_any(), "worker pod failed to start");
                return true;
            }

            let running = status.phase.as_deref() == Some("Running");
            let started = status
                .start_time
                .as_ref()
                .or(pod.metadata.creation_timestamp.as_ref())
                .map(|t| t.0);
            let timed_out = started
                .and_then(|started| now.signed_duration_since(started).to_std().ok())
                .is_some_and(|waited| waited > self.cx.worker_readiness_timeout);
            if !running
                && timed_out
                && matches!(phase, LoadTestPhase::Creating | LoadTestPhase::Starting)
            {
                warn!(pod = %pod.name_any(), "worker pod did not become ready in time");
                return true;
            }
            false
        })
    }
}

#[async_trait]
impl Backend for JMeter {
    fn load_test_type(&self) -> LoadTestType {
        LoadTestType::JMeter
    }

    fn transform_spec(&self, spec: &mut LoadTestSpec) -> Result<(), Error> {
        require_distributed_pods(spec)?;
        require_test_file(spec)?;
        default_image(&mut spec.master_config, &self.master_image);
        default_image(&mut spec.worker_config, &self.worker_image);
        if let Some(test_data) = spec.test_data.as_mut() {
            test_data.0 = compress_test_data(&test_data.0)?;
        }
        Ok(())
    }

    async fn sync(&self, load_test: &LoadTest, report_url: Option<&str>) -> Result<(), Error> {
        let Some(ns) = load_test.assigned_namespace() else {
            return Ok(());
        };
        let services: Api<Service> = Api::namespaced(self.cx.k_client.clone(), ns);
        if !services.list(&ListParams::default()).await?.items.is_empty() {
            return Ok(());
        }

        let config_maps: Api<ConfigMap> = Api::namespaced(self.cx.k_client.clone(), ns);
        let test_file = load_test.spec.test_file.as_ref().map(|f| f.0.as_slice());
        let config = resources::file_config_map(
            load_test,
            TEST_FILE_CONFIG_MAP,
            TEST_FILE,
            test_file.unwrap_or_default(),
        )?;
        create_if_absent(&config_maps, &config).await?;

        if let Some(secret) = resources::env_secret(load_test) {
            let secrets: Api<Secret> = Api::namespaced(self.cx.k_client.clone(), ns);
            create_if_absent(&secrets, &secret).await?;
        }

        let workers = load_test.distributed_pods() as usize;
        let chunks = match &load_test.spec.test_data {
            Some(data) if !data.0.is_empty() => Some(split_test_data(&data.0, workers)?),
            _ => None,
        };

        let pods: Api<Pod> = Api::namespaced(self.cx.k_client.clone(), ns);
        for index in 0..workers {
            let chunk = chunks
                .as_ref()
                .and_then(|chunks| chunks.get(index))
                .filter(|chunk| !chunk.is_empty());
            let config_map = match chunk {
                Some(chunk) => {
                    let name = test_data_config_map_name(index);
                    let cm =
                        resources::file_config_map(load_test, &name, TEST_DATA_ARCHIVE, chunk)?;
                    create_if_absent(&config_maps, &cm).await?;
                    Some(name)
                }
                None => None,
            };
            create_if_absent(
                &pods,
                &self.worker_pod(load_test, index, config_map.as_deref()),
            )
            .await?;
        }

        create_if_absent(&services, &self.worker_service(load_test)).await?;
        let jobs: Api<Job> = Api::namespaced(self.cx.k_client.clone(), ns);
        create_if_absent(&jobs, &self.master_job(load_test, report_url)).await?;

        info!(
            load_test = %load_test.name_any(),
            namespace = ns,
            workers,
            "created jmeter resources"
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
        let pods: Api<Pod> = Api::namespaced(self.cx.k_client.clone(), &status.namespace);
        let pods = pods
            .list(&ListParams::default().labels(&app_label_selector(WORKER_APP)))
            .await?
            .items;
        let desired = load_test.distributed_pods();
        if pods.len() != desired as usize {
            return Ok(());
        }
        if self.workers_failed(&pods, status.phase) {
            status.phase = LoadTestPhase::Errored;
            return Ok(());
        }

        status.pods = LoadTestPodsStatus {
            current: pods
                .iter()
                .filter(|pod| {
                    pod.status.as_ref().and_then(|s| s.phase.as_deref()) == Some("Running")
                })
                .count() as i32,
            desired,
        };

        let jobs: Api<Job> = Api::namespaced(self.cx.k_client.clone(), &status.namespace);
        let Some(master) = jobs.get_opt(MASTER_JOB_NAME).await? else {
            status.phase = LoadTestPhase::Creating;
            return Ok(());
        };
        let master_status = job_status(&master);
        status.phase = phase_from_job(&master_status);
        status.job_status = master_status;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::Arc, time::Duration};

    use k8s_openapi::{
        api::{
            batch::v1::JobStatus,
            core::v1::{ContainerState, ContainerStateWaiting, ContainerStatus, PodStatus},
        },
        apimachinery::pkg::apis::meta::v1::Time,
        chrono::{TimeZone, Utc},
        ByteString,
    };

    use crate::utils::test::{load_test, offline_client, FakeApiServer, FixedClock};

    const NAME: &str = "loadtest-noble-ibex";

    fn jmeter_load_test() -> LoadTest {
        let mut lt = load_test(NAME, LoadTestType::JMeter);
        lt.spec.distributed_pods = Some(2);
        lt.spec.test_file = Some(ByteString(b"<jmeterTestPlan/>".to_vec()));
        lt.spec.test_data = Some(ByteString(b"a,1\nb,2\nc,3\n".to_vec()));
        lt
    }

    fn backend(client: kube::Client) -> JMeter {
        let mut cx = BackendContext::new(client);
        cx.clock = Arc::new(FixedClock(
            Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap(),
        ));
        cx.worker_readiness_timeout = Duration::from_secs(600);
        JMeter::new(cx)
    }

    fn set_pod_status(server: &FakeApiServer, index: usize, status: PodStatus) {
        server.set_status("pods", Some(NAME), &worker_pod_name(index), status);
    }

    fn running() -> PodStatus {
        PodStatus {
            phase: Some("Running".to_owned()),
            ..Default::default()
        }
    }

    fn records(chunk: &[u8]) -> Vec<Vec<String>> {
        csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(GzDecoder::new(chunk))
            .into_records()
            .map(|record| record.unwrap().iter().map(str::to_owned).collect())
            .collect()
    }

    #[test]
    fn records_are_spread_evenly() {
        let data = compress_test_data(b"a\nb\nc\nd\ne\n").unwrap();
        let chunks = split_test_data(&data, 4).unwrap();
        let chunks: Vec<_> = chunks.iter().map(|chunk| records(chunk)).collect();
        assert_eq!(
            chunks,
            vec![
                vec![vec!["a"], vec!["b"]],
                vec![vec!["c"]],
                vec![vec!["d"]],
                vec![vec!["e"]],
            ]
        );
    }

    #[test]
    fn fewer_records_than_workers_leaves_empty_parts() {
        let chunks = split_test_data(b"a,1\n", 3).unwrap();
        assert_eq!(records(&chunks[0]), vec![vec!["a", "1"]]);
        assert!(chunks[1].is_empty());
        assert!(chunks[2].is_empty());
    }

    #[test]
    fn quoted_multiline_record_stays_whole() {
        let data = compress_test_data(b"id,comment\n1,\"first line\nsecond line\"\n2,plain\n").unwrap();
        let chunks = split_test_data(&data, 2).unwrap();
        assert_eq!(
            records(&chunks[0]),
            vec![vec!["id", "comment"], vec!["1", "first line\nsecond line"]]
        );
        assert_eq!(records(&chunks[1]), vec![vec!["2", "plain"]]);
    }

    #[tokio::test]
    async fn transform_compresses_test_data_once() {
        let backend = backend(offline_client());
        let mut spec = jmeter_load_test().spec;
        backend.transform_spec(&mut spec).unwrap();
        let compressed = spec.test_data.clone().unwrap().0;
        assert!(compressed.starts_with(&GZIP_MAGIC));

        let mut csv = String::new();
        GzDecoder::new(compressed.as_slice())
            .read_to_string(&mut csv)
            .unwrap();
        assert_eq!(csv, "a,1\nb,2\nc,3\n");

        backend.transform_spec(&mut spec).unwrap();
        assert_eq!(spec.test_data.unwrap().0, compressed);
    }

    #[tokio::test]
    async fn sync_creates_workers_once() {
        let (client, server) = FakeApiServer::start();
        server.add_namespace(NAME);
        let backend = backend(client);
        let lt = jmeter_load_test();

        backend.sync(&lt, None).await.unwrap();
        backend.sync(&lt, None).await.unwrap();

        assert_eq!(server.created("pods"), 2);
        assert_eq!(server.created("services"), 1);
        assert_eq!(server.created("jobs"), 1);
        // test file and one test data chunk per worker
        assert_eq!(server.count("configmaps", Some(NAME)), 3);
        let pod: Pod = server.get("pods", Some(NAME), "loadtest-worker-001").unwrap();
        assert_eq!(
            pod.metadata.labels.unwrap().get("app").map(String::as_str),
            Some(WORKER_APP)
        );
        let spec = pod.spec.unwrap();
        let init = &spec.init_containers.unwrap()[0];
        assert!(init.args.as_ref().unwrap()[1].contains("testdata.csv.gz"));

        let chunk: ConfigMap = server
            .get("configmaps", Some(NAME), &test_data_config_map_name(1))
            .unwrap();
        let archive = &chunk.binary_data.unwrap()[TEST_DATA_ARCHIVE];
        assert_eq!(records(&archive.0), vec![vec!["c", "3"]]);
    }

    #[tokio::test]
    async fn phase_follows_master_once_workers_run() {
        let (client, server) = FakeApiServer::start();
        server.add_namespace(NAME);
        let backend = backend(client);
        let lt = jmeter_load_test();
        backend.sync(&lt, None).await.unwrap();
        set_pod_status(&server, 0, running());
        set_pod_status(&server, 1, running());
        server.set_job_status(
            NAME,
            MASTER_JOB_NAME,
            JobStatus {
                active: Some(1),
                ..Default::default()
            },
        );

        let mut status = lt.status_or_default();
        backend.sync_status(&lt, &mut status).await.unwrap();
        assert_eq!(status.phase, LoadTestPhase::Running);
        assert_eq!(status.pods.current, 2);
    }

    #[tokio::test]
    async fn crashing_worker_is_errored() {
        let (client, server) = FakeApiServer::start();
        server.add_namespace(NAME);
        let backend = backend(client);
        let lt = jmeter_load_test();
        backend.sync(&lt, None).await.unwrap();
        set_pod_status(&server, 0, running());
        set_pod_status(
            &server,
            1,
            PodStatus {
                phase: Some("Pending".to_owned()),
                container_statuses: Some(vec![ContainerStatus {
                    name: WORKER_NAME.to_owned(),
                    state: Some(ContainerState {
                        waiting: Some(ContainerStateWaiting {
                            reason: Some("ImagePullBackOff".to_owned()),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }),
                    ..Default::default()
                }]),
                ..Default::default()
            },
        );

        let mut status = lt.status_or_default();
        backend.sync_status(&lt, &mut status).await.unwrap();
        assert_eq!(status.phase, LoadTestPhase::Errored);
    }

    #[tokio::test]
    async fn slow_worker_times_out() {
        let (client, server) = FakeApiServer::start();
        server.add_namespace(NAME);
        let backend = backend(client);
        let lt = jmeter_load_test();
        backend.sync(&lt, None).await.unwrap();
        set_pod_status(&server, 0, running());
        let pending = |minutes| PodStatus {
            phase: Some("Pending".to_owned()),
            start_time: Some(Time(
                Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
                    - k8s_openapi::chrono::Duration::minutes(minutes),
            )),
            ..Default::default()
        };

        set_pod_status(&server, 1, pending(5));
        let mut status = lt.status_or_default();
        backend.sync_status(&lt, &mut status).await.unwrap();
        assert_eq!(status.phase, LoadTestPhase::Starting);

        set_pod_status(&server, 1, pending(11));
        backend.sync_status(&lt, &mut status).await.unwrap();
        assert_eq!(status.phase, LoadTestPhase::Errored);
    }

    #[tokio::test]
    async fn waits_for_every_worker() {
        let (client, server) = FakeApiServer::start();
        server.add_namespace(NAME);
        let backend = backend(client);
        let lt = jmeter_load_test();
        let mut status = lt.status_or_default();
        backend.sync_status(&lt, &mut status).await.unwrap();
        assert_eq!(status, lt.status_or_default());
    }
}
