//! Locust backend, a master job coordinating a job of workers.
use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::{
    api::{
        batch::v1::Job,
        core::v1::{ConfigMap, Container, Secret, Service, ServicePort, ServiceSpec},
    },
    apimachinery::pkg::util::intstr::IntOrString,
};
use kube::{api::ListParams, Api, ResourceExt};
use tracing::info;

use super::{
    configured_image, default_image,
    phase::{job_status, phase_from_jobs},
    prepare_status, require_distributed_pods, require_test_file,
    resources::{self, env_var},
    Backend, BackendContext, BackendOverrides, Error,
};
use crate::{
    loadtest::{
        ImageDetails, LoadTest, LoadTestPhase, LoadTestPodsStatus, LoadTestSpec, LoadTestStatus,
        LoadTestType,
    },
    utils::create_if_absent,
};

const DEFAULT_IMAGE: (&str, &str) = ("locustio/locust", "latest");
const LOCUST_FILE: &str = "locustfile.py";
const MASTER_PORT: i32 = 5557;

fn config_map_name(load_test: &LoadTest) -> String {
    format!("{}-testfile", load_test.name_any())
}

fn master_name(load_test: &LoadTest) -> String {
    format!("{}-master", load_test.name_any())
}

fn worker_name(load_test: &LoadTest) -> String {
    format!("{}-worker", load_test.name_any())
}

/// Backend running locust in distributed mode.
pub struct Locust {
    cx: BackendContext,
    image: ImageDetails,
    overrides: BackendOverrides,
}

impl Locust {
    /// Create a locust backend.
    pub fn new(cx: BackendContext) -> Self {
        let overrides = cx.overrides(LoadTestType::Locust);
        Self {
            image: configured_image(&overrides.master_image, DEFAULT_IMAGE),
            overrides,
            cx,
        }
    }

    fn image(&self, configured: &ImageDetails) -> String {
        if configured.is_empty() {
            self.image.to_string()
        } else {
            configured.to_string()
        }
    }

    fn container(&self, load_test: &LoadTest, image: &ImageDetails, env: Vec<(&str, String)>) -> Container {
        let (_, mount) =
            resources::file_volume_and_mount("testfile", &config_map_name(load_test), LOCUST_FILE);
        Container {
            name: "locust".to_owned(),
            image: Some(self.image(image)),
            env: Some(env.into_iter().map(|(k, v)| env_var(k, v)).collect()),
            env_from: resources::env_from(load_test),
            volume_mounts: Some(vec![mount]),
            ..Default::default()
        }
    }

    fn master_job(&self, load_test: &LoadTest, report_url: Option<&str>) -> Job {
        let mut env = vec![
            ("LOCUST_HEADLESS", "true".to_owned()),
            ("LOCUST_MODE_MASTER", "true".to_owned()),
            (
                "LOCUST_EXPECT_WORKERS",
                load_test.distributed_pods().to_string(),
            ),
            ("LOCUST_LOCUSTFILE", format!("/data/{LOCUST_FILE}")),
            ("LOCUST_CSV", "/tmp/".to_owned()),
            ("LOCUST_HOST", load_test.spec.target_url.clone()),
        ];
        if let Some(duration) = load_test.spec.duration.filter(|d| !d.is_zero()) {
            env.push((
                "LOCUST_RUN_TIME",
                humantime::format_duration(duration).to_string().replace(' ', ""),
            ));
        }
        let mut container = self.container(load_test, &load_test.spec.master_config, env);
        container
            .env
            .get_or_insert_with(Vec::new)
            .extend(resources::report_env(report_url));
        container.resources = self.overrides.master_resources.requirements();

        let (volume, _) =
            resources::file_volume_and_mount("testfile", &config_map_name(load_test), LOCUST_FILE);
        resources::job(
            &self.cx,
            load_test,
            &master_name(load_test),
            role_labels(load_test, "master"),
            1,
            container,
            vec![volume],
        )
    }

    fn master_service(&self, load_test: &LoadTest) -> Service {
        Service {
            metadata: resources::owned_meta(
                load_test,
                &master_name(load_test),
                role_labels(load_test, "master"),
            ),
            spec: Some(ServiceSpec {
                cluster_ip: Some("None".to_owned()),
                selector: Some(role_labels(load_test, "master")),
                ports: Some(vec![ServicePort {
                    name: Some("server".to_owned()),
                    port: MASTER_PORT,
                    target_port: Some(IntOrString::Int(MASTER_PORT)),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn worker_job(&self, load_test: &LoadTest) -> Job {
        let master_host = format!(
            "{}.{}",
            master_name(load_test),
            load_test.assigned_namespace().unwrap_or_default()
        );
        let env = vec![
            ("LOCUST_MODE_WORKER", "true".to_owned()),
            ("LOCUST_MASTER_NODE_HOST", master_host),
            ("LOCUST_MASTER_NODE_PORT", MASTER_PORT.to_string()),
            ("LOCUST_LOCUSTFILE", format!("/data/{LOCUST_FILE}")),
        ];
        let mut container = self.container(load_test, &load_test.spec.worker_config, env);
        container.resources = self.overrides.worker_resources.requirements();

        let (volume, _) =
            resources::file_volume_and_mount("testfile", &config_map_name(load_test), LOCUST_FILE);
        resources::job(
            &self.cx,
            load_test,
            &worker_name(load_test),
            role_labels(load_test, "worker"),
            load_test.distributed_pods(),
            container,
            vec![volume],
        )
    }
}

fn role_labels(load_test: &LoadTest, role: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app".to_owned(), "locust".to_owned()),
        ("loadtest".to_owned(), load_test.name_any()),
        ("role".to_owned(), role.to_owned()),
    ])
}

#[async_trait]
impl Backend for Locust {
    fn load_test_type(&self) -> LoadTestType {
        LoadTestType::Locust
    }

    fn transform_spec(&self, spec: &mut LoadTestSpec) -> Result<(), Error> {
        require_distributed_pods(spec)?;
        require_test_file(spec)?;
        default_image(&mut spec.master_config, &self.image);
        default_image(&mut spec.worker_config, &self.image);
        Ok(())
    }

    async fn sync(&self, load_test: &LoadTest, report_url: Option<&str>) -> Result<(), Error> {
        let Some(ns) = load_test.assigned_namespace() else {
            return Ok(());
        };
        let jobs: Api<Job> = Api::namespaced(self.cx.k_client.clone(), ns);
        let workers = jobs
            .list(&ListParams::default().fields(&format!("metadata.name={}", worker_name(load_test))))
            .await?;
        if !workers.items.is_empty() {
            return Ok(());
        }

        let config_maps: Api<ConfigMap> = Api::namespaced(self.cx.k_client.clone(), ns);
        let test_file = load_test.spec.test_file.as_ref().map(|f| f.0.as_slice());
        let config = resources::file_config_map(
            load_test,
            &config_map_name(load_test),
            LOCUST_FILE,
            test_file.unwrap_or_default(),
        )?;
        create_if_absent(&config_maps, &config).await?;

        if let Some(secret) = resources::env_secret(load_test) {
            let secrets: Api<Secret> = Api::namespaced(self.cx.k_client.clone(), ns);
            create_if_absent(&secrets, &secret).await?;
        }

        create_if_absent(&jobs, &self.master_job(load_test, report_url)).await?;
        let services: Api<Service> = Api::namespaced(self.cx.k_client.clone(), ns);
        create_if_absent(&services, &self.master_service(load_test)).await?;
        create_if_absent(&jobs, &self.worker_job(load_test)).await?;

        info!(load_test = %load_test.name_any(), namespace = ns, "created locust resources");
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
        let config_maps: Api<ConfigMap> =
            Api::namespaced(self.cx.k_client.clone(), &status.namespace);
        if config_maps
            .get_opt(&config_map_name(load_test))
            .await?
            .is_none()
        {
            status.phase = LoadTestPhase::Finished;
            return Ok(());
        }

        let jobs: Api<Job> = Api::namespaced(self.cx.k_client.clone(), &status.namespace);
        let master = jobs.get_opt(&master_name(load_test)).await?;
        let worker = jobs.get_opt(&worker_name(load_test)).await?;
        let (Some(master), Some(worker)) = (master, worker) else {
            status.phase = LoadTestPhase::Creating;
            return Ok(());
        };

        status.phase = phase_from_jobs([&master, &worker]);
        status.pods = LoadTestPodsStatus {
            current: job_status(&worker).active.unwrap_or_default(),
            desired: load_test.distributed_pods(),
        };
        status.job_status = job_status(&master);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::{api::batch::v1::JobStatus, ByteString};

    use crate::utils::test::{load_test, offline_client, FakeApiServer};

    const NAME: &str = "loadtest-brave-koala";

    fn locust_load_test() -> LoadTest {
        let mut lt = load_test(NAME, LoadTestType::Locust);
        lt.spec.distributed_pods = Some(2);
        lt.spec.target_url = "http://target".to_owned();
        lt.spec.test_file = Some(ByteString(b"from locust import HttpUser".to_vec()));
        lt
    }

    #[tokio::test]
    async fn transform_fills_both_images() {
        let backend = Locust::new(BackendContext::new(offline_client()));
        let mut spec = locust_load_test().spec;
        backend.transform_spec(&mut spec).unwrap();
        assert_eq!(spec.master_config.to_string(), "locustio/locust:latest");
        assert_eq!(spec.worker_config.to_string(), "locustio/locust:latest");
    }

    #[tokio::test]
    async fn sync_creates_master_and_workers_once() {
        let (client, server) = FakeApiServer::start();
        server.add_namespace(NAME);
        let backend = Locust::new(BackendContext::new(client));
        let lt = locust_load_test();

        backend.sync(&lt, Some("http://proxy/report")).await.unwrap();
        backend.sync(&lt, Some("http://proxy/report")).await.unwrap();

        assert_eq!(server.created("jobs"), 2);
        assert_eq!(server.created("services"), 1);
        assert_eq!(server.created("configmaps"), 1);
        let worker: Job = server
            .get("jobs", Some(NAME), &format!("{NAME}-worker"))
            .unwrap();
        let spec = worker.spec.unwrap();
        assert_eq!(spec.parallelism, Some(2));
        let env = spec.template.spec.unwrap().containers[0].env.clone().unwrap();
        assert!(env
            .iter()
            .any(|e| e.name == "LOCUST_MASTER_NODE_HOST"
                && e.value.as_deref() == Some("loadtest-brave-koala-master.loadtest-brave-koala")));
    }

    #[tokio::test]
    async fn finished_master_with_running_workers_is_running() {
        let (client, server) = FakeApiServer::start();
        server.add_namespace(NAME);
        let backend = Locust::new(BackendContext::new(client));
        let lt = locust_load_test();
        backend.sync(&lt, None).await.unwrap();

        server.set_job_status(
            NAME,
            &format!("{NAME}-master"),
            JobStatus {
                active: Some(0),
                succeeded: Some(1),
                ..Default::default()
            },
        );
        server.set_job_status(
            NAME,
            &format!("{NAME}-worker"),
            JobStatus {
                active: Some(2),
                ..Default::default()
            },
        );
        let mut status = lt.status_or_default();
        backend.sync_status(&lt, &mut status).await.unwrap();
        assert_eq!(status.phase, LoadTestPhase::Running);
        assert_eq!(status.job_status.succeeded, Some(1));
        assert_eq!(status.pods.current, 2);
    }

    #[tokio::test]
    async fn missing_test_file_is_finished() {
        let (client, server) = FakeApiServer::start();
        server.add_namespace(NAME);
        let backend = Locust::new(BackendContext::new(client));
        let lt = locust_load_test();
        let mut status = lt.status_or_default();
        backend.sync_status(&lt, &mut status).await.unwrap();
        assert_eq!(status.phase, LoadTestPhase::Finished);
    }
}
