//! Builders for the Kubernetes resources shared by several backends.
use std::collections::BTreeMap;

use k8s_openapi::{
    api::{
        batch::v1::{Job, JobSpec},
        core::v1::{
            ConfigMap, ConfigMapVolumeSource, Container, EnvFromSource, EnvVar, PodSpec,
            PodTemplateSpec, ResourceRequirements, Secret, SecretEnvSource, Volume, VolumeMount,
        },
    },
    apimachinery::pkg::{api::resource::Quantity, apis::meta::v1::OwnerReference},
    ByteString,
};
use kube::{api::ObjectMeta, Resource, ResourceExt};

use super::{BackendContext, Error};
use crate::{labels::managed_labels_extend, loadtest::LoadTest};

/// Name of the config map holding the test file.
pub const TEST_FILE_CONFIG_MAP: &str = "loadtest-testfile";
/// Name of the config map holding the test data.
pub const TEST_DATA_CONFIG_MAP: &str = "loadtest-testdata";
/// Name of the volume mounting the test file.
pub const TEST_FILE_VOLUME: &str = "loadtest-testfile-volume";
/// Name of the volume mounting the test data.
pub const TEST_DATA_VOLUME: &str = "loadtest-testdata-volume";

/// CPU and memory limits and requests, empty values are left unset.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Resources {
    /// CPU limit
    pub cpu_limits: String,
    /// CPU request
    pub cpu_requests: String,
    /// Memory limit
    pub memory_limits: String,
    /// Memory request
    pub memory_requests: String,
}

impl Resources {
    /// Resource requirements of a container.
    pub fn requirements(&self) -> Option<ResourceRequirements> {
        fn quantities(cpu: &str, memory: &str) -> Option<BTreeMap<String, Quantity>> {
            let map: BTreeMap<_, _> = [("cpu", cpu), ("memory", memory)]
                .into_iter()
                .filter(|(_, value)| !value.trim().is_empty())
                .map(|(name, value)| (name.to_owned(), Quantity(value.trim().to_owned())))
                .collect();
            (!map.is_empty()).then_some(map)
        }
        let limits = quantities(&self.cpu_limits, &self.memory_limits);
        let requests = quantities(&self.cpu_requests, &self.memory_requests);
        if limits.is_none() && requests.is_none() {
            return None;
        }
        Some(ResourceRequirements {
            limits,
            requests,
            ..Default::default()
        })
    }
}

/// Owner references linking a resource to its load test.
pub fn owner_refs(load_test: &LoadTest) -> Option<Vec<OwnerReference>> {
    load_test.controller_owner_ref(&()).map(|oref| vec![oref])
}

/// Metadata of a resource owned by a load test.
pub fn owned_meta(
    load_test: &LoadTest,
    name: &str,
    labels: BTreeMap<String, String>,
) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_owned()),
        namespace: load_test.assigned_namespace().map(str::to_owned),
        labels: managed_labels_extend(Some(labels)),
        owner_references: owner_refs(load_test),
        ..Default::default()
    }
}

/// Config map holding a single file, stored as binary data so any content survives unchanged.
pub fn file_config_map(
    load_test: &LoadTest,
    name: &str,
    filename: &str,
    content: &[u8],
) -> Result<ConfigMap, Error> {
    if content.iter().all(u8::is_ascii_whitespace) {
        return Err(Error::InvalidSpec(format!(
            "invalid file {filename} for configmap {name}, empty content"
        )));
    }
    Ok(ConfigMap {
        metadata: owned_meta(load_test, name, BTreeMap::new()),
        binary_data: Some(BTreeMap::from([(
            filename.to_owned(),
            ByteString(content.to_vec()),
        )])),
        ..Default::default()
    })
}

/// Volume exposing a config map file and its mount at `/data/<filename>`.
pub fn file_volume_and_mount(name: &str, config_map: &str, filename: &str) -> (Volume, VolumeMount) {
    let volume = Volume {
        name: name.to_owned(),
        config_map: Some(ConfigMapVolumeSource {
            name: Some(config_map.to_owned()),
            ..Default::default()
        }),
        ..Default::default()
    };
    let mount = VolumeMount {
        name: name.to_owned(),
        mount_path: format!("/data/{filename}"),
        sub_path: Some(filename.to_owned()),
        ..Default::default()
    };
    (volume, mount)
}

/// Name of the secret holding the environment of a load test.
pub fn env_secret_name(load_test: &LoadTest) -> String {
    format!("{}-envvar", load_test.name_any())
}

/// Secret holding the environment of a load test, None if there is no environment.
pub fn env_secret(load_test: &LoadTest) -> Option<Secret> {
    if load_test.spec.env_vars.is_empty() {
        return None;
    }
    Some(Secret {
        metadata: owned_meta(load_test, &env_secret_name(load_test), BTreeMap::new()),
        string_data: Some(load_test.spec.env_vars.clone()),
        ..Default::default()
    })
}

/// Environment sourced from the secret of a load test.
pub fn env_from(load_test: &LoadTest) -> Option<Vec<EnvFromSource>> {
    (!load_test.spec.env_vars.is_empty()).then(|| {
        vec![EnvFromSource {
            secret_ref: Some(SecretEnvSource {
                name: Some(env_secret_name(load_test)),
                ..Default::default()
            }),
            ..Default::default()
        }]
    })
}

/// Environment variable with a literal value.
pub fn env_var(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_owned(),
        value: Some(value.into()),
        ..Default::default()
    }
}

/// Environment passing the report upload URL to the load generator.
pub fn report_env(report_url: Option<&str>) -> Vec<EnvVar> {
    report_url
        .filter(|url| !url.is_empty())
        .map(|url| env_var("REPORT_PRESIGNED_URL", url))
        .into_iter()
        .collect()
}

/// Pod template carrying the configured annotations, node selector and tolerations.
pub fn pod_template(
    cx: &BackendContext,
    labels: BTreeMap<String, String>,
    spec: PodSpec,
) -> PodTemplateSpec {
    PodTemplateSpec {
        metadata: Some(ObjectMeta {
            labels: managed_labels_extend(Some(labels)),
            annotations: (!cx.pod_annotations.is_empty()).then(|| cx.pod_annotations.clone()),
            ..Default::default()
        }),
        spec: Some(pod_spec(cx, spec)),
    }
}

/// Pod spec with the configured node selector and tolerations and no restarts.
pub fn pod_spec(cx: &BackendContext, spec: PodSpec) -> PodSpec {
    PodSpec {
        restart_policy: Some("Never".to_owned()),
        node_selector: (!cx.node_selector.is_empty()).then(|| cx.node_selector.clone()),
        tolerations: (!cx.tolerations.is_empty()).then(|| cx.tolerations.clone()),
        ..spec
    }
}

/// Job running a single container to completion without retries.
pub fn job(
    cx: &BackendContext,
    load_test: &LoadTest,
    name: &str,
    labels: BTreeMap<String, String>,
    parallelism: i32,
    container: Container,
    volumes: Vec<Volume>,
) -> Job {
    Job {
        metadata: owned_meta(load_test, name, labels.clone()),
        spec: Some(JobSpec {
            parallelism: Some(parallelism),
            completions: Some(parallelism),
            backoff_limit: Some(0),
            template: pod_template(
                cx,
                labels,
                PodSpec {
                    containers: vec![container],
                    volumes: (!volumes.is_empty()).then_some(volumes),
                    ..Default::default()
                },
            ),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::test::{load_test, offline_client};
    use k8s_openapi::api::core::v1::Toleration;

    #[test]
    fn empty_resources_are_skipped() {
        assert_eq!(Resources::default().requirements(), None);
        let requirements = Resources {
            cpu_limits: "2".to_owned(),
            memory_requests: "512Mi".to_owned(),
            ..Default::default()
        }
        .requirements()
        .unwrap();
        assert_eq!(
            requirements.limits,
            Some(BTreeMap::from([("cpu".to_owned(), Quantity("2".to_owned()))]))
        );
        assert_eq!(
            requirements.requests,
            Some(BTreeMap::from([(
                "memory".to_owned(),
                Quantity("512Mi".to_owned())
            )]))
        );
    }

    #[test]
    fn config_map_requires_content() {
        let lt = load_test("loadtest-calm-otter", crate::loadtest::LoadTestType::K6);
        assert!(file_config_map(&lt, TEST_FILE_CONFIG_MAP, "test.js", b"  \n").is_err());
        let cm = file_config_map(&lt, TEST_FILE_CONFIG_MAP, "test.js", b"export default 1").unwrap();
        assert_eq!(cm.metadata.namespace.as_deref(), Some("loadtest-calm-otter"));
        assert_eq!(
            cm.metadata.owner_references.unwrap()[0].name,
            "loadtest-calm-otter"
        );
        assert_eq!(cm.data, None);
    }

    #[test]
    fn config_map_keeps_binary_content() {
        let lt = load_test("loadtest-calm-otter", crate::loadtest::LoadTestType::Ghz);
        let protoset = [0x0a, 0xc2, 0x01, 0x0a, 0xff, 0xfe, 0x80, 0x12];
        let cm = file_config_map(&lt, TEST_DATA_CONFIG_MAP, "testdata.protoset", &protoset).unwrap();

        let stored: ConfigMap = serde_json::from_value(serde_json::to_value(&cm).unwrap()).unwrap();
        assert_eq!(
            stored.binary_data.unwrap()["testdata.protoset"],
            ByteString(protoset.to_vec())
        );
    }

    #[test]
    fn report_url_is_optional() {
        assert!(report_env(None).is_empty());
        assert!(report_env(Some("")).is_empty());
        assert_eq!(
            report_env(Some("http://proxy/load-test/x/report"))[0].name,
            "REPORT_PRESIGNED_URL"
        );
    }

    #[tokio::test]
    async fn pod_template_carries_scheduling_settings() {
        let mut cx = BackendContext::new(offline_client());
        cx.pod_annotations = BTreeMap::from([("sidecar".to_owned(), "false".to_owned())]);
        cx.node_selector = BTreeMap::from([("pool".to_owned(), "loadtest".to_owned())]);
        cx.tolerations = vec![Toleration {
            key: Some("dedicated".to_owned()),
            ..Default::default()
        }];
        let template = pod_template(&cx, BTreeMap::new(), PodSpec::default());
        let meta = template.metadata.unwrap();
        assert_eq!(meta.annotations, Some(cx.pod_annotations.clone()));
        let spec = template.spec.unwrap();
        assert_eq!(spec.restart_policy.as_deref(), Some("Never"));
        assert_eq!(spec.node_selector, Some(cx.node_selector.clone()));
        assert_eq!(spec.tolerations.map(|t| t.len()), Some(1));
    }
}
