use std::{collections::BTreeMap, fmt, str::FromStr, time::Duration};

use k8s_openapi::{api::batch::v1::JobStatus, ByteString};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Primary CRD describing a single load test run.
#[derive(CustomResource, Serialize, Deserialize, Debug, Default, PartialEq, Clone, JsonSchema)]
#[kube(
    group = "kangal.hellofresh.com",
    version = "v1",
    kind = "LoadTest",
    plural = "loadtests",
    status = "LoadTestStatus",
    derive = "PartialEq",
    printcolumn = r#"{"name":"Type","type":"string","jsonPath":".spec.type"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct LoadTestSpec {
    /// Load generation tool used to run the test.
    #[serde(rename = "type")]
    pub load_test_type: LoadTestType,
    /// Replace an existing load test with the same test file.
    #[serde(default)]
    pub overwrite: bool,
    /// Image of the master, or of the single job for single job backends.
    #[serde(default)]
    pub master_config: ImageDetails,
    /// Image of the workers.
    #[serde(default)]
    pub worker_config: ImageDetails,
    /// Number of pods generating load.
    pub distributed_pods: Option<i32>,
    /// Free form tags, exposed as labels on the resource.
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    /// Test script for the selected tool.
    #[schemars(with = "Option<String>")]
    pub test_file: Option<ByteString>,
    /// Data consumed by the test script.
    #[schemars(with = "Option<String>")]
    pub test_data: Option<ByteString>,
    /// Environment passed to the load generators.
    #[serde(default)]
    pub env_vars: BTreeMap<String, String>,
    /// Target of the load test.
    #[serde(rename = "targetURL", default)]
    pub target_url: String,
    /// How long the load should be generated for.
    #[serde(default, with = "humantime_serde")]
    #[schemars(with = "Option<String>")]
    pub duration: Option<Duration>,
}

/// Status of a load test.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LoadTestStatus {
    /// Coarse lifecycle phase.
    #[serde(default)]
    pub phase: LoadTestPhase,
    /// Namespace holding every resource of the test.
    #[serde(default)]
    pub namespace: String,
    /// Snapshot of the job that best describes the progress of the test.
    #[serde(default)]
    pub job_status: JobStatus,
    /// Worker pod counts.
    #[serde(default)]
    pub pods: LoadTestPodsStatus,
}

/// Worker pod counts.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Eq, Clone, JsonSchema)]
pub struct LoadTestPodsStatus {
    /// Pods currently running.
    pub current: i32,
    /// Pods requested by the spec.
    pub desired: i32,
}

/// Image reference split into image name and tag.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Eq, Clone, JsonSchema)]
pub struct ImageDetails {
    /// Image name.
    #[serde(default)]
    pub image: String,
    /// Image tag.
    #[serde(default)]
    pub tag: String,
}

impl ImageDetails {
    /// Construct image details from an image name and tag.
    pub fn new(image: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            tag: tag.into(),
        }
    }

    /// True when either the image or the tag is missing.
    pub fn is_empty(&self) -> bool {
        self.image.is_empty() || self.tag.is_empty()
    }
}

impl fmt::Display for ImageDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.image, self.tag)
    }
}

/// Supported load generation tools.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Eq, Hash, Clone, Copy, JsonSchema)]
pub enum LoadTestType {
    /// Apache JMeter
    JMeter,
    /// Does nothing but sleep, used to exercise the controller.
    #[default]
    Fake,
    /// Locust
    Locust,
    /// ghz gRPC benchmarking
    Ghz,
    /// Grafana k6
    K6,
}

impl LoadTestType {
    /// Every supported type.
    pub const ALL: [LoadTestType; 5] = [
        LoadTestType::JMeter,
        LoadTestType::Fake,
        LoadTestType::Locust,
        LoadTestType::Ghz,
        LoadTestType::K6,
    ];

    fn as_str(&self) -> &'static str {
        match self {
            LoadTestType::JMeter => "JMeter",
            LoadTestType::Fake => "Fake",
            LoadTestType::Locust => "Locust",
            LoadTestType::Ghz => "Ghz",
            LoadTestType::K6 => "K6",
        }
    }
}

impl fmt::Display for LoadTestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LoadTestType {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownVariant(s.to_owned()))
    }
}

/// Coarse lifecycle state of a load test.
#[derive(
    Serialize, Deserialize, Debug, Default, PartialEq, Eq, Hash, Clone, Copy, JsonSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum LoadTestPhase {
    /// Resources are being created.
    #[default]
    Creating,
    /// Resources exist, load generators have not started.
    Starting,
    /// Load is being generated.
    Running,
    /// Every load generator completed.
    Finished,
    /// A load generator failed or never became ready.
    Errored,
}

impl LoadTestPhase {
    const ALL: [LoadTestPhase; 5] = [
        LoadTestPhase::Creating,
        LoadTestPhase::Starting,
        LoadTestPhase::Running,
        LoadTestPhase::Finished,
        LoadTestPhase::Errored,
    ];

    fn as_str(&self) -> &'static str {
        match self {
            LoadTestPhase::Creating => "creating",
            LoadTestPhase::Starting => "starting",
            LoadTestPhase::Running => "running",
            LoadTestPhase::Finished => "finished",
            LoadTestPhase::Errored => "errored",
        }
    }

    /// True for phases no load generator will leave on its own.
    pub fn is_terminal(&self) -> bool {
        matches!(self, LoadTestPhase::Finished | LoadTestPhase::Errored)
    }
}

impl fmt::Display for LoadTestPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LoadTestPhase {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownVariant(s.to_owned()))
    }
}

/// Returned when parsing an unknown type or phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownVariant(pub String);

impl fmt::Display for UnknownVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown value {:?}", self.0)
    }
}

impl std::error::Error for UnknownVariant {}

impl LoadTest {
    /// Status of the load test or a default status if none has been recorded.
    pub fn status_or_default(&self) -> LoadTestStatus {
        self.status.clone().unwrap_or_default()
    }

    /// Number of distributed pods, at least one.
    pub fn distributed_pods(&self) -> i32 {
        self.spec.distributed_pods.unwrap_or(1).max(1)
    }

    /// Namespace assigned to the load test, if any.
    pub fn assigned_namespace(&self) -> Option<&str> {
        self.status
            .as_ref()
            .map(|status| status.namespace.as_str())
            .filter(|ns| !ns.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_parses_case_insensitively() {
        assert_eq!("Running".parse(), Ok(LoadTestPhase::Running));
        assert_eq!("ERRORED".parse(), Ok(LoadTestPhase::Errored));
        assert!("done".parse::<LoadTestPhase>().is_err());
    }

    #[test]
    fn phase_serializes_lowercase() {
        assert_eq!(
            serde_json::to_value(LoadTestPhase::Finished).unwrap(),
            serde_json::json!("finished")
        );
    }

    #[test]
    fn type_parses_case_insensitively() {
        assert_eq!("jmeter".parse(), Ok(LoadTestType::JMeter));
        assert_eq!("k6".parse(), Ok(LoadTestType::K6));
        assert!("gatling".parse::<LoadTestType>().is_err());
    }

    #[test]
    fn spec_deserializes_from_resource_json() {
        let spec: LoadTestSpec = serde_json::from_value(serde_json::json!({
            "type": "K6",
            "distributedPods": 3,
            "targetURL": "http://example.com",
            "duration": "1m 30s",
            "testFile": "aGVsbG8=",
        }))
        .unwrap();
        assert_eq!(spec.load_test_type, LoadTestType::K6);
        assert_eq!(spec.distributed_pods, Some(3));
        assert_eq!(spec.target_url, "http://example.com");
        assert_eq!(spec.duration, Some(Duration::from_secs(90)));
        assert_eq!(spec.test_file, Some(ByteString(b"hello".to_vec())));
    }

    #[test]
    fn crd_describes_files_as_base64_strings() {
        use kube::CustomResourceExt;

        let crd = serde_json::to_value(LoadTest::crd()).unwrap();
        let spec = &crd["spec"]["versions"][0]["schema"]["openAPIV3Schema"]["properties"]["spec"]
            ["properties"];
        assert_eq!(spec["testFile"]["type"], "string");
        assert_eq!(spec["testData"]["type"], "string");
        assert_eq!(spec["duration"]["type"], "string");
    }
}
