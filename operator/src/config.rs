//! Controller configuration, read from flags or the environment.
use std::{
    collections::{BTreeMap, HashMap},
    time::Duration,
};

use anyhow::{anyhow, bail, Result};
use clap::{Parser, ValueEnum};
use k8s_openapi::api::core::v1::Toleration;
use kube::Client;

use crate::{
    backends::{resources::Resources, BackendContext, BackendOverrides},
    loadtest::{ImageDetails, LoadTestType},
    utils::Settings,
};

/// Format of the controller logs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human readable single lines.
    #[default]
    Compact,
    /// One JSON object per line.
    Json,
}

impl From<LogFormat> for kangal_common::telemetry::LogFormat {
    fn from(format: LogFormat) -> Self {
        match format {
            LogFormat::Compact => Self::Compact,
            LogFormat::Json => Self::Json,
        }
    }
}

/// Kangal controller, runs load tests described by LoadTest resources.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Age after which finished load tests are deleted, 0 keeps them forever.
    #[arg(long, env = "CLEANUP_THRESHOLD", default_value = "1h", value_parser = humantime::parse_duration)]
    pub cleanup_threshold: Duration,

    /// Base URL of the proxy serving load test reports.
    #[arg(long, env = "KANGAL_PROXY_URL")]
    pub kangal_proxy_url: Option<String>,

    /// Timeout of connecting to the API server.
    #[arg(long, env = "KUBE_CLIENT_TIMEOUT", default_value = "5s", value_parser = humantime::parse_duration)]
    pub kube_client_timeout: Duration,

    /// Time limit of a single reconcile.
    #[arg(long, env = "SYNC_HANDLER_TIMEOUT", default_value = "60s", value_parser = humantime::parse_duration)]
    pub sync_handler_timeout: Duration,

    /// Interval at which every load test is reconciled without a watch event.
    #[arg(long, env = "RESYNC_PERIOD", default_value = "30s", value_parser = humantime::parse_duration)]
    pub resync_period: Duration,

    /// Number of load tests reconciled concurrently.
    #[arg(long, env = "WORKERS", default_value_t = 2)]
    pub workers: usize,

    /// How long worker pods may take to become ready before the load test errors.
    #[arg(long, env = "WORKER_READINESS_TIMEOUT", default_value = "10m", value_parser = humantime::parse_duration)]
    pub worker_readiness_timeout: Duration,

    /// Annotations of load test namespaces, as comma separated key:value pairs.
    #[arg(long, env = "NAMESPACE_ANNOTATIONS", value_parser = parse_key_values, default_value = "")]
    pub namespace_annotations: BTreeMap<String, String>,

    /// Annotations of load generator pods, as comma separated key:value pairs.
    #[arg(long, env = "POD_ANNOTATIONS", value_parser = parse_key_values, default_value = "")]
    pub pod_annotations: BTreeMap<String, String>,

    /// Node selector of load generator pods, as comma separated key:value pairs.
    #[arg(long, env = "NODE_SELECTORS", value_parser = parse_key_values, default_value = "")]
    pub node_selectors: BTreeMap<String, String>,

    /// Tolerations of load generator pods, as comma separated key:value:operator:effect items.
    #[arg(long, env = "TOLERATIONS", value_parser = parse_tolerations, default_value = "")]
    pub tolerations: Tolerations,

    /// Endpoint of the OTLP collector receiving spans and metrics.
    #[arg(long, env = "OTLP_ENDPOINT")]
    pub otlp_endpoint: Option<String>,

    /// Format of the logs written to stdout.
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t)]
    pub log_format: LogFormat,
}

/// Parsed tolerations, a newtype so clap treats the list as one value.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Tolerations(pub Vec<Toleration>);

fn unquote(s: &str) -> &str {
    s.trim().trim_matches(|c| c == '"' || c == '\'')
}

/// Parse comma separated `key:value` pairs.
pub fn parse_key_values(s: &str) -> Result<BTreeMap<String, String>> {
    unquote(s)
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| {
            let (key, value) = item
                .split_once(':')
                .ok_or_else(|| anyhow!("expected key:value, got {item:?}"))?;
            let key = unquote(key);
            if key.is_empty() {
                bail!("empty key in {item:?}");
            }
            Ok((key.to_owned(), unquote(value).to_owned()))
        })
        .collect()
}

/// Parse one `key:value:operator:effect` toleration.
pub fn parse_toleration(s: &str) -> Result<Toleration> {
    let parts: Vec<&str> = s.trim().split(':').collect();
    let [key, value, operator, effect] = parts[..] else {
        bail!("failed to parse toleration {s:?}, expected pattern key:value:operator:effect");
    };
    if !matches!(operator, "Equal" | "Exists") {
        bail!("invalid operator type {operator:?}");
    }
    if !matches!(effect, "NoExecute" | "NoSchedule" | "PreferNoSchedule") {
        bail!("invalid effect type {effect:?}");
    }
    Ok(Toleration {
        key: Some(key.to_owned()),
        value: (!value.is_empty()).then(|| value.to_owned()),
        operator: Some(operator.to_owned()),
        effect: Some(effect.to_owned()),
        toleration_seconds: None,
    })
}

/// Parse comma separated tolerations.
pub fn parse_tolerations(s: &str) -> Result<Tolerations> {
    unquote(s)
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(parse_toleration)
        .collect::<Result<_>>()
        .map(Tolerations)
}

fn env_prefix(load_test_type: LoadTestType) -> &'static str {
    match load_test_type {
        LoadTestType::JMeter => "JMETER",
        LoadTestType::Fake => "FAKE",
        LoadTestType::Locust => "LOCUST",
        LoadTestType::Ghz => "GHZ",
        LoadTestType::K6 => "K6",
    }
}

/// Overrides of one backend, read from `<TYPE>_MASTER_*` and `<TYPE>_WORKER_*` variables.
///
/// Backends running a single kind of pod read the unqualified `<TYPE>_*` variables as the
/// master settings.
pub fn backend_overrides(
    load_test_type: LoadTestType,
    lookup: impl Fn(&str) -> Option<String>,
) -> BackendOverrides {
    let prefix = env_prefix(load_test_type);
    let var = |role: &str, name: &str| {
        let qualified = lookup(&format!("{prefix}_{role}_{name}"));
        let value = if role == "MASTER" {
            qualified.or_else(|| lookup(&format!("{prefix}_{name}")))
        } else {
            qualified
        };
        value.unwrap_or_default()
    };
    let image = |role: &str| ImageDetails::new(var(role, "IMAGE_NAME"), var(role, "IMAGE_TAG"));
    let resources = |role: &str| Resources {
        cpu_limits: var(role, "CPU_LIMITS"),
        cpu_requests: var(role, "CPU_REQUESTS"),
        memory_limits: var(role, "MEMORY_LIMITS"),
        memory_requests: var(role, "MEMORY_REQUESTS"),
    };
    BackendOverrides {
        master_image: image("MASTER"),
        worker_image: image("WORKER"),
        master_resources: resources("MASTER"),
        worker_resources: resources("WORKER"),
    }
}

impl Config {
    /// Apply the connect timeout to an inferred client config.
    ///
    /// The read timeout keeps its default so idle watches are not cut short, requests made while
    /// reconciling are bounded by the reconcile timeout instead.
    pub fn kube_client_config(&self, mut kube_config: kube::Config) -> kube::Config {
        kube_config.connect_timeout = Some(self.kube_client_timeout);
        kube_config
    }

    /// Settings of the reconcile loop.
    pub fn settings(&self) -> Settings {
        Settings {
            cleanup_threshold: self.cleanup_threshold,
            proxy_url: self.kangal_proxy_url.clone().filter(|url| !url.is_empty()),
            sync_timeout: self.sync_handler_timeout,
            resync_period: self.resync_period,
            namespace_annotations: self.namespace_annotations.clone(),
        }
    }

    /// Context shared by every backend, overrides are read through `lookup`.
    pub fn backend_context(
        &self,
        k_client: Client,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> BackendContext {
        let overrides: HashMap<_, _> = LoadTestType::ALL
            .into_iter()
            .map(|load_test_type| (load_test_type, backend_overrides(load_test_type, &lookup)))
            .collect();
        BackendContext {
            pod_annotations: self.pod_annotations.clone(),
            node_selector: self.node_selectors.clone(),
            tolerations: self.tolerations.0.clone(),
            overrides,
            worker_readiness_timeout: self.worker_readiness_timeout,
            ..BackendContext::new(k_client)
        }
    }
}
