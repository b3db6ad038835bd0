use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Namespace;
use kube::{
    api::{ListParams, ObjectMeta},
    Api, Client, ResourceExt,
};
use tracing::info;

use crate::{
    backends::resources::owner_refs,
    labels::{managed_labels_extend, namespace_label_selector, namespace_labels},
    loadtest::LoadTest,
    utils::create_if_absent,
};

/// Namespace assigned to a load test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assigned {
    /// Name of the namespace.
    pub name: String,
    /// True when the namespace was created by this call.
    pub created: bool,
}

/// Find the namespace of a load test, creating it if it does not exist.
///
/// Namespaces are found by label so a namespace created by an earlier pass is reused even if
/// the load test status never recorded it.
pub async fn ensure_namespace(
    k_client: Client,
    load_test: &LoadTest,
    annotations: &BTreeMap<String, String>,
) -> Result<Assigned, kube::Error> {
    let name = load_test.name_any();
    let namespaces: Api<Namespace> = Api::all(k_client);
    let existing = namespaces
        .list(&ListParams::default().labels(&namespace_label_selector(&name)))
        .await?;
    if let Some(namespace) = existing.items.first() {
        return Ok(Assigned {
            name: namespace.name_any(),
            created: false,
        });
    }

    let namespace = Namespace {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            labels: managed_labels_extend(Some(namespace_labels(&name))),
            annotations: (!annotations.is_empty()).then(|| annotations.clone()),
            owner_references: owner_refs(load_test),
            ..Default::default()
        },
        ..Default::default()
    };
    let created = create_if_absent(&namespaces, &namespace).await?;
    if created {
        info!(load_test = %name, "created namespace");
    }
    Ok(Assigned { name, created })
}
