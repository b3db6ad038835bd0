use std::collections::BTreeMap;

use crate::CONTROLLER_NAME;

/// Create lables that can be used as a unique selector for a given app name.
pub fn selector_labels(app: &str) -> BTreeMap<String, String> {
    BTreeMap::from_iter(vec![("app".to_owned(), app.to_owned())])
}

/// Label selector for a given app name.
pub fn app_label_selector(app: &str) -> String {
    format!("app={app}")
}

/// Manage by label
pub const MANAGED_BY_LABEL_SELECTOR: &str = "managed-by=kangal";

/// Labels that indicate the resource is managed by the kangal operator.
pub fn managed_labels() -> Option<BTreeMap<String, String>> {
    Some(BTreeMap::from_iter(vec![(
        "managed-by".to_owned(),
        CONTROLLER_NAME.to_owned(),
    )]))
}

/// Managed labels extended with the given labels.
pub fn managed_labels_extend(
    labels: Option<BTreeMap<String, String>>,
) -> Option<BTreeMap<String, String>> {
    let mut managed = managed_labels().unwrap_or_default();
    managed.extend(labels.unwrap_or_default());
    Some(managed)
}

/// Label key linking a namespace to the load test that owns it.
pub const CONTROLLER_LABEL: &str = "controller";

/// Labels of the namespace created for a load test.
pub fn namespace_labels(load_test: &str) -> BTreeMap<String, String> {
    let mut labels = selector_labels("kangal");
    labels.insert(CONTROLLER_LABEL.to_owned(), load_test.to_owned());
    labels
}

/// Label selector matching the namespace created for a load test.
pub fn namespace_label_selector(load_test: &str) -> String {
    format!("{CONTROLLER_LABEL}={load_test}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extend_keeps_managed_by() {
        let labels = managed_labels_extend(Some(selector_labels("loadtest-worker-pod"))).unwrap();
        assert_eq!(labels.get("managed-by").map(String::as_str), Some("kangal"));
        assert_eq!(
            labels.get("app").map(String::as_str),
            Some("loadtest-worker-pod")
        );
    }

    #[test]
    fn namespace_labels_link_load_test() {
        let labels = namespace_labels("loadtest-quick-otter");
        assert_eq!(labels.get("app").map(String::as_str), Some("kangal"));
        assert_eq!(
            namespace_label_selector("loadtest-quick-otter"),
            "controller=loadtest-quick-otter"
        );
    }
}
