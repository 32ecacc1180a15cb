use std::collections::{BTreeMap, HashSet};

pub const APP_NAME_LABEL: &str = "app.kubernetes.io/name";
pub const APP_COMPONENT_LABEL: &str = "app.kubernetes.io/component";
pub const APP_INSTANCE_LABEL: &str = "app.kubernetes.io/instance";
pub const APP_MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

pub const APP_NAME: &str = "quarry";
pub const APP_COMPONENT_RUNNER: &str = "runner";
pub const MANAGER_NAME: &str = "quarry-operator";

/// Label injected by the ReplicaSet controller. Removing it detaches a pod
/// from its owning ReplicaSet.
pub const TEMPLATE_HASH_LABEL: &str = "pod-template-hash";

/// `<namespace>/<name>` form used as both the loop registry key and the
/// CI-provider runner tag.
pub fn namespaced_name(namespace: &str, name: &str) -> String {
    format!("{}/{}", namespace, name)
}

/// The three identifying labels carried by every runner pod of a pool.
pub fn pool_selector_labels(pool_name: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(APP_NAME_LABEL.to_string(), APP_NAME.to_string());
    labels.insert(
        APP_COMPONENT_LABEL.to_string(),
        APP_COMPONENT_RUNNER.to_string(),
    );
    labels.insert(APP_INSTANCE_LABEL.to_string(), pool_name.to_string());
    labels
}

/// Label selector string accepted by the Kubernetes list API.
pub fn pool_selector(pool_name: &str) -> String {
    pool_selector_labels(pool_name)
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

/// Elements of `prev` that are absent from `current`.
pub fn difference(prev: &[String], current: &[String]) -> Vec<String> {
    let set: HashSet<&str> = current.iter().map(String::as_str).collect();
    prev.iter()
        .filter(|v| !set.contains(v.as_str()))
        .cloned()
        .collect()
}
