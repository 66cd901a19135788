//! Identity of the pods produced by a workload template

use serde_json::Value;

/// Identity derived from the workload under admission, used for resource attributes
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PodInfo {
    /// Namespace of the workload
    pub namespace: Option<String>,
    /// Lowercased kind of the owning workload (e.g. `deployment`)
    pub owner_kind: Option<String>,
    /// Name of the owning workload
    pub owner_name: Option<String>,
    /// UID of the owning workload (absent on CREATE)
    pub owner_uid: Option<String>,
    /// Name of the container when the template has exactly one
    pub only_container_name: Option<String>,
}

impl PodInfo {
    /// Derive pod identity from a workload object
    ///
    /// `fallback_namespace` is used when the object itself does not carry a
    /// namespace, which is common on CREATE.
    pub fn from_object(object: &Value, fallback_namespace: Option<&str>) -> Self {
        let metadata = object.get("metadata");
        let meta_str = |field: &str| {
            metadata
                .and_then(|m| m.get(field))
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };

        let containers = object
            .pointer("/spec/template/spec/containers")
            .and_then(Value::as_array);
        let only_container_name = match containers {
            Some(c) if c.len() == 1 => c[0].get("name").and_then(Value::as_str).map(str::to_string),
            _ => None,
        };

        Self {
            namespace: meta_str("namespace")
                .or_else(|| fallback_namespace.filter(|s| !s.is_empty()).map(str::to_string)),
            owner_kind: object
                .get("kind")
                .and_then(Value::as_str)
                .map(str::to_lowercase),
            owner_name: meta_str("name"),
            owner_uid: meta_str("uid"),
            only_container_name,
        }
    }
}
