//! Instrumentation Custom Resource Definition
//!
//! An Instrumentation resource governs how pods in its namespace are
//! auto-instrumented. The resource named `default` applies to every pod
//! template that does not pick one explicitly through its `inject-*`
//! annotations.

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{Destination, InstrumentationSettings};

/// Specification for an Instrumentation resource
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "monitor.azure.com",
    version = "v1",
    kind = "Instrumentation",
    plural = "instrumentations",
    namespaced,
    printcolumn = r#"{"name":"Platforms","type":"string","jsonPath":".spec.settings.autoInstrumentationPlatforms"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct InstrumentationSpec {
    /// What to inject and how
    #[serde(default)]
    pub settings: InstrumentationSettings,

    /// Telemetry destination
    pub destination: Destination,
}

impl Instrumentation {
    /// Name of this resource, empty if unset
    pub fn cr_name(&self) -> String {
        self.name_any()
    }

    /// Resource version as reported by the API server, empty if unset
    pub fn cr_resource_version(&self) -> String {
        self.resource_version().unwrap_or_default()
    }

    /// Connection string handed to the injected agents
    pub fn connection_string(&self) -> &str {
        &self.spec.destination.application_insights_connection_string
    }

    /// Alternate registry path for agent images, if configured
    pub fn image_repository_path(&self) -> Option<&str> {
        self.spec.settings.image_repository_path.as_deref()
    }

    /// Whether agents should keep collecting application logs
    pub fn app_logs_enabled(&self) -> bool {
        !self
            .spec
            .settings
            .log_collection_settings
            .as_ref()
            .and_then(|l| l.disable_app_logs)
            .unwrap_or(false)
    }

    /// Explicit container log exclusion setting, `None` when unspecified
    pub fn container_logs_disabled(&self) -> Option<bool> {
        self.spec
            .settings
            .log_collection_settings
            .as_ref()
            .and_then(|l| l.disable_container_logs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{LogCollectionSettings, Platform};
    use kube::CustomResourceExt;

    fn sample(logs: Option<LogCollectionSettings>) -> Instrumentation {
        let mut cr = Instrumentation::new(
            "default",
            InstrumentationSpec {
                settings: InstrumentationSettings {
                    auto_instrumentation_platforms: vec![Platform::Java],
                    image_repository_path: None,
                    log_collection_settings: logs,
                },
                destination: Destination {
                    application_insights_connection_string: "InstrumentationKey=abc".into(),
                },
            },
        );
        cr.metadata.namespace = Some("apps".into());
        cr.metadata.resource_version = Some("42".into());
        cr
    }

    #[test]
    fn test_crd_metadata() {
        let crd = Instrumentation::crd();
        assert_eq!(
            crd.metadata.name.as_deref(),
            Some("instrumentations.monitor.azure.com")
        );
        assert_eq!(crd.spec.scope, "Namespaced");
    }

    #[test]
    fn test_identity_accessors() {
        let cr = sample(None);
        assert_eq!(cr.cr_name(), "default");
        assert_eq!(cr.cr_resource_version(), "42");
        assert_eq!(cr.connection_string(), "InstrumentationKey=abc");
        assert_eq!(cr.image_repository_path(), None);
    }

    #[test]
    fn test_log_settings_default_to_enabled_and_unspecified() {
        let cr = sample(None);
        assert!(cr.app_logs_enabled());
        assert_eq!(cr.container_logs_disabled(), None);
    }

    #[test]
    fn test_log_settings_respected() {
        let cr = sample(Some(LogCollectionSettings {
            disable_app_logs: Some(true),
            disable_container_logs: Some(false),
        }));
        assert!(!cr.app_logs_enabled());
        assert_eq!(cr.container_logs_disabled(), Some(false));
    }

    #[test]
    fn test_deserializes_from_api_json() {
        let cr: Instrumentation = serde_json::from_value(serde_json::json!({
            "apiVersion": "monitor.azure.com/v1",
            "kind": "Instrumentation",
            "metadata": {"name": "team-a", "namespace": "apps", "resourceVersion": "7"},
            "spec": {
                "settings": {"autoInstrumentationPlatforms": ["DotNet"]},
                "destination": {"applicationInsightsConnectionString": "InstrumentationKey=xyz"}
            }
        }))
        .unwrap();

        assert_eq!(cr.cr_name(), "team-a");
        assert_eq!(
            cr.spec.settings.auto_instrumentation_platforms,
            vec![Platform::DotNet]
        );
    }
}
