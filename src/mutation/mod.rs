//! Reversible pod template mutation
//!
//! The webhook cannot assume it sees a pristine object: Kubernetes re-submits
//! the same Deployment for admission on every apply, rollout and patch. Every
//! mutation therefore starts by undoing whatever a previous mutation left
//! behind, and all bookkeeping about what was injected lives in the object
//! itself through the naming conventions below. A cleanup job reads the same
//! conventions back, so these literals are a wire contract.
//!
//! - [`catalog`] - Kubernetes fragments (init containers, volumes, env vars, mounts) per platform
//! - [`resolver`] - Picks the governing Instrumentation resource and platforms for a pod template
//! - [`patcher`] - Unpatch/patch engine producing the JSON Patch document
//! - [`pod_info`] - Identity of the pods a template will produce

pub mod catalog;
pub mod patcher;
pub mod pod_info;
pub mod resolver;

pub use patcher::{is_mutated, mutate_object, patch_object, InstrumentationState};
pub use pod_info::PodInfo;
pub use resolver::{resolve_cr_name, select_platforms, template_annotations};

/// Pod template annotation recording the currently applied mutation
pub const INSTRUMENTATION_ANNOTATION: &str = "monitor.azure.com/instrumentation";

/// Pod template annotation excluding container logs from Container Insights
pub const LOGS_EXCLUSION_ANNOTATION: &str = "fluentbit.io/exclude";

/// Holds the customer's own [`LOGS_EXCLUSION_ANNOTATION`] value while a mutation is applied
pub const LOGS_EXCLUSION_BACKUP_ANNOTATION: &str = "fluentbit.io/exclude_before_auto_instrumentation";

/// Suffix of the env var holding a customer value the mutation overwrote
pub const ENV_BACKUP_SUFFIX: &str = "_BEFORE_AUTO_INSTRUMENTATION";

/// Empty env var present on every mutated container
pub const MUTATION_MARKER_ENV: &str = "AZURE_MONITOR_AUTO_INSTRUMENTATION_MUTATED";

/// Pod template annotations selecting platforms and the governing resource
pub const INJECT_DOTNET_ANNOTATION: &str = "instrumentation.opentelemetry.io/inject-dotnet";
/// See [`INJECT_DOTNET_ANNOTATION`]
pub const INJECT_JAVA_ANNOTATION: &str = "instrumentation.opentelemetry.io/inject-java";
/// See [`INJECT_DOTNET_ANNOTATION`]
pub const INJECT_NODEJS_ANNOTATION: &str = "instrumentation.opentelemetry.io/inject-nodejs";

/// Instrumentation resource used when no annotation names one
pub const DEFAULT_INSTRUMENTATION_NAME: &str = "default";

/// Name of the env var that backs up `name`
pub fn backup_env_name(name: &str) -> String {
    format!("{name}{ENV_BACKUP_SUFFIX}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backup_env_name() {
        assert_eq!(
            backup_env_name("NODE_OPTIONS"),
            "NODE_OPTIONS_BEFORE_AUTO_INSTRUMENTATION"
        );
    }
}
