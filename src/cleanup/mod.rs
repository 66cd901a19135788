//! Cleanup job
//!
//! Reverts every Deployment in the cluster to its unmutated shape. Runs when
//! the feature is switched off, so workloads keep running without the agents
//! once they roll.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use kube::api::{Api, ApiResource, DynamicObject, ListParams, Patch, PatchParams};
use kube::core::TypeMeta;
use kube::Client;
use serde_json::Value;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use crate::cluster::ClusterIdentity;
use crate::mutation::{
    is_mutated, patch_object, InstrumentationState, PodInfo, INSTRUMENTATION_ANNOTATION,
};
use crate::retry::{call_api, Backoff};
use crate::telemetry::{HeartbeatLog, HeartbeatMetric, Telemetry};
use crate::{Error, Result};

/// Access to the workloads the cleanup job reverts
#[cfg_attr(test, automock)]
#[async_trait]
pub trait WorkloadClient: Send + Sync {
    /// Every Deployment in the cluster
    async fn list_deployments(&self) -> Result<Vec<DynamicObject>>;

    /// Apply a JSON Patch to one Deployment
    async fn patch_deployment(
        &self,
        namespace: &str,
        name: &str,
        patch: json_patch::Patch,
    ) -> Result<()>;
}

/// [`WorkloadClient`] backed by the Kubernetes API
pub struct KubeWorkloadClient {
    client: Client,
    backoff: Backoff,
    telemetry: Arc<dyn Telemetry>,
}

impl KubeWorkloadClient {
    /// Create a workload client using `client`
    pub fn new(client: Client, telemetry: Arc<dyn Telemetry>) -> Self {
        Self {
            client,
            backoff: Backoff::API_CALLS,
            telemetry,
        }
    }

    fn record_call(&self, result: &std::result::Result<impl Sized, kube::Error>) {
        self.telemetry
            .add_heartbeat_metric(HeartbeatMetric::ApiServerCallCount, 1.0);
        if let Err(e) = result {
            self.telemetry
                .add_heartbeat_metric(HeartbeatMetric::ApiServerCallErrorCount, 1.0);
            self.telemetry
                .append_heartbeat_log(HeartbeatLog::ApiServerTopExceptionsEncountered, &e.to_string());
        }
    }
}

fn deployment_resource() -> ApiResource {
    ApiResource::erase::<Deployment>(&())
}

#[async_trait]
impl WorkloadClient for KubeWorkloadClient {
    async fn list_deployments(&self) -> Result<Vec<DynamicObject>> {
        let resource = deployment_resource();
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &resource);
        let params = ListParams::default();
        let result = call_api(&self.backoff, "list_deployments", || api.list(&params)).await;
        self.record_call(&result);

        // list items come back without apiVersion/kind; the patch replaces the
        // whole object so they must be present
        let types = TypeMeta {
            api_version: resource.api_version.clone(),
            kind: resource.kind.clone(),
        };
        Ok(result?
            .items
            .into_iter()
            .map(|mut obj| {
                obj.types = Some(types.clone());
                obj
            })
            .collect())
    }

    async fn patch_deployment(
        &self,
        namespace: &str,
        name: &str,
        patch: json_patch::Patch,
    ) -> Result<()> {
        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), namespace, &deployment_resource());
        let params = PatchParams::default();
        let patch = Patch::Json::<()>(patch);
        let result =
            call_api(&self.backoff, "patch_deployment", || api.patch(name, &params, &patch))
                .await;
        self.record_call(&result);
        result?;
        Ok(())
    }
}

/// Whether a workload object carries anything an earlier mutation injected
pub fn needs_cleanup(object: &Value) -> bool {
    let has_state_annotation = object
        .pointer("/spec/template/metadata/annotations")
        .and_then(|a| a.get(INSTRUMENTATION_ANNOTATION))
        .is_some();
    has_state_annotation || is_mutated(object)
}

/// Revert every mutated Deployment, returning how many were patched
///
/// A failure on one Deployment is logged and the job moves on.
pub async fn run_cleanup(
    workloads: &dyn WorkloadClient,
    cluster: &ClusterIdentity,
    telemetry: &dyn Telemetry,
) -> Result<usize> {
    let deployments = workloads.list_deployments().await?;
    info!(count = deployments.len(), "Scanning deployments for cleanup");

    let mut patched = 0;
    for deployment in deployments {
        let namespace = deployment.metadata.namespace.clone().unwrap_or_default();
        let name = deployment.metadata.name.clone().unwrap_or_default();

        match revert(workloads, &deployment, &namespace, &name, cluster).await {
            Ok(true) => {
                patched += 1;
                telemetry.add_heartbeat_metric(HeartbeatMetric::CleanupPatchedCount, 1.0);
            }
            Ok(false) => debug!(%namespace, %name, "Deployment not mutated, skipping"),
            Err(e) => warn!(%namespace, %name, error = %e, "Failed to revert deployment"),
        }
    }

    info!(patched, "Cleanup finished");
    Ok(patched)
}

async fn revert(
    workloads: &dyn WorkloadClient,
    deployment: &DynamicObject,
    namespace: &str,
    name: &str,
    cluster: &ClusterIdentity,
) -> Result<bool> {
    let object = serde_json::to_value(deployment)?;
    if !needs_cleanup(&object) {
        return Ok(false);
    }
    if name.is_empty() {
        return Err(Error::malformed("deployment has no name"));
    }

    if let Some(state) = InstrumentationState::from_object(&object) {
        debug!(%namespace, %name, cr = %state.cr_name, "Reverting mutation");
    }

    let pod_info = PodInfo::from_object(&object, Some(namespace));
    let patch = patch_object(&object, None, &pod_info, &[], cluster)?;
    workloads.patch_deployment(namespace, name, patch).await?;
    info!(%namespace, %name, "Deployment reverted");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{Destination, Instrumentation, InstrumentationSettings, InstrumentationSpec, Platform};
    use crate::mutation::{mutate_object, MUTATION_MARKER_ENV};
    use crate::telemetry::MockTelemetry;
    use mockall::predicate::{always, eq};
    use serde_json::json;

    fn plain_deployment(name: &str) -> Value {
        json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": name, "namespace": "apps"},
            "spec": {"template": {"spec": {"containers": [{"name": "main", "image": "app"}]}}}
        })
    }

    fn mutated_deployment(name: &str) -> Value {
        let mut object = plain_deployment(name);
        let mut cr = Instrumentation::new(
            "default",
            InstrumentationSpec {
                settings: InstrumentationSettings {
                    auto_instrumentation_platforms: vec![Platform::Java],
                    ..Default::default()
                },
                destination: Destination {
                    application_insights_connection_string: "InstrumentationKey=abc".into(),
                },
            },
        );
        cr.metadata.namespace = Some("apps".into());
        cr.metadata.resource_version = Some("7".into());
        mutate_object(
            &mut object,
            Some(&cr),
            &PodInfo::default(),
            &[Platform::Java],
            &ClusterIdentity::default(),
        )
        .unwrap();
        object
    }

    fn dynamic(value: Value) -> DynamicObject {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_needs_cleanup_detects_marker_and_state() {
        assert!(!needs_cleanup(&plain_deployment("web")));
        assert!(needs_cleanup(&mutated_deployment("web")));

        let mut only_state = plain_deployment("web");
        only_state["spec"]["template"]["metadata"] =
            json!({"annotations": {INSTRUMENTATION_ANNOTATION: "{}"}});
        assert!(needs_cleanup(&only_state));

        let mut only_marker = plain_deployment("web");
        only_marker["spec"]["template"]["spec"]["containers"][0]["env"] =
            json!([{"name": MUTATION_MARKER_ENV, "value": "true"}]);
        assert!(needs_cleanup(&only_marker));
    }

    /// Story: the cleanup job reverts mutated deployments and leaves the
    /// rest alone
    #[tokio::test]
    async fn story_cleanup_reverts_only_mutated_deployments() {
        let mutated = mutated_deployment("mutated");
        let original = plain_deployment("mutated");

        let mut workloads = MockWorkloadClient::new();
        workloads.expect_list_deployments().returning(|| {
            Ok(vec![
                dynamic(plain_deployment("plain")),
                dynamic(mutated_deployment("mutated")),
            ])
        });
        workloads
            .expect_patch_deployment()
            .with(eq("apps"), eq("mutated"), always())
            .times(1)
            .returning(move |_, _, patch| {
                let mut object = mutated.clone();
                json_patch::patch(&mut object, &patch.0).unwrap();
                assert_eq!(object, original);
                Ok(())
            });

        let mut telemetry = MockTelemetry::new();
        telemetry
            .expect_add_heartbeat_metric()
            .with(eq(HeartbeatMetric::CleanupPatchedCount), eq(1.0))
            .times(1)
            .return_const(());

        let patched = run_cleanup(&workloads, &ClusterIdentity::default(), &telemetry)
            .await
            .unwrap();
        assert_eq!(patched, 1);
    }

    /// Story: one failing deployment does not stop the job
    #[tokio::test]
    async fn story_patch_failure_does_not_stop_cleanup() {
        let mut workloads = MockWorkloadClient::new();
        workloads.expect_list_deployments().returning(|| {
            Ok(vec![
                dynamic(mutated_deployment("first")),
                dynamic(mutated_deployment("second")),
            ])
        });
        workloads
            .expect_patch_deployment()
            .with(eq("apps"), eq("first"), always())
            .returning(|_, _, _| Err(Error::malformed("conflict")));
        workloads
            .expect_patch_deployment()
            .with(eq("apps"), eq("second"), always())
            .returning(|_, _, _| Ok(()));

        let mut telemetry = MockTelemetry::new();
        telemetry.expect_add_heartbeat_metric().return_const(());

        let patched = run_cleanup(&workloads, &ClusterIdentity::default(), &telemetry)
            .await
            .unwrap();
        assert_eq!(patched, 1);
    }

    #[tokio::test]
    async fn test_list_failure_is_returned() {
        let mut workloads = MockWorkloadClient::new();
        workloads
            .expect_list_deployments()
            .returning(|| Err(Error::malformed("forbidden")));

        let result =
            run_cleanup(&workloads, &ClusterIdentity::default(), &MockTelemetry::new()).await;
        assert!(result.is_err());
    }
}
