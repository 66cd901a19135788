//! Admission review orchestration
//!
//! Validates the request, picks the governing Instrumentation resource and
//! platforms, runs the patch engine and wraps the result in an admission
//! response. The webhook never blocks admission: every failure degrades to
//! an allowed response without a patch, with the error surfaced as a
//! warning.

use std::sync::Arc;

use axum::{extract::State, Json};
use kube::api::DynamicObject;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation};
use kube::core::Status;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use super::WebhookState;
use crate::cluster::ClusterIdentity;
use crate::mutation::{
    patch_object, resolve_cr_name, select_platforms, template_annotations, PodInfo,
};
use crate::store::InstrumentationStore;
use crate::telemetry::{HeartbeatLog, HeartbeatMetric, Telemetry};
use crate::{Error, Result};

/// Workload kind the webhook mutates
pub const SUPPORTED_KIND: &str = "Deployment";

/// Turns admission requests into mutation responses
pub struct Mutator {
    store: Arc<InstrumentationStore>,
    cluster: ClusterIdentity,
    telemetry: Arc<dyn Telemetry>,
}

impl Mutator {
    /// Create a mutator reading configuration from `store`
    pub fn new(
        store: Arc<InstrumentationStore>,
        cluster: ClusterIdentity,
        telemetry: Arc<dyn Telemetry>,
    ) -> Self {
        Self {
            store,
            cluster,
            telemetry,
        }
    }

    /// Answer an admission review
    pub fn mutate(&self, review: AdmissionReview<DynamicObject>) -> AdmissionReview<DynamicObject> {
        self.telemetry
            .add_heartbeat_metric(HeartbeatMetric::AdmissionReviewCount, 1.0);

        let request: AdmissionRequest<DynamicObject> = match review.try_into() {
            Ok(request) => request,
            Err(e) => {
                error!(error = %e, "Failed to parse admission request");
                self.record_failure(&e.to_string());
                let mut response = AdmissionResponse::invalid(e.to_string());
                response.allowed = true;
                return response.into_review();
            }
        };

        self.mutate_request(&request).into_review()
    }

    /// Answer a single admission request
    pub fn mutate_request(&self, request: &AdmissionRequest<DynamicObject>) -> AdmissionResponse {
        let uid = request.uid.as_str();

        let patch = match self.compute_patch(request) {
            Ok(patch) => patch,
            Err(e) => {
                warn!(%uid, error = %e, "Not mutating object");
                self.record_failure(&e.to_string());
                return with_warning(AdmissionResponse::from(request), &e);
            }
        };

        let operations = patch.0.len();
        match AdmissionResponse::from(request).with_patch(patch) {
            Ok(response) => {
                info!(%uid, operations, "Returning patch");
                response
            }
            Err(e) => {
                error!(%uid, error = %e, "Failed to serialize patch");
                let e = Error::serialization(e.to_string());
                self.record_failure(&e.to_string());
                with_warning(AdmissionResponse::from(request), &e)
            }
        }
    }

    fn compute_patch(&self, request: &AdmissionRequest<DynamicObject>) -> Result<json_patch::Patch> {
        let (object, namespace) = validate(request)?;
        let pod_info = PodInfo::from_object(&object, Some(&namespace));

        let annotations = template_annotations(&object);
        let cr_name = resolve_cr_name(&annotations)?;
        let cr = self.store.get(&namespace, &cr_name);

        let platforms = match cr.as_deref() {
            Some(cr) => {
                let platforms = select_platforms(&annotations, cr);
                info!(
                    uid = %request.uid,
                    %namespace,
                    workload = ?pod_info.owner_name,
                    cr = %cr_name,
                    platforms = ?platforms,
                    "Found governing Instrumentation"
                );
                self.telemetry
                    .add_heartbeat_metric(HeartbeatMetric::AdmissionReviewActionableCount, 1.0);
                platforms
            }
            None => {
                debug!(
                    uid = %request.uid,
                    %namespace,
                    cr = %cr_name,
                    "No governing Instrumentation, reverting earlier mutations if any"
                );
                Vec::new()
            }
        };

        patch_object(&object, cr.as_deref(), &pod_info, &platforms, &self.cluster)
    }

    fn record_failure(&self, message: &str) {
        self.telemetry
            .add_heartbeat_metric(HeartbeatMetric::AdmissionReviewActionableFailedCount, 1.0);
        self.telemetry
            .append_heartbeat_log(HeartbeatLog::AdmissionReviewTopExceptionsEncountered, message);
    }
}

/// Check the request is one the webhook handles and extract the object and its namespace
fn validate(request: &AdmissionRequest<DynamicObject>) -> Result<(Value, String)> {
    if !matches!(request.operation, Operation::Create | Operation::Update) {
        return Err(Error::invalid_request(format!(
            "unsupported operation {:?}",
            request.operation
        )));
    }
    if request.kind.kind != SUPPORTED_KIND {
        return Err(Error::invalid_request(format!(
            "unsupported kind {}",
            request.kind.kind
        )));
    }

    let object = request
        .object
        .as_ref()
        .ok_or_else(|| Error::invalid_request("request carries no object"))?;
    if object.data.get("spec").map_or(true, Value::is_null) {
        return Err(Error::invalid_request("object has no spec"));
    }

    let namespace = object
        .metadata
        .namespace
        .clone()
        .or_else(|| request.namespace.clone())
        .filter(|ns| !ns.is_empty())
        .ok_or_else(|| Error::invalid_request("could not determine the object's namespace"))?;

    Ok((serde_json::to_value(object)?, namespace))
}

/// Allowed response without a patch, carrying `error` as warning and status
fn with_warning(mut response: AdmissionResponse, error: &Error) -> AdmissionResponse {
    let message = error.to_string();
    response.warnings = Some(vec![format!("auto-instrumentation skipped: {message}")]);
    response.result = Status::failure(&message, "BadRequest").with_code(400);
    response
}

/// Handle `POST /mutate`
pub async fn mutate_handler(
    State(state): State<Arc<WebhookState>>,
    Json(body): Json<AdmissionReview<DynamicObject>>,
) -> Json<AdmissionReview<DynamicObject>> {
    Json(state.mutator.mutate(body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{Destination, Instrumentation, InstrumentationSettings, InstrumentationSpec, Platform};
    use crate::mutation::{InstrumentationState, INJECT_DOTNET_ANNOTATION, INJECT_JAVA_ANNOTATION};
    use crate::telemetry::MockTelemetry;
    use mockall::predicate::eq;
    use serde_json::json;

    fn review(operation: &str, kind: &str, object: Value) -> AdmissionReview<DynamicObject> {
        serde_json::from_value(json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": {
                "uid": "req-1",
                "kind": {"group": "apps", "version": "v1", "kind": kind},
                "resource": {"group": "apps", "version": "v1", "resource": "deployments"},
                "requestKind": {"group": "apps", "version": "v1", "kind": kind},
                "requestResource": {"group": "apps", "version": "v1", "resource": "deployments"},
                "name": "web",
                "namespace": "apps",
                "operation": operation,
                "userInfo": {"username": "tester"},
                "object": object,
                "oldObject": null,
                "dryRun": false,
                "options": null
            }
        }))
        .unwrap()
    }

    fn deployment(annotations: Value) -> Value {
        json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": "web", "namespace": "apps"},
            "spec": {
                "template": {
                    "metadata": {"annotations": annotations},
                    "spec": {"containers": [{"name": "main", "image": "app:1"}]}
                }
            }
        })
    }

    fn store_with(platforms: Vec<Platform>) -> Arc<InstrumentationStore> {
        let mut cr = Instrumentation::new(
            "default",
            InstrumentationSpec {
                settings: InstrumentationSettings {
                    auto_instrumentation_platforms: platforms,
                    ..Default::default()
                },
                destination: Destination {
                    application_insights_connection_string: "InstrumentationKey=abc".into(),
                },
            },
        );
        cr.metadata.namespace = Some("apps".into());
        cr.metadata.resource_version = Some("11".into());
        let store = Arc::new(InstrumentationStore::new());
        store.upsert(cr);
        store
    }

    fn quiet_telemetry() -> Arc<MockTelemetry> {
        let mut telemetry = MockTelemetry::new();
        telemetry.expect_add_heartbeat_metric().return_const(());
        telemetry.expect_append_heartbeat_log().return_const(());
        Arc::new(telemetry)
    }

    fn response_of(review: AdmissionReview<DynamicObject>) -> Value {
        serde_json::to_value(review).unwrap()["response"].clone()
    }

    fn decoded_patch(response: &Value) -> Vec<Value> {
        // kube-core serializes `AdmissionResponse.patch` (a `Vec<u8>`) as a JSON byte array
        let bytes: Vec<u8> = serde_json::from_value(response["patch"].clone()).unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    // =========================================================================
    // Mutation
    // =========================================================================

    /// Story: a deployment in a namespace with a default Instrumentation is
    /// instrumented for the platforms the resource lists
    #[test]
    fn story_default_instrumentation_applies() {
        let mutator = Mutator::new(
            store_with(vec![Platform::Java]),
            ClusterIdentity::default(),
            quiet_telemetry(),
        );

        let response = response_of(mutator.mutate(review("CREATE", "Deployment", deployment(json!({})))));
        assert_eq!(response["uid"], "req-1");
        assert_eq!(response["allowed"], true);
        assert_eq!(response["patchType"], "JSONPatch");

        let ops = decoded_patch(&response);
        let state: InstrumentationState =
            serde_json::from_str(ops[0]["value"].as_str().unwrap()).unwrap();
        assert_eq!(state.cr_name, "default");
        assert_eq!(state.cr_resource_version, "11");
        assert_eq!(state.platforms, vec![Platform::Java]);

        let replaced = &ops.last().unwrap()["value"];
        assert_eq!(
            replaced["spec"]["template"]["spec"]["initContainers"][0]["name"],
            "azure-monitor-auto-instrumentation-java"
        );
    }

    /// Story: without a governing resource the webhook still answers with a
    /// patch that only reverts earlier mutations
    #[test]
    fn story_missing_instrumentation_only_unpatches() {
        let mutator = Mutator::new(
            Arc::new(InstrumentationStore::new()),
            ClusterIdentity::default(),
            quiet_telemetry(),
        );

        let response = response_of(mutator.mutate(review("UPDATE", "Deployment", deployment(json!({})))));
        let ops = decoded_patch(&response);
        assert_eq!(ops[0]["op"], "add");
        assert_eq!(ops[1]["op"], "remove");
        assert_eq!(ops[2]["op"], "replace");
    }

    /// Story: two differently named resources in inject annotations leave
    /// the object alone but never block admission
    #[test]
    fn story_conflicting_annotations_allowed_unmutated() {
        let failed = HeartbeatMetric::AdmissionReviewActionableFailedCount;
        let mut telemetry = MockTelemetry::new();
        telemetry
            .expect_add_heartbeat_metric()
            .with(eq(failed), eq(1.0))
            .times(1)
            .return_const(());
        telemetry
            .expect_add_heartbeat_metric()
            .withf(move |metric, _| *metric != failed)
            .return_const(());
        telemetry
            .expect_append_heartbeat_log()
            .times(1)
            .return_const(());

        let mutator = Mutator::new(
            store_with(vec![Platform::Java]),
            ClusterIdentity::default(),
            Arc::new(telemetry),
        );
        let object = deployment(json!({
            INJECT_DOTNET_ANNOTATION: "cr1",
            INJECT_JAVA_ANNOTATION: "cr2"
        }));

        let response = response_of(mutator.mutate(review("CREATE", "Deployment", object)));
        assert_eq!(response["allowed"], true);
        assert!(response.get("patch").map_or(true, Value::is_null));
        assert!(response["warnings"][0]
            .as_str()
            .unwrap()
            .contains("cr1, cr2"));
        assert_eq!(response["status"]["code"], 400);
        assert!(response["status"]["message"]
            .as_str()
            .unwrap()
            .contains("cr1, cr2"));
    }

    // =========================================================================
    // Validation
    // =========================================================================

    #[test]
    fn test_unsupported_kind_allowed_unmutated() {
        let mutator = Mutator::new(
            store_with(vec![Platform::Java]),
            ClusterIdentity::default(),
            quiet_telemetry(),
        );
        let response = response_of(mutator.mutate(review("CREATE", "StatefulSet", deployment(json!({})))));
        assert_eq!(response["allowed"], true);
        assert!(response.get("patch").map_or(true, Value::is_null));
    }

    #[test]
    fn test_delete_operation_allowed_unmutated() {
        let mutator = Mutator::new(
            store_with(vec![Platform::Java]),
            ClusterIdentity::default(),
            quiet_telemetry(),
        );
        let response = response_of(mutator.mutate(review("DELETE", "Deployment", deployment(json!({})))));
        assert_eq!(response["allowed"], true);
        assert!(response.get("patch").map_or(true, Value::is_null));
    }

    #[test]
    fn test_object_without_spec_allowed_unmutated() {
        let mutator = Mutator::new(
            store_with(vec![Platform::Java]),
            ClusterIdentity::default(),
            quiet_telemetry(),
        );
        let object = json!({"apiVersion": "apps/v1", "kind": "Deployment", "metadata": {"name": "web"}});
        let response = response_of(mutator.mutate(review("CREATE", "Deployment", object)));
        assert_eq!(response["allowed"], true);
        assert!(response["warnings"][0].as_str().unwrap().contains("no spec"));
        assert_eq!(response["status"]["code"], 400);
    }

    #[test]
    fn test_review_without_request_is_allowed() {
        let mutator = Mutator::new(
            store_with(vec![Platform::Java]),
            ClusterIdentity::default(),
            quiet_telemetry(),
        );
        let review: AdmissionReview<DynamicObject> = serde_json::from_value(json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview"
        }))
        .unwrap();

        let response = response_of(mutator.mutate(review));
        assert_eq!(response["allowed"], true);
    }
}
