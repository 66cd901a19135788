//! Webhook certificate management
//!
//! Runs as a job next to the webhook. Keeps the serving certificate Secret
//! and the `caBundle` of the MutatingWebhookConfiguration consistent, and
//! regenerates both well before expiry. The webhook Deployment mounts the
//! Secret, so after regenerating it is restarted to pick up the new files.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::admissionregistration::v1::MutatingWebhookConfiguration;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::api::{Api, ObjectMeta, Patch, PatchParams};
use kube::Client;
use tracing::{info, warn};

#[cfg(test)]
use mockall::automock;

use crate::pki::{is_signed_by, CertificateAuthority, CertificateInfo, CA_COMMON_NAME};
use crate::retry::{call_api, Backoff};
use crate::telemetry::{HeartbeatLog, HeartbeatMetric, Telemetry};
use crate::{Error, Result};

/// Namespace the webhook runs in
pub const WEBHOOK_NAMESPACE: &str = "kube-system";
/// Secret holding the CA and serving certificate
pub const CERT_SECRET_NAME: &str = "app-monitoring-webhook-cert";
/// MutatingWebhookConfiguration registering the webhook
pub const WEBHOOK_CONFIG_NAME: &str = "app-monitoring-webhook";
/// Deployment running the webhook server
pub const WEBHOOK_DEPLOYMENT_NAME: &str = "app-monitoring-webhook";
/// DNS name the API server uses to reach the webhook
pub const WEBHOOK_SERVICE_DNS: &str = "app-monitoring-webhook-service.kube-system.svc";
/// Certificates expiring sooner than this are regenerated
pub const EXPIRY_THRESHOLD_DAYS: i64 = 90;

const CA_CERT_KEY: &str = "ca.cert";
const CA_KEY_KEY: &str = "ca.key";
const TLS_CERT_KEY: &str = "tls.cert";
const TLS_KEY_KEY: &str = "tls.key";

const FIELD_MANAGER: &str = "appmon-certs";
const RESTARTED_AT_ANNOTATION: &str = "kubectl.kubernetes.io/restartedAt";

/// CA and serving certificate material as stored in the Secret
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WebhookCertificates {
    /// CA certificate PEM
    pub ca_cert: String,
    /// CA private key PEM
    pub ca_key: String,
    /// Serving certificate PEM
    pub tls_cert: String,
    /// Serving private key PEM
    pub tls_key: String,
}

impl WebhookCertificates {
    /// Generate a fresh CA and serving certificate for the webhook service
    pub fn generate() -> Result<Self> {
        let ca = CertificateAuthority::new(CA_COMMON_NAME)?;
        let (tls_cert, tls_key) = ca.generate_server_cert(&[WEBHOOK_SERVICE_DNS])?;
        Ok(Self {
            ca_cert: ca.ca_cert_pem().to_string(),
            ca_key: ca.ca_key_pem().to_string(),
            tls_cert,
            tls_key,
        })
    }

    /// Read certificate material from a Secret; missing keys read as empty
    pub fn from_secret(secret: &Secret) -> Self {
        let field = |key: &str| {
            secret
                .data
                .as_ref()
                .and_then(|d| d.get(key))
                .and_then(|v| String::from_utf8(v.0.clone()).ok())
                .unwrap_or_default()
        };
        Self {
            ca_cert: field(CA_CERT_KEY),
            ca_key: field(CA_KEY_KEY),
            tls_cert: field(TLS_CERT_KEY),
            tls_key: field(TLS_KEY_KEY),
        }
    }

    /// Secret holding this certificate material
    pub fn to_secret(&self) -> Secret {
        let data = BTreeMap::from([
            (CA_CERT_KEY.to_string(), ByteString(self.ca_cert.clone().into_bytes())),
            (CA_KEY_KEY.to_string(), ByteString(self.ca_key.clone().into_bytes())),
            (TLS_CERT_KEY.to_string(), ByteString(self.tls_cert.clone().into_bytes())),
            (TLS_KEY_KEY.to_string(), ByteString(self.tls_key.clone().into_bytes())),
        ]);
        Secret {
            metadata: ObjectMeta {
                name: Some(CERT_SECRET_NAME.to_string()),
                namespace: Some(WEBHOOK_NAMESPACE.to_string()),
                ..Default::default()
            },
            type_: Some("Opaque".to_string()),
            data: Some(data),
            ..Default::default()
        }
    }

    /// Why this material cannot be kept, or `None` if it is usable
    pub fn regeneration_reason(&self) -> Option<String> {
        if [&self.ca_cert, &self.ca_key, &self.tls_cert, &self.tls_key]
            .iter()
            .any(|v| v.is_empty())
        {
            return Some("certificate material missing".to_string());
        }
        if let Err(e) = CertificateAuthority::from_pem(&self.ca_cert, &self.ca_key) {
            return Some(format!("CA unusable: {e}"));
        }
        match is_signed_by(&self.tls_cert, &self.ca_cert) {
            Ok(true) => {}
            Ok(false) => return Some("serving certificate not signed by CA".to_string()),
            Err(e) => return Some(format!("serving certificate unusable: {e}")),
        }
        for (what, pem) in [("CA", &self.ca_cert), ("serving", &self.tls_cert)] {
            match CertificateInfo::from_pem(pem) {
                Ok(info) if info.expires_within_days(EXPIRY_THRESHOLD_DAYS) => {
                    return Some(format!("{what} certificate close to expiry"));
                }
                Ok(_) => {}
                Err(e) => return Some(format!("{what} certificate unusable: {e}")),
            }
        }
        None
    }

    /// Whether this material must be replaced
    pub fn needs_regeneration(&self) -> bool {
        self.regeneration_reason().is_some()
    }
}

/// Where certificate state lives
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CertificateStore: Send + Sync {
    /// Current certificate Secret content, `None` if the Secret does not exist
    async fn read_certificates(&self) -> Result<Option<WebhookCertificates>>;

    /// Write the certificate Secret
    async fn write_certificates(&self, certs: &WebhookCertificates) -> Result<()>;

    /// CA bundle of the first webhook entry, `None` if unset
    async fn read_ca_bundle(&self) -> Result<Option<String>>;

    /// Set the CA bundle of every webhook entry
    async fn write_ca_bundle(&self, ca_cert: &str) -> Result<()>;

    /// Restart the webhook Deployment
    async fn restart_webhook(&self) -> Result<()>;
}

/// Result of one reconcile pass
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Stored certificates and CA bundle were valid and consistent
    UpToDate,
    /// New certificates were generated and rolled out
    Regenerated {
        /// What triggered regeneration
        reason: String,
    },
}

/// Bring the certificate Secret and the webhook CA bundle into a valid, consistent state
pub async fn reconcile(
    store: &dyn CertificateStore,
    telemetry: &dyn Telemetry,
) -> Result<ReconcileOutcome> {
    let current = store.read_certificates().await?;
    let bundle = store.read_ca_bundle().await?;

    let reason = match &current {
        None => Some("certificate secret missing".to_string()),
        Some(certs) => certs.regeneration_reason().or_else(|| {
            (bundle.as_deref() != Some(certs.ca_cert.as_str()))
                .then(|| "webhook CA bundle does not match stored CA".to_string())
        }),
    };

    let Some(reason) = reason else {
        info!("Webhook certificates valid, nothing to do");
        return Ok(ReconcileOutcome::UpToDate);
    };

    info!(%reason, "Regenerating webhook certificates");
    let certs = WebhookCertificates::generate()?;

    match store.write_certificates(&certs).await {
        Ok(()) => telemetry.add_heartbeat_metric(HeartbeatMetric::SecretStoreUpdatedCount, 1.0),
        Err(e) => {
            telemetry.add_heartbeat_metric(HeartbeatMetric::SecretStoreUpdateFailedCount, 1.0);
            return Err(e);
        }
    }

    store.write_ca_bundle(&certs.ca_cert).await?;
    telemetry.add_heartbeat_metric(HeartbeatMetric::WebhookConfigUpdatedCount, 1.0);

    store.restart_webhook().await?;
    info!("Webhook certificates rolled out");

    Ok(ReconcileOutcome::Regenerated { reason })
}

/// [`CertificateStore`] backed by the Kubernetes API
pub struct KubeCertificateStore {
    client: Client,
    backoff: Backoff,
    telemetry: Arc<dyn Telemetry>,
}

impl KubeCertificateStore {
    /// Create a store using `client`
    pub fn new(client: Client, telemetry: Arc<dyn Telemetry>) -> Self {
        Self {
            client,
            backoff: Backoff::API_CALLS,
            telemetry,
        }
    }

    async fn call<T, F, Fut>(&self, name: &str, operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = std::result::Result<T, kube::Error>>,
    {
        self.telemetry
            .add_heartbeat_metric(HeartbeatMetric::ApiServerCallCount, 1.0);
        call_api(&self.backoff, name, operation)
            .await
            .map_err(|e| {
                self.telemetry
                    .add_heartbeat_metric(HeartbeatMetric::ApiServerCallErrorCount, 1.0);
                self.telemetry
                    .append_heartbeat_log(HeartbeatLog::ApiServerTopExceptionsEncountered, &e.to_string());
                Error::from(e)
            })
    }

    async fn webhook_config(&self) -> Result<Option<MutatingWebhookConfiguration>> {
        let api: Api<MutatingWebhookConfiguration> = Api::all(self.client.clone());
        self.call("get_webhook_config", || api.get_opt(WEBHOOK_CONFIG_NAME))
            .await
    }
}

#[async_trait]
impl CertificateStore for KubeCertificateStore {
    async fn read_certificates(&self) -> Result<Option<WebhookCertificates>> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), WEBHOOK_NAMESPACE);
        let secret = self
            .call("get_certificate_secret", || api.get_opt(CERT_SECRET_NAME))
            .await?;
        Ok(secret.as_ref().map(WebhookCertificates::from_secret))
    }

    async fn write_certificates(&self, certs: &WebhookCertificates) -> Result<()> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), WEBHOOK_NAMESPACE);
        let params = PatchParams::apply(FIELD_MANAGER).force();
        let patch = Patch::Apply(certs.to_secret());
        self.call("apply_certificate_secret", || {
            api.patch(CERT_SECRET_NAME, &params, &patch)
        })
        .await?;
        info!(secret = CERT_SECRET_NAME, "Certificate secret written");
        Ok(())
    }

    async fn read_ca_bundle(&self) -> Result<Option<String>> {
        let Some(config) = self.webhook_config().await? else {
            warn!(config = WEBHOOK_CONFIG_NAME, "MutatingWebhookConfiguration not found");
            return Ok(None);
        };
        Ok(config
            .webhooks
            .as_ref()
            .and_then(|w| w.first())
            .and_then(|w| w.client_config.ca_bundle.as_ref())
            .and_then(|b| String::from_utf8(b.0.clone()).ok()))
    }

    async fn write_ca_bundle(&self, ca_cert: &str) -> Result<()> {
        let config = self.webhook_config().await?.ok_or_else(|| {
            Error::certificate(format!(
                "MutatingWebhookConfiguration {WEBHOOK_CONFIG_NAME} not found"
            ))
        })?;

        let mut webhooks = config.webhooks.unwrap_or_default();
        for webhook in &mut webhooks {
            webhook.client_config.ca_bundle = Some(ByteString(ca_cert.as_bytes().to_vec()));
        }
        let count = webhooks.len();
        let params = PatchParams::default();
        let patch = Patch::Merge(serde_json::json!({ "webhooks": webhooks }));

        let api: Api<MutatingWebhookConfiguration> = Api::all(self.client.clone());
        self.call("patch_webhook_ca_bundle", || {
            api.patch(WEBHOOK_CONFIG_NAME, &params, &patch)
        })
        .await?;
        info!(config = WEBHOOK_CONFIG_NAME, webhooks = count, "CA bundle updated");
        Ok(())
    }

    async fn restart_webhook(&self) -> Result<()> {
        let now = ::time::OffsetDateTime::now_utc()
            .format(&::time::format_description::well_known::Rfc3339)
            .map_err(|e| Error::serialization(e.to_string()))?;
        let params = PatchParams::default();
        let patch = Patch::Merge(serde_json::json!({
            "spec": {"template": {"metadata": {"annotations": {RESTARTED_AT_ANNOTATION: now}}}}
        }));

        let api: Api<Deployment> = Api::namespaced(self.client.clone(), WEBHOOK_NAMESPACE);
        self.call("restart_webhook_deployment", || {
            api.patch(WEBHOOK_DEPLOYMENT_NAME, &params, &patch)
        })
        .await?;
        info!(deployment = WEBHOOK_DEPLOYMENT_NAME, "Webhook deployment restarted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::MockTelemetry;
    use mockall::predicate::eq;

    fn quiet_telemetry() -> MockTelemetry {
        let mut telemetry = MockTelemetry::new();
        telemetry.expect_add_heartbeat_metric().return_const(());
        telemetry.expect_append_heartbeat_log().return_const(());
        telemetry
    }

    // =========================================================================
    // Certificate material
    // =========================================================================

    #[test]
    fn test_generated_certificates_are_usable() {
        let certs = WebhookCertificates::generate().unwrap();
        assert_eq!(certs.regeneration_reason(), None);
    }

    #[test]
    fn test_secret_round_trip() {
        let certs = WebhookCertificates::generate().unwrap();
        let secret = certs.to_secret();
        assert_eq!(secret.metadata.name.as_deref(), Some(CERT_SECRET_NAME));
        assert_eq!(secret.data.as_ref().unwrap().len(), 4);
        assert_eq!(WebhookCertificates::from_secret(&secret), certs);
    }

    #[test]
    fn test_missing_material_needs_regeneration() {
        let mut certs = WebhookCertificates::generate().unwrap();
        certs.tls_key.clear();
        assert!(certs.needs_regeneration());
        assert!(WebhookCertificates::from_secret(&Secret::default()).needs_regeneration());
    }

    #[test]
    fn test_serving_cert_from_other_ca_needs_regeneration() {
        let mut certs = WebhookCertificates::generate().unwrap();
        let other = WebhookCertificates::generate().unwrap();
        certs.tls_cert = other.tls_cert;
        assert_eq!(
            certs.regeneration_reason().as_deref(),
            Some("serving certificate not signed by CA")
        );
    }

    // =========================================================================
    // Reconcile
    // =========================================================================

    /// Story: first run on a fresh cluster creates everything and restarts
    /// the webhook
    #[tokio::test]
    async fn story_first_run_generates_and_rolls_out() {
        let mut store = MockCertificateStore::new();
        store.expect_read_certificates().returning(|| Ok(None));
        store.expect_read_ca_bundle().returning(|| Ok(None));
        store
            .expect_write_certificates()
            .times(1)
            .returning(|_| Ok(()));
        store
            .expect_write_ca_bundle()
            .withf(|ca| ca.contains("BEGIN CERTIFICATE"))
            .times(1)
            .returning(|_| Ok(()));
        store.expect_restart_webhook().times(1).returning(|| Ok(()));

        let outcome = reconcile(&store, &quiet_telemetry()).await.unwrap();
        assert!(matches!(outcome, ReconcileOutcome::Regenerated { .. }));
    }

    /// Story: valid, consistent certificates are left alone
    #[tokio::test]
    async fn story_valid_certificates_untouched() {
        let certs = WebhookCertificates::generate().unwrap();
        let ca = certs.ca_cert.clone();

        let mut store = MockCertificateStore::new();
        store
            .expect_read_certificates()
            .returning(move || Ok(Some(certs.clone())));
        store
            .expect_read_ca_bundle()
            .returning(move || Ok(Some(ca.clone())));
        store.expect_write_certificates().never();
        store.expect_write_ca_bundle().never();
        store.expect_restart_webhook().never();

        let outcome = reconcile(&store, &MockTelemetry::new()).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::UpToDate);
    }

    #[tokio::test]
    async fn test_bundle_mismatch_triggers_regeneration() {
        let certs = WebhookCertificates::generate().unwrap();

        let mut store = MockCertificateStore::new();
        store
            .expect_read_certificates()
            .returning(move || Ok(Some(certs.clone())));
        store
            .expect_read_ca_bundle()
            .returning(|| Ok(Some("stale".to_string())));
        store.expect_write_certificates().returning(|_| Ok(()));
        store.expect_write_ca_bundle().returning(|_| Ok(()));
        store.expect_restart_webhook().returning(|| Ok(()));

        let outcome = reconcile(&store, &quiet_telemetry()).await.unwrap();
        assert_eq!(
            outcome,
            ReconcileOutcome::Regenerated {
                reason: "webhook CA bundle does not match stored CA".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_failed_secret_write_stops_rollout() {
        let mut store = MockCertificateStore::new();
        store.expect_read_certificates().returning(|| Ok(None));
        store.expect_read_ca_bundle().returning(|| Ok(None));
        store
            .expect_write_certificates()
            .returning(|_| Err(Error::certificate("forbidden")));
        store.expect_write_ca_bundle().never();
        store.expect_restart_webhook().never();

        let mut telemetry = MockTelemetry::new();
        telemetry
            .expect_add_heartbeat_metric()
            .with(eq(HeartbeatMetric::SecretStoreUpdateFailedCount), eq(1.0))
            .times(1)
            .return_const(());

        assert!(reconcile(&store, &telemetry).await.is_err());
    }
}
