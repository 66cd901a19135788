//! Appmon webhook - application monitoring auto-instrumentation for Kubernetes

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum_server::tls_rustls::RustlsConfig;
use clap::{Args, Parser, Subcommand};
use kube::{Client, CustomResourceExt};

use appmon::certs::{reconcile, KubeCertificateStore, ReconcileOutcome};
use appmon::cleanup::{run_cleanup, KubeWorkloadClient};
use appmon::cluster::ClusterIdentity;
use appmon::crd::Instrumentation;
use appmon::store::{run_watcher, InstrumentationStore};
use appmon::telemetry::{init_tracing, HeartbeatTelemetry, Telemetry, TelemetryConfig};
use appmon::webhook::{webhook_router, Mutator, WebhookState};
use appmon::{DEFAULT_HEARTBEAT_INTERVAL_SECS, DEFAULT_WEBHOOK_PORT};

/// Appmon - mutating admission webhook injecting application monitoring
#[derive(Parser, Debug)]
#[command(name = "appmon-webhook", version, about, long_about = None)]
struct Cli {
    /// Generate the Instrumentation CRD manifest and exit
    #[arg(long)]
    crd: bool,

    /// Heartbeat flush interval in seconds
    #[arg(long, env = "HEARTBEAT_INTERVAL_SECS", default_value_t = DEFAULT_HEARTBEAT_INTERVAL_SECS)]
    heartbeat_interval_secs: u64,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Serve the admission webhook (default mode)
    Serve(ServeArgs),

    /// Create or rotate the webhook serving certificate
    ///
    /// Regenerates the CA and serving certificate when they are missing,
    /// invalid or close to expiry, updates the webhook CA bundle and
    /// restarts the webhook.
    Certs,

    /// Revert auto-instrumentation on every Deployment in the cluster
    Cleanup(ClusterArgs),
}

/// Identity of the hosting cluster
#[derive(Args, Debug)]
struct ClusterArgs {
    /// ARM resource id of the cluster
    #[arg(long, env = "CLUSTER_RESOURCE_ID")]
    arm_id: String,

    /// Azure region of the cluster
    #[arg(long, env = "CLUSTER_REGION")]
    arm_region: String,
}

impl ClusterArgs {
    fn identity(&self) -> anyhow::Result<ClusterIdentity> {
        ClusterIdentity::parse(&self.arm_id, &self.arm_region)
            .map_err(|e| anyhow::anyhow!("Invalid cluster identity: {}", e))
    }
}

/// Serve mode arguments
#[derive(Parser, Debug)]
struct ServeArgs {
    #[command(flatten)]
    cluster: ClusterArgs,

    /// Port of the HTTPS admission endpoint
    #[arg(long, env = "PORT", default_value_t = DEFAULT_WEBHOOK_PORT)]
    port: u16,

    /// Path to the serving certificate
    #[arg(long, env = "TLS_CERT_PATH", default_value = "/mnt/webhook/tls.cert")]
    tls_cert: PathBuf,

    /// Path to the serving private key
    #[arg(long, env = "TLS_KEY_PATH", default_value = "/mnt/webhook/tls.key")]
    tls_key: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: Failed to install crypto provider: {:?}", e);
        std::process::exit(1);
    }

    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&Instrumentation::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    init_tracing(TelemetryConfig::default())?;

    let heartbeat = Arc::new(HeartbeatTelemetry::default());
    let flush_loop = Arc::clone(&heartbeat)
        .spawn_flush_loop(Duration::from_secs(cli.heartbeat_interval_secs));

    let result = match cli.command {
        Some(Commands::Serve(args)) => run_serve(args, heartbeat.clone()).await,
        Some(Commands::Certs) => run_certs(heartbeat.clone()).await,
        Some(Commands::Cleanup(args)) => run_cleanup_job(args, heartbeat.clone()).await,
        None => {
            // bare invocation serves, reading everything from the environment
            let args = ServeArgs::try_parse_from(["serve"])
                .map_err(|e| anyhow::anyhow!("Missing serve configuration: {}", e))?;
            run_serve(args, heartbeat.clone()).await
        }
    };

    flush_loop.abort();
    heartbeat.flush();
    result
}

/// Run the admission webhook until the server stops
async fn run_serve(args: ServeArgs, heartbeat: Arc<HeartbeatTelemetry>) -> anyhow::Result<()> {
    let cluster = args.cluster.identity()?;
    tracing::info!(
        cluster = %cluster.cluster_name,
        region = %cluster.arm_region,
        "Starting admission webhook"
    );

    let telemetry: Arc<dyn Telemetry> = heartbeat;
    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    let store = Arc::new(InstrumentationStore::new());
    tokio::spawn(run_watcher(client, Arc::clone(&store), Arc::clone(&telemetry)));

    let mutator = Mutator::new(store, cluster, telemetry);
    let router = webhook_router(Arc::new(WebhookState::new(mutator)));

    let tls = RustlsConfig::from_pem_file(&args.tls_cert, &args.tls_key)
        .await
        .map_err(|e| {
            anyhow::anyhow!(
                "Failed to load TLS certificate {:?} / {:?}: {}",
                args.tls_cert,
                args.tls_key,
                e
            )
        })?;

    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    tracing::info!(%addr, "Admission webhook listening");
    axum_server::bind_rustls(addr, tls)
        .serve(router.into_make_service())
        .await
        .map_err(|e| anyhow::anyhow!("Webhook server failed: {}", e))
}

/// Create or rotate the webhook certificates once
async fn run_certs(heartbeat: Arc<HeartbeatTelemetry>) -> anyhow::Result<()> {
    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    let telemetry: Arc<dyn Telemetry> = heartbeat;
    let store = KubeCertificateStore::new(client, Arc::clone(&telemetry));

    match reconcile(&store, telemetry.as_ref()).await? {
        ReconcileOutcome::UpToDate => tracing::info!("Certificates up to date"),
        ReconcileOutcome::Regenerated { reason } => {
            tracing::info!(%reason, "Certificates regenerated")
        }
    }
    Ok(())
}

/// Revert every mutated Deployment once
async fn run_cleanup_job(args: ClusterArgs, heartbeat: Arc<HeartbeatTelemetry>) -> anyhow::Result<()> {
    let cluster = args.identity()?;
    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    let telemetry: Arc<dyn Telemetry> = heartbeat;
    let workloads = KubeWorkloadClient::new(client, Arc::clone(&telemetry));

    let patched = run_cleanup(&workloads, &cluster, telemetry.as_ref()).await?;
    tracing::info!(patched, "Cleanup complete");
    Ok(())
}
