//! Mutation catalog
//!
//! Pure functions mapping a platform list and context to the Kubernetes
//! fragments injected into a pod template. Every fragment is identified by
//! its name; names are stable and disjoint across platforms, which is what
//! lets the patcher find and remove them later without any other record.
//!
//! Env var names are the exception: they are dictated by the agents and can
//! collide with variables the customer already defines.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Container, EmptyDirVolumeSource, EnvVar, EnvVarSource, ObjectFieldSelector,
    ResourceRequirements, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

use crate::cluster::ClusterIdentity;
use crate::crd::Platform;
use crate::mutation::PodInfo;
use crate::{Error, Result};

/// Registry path agent images are pulled from unless overridden
pub const DEFAULT_IMAGE_PREFIX: &str = "mcr.microsoft.com/applicationinsights";

/// Shared volume the agents write their own logs to
pub const LOGS_VOLUME: &str = "azure-monitor-auto-instrumentation-volume-logs";

/// Hardcoded in the Java and Node.js agents, cannot change
pub const LOGS_MOUNT_PATH: &str = "/var/log/applicationinsights";

/// Env var carrying the Application Insights connection string
pub const CONNECTION_STRING_ENV: &str = "APPLICATIONINSIGHTS_CONNECTION_STRING";

/// Env var carrying OpenTelemetry resource attributes
pub const RESOURCE_ATTRIBUTES_ENV: &str = "OTEL_RESOURCE_ATTRIBUTES";

/// Per-platform agent layout
struct Agent {
    init_container: &'static str,
    repository: &'static str,
    tag: &'static str,
    /// Path inside the agent image copied into the volume
    source_path: &'static str,
    volume: &'static str,
    /// Where the application runtime loads the agent from
    mount_path: &'static str,
}

const DOTNET_AGENT: Agent = Agent {
    init_container: "azure-monitor-auto-instrumentation-dotnet",
    repository: "opentelemetry-auto-instrumentation/dotnet",
    tag: "1.0.0-rc.2",
    source_path: "/dotnet-tracer-home/.",
    volume: "azure-monitor-auto-instrumentation-volume-dotnet",
    mount_path: "/azure-monitor-auto-instrumentation-dotnet",
};

const JAVA_AGENT: Agent = Agent {
    init_container: "azure-monitor-auto-instrumentation-java",
    repository: "auto-instrumentation/java",
    tag: "3.5.2-aks",
    source_path: "/agents/java/.",
    volume: "azure-monitor-auto-instrumentation-volume-java",
    mount_path: "/azure-monitor-auto-instrumentation-java",
};

const NODEJS_AGENT: Agent = Agent {
    init_container: "azure-monitor-auto-instrumentation-nodejs",
    repository: "opentelemetry-auto-instrumentation/nodejs",
    tag: "3.1.0",
    source_path: "/agents/nodejs/.",
    volume: "azure-monitor-auto-instrumentation-volume-nodejs",
    mount_path: "/azure-monitor-auto-instrumentation-nodejs",
};

fn agent(platform: Platform, function: &'static str) -> Result<&'static Agent> {
    match platform {
        Platform::DotNet => Ok(&DOTNET_AGENT),
        Platform::Java => Ok(&JAVA_AGENT),
        Platform::NodeJs => Ok(&NODEJS_AGENT),
        Platform::OpenTelemetry => Err(Error::unsupported_platform(function, platform)),
    }
}

fn quantities(cpu: &str, memory: &str) -> BTreeMap<String, Quantity> {
    BTreeMap::from([
        ("cpu".to_string(), Quantity(cpu.to_string())),
        ("memory".to_string(), Quantity(memory.to_string())),
    ])
}

/// Init containers copying agent binaries into each platform's volume
///
/// `image_repository_path` replaces [`DEFAULT_IMAGE_PREFIX`]; trailing
/// slashes on it are ignored.
pub fn generate_init_containers(
    platforms: &[Platform],
    image_repository_path: Option<&str>,
) -> Result<Vec<Container>> {
    let prefix = image_repository_path
        .map(|p| p.trim_end_matches('/'))
        .filter(|p| !p.is_empty())
        .unwrap_or(DEFAULT_IMAGE_PREFIX);

    platforms
        .iter()
        .map(|&platform| {
            let agent = agent(platform, "init_containers")?;
            Ok(Container {
                name: agent.init_container.to_string(),
                image: Some(format!("{prefix}/{}:{}", agent.repository, agent.tag)),
                // cp -a <source> <destination>
                command: Some(vec!["cp".to_string()]),
                args: Some(vec![
                    "-a".to_string(),
                    agent.source_path.to_string(),
                    agent.mount_path.to_string(),
                ]),
                volume_mounts: Some(vec![VolumeMount {
                    name: agent.volume.to_string(),
                    mount_path: agent.mount_path.to_string(),
                    ..Default::default()
                }]),
                resources: Some(ResourceRequirements {
                    requests: Some(quantities("100m", "128Mi")),
                    limits: Some(quantities("2", "1Gi")),
                    ..Default::default()
                }),
                ..Default::default()
            })
        })
        .collect()
}

/// Agent volumes plus one shared logs volume when any platform is active
pub fn generate_volumes(platforms: &[Platform]) -> Result<Vec<Volume>> {
    let empty_dir = |name: &str| Volume {
        name: name.to_string(),
        empty_dir: Some(EmptyDirVolumeSource::default()),
        ..Default::default()
    };

    let mut volumes = platforms
        .iter()
        .map(|&platform| Ok(empty_dir(agent(platform, "volumes")?.volume)))
        .collect::<Result<Vec<_>>>()?;

    if !volumes.is_empty() {
        volumes.push(empty_dir(LOGS_VOLUME));
    }

    Ok(volumes)
}

/// Mounts for the agent volumes plus the shared logs mount
pub fn generate_volume_mounts(platforms: &[Platform]) -> Result<Vec<VolumeMount>> {
    let mount = |name: &str, path: &str| VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        ..Default::default()
    };

    let mut mounts = platforms
        .iter()
        .map(|&platform| {
            let agent = agent(platform, "volume_mounts")?;
            Ok(mount(agent.volume, agent.mount_path))
        })
        .collect::<Result<Vec<_>>>()?;

    if !mounts.is_empty() {
        mounts.push(mount(LOGS_VOLUME, LOGS_MOUNT_PATH));
    }

    Ok(mounts)
}

fn value_env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        value_from: None,
    }
}

fn field_ref_env(name: &str, field_path: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: None,
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: field_path.to_string(),
                api_version: None,
            }),
            ..Default::default()
        }),
    }
}

/// `OTEL_RESOURCE_ATTRIBUTES` value; components whose source is unknown are left out
fn resource_attributes(pod_info: &PodInfo, cluster: &ClusterIdentity) -> String {
    let non_empty = |s: &str| (!s.is_empty()).then(|| s.to_string());
    let owner_kind = pod_info.owner_kind.as_deref();

    let components = [
        non_empty(&cluster.arm_id).map(|v| format!("cloud.resource_id={v}")),
        non_empty(&cluster.arm_region).map(|v| format!("cloud.region={v}")),
        non_empty(&cluster.cluster_name).map(|v| format!("k8s.cluster.name={v}")),
        Some("k8s.namespace.name=$(POD_NAMESPACE)".to_string()),
        Some("k8s.node.name=$(NODE_NAME)".to_string()),
        Some("k8s.pod.name=$(POD_NAME)".to_string()),
        Some("k8s.pod.uid=$(POD_UID)".to_string()),
        pod_info
            .only_container_name
            .as_ref()
            .map(|v| format!("k8s.container.name={v}")),
        Some("cloud.provider=Azure".to_string()),
        Some("cloud.platform=azure_aks".to_string()),
        owner_kind
            .zip(pod_info.owner_name.as_deref())
            .map(|(kind, name)| format!("k8s.{kind}.name={name}")),
        owner_kind
            .zip(pod_info.owner_uid.as_deref())
            .map(|(kind, uid)| format!("k8s.{kind}.uid={uid}")),
    ];

    components.into_iter().flatten().collect::<Vec<_>>().join(",")
}

/// Env vars configuring the agents
///
/// The Downward API variables come first because later values reference
/// them through `$(VAR)` substitution, which only sees earlier entries.
pub fn generate_environment_variables(
    pod_info: &PodInfo,
    platforms: &[Platform],
    app_logs_enabled: bool,
    connection_string: &str,
    cluster: &ClusterIdentity,
) -> Result<Vec<EnvVar>> {
    let mut env = vec![
        field_ref_env("NODE_NAME", "spec.nodeName"),
        field_ref_env("POD_NAMESPACE", "metadata.namespace"),
        field_ref_env("POD_NAME", "metadata.name"),
        field_ref_env("POD_UID", "metadata.uid"),
        value_env(
            RESOURCE_ATTRIBUTES_ENV,
            resource_attributes(pod_info, cluster),
        ),
        value_env(
            "AKS_ARM_NAMESPACE_ID",
            format!("{}/$(POD_NAMESPACE)", cluster.arm_id),
        ),
        value_env(CONNECTION_STRING_ENV, connection_string),
    ];

    for &platform in platforms {
        env.extend(platform_environment_variables(platform, app_logs_enabled)?);
    }

    Ok(env)
}

/// Agent loader variables, plus the logging switch when app logs are disabled
fn platform_environment_variables(
    platform: Platform,
    app_logs_enabled: bool,
) -> Result<Vec<EnvVar>> {
    let (mut env, logs_off) = match platform {
        Platform::DotNet => (
            vec![
                value_env("OTEL_DOTNET_AUTO_LOG_DIRECTORY", LOGS_MOUNT_PATH),
                value_env(
                    "DOTNET_STARTUP_HOOKS",
                    format!(
                        "{}/net/OpenTelemetry.AutoInstrumentation.StartupHook.dll",
                        DOTNET_AGENT.mount_path
                    ),
                ),
                value_env(
                    "ASPNETCORE_HOSTINGSTARTUPASSEMBLIES",
                    "OpenTelemetry.AutoInstrumentation.AspNetCoreBootstrapper",
                ),
                value_env(
                    "DOTNET_ADDITIONAL_DEPS",
                    format!("{}/AdditionalDeps", DOTNET_AGENT.mount_path),
                ),
                value_env(
                    "DOTNET_SHARED_STORE",
                    format!("{}/store", DOTNET_AGENT.mount_path),
                ),
                value_env(
                    "OTEL_DOTNET_AUTO_HOME",
                    format!("{}/", DOTNET_AGENT.mount_path),
                ),
                value_env(
                    "OTEL_DOTNET_AUTO_PLUGINS",
                    "Azure.Monitor.OpenTelemetry.AutoInstrumentation.AzureMonitorPlugin, Azure.Monitor.OpenTelemetry.AutoInstrumentation, Version=1.0.0.0, Culture=neutral, PublicKeyToken=null",
                ),
            ],
            value_env("OTEL_DOTNET_AUTO_LOGS_ENABLED", "false"),
        ),
        Platform::Java => (
            vec![value_env(
                "JAVA_TOOL_OPTIONS",
                format!(
                    "-javaagent:{}/applicationinsights-agent-codeless.jar",
                    JAVA_AGENT.mount_path
                ),
            )],
            value_env("APPLICATIONINSIGHTS_INSTRUMENTATION_LOGGING_ENABLED", "false"),
        ),
        Platform::NodeJs => {
            let off = serde_json::json!({ "enabled": false });
            let configuration = serde_json::json!({
                "instrumentationOptions": {
                    "console": off,
                    "bunyan": off,
                    "winston": off,
                }
            });
            (
                vec![value_env(
                    "NODE_OPTIONS",
                    format!("--require {}/aks.js", NODEJS_AGENT.mount_path),
                )],
                value_env(
                    "APPLICATIONINSIGHTS_CONFIGURATION_CONTENT",
                    configuration.to_string(),
                ),
            )
        }
        Platform::OpenTelemetry => return Err(Error::unsupported_platform("env", platform)),
    };

    // agents log by default; the switch only ever turns logging off
    if !app_logs_enabled {
        env.push(logs_off);
    }

    Ok(env)
}

/// Names of every env var [`generate_environment_variables`] can emit for `platforms`
///
/// Includes the logging switches, which are only emitted when app logs are
/// disabled, so unpatch finds them whatever the settings were.
pub fn environment_variable_names(platforms: &[Platform]) -> Result<Vec<String>> {
    let env = generate_environment_variables(
        &PodInfo::default(),
        platforms,
        false,
        "",
        &ClusterIdentity::default(),
    )?;
    Ok(env.into_iter().map(|e| e.name).collect())
}
