//! Supporting types for the Instrumentation CRD

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Application platforms that can be auto-instrumented
///
/// `OpenTelemetry` is accepted by the CRD schema so that resources written
/// against newer webhook versions still load, but the mutation catalog
/// refuses to generate anything for it.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
pub enum Platform {
    /// .NET (startup hooks + OpenTelemetry .NET auto-instrumentation)
    DotNet,
    /// Java (Application Insights Java agent)
    Java,
    /// Node.js (Application Insights Node.js distro via `--require`)
    NodeJs,
    /// Reserved, not implemented
    OpenTelemetry,
}

impl Platform {
    /// Every platform the mutation catalog can generate artifacts for, in
    /// the order artifacts are emitted
    pub const SUPPORTED: [Platform; 3] = [Platform::DotNet, Platform::Java, Platform::NodeJs];

    /// Canonical name as it appears in CRs and the instrumentation annotation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DotNet => "DotNet",
            Self::Java => "Java",
            Self::NodeJs => "NodeJs",
            Self::OpenTelemetry => "OpenTelemetry",
        }
    }
}

impl std::str::FromStr for Platform {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "dotnet" => Ok(Self::DotNet),
            "java" => Ok(Self::Java),
            "nodejs" => Ok(Self::NodeJs),
            "opentelemetry" => Ok(Self::OpenTelemetry),
            _ => Err(crate::Error::unsupported_platform("parse", s)),
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Log collection toggles carried by an Instrumentation resource
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LogCollectionSettings {
    /// Stop the injected agents from collecting application logs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disable_app_logs: Option<bool>,

    /// Exclude the pod's container logs from Container Insights collection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disable_container_logs: Option<bool>,
}

/// Instrumentation behaviour
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InstrumentationSettings {
    /// Platforms to instrument when a pod template does not choose explicitly
    #[serde(default)]
    pub auto_instrumentation_platforms: Vec<Platform>,

    /// Alternate registry path replacing the default agent image prefix
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_repository_path: Option<String>,

    /// Log collection toggles
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_collection_settings: Option<LogCollectionSettings>,
}

/// Where the injected agents send telemetry
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Destination {
    /// Application Insights connection string
    pub application_insights_connection_string: String,
}
