//! Identity of the cluster the webhook runs in
//!
//! The cluster is identified by its ARM resource id, e.g.
//! `/subscriptions/<sub>/resourceGroups/<rg>/providers/Microsoft.ContainerService/managedClusters/<name>`.
//! The id is parsed once at startup; a malformed id is fatal for the process.

use std::sync::LazyLock;

use regex::Regex;

use crate::{Error, Result};

/// ARM resource id, region and derived short name of the cluster
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClusterIdentity {
    /// Full ARM resource id
    pub arm_id: String,
    /// Azure region
    pub arm_region: String,
    /// Cluster short name (last segment of the resource id)
    pub cluster_name: String,
}

impl ClusterIdentity {
    /// Parse the cluster identity from an ARM resource id and region
    pub fn parse(arm_id: &str, arm_region: &str) -> Result<Self> {
        let cluster_name = cluster_name_from_arm_id(arm_id)?;
        Ok(Self {
            arm_id: arm_id.to_string(),
            arm_region: arm_region.to_string(),
            cluster_name,
        })
    }
}

/// `/subscriptions/<s>/resourceGroups/<rg>/providers/<p>/<type>/<name>[/...]`,
/// keywords case-insensitive
static ARM_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^/subscriptions/(?P<subscription>[^/]+)/resourceGroups/(?P<group>[^/]+)/providers/(?P<provider>[^/]+)/(?P<kind>[^/]+)/(?P<name>[^/]+).*$",
    )
    .expect("invalid ARM resource id pattern")
});

fn cluster_name_from_arm_id(arm_id: &str) -> Result<String> {
    ARM_ID
        .captures(arm_id)
        .and_then(|c| c.name("name"))
        .map(|name| name.as_str().to_string())
        .ok_or_else(|| Error::InvalidArmId(arm_id.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const AKS_ID: &str = "/subscriptions/66010356-d8a5-42d3-8593-6aaa3aeb1c11/resourceGroups/rambhatt-rnd-v2/providers/Microsoft.ContainerService/managedClusters/rambhatt-agent-v2";

    #[test]
    fn story_aks_resource_id_yields_cluster_name() {
        let identity = ClusterIdentity::parse(AKS_ID, "eastus").unwrap();
        assert_eq!(identity.cluster_name, "rambhatt-agent-v2");
        assert_eq!(identity.arm_region, "eastus");
        assert_eq!(identity.arm_id, AKS_ID);
    }

    #[test]
    fn test_keywords_are_case_insensitive_and_trailing_segments_ignored() {
        let id = "/SUBSCRIPTIONS/s/resourcegroups/rg/PROVIDERS/p/t/my-cluster/extra/parts";
        let identity = ClusterIdentity::parse(id, "westus").unwrap();
        assert_eq!(identity.cluster_name, "my-cluster");
    }

    #[rstest]
    #[case::empty("")]
    #[case::no_leading_slash("subscriptions/s/resourceGroups/rg/providers/p/t/name")]
    #[case::missing_name("/subscriptions/s/resourceGroups/rg/providers/p/t")]
    #[case::empty_name("/subscriptions/s/resourceGroups/rg/providers/p/t/")]
    #[case::wrong_keyword("/subscription/s/resourceGroups/rg/providers/p/t/name")]
    #[case::empty_segment("/subscriptions//resourceGroups/rg/providers/p/t/name")]
    #[case::wrong_provider_keyword("/subscriptions/s/resourceGroups/rg/provider/p/t/name")]
    fn test_malformed_ids_rejected(#[case] id: &str) {
        let err = ClusterIdentity::parse(id, "eastus").unwrap_err();
        assert!(matches!(err, Error::InvalidArmId(ref v) if v == id));
    }
}
