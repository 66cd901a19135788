//! Configuration resolver
//!
//! Decides which Instrumentation resource governs a pod template and which
//! platforms it enables, from the template's `inject-*` annotations. A value
//! of `true`/`false` toggles the platform; any other value both enables the
//! platform and names the resource to use.

use std::collections::BTreeMap;

use serde_json::Value;

use super::{
    DEFAULT_INSTRUMENTATION_NAME, INJECT_DOTNET_ANNOTATION, INJECT_JAVA_ANNOTATION,
    INJECT_NODEJS_ANNOTATION,
};
use crate::crd::{Instrumentation, Platform};
use crate::{Error, Result};

/// Inject annotation per supported platform, in enumeration order
const INJECT_ANNOTATIONS: [(Platform, &str); 3] = [
    (Platform::DotNet, INJECT_DOTNET_ANNOTATION),
    (Platform::Java, INJECT_JAVA_ANNOTATION),
    (Platform::NodeJs, INJECT_NODEJS_ANNOTATION),
];

fn is_flag(value: &str) -> bool {
    value.eq_ignore_ascii_case("true") || value.eq_ignore_ascii_case("false")
}

/// String annotations on the workload's pod template
pub fn template_annotations(object: &Value) -> BTreeMap<String, String> {
    object
        .pointer("/spec/template/metadata/annotations")
        .and_then(Value::as_object)
        .map(|annotations| {
            annotations
                .iter()
                .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

/// Name of the Instrumentation resource governing a pod template
///
/// Fails when the inject annotations name more than one distinct resource.
pub fn resolve_cr_name(annotations: &BTreeMap<String, String>) -> Result<String> {
    let mut names: Vec<&str> = Vec::new();
    for (_, key) in INJECT_ANNOTATIONS {
        let Some(value) = annotations.get(key).map(String::as_str) else {
            continue;
        };
        if value.is_empty() || is_flag(value) {
            continue;
        }
        if !names.iter().any(|n| n.eq_ignore_ascii_case(value)) {
            names.push(value);
        }
    }

    match names.as_slice() {
        [] => Ok(DEFAULT_INSTRUMENTATION_NAME.to_string()),
        [name] => Ok(name.to_string()),
        _ => Err(Error::ConflictingConfigSelection(
            names.into_iter().map(str::to_string).collect(),
        )),
    }
}

/// Platforms to instrument for a pod template governed by `cr`
///
/// Without any inject annotation the resource's own platform list applies.
pub fn select_platforms(
    annotations: &BTreeMap<String, String>,
    cr: &Instrumentation,
) -> Vec<Platform> {
    let requested: Vec<(Platform, &str)> = INJECT_ANNOTATIONS
        .iter()
        .filter_map(|&(platform, key)| annotations.get(key).map(|v| (platform, v.as_str())))
        .filter(|(_, value)| !value.is_empty())
        .collect();

    if requested.is_empty() {
        return cr.spec.settings.auto_instrumentation_platforms.clone();
    }

    requested
        .into_iter()
        .filter(|(_, value)| !value.eq_ignore_ascii_case("false"))
        .map(|(platform, _)| platform)
        .collect()
}
