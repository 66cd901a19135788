//! Patch/unpatch engine
//!
//! Every call first strips whatever an earlier mutation injected, then, when
//! an Instrumentation resource applies, injects the catalog fragments for the
//! requested platforms. The result is emitted as a JSON Patch that replaces
//! the whole object, preceded by operations that set or clear the
//! instrumentation state annotation.
//!
//! The engine is pure: identical inputs always produce identical patches.
//!
//! Invariants relied on by unpatch:
//! - A backup env var sits immediately before its primary.
//! - Every mutated container carries the mutation marker env var.
//! - Lists emptied by unpatch are dropped, so an object that had no `env`
//!   (or no volumes, init containers, annotations) before patching has none
//!   after unpatching.

use std::collections::HashSet;

use json_patch::{AddOperation, Patch, PatchOperation, RemoveOperation, ReplaceOperation};
use jsonptr::PointerBuf;
use k8s_openapi::api::core::v1::EnvVar;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use super::catalog::{
    environment_variable_names, generate_environment_variables, generate_init_containers,
    generate_volume_mounts, generate_volumes,
};
use super::{
    backup_env_name, PodInfo, INSTRUMENTATION_ANNOTATION, LOGS_EXCLUSION_ANNOTATION,
    LOGS_EXCLUSION_BACKUP_ANNOTATION, MUTATION_MARKER_ENV,
};
use crate::cluster::ClusterIdentity;
use crate::crd::{Instrumentation, Platform};
use crate::{Error, Result};

type Object = Map<String, Value>;

/// Value of the instrumentation state annotation
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstrumentationState {
    /// Name of the governing Instrumentation resource
    pub cr_name: String,
    /// Resource version of that resource when the mutation was computed
    pub cr_resource_version: String,
    /// Platforms injected
    pub platforms: Vec<Platform>,
}

impl InstrumentationState {
    /// Parse the state annotation of a workload object, if present and well formed
    pub fn from_object(object: &Value) -> Option<Self> {
        object
            .pointer("/spec/template/metadata/annotations")
            .and_then(|a| a.get(INSTRUMENTATION_ANNOTATION))
            .and_then(Value::as_str)
            .and_then(|s| serde_json::from_str(s).ok())
    }
}

/// Compute the JSON Patch that brings `object` to its mutated (or unmutated) form
///
/// With `cr` set and `platforms` non-empty the patch injects the catalog
/// fragments for `platforms`; otherwise it only removes earlier mutations.
pub fn patch_object(
    object: &Value,
    cr: Option<&Instrumentation>,
    pod_info: &PodInfo,
    platforms: &[Platform],
    cluster: &ClusterIdentity,
) -> Result<Patch> {
    let mut mutated = object.clone();
    let state = mutate_object(&mut mutated, cr, pod_info, platforms, cluster)?;

    let mut ops = missing_annotation_parents(object);
    let state_path = PointerBuf::from_tokens([
        "spec",
        "template",
        "metadata",
        "annotations",
        INSTRUMENTATION_ANNOTATION,
    ]);

    match state {
        Some(state) => ops.push(PatchOperation::Add(AddOperation {
            path: state_path,
            value: Value::String(serde_json::to_string(&state)?),
        })),
        None => {
            // add first so the remove never targets a missing key
            ops.push(PatchOperation::Add(AddOperation {
                path: state_path.clone(),
                value: Value::String(String::new()),
            }));
            ops.push(PatchOperation::Remove(RemoveOperation { path: state_path }));
        }
    }

    ops.push(PatchOperation::Replace(ReplaceOperation {
        path: PointerBuf::new(),
        value: mutated,
    }));

    Ok(Patch(ops))
}

/// Unpatch and then patch `object` in place
///
/// Returns the state recorded in the instrumentation annotation, or `None`
/// when the object was only unpatched.
pub fn mutate_object(
    object: &mut Value,
    cr: Option<&Instrumentation>,
    pod_info: &PodInfo,
    platforms: &[Platform],
    cluster: &ClusterIdentity,
) -> Result<Option<InstrumentationState>> {
    validate_structure(object)?;

    unpatch(object)?;

    match cr {
        Some(cr) if !platforms.is_empty() => {
            let state = InstrumentationState {
                cr_name: cr.cr_name(),
                cr_resource_version: cr.cr_resource_version(),
                platforms: platforms.to_vec(),
            };
            patch(object, cr, &state, pod_info, cluster)?;
            Ok(Some(state))
        }
        _ => Ok(None),
    }
}

/// Whether any container of the workload carries the mutation marker
pub fn is_mutated(object: &Value) -> bool {
    containers(object)
        .iter()
        .any(|c| env_position(c.get("env"), MUTATION_MARKER_ENV).is_some())
}

fn validate_structure(object: &Value) -> Result<()> {
    let spec = object
        .get("spec")
        .filter(|v| v.is_object())
        .ok_or_else(|| Error::malformed("object has no spec"))?;
    let template = spec
        .get("template")
        .filter(|v| v.is_object())
        .ok_or_else(|| Error::malformed("spec has no template"))?;
    let pod_spec = template
        .get("spec")
        .filter(|v| v.is_object())
        .ok_or_else(|| Error::malformed("template has no spec"))?;

    match pod_spec.get("containers") {
        None | Some(Value::Array(_)) => Ok(()),
        Some(_) => Err(Error::malformed("template containers is not a list")),
    }
}

// =============================================================================
// Unpatch
// =============================================================================

fn unpatch(object: &mut Value) -> Result<()> {
    let was_mutated = is_mutated(object);

    unpatch_annotations(object, was_mutated);

    let all = Platform::SUPPORTED;
    let init_container_names = names_of(&generate_init_containers(&all, None)?, |c| &c.name);
    let volume_names = names_of(&generate_volumes(&all)?, |v| &v.name);
    let mount_names = names_of(&generate_volume_mounts(&all)?, |m| &m.name);
    let env_names = environment_variable_names(&all)?;

    let pod_spec = pod_spec_mut(object)?;
    drop_named(pod_spec, "initContainers", &init_container_names);
    drop_named(pod_spec, "volumes", &volume_names);

    let Some(Value::Array(containers)) = pod_spec.get_mut("containers") else {
        return Ok(());
    };
    for container in containers.iter_mut().filter_map(Value::as_object_mut) {
        if let Some(Value::Array(env)) = container.get_mut("env") {
            let before = env.len();
            for var in &env_names {
                unpatch_env_var(env, var, was_mutated);
            }
            env.retain(|e| name(e) != Some(MUTATION_MARKER_ENV));
            if env.is_empty() && before > 0 {
                container.remove("env");
            }
        }
        drop_named(container, "volumeMounts", &mount_names);
    }

    Ok(())
}

fn unpatch_annotations(object: &mut Value, was_mutated: bool) {
    let Some(metadata) = object
        .pointer_mut("/spec/template/metadata")
        .and_then(Value::as_object_mut)
    else {
        return;
    };
    let Some(annotations) = metadata.get_mut("annotations").and_then(Value::as_object_mut) else {
        return;
    };

    let mut removed = annotations.remove(INSTRUMENTATION_ANNOTATION).is_some();
    if was_mutated {
        removed |= annotations.remove(LOGS_EXCLUSION_ANNOTATION).is_some();
        if let Some(original) = annotations.remove(LOGS_EXCLUSION_BACKUP_ANNOTATION) {
            annotations.insert(LOGS_EXCLUSION_ANNOTATION.to_string(), original);
        }
    }

    if removed && annotations.is_empty() {
        metadata.remove("annotations");
        if metadata.is_empty() {
            if let Some(template) = object.pointer_mut("/spec/template").and_then(Value::as_object_mut) {
                template.remove("metadata");
            }
        }
    }
}

/// Restore or remove one catalog env var
fn unpatch_env_var(env: &mut Vec<Value>, var: &str, was_mutated: bool) {
    let Some(primary) = position(env, var) else {
        return;
    };

    let backup = backup_env_name(var);
    if let Some(b) = position(env, &backup) {
        let mut restored = env.remove(b);
        if let Some(entry) = restored.as_object_mut() {
            entry.insert("name".to_string(), Value::String(var.to_string()));
        }
        let primary = if b < primary { primary - 1 } else { primary };
        env[primary] = restored;
        debug!(env = var, "restored customer value from backup");
    } else if was_mutated {
        env.remove(primary);
    }
}

// =============================================================================
// Patch
// =============================================================================

fn patch(
    object: &mut Value,
    cr: &Instrumentation,
    state: &InstrumentationState,
    pod_info: &PodInfo,
    cluster: &ClusterIdentity,
) -> Result<()> {
    let platforms = &state.platforms;

    let init_containers = to_values(&generate_init_containers(
        platforms,
        cr.image_repository_path(),
    )?)?;
    let volumes = to_values(&generate_volumes(platforms)?)?;
    let mounts = to_values(&generate_volume_mounts(platforms)?)?;
    let env = generate_environment_variables(
        pod_info,
        platforms,
        cr.app_logs_enabled(),
        cr.connection_string(),
        cluster,
    )?;
    let marker = serde_json::to_value(EnvVar {
        name: MUTATION_MARKER_ENV.to_string(),
        value: Some(String::new()),
        value_from: None,
    })?;

    // catalog names this mutation leaves alone still need a backup, or the
    // next unpatch would take the customer's value for an injected one
    let injected: HashSet<&str> = env.iter().map(|e| e.name.as_str()).collect();
    let untouched: Vec<String> = environment_variable_names(&Platform::SUPPORTED)?
        .into_iter()
        .filter(|n| !injected.contains(n.as_str()))
        .collect();

    patch_annotations(object, cr, state)?;

    let pod_spec = pod_spec_mut(object)?;
    child_array(pod_spec, "volumes")?.extend(volumes);
    child_array(pod_spec, "initContainers")?.extend(init_containers);

    let Some(Value::Array(containers)) = pod_spec.get_mut("containers") else {
        return Ok(());
    };
    for container in containers.iter_mut() {
        let container = container
            .as_object_mut()
            .ok_or_else(|| Error::malformed("container is not an object"))?;

        let container_env = child_array(container, "env")?;
        for var in &env {
            patch_env_var(container_env, &var.name, serde_json::to_value(var)?);
        }
        for var in &untouched {
            preserve_env_var(container_env, var);
        }
        if position(container_env, MUTATION_MARKER_ENV).is_none() {
            container_env.push(marker.clone());
        }

        child_array(container, "volumeMounts")?.extend(mounts.iter().cloned());
    }

    Ok(())
}

fn patch_annotations(
    object: &mut Value,
    cr: &Instrumentation,
    state: &InstrumentationState,
) -> Result<()> {
    let template = object
        .pointer_mut("/spec/template")
        .and_then(Value::as_object_mut)
        .ok_or_else(|| Error::malformed("spec has no template"))?;
    let annotations = child_object(child_object(template, "metadata")?, "annotations")?;

    if let Some(current) = annotations.get(LOGS_EXCLUSION_ANNOTATION).cloned() {
        annotations
            .entry(LOGS_EXCLUSION_BACKUP_ANNOTATION)
            .or_insert(current);
    }
    if let Some(disabled) = cr.container_logs_disabled() {
        annotations.insert(
            LOGS_EXCLUSION_ANNOTATION.to_string(),
            Value::String(disabled.to_string()),
        );
    }

    annotations.insert(
        INSTRUMENTATION_ANNOTATION.to_string(),
        Value::String(serde_json::to_string(state)?),
    );
    Ok(())
}

/// Set one catalog env var, backing up a customer value it overwrites
fn patch_env_var(env: &mut Vec<Value>, var: &str, value: Value) {
    if position(env, var).is_none() {
        env.push(value);
        return;
    }

    let backup = backup_env_name(var);
    env.retain(|e| name(e) != Some(backup.as_str()));

    if let Some(primary) = position(env, var) {
        let mut original = std::mem::replace(&mut env[primary], value);
        if let Some(entry) = original.as_object_mut() {
            entry.insert("name".to_string(), Value::String(backup));
        }
        env.insert(primary, original);
    }
}

/// Back up a catalog env var in place, keeping its value
fn preserve_env_var(env: &mut Vec<Value>, var: &str) {
    let Some(primary) = position(env, var) else {
        return;
    };

    let backup = backup_env_name(var);
    if position(env, &backup).is_some() {
        return;
    }

    let mut copy = env[primary].clone();
    if let Some(entry) = copy.as_object_mut() {
        entry.insert("name".to_string(), Value::String(backup));
    }
    env.insert(primary, copy);
}

// =============================================================================
// Assembly
// =============================================================================

/// `add` operations creating the template metadata/annotations the state
/// annotation operation needs
fn missing_annotation_parents(object: &Value) -> Vec<PatchOperation> {
    let add_empty = |tokens: &[&str]| {
        PatchOperation::Add(AddOperation {
            path: PointerBuf::from_tokens(tokens.iter().copied()),
            value: Value::Object(Object::new()),
        })
    };

    match object.pointer("/spec/template/metadata") {
        None => vec![
            add_empty(&["spec", "template", "metadata"]),
            add_empty(&["spec", "template", "metadata", "annotations"]),
        ],
        Some(metadata) if metadata.get("annotations").is_none() => {
            vec![add_empty(&["spec", "template", "metadata", "annotations"])]
        }
        Some(_) => Vec::new(),
    }
}

// =============================================================================
// JSON helpers
// =============================================================================

fn containers(object: &Value) -> &[Value] {
    object
        .pointer("/spec/template/spec/containers")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
}

fn pod_spec_mut(object: &mut Value) -> Result<&mut Object> {
    object
        .pointer_mut("/spec/template/spec")
        .and_then(Value::as_object_mut)
        .ok_or_else(|| Error::malformed("template has no spec"))
}

fn child_object<'a>(parent: &'a mut Object, key: &str) -> Result<&'a mut Object> {
    parent
        .entry(key)
        .or_insert_with(|| Value::Object(Object::new()))
        .as_object_mut()
        .ok_or_else(|| Error::malformed(format!("{key} is not an object")))
}

fn child_array<'a>(parent: &'a mut Object, key: &str) -> Result<&'a mut Vec<Value>> {
    parent
        .entry(key)
        .or_insert_with(|| Value::Array(Vec::new()))
        .as_array_mut()
        .ok_or_else(|| Error::malformed(format!("{key} is not a list")))
}

fn name(entry: &Value) -> Option<&str> {
    entry.get("name").and_then(Value::as_str)
}

fn position(list: &[Value], wanted: &str) -> Option<usize> {
    list.iter().position(|e| name(e) == Some(wanted))
}

fn env_position(env: Option<&Value>, wanted: &str) -> Option<usize> {
    env.and_then(Value::as_array)
        .and_then(|env| position(env, wanted))
}

fn names_of<T>(items: &[T], name: impl Fn(&T) -> &String) -> HashSet<String> {
    items.iter().map(|i| name(i).clone()).collect()
}

fn to_values<T: Serialize>(items: &[T]) -> Result<Vec<Value>> {
    items
        .iter()
        .map(|i| serde_json::to_value(i).map_err(Error::from))
        .collect()
}

/// Remove named entries from `parent[key]`, dropping the list if that empties it
fn drop_named(parent: &mut Object, key: &str, names: &HashSet<String>) {
    let Some(Value::Array(items)) = parent.get_mut(key) else {
        return;
    };
    let before = items.len();
    items.retain(|item| !name(item).is_some_and(|n| names.contains(n)));
    if items.is_empty() && before > 0 {
        parent.remove(key);
    }
}
