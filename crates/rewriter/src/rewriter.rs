//! The per-kind dispatch at the heart of the rewriter.

use serde_json::Value;

use crate::admission::rewrite_admission_review;
use crate::crd::rewrite_crd;
use crate::discovery::{
    rewrite_api_group, rewrite_api_group_discovery_list, rewrite_api_group_list,
    rewrite_api_resource_list,
};
use crate::metadata::{rewrite_label_map, rewrite_metadata};
use crate::rbac::rewrite_role;
use crate::rules::{KindForm, RewriteRules};
use crate::webhookconf::{rewrite_admission_policy, rewrite_webhook_configuration};
use crate::workloads::rewrite_workload;
use crate::{Action, RewriteError};

const WORKLOAD_KINDS: &[&str] = &[
    "Pod",
    "DaemonSet",
    "StatefulSet",
    "Deployment",
    "Job",
    "PodDisruptionBudget",
    "ServiceMonitor",
];

/// Rewrites a whole payload. Returns `None` when the body is not JSON or
/// no rule applies, meaning the original bytes must pass through.
pub fn rewrite_payload(
    rules: &RewriteRules,
    action: Action,
    body: &[u8],
) -> Result<Option<Vec<u8>>, RewriteError> {
    let mut value: Value = match serde_json::from_slice(body) {
        Ok(value) => value,
        Err(_) => return Ok(None),
    };
    match rewrite_value(rules, action, &mut value)? {
        true => serde_json::to_vec(&value)
            .map(Some)
            .map_err(|err| RewriteError::Malformed(err.to_string())),
        false => Ok(None),
    }
}

/// Dispatches on `kind`, returning whether anything was rewritten.
pub fn rewrite_value(
    rules: &RewriteRules,
    action: Action,
    value: &mut Value,
) -> Result<bool, RewriteError> {
    let kind = match value.get("kind").and_then(Value::as_str) {
        Some(kind) => kind.to_string(),
        None => return Ok(false),
    };

    if let Some(base) = workload_kind(&kind) {
        if base == kind {
            rewrite_workload(rules, action, value);
        } else {
            rewrite_each_item(rules, action, value, |rules, action, item| {
                rewrite_workload(rules, action, item);
                Ok(())
            })?;
        }
        return Ok(true);
    }

    match kind.as_str() {
        "Service" => {
            rewrite_metadata(rules, action, value);
            if let Some(selector) = value
                .get_mut("spec")
                .and_then(|spec| spec.get_mut("selector"))
            {
                rewrite_label_map(rules, action, selector);
            }
            Ok(true)
        }
        "ServiceList" => {
            rewrite_each_item(rules, action, value, |rules, action, item| {
                rewrite_metadata(rules, action, item);
                if let Some(selector) = item
                    .get_mut("spec")
                    .and_then(|spec| spec.get_mut("selector"))
                {
                    rewrite_label_map(rules, action, selector);
                }
                Ok(())
            })?;
            Ok(true)
        }
        "PersistentVolumeClaim" => {
            rewrite_pvc(rules, action, value);
            Ok(true)
        }
        "PersistentVolumeClaimList" => {
            rewrite_each_item(rules, action, value, |rules, action, item| {
                rewrite_pvc(rules, action, item);
                Ok(())
            })?;
            Ok(true)
        }
        "Event" => {
            rewrite_event(rules, action, value);
            Ok(true)
        }
        "EventList" => {
            rewrite_each_item(rules, action, value, |rules, action, item| {
                rewrite_event(rules, action, item);
                Ok(())
            })?;
            Ok(true)
        }
        "ClusterRole" | "Role" => {
            rewrite_role(rules, action, value);
            Ok(true)
        }
        "ClusterRoleList" | "RoleList" => {
            rewrite_each_item(rules, action, value, |rules, action, item| {
                rewrite_role(rules, action, item);
                Ok(())
            })?;
            Ok(true)
        }
        "MutatingWebhookConfiguration" | "ValidatingWebhookConfiguration" => {
            rewrite_webhook_configuration(rules, action, value);
            Ok(true)
        }
        "MutatingWebhookConfigurationList" | "ValidatingWebhookConfigurationList" => {
            rewrite_each_item(rules, action, value, |rules, action, item| {
                rewrite_webhook_configuration(rules, action, item);
                Ok(())
            })?;
            Ok(true)
        }
        "ValidatingAdmissionPolicy" | "ValidatingAdmissionPolicyBinding" => {
            rewrite_admission_policy(rules, action, value);
            Ok(true)
        }
        "ValidatingAdmissionPolicyList" | "ValidatingAdmissionPolicyBindingList" => {
            rewrite_each_item(rules, action, value, |rules, action, item| {
                rewrite_admission_policy(rules, action, item);
                Ok(())
            })?;
            Ok(true)
        }
        "CustomResourceDefinition" => {
            rewrite_crd(rules, action, value)?;
            Ok(true)
        }
        "CustomResourceDefinitionList" => {
            rewrite_each_item(rules, action, value, |rules, action, item| {
                rewrite_crd(rules, action, item)
            })?;
            Ok(true)
        }
        "APIGroupList" => {
            rewrite_api_group_list(rules, action, value);
            Ok(true)
        }
        "APIGroup" => {
            rewrite_api_group(rules, action, value);
            Ok(true)
        }
        "APIResourceList" => {
            rewrite_api_resource_list(rules, action, value);
            Ok(true)
        }
        "APIGroupDiscoveryList" => {
            rewrite_api_group_discovery_list(rules, action, value);
            Ok(true)
        }
        "AdmissionReview" => {
            rewrite_admission_review(rules, value)?;
            Ok(true)
        }
        _ => rewrite_custom_resource(rules, action, value, &kind),
    }
}

fn workload_kind(kind: &str) -> Option<&str> {
    for base in WORKLOAD_KINDS {
        if kind == *base {
            return Some(base);
        }
        if let Some(stripped) = kind.strip_suffix("List") {
            if stripped == *base {
                return Some(base);
            }
        }
    }
    None
}

/// Custom resources of the managed group: apiVersion, kind, metadata, and
/// managedFields, recursing into list items.
fn rewrite_custom_resource(
    rules: &RewriteRules,
    action: Action,
    value: &mut Value,
    kind: &str,
) -> Result<bool, RewriteError> {
    let (group_rule, resource, form) = match rules.resource_by_kind(action, kind) {
        Some(found) => found,
        None => return Ok(false),
    };
    let target_kind = resource.kind_for(action, form).to_string();
    let target_group = group_rule.group_for(action).to_string();

    value["kind"] = Value::String(target_kind);
    if let Some(api_version) = value.get("apiVersion").and_then(Value::as_str) {
        if let Some((_, version)) = api_version.split_once('/') {
            value["apiVersion"] = Value::String(format!("{}/{}", target_group, version));
        }
    }

    match form {
        KindForm::Single => {
            rewrite_metadata(rules, action, value);
        }
        KindForm::List => {
            let item_kind = resource.kind_for(action, KindForm::Single).to_string();
            rewrite_each_item(rules, action, value, |rules, action, item| {
                if item.get("kind").and_then(Value::as_str).is_some() {
                    // Items usually omit kind; keep it aligned when set.
                    item["kind"] = Value::String(item_kind.clone());
                }
                if let Some(api_version) = item.get("apiVersion").and_then(Value::as_str) {
                    item["apiVersion"] =
                        Value::String(rules.rewrite_api_version(action, api_version));
                }
                rewrite_metadata(rules, action, item);
                Ok(())
            })?;
        }
    }
    Ok(true)
}

fn rewrite_pvc(rules: &RewriteRules, action: Action, value: &mut Value) {
    rewrite_metadata(rules, action, value);
    let spec = match value.get_mut("spec") {
        Some(spec) => spec,
        None => return,
    };
    for field in ["dataSource", "dataSourceRef"] {
        let source = match spec.get_mut(field) {
            Some(source) if source.is_object() => source,
            _ => continue,
        };
        if let Some(api_group) = source.get("apiGroup").and_then(Value::as_str) {
            source["apiGroup"] = Value::String(rules.rewrite_group(action, api_group));
        }
        if let Some(kind) = source.get("kind").and_then(Value::as_str) {
            if let Some((_, rule, form)) = rules.resource_by_kind(action, kind) {
                source["kind"] = Value::String(rule.kind_for(action, form).to_string());
            }
        }
    }
}

fn rewrite_event(rules: &RewriteRules, action: Action, value: &mut Value) {
    rewrite_metadata(rules, action, value);
    let involved = match value.get_mut("involvedObject") {
        Some(involved) if involved.is_object() => involved,
        _ => return,
    };
    if let Some(api_version) = involved.get("apiVersion").and_then(Value::as_str) {
        involved["apiVersion"] = Value::String(rules.rewrite_api_version(action, api_version));
    }
    if let Some(kind) = involved.get("kind").and_then(Value::as_str) {
        if let Some((_, rule, form)) = rules.resource_by_kind(action, kind) {
            involved["kind"] = Value::String(rule.kind_for(action, form).to_string());
        }
    }
}

/// Applies `f` to each list item, dropping items the rules skip.
fn rewrite_each_item(
    rules: &RewriteRules,
    action: Action,
    value: &mut Value,
    f: impl Fn(&RewriteRules, Action, &mut Value) -> Result<(), RewriteError>,
) -> Result<(), RewriteError> {
    let items = match value.get_mut("items").and_then(Value::as_array_mut) {
        Some(items) => items,
        None => return Ok(()),
    };
    let mut kept = Vec::with_capacity(items.len());
    for mut item in items.drain(..) {
        match f(rules, action, &mut item) {
            Ok(()) => kept.push(item),
            Err(RewriteError::SkipItem) => {}
            Err(err) => return Err(err),
        }
    }
    *items = kept;
    Ok(())
}
