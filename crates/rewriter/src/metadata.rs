//! Metadata surgery shared by every object rewrite: labels, annotations,
//! finalizers, owner references, and label-selector structures.

use serde_json::{Map, Value};

use crate::rules::{rewrite_metadata_key, RewriteRules};
use crate::Action;

/// Rewrites `metadata.{labels,annotations,finalizers,ownerReferences}` in
/// place; absent blocks are left alone.
pub fn rewrite_metadata(rules: &RewriteRules, action: Action, obj: &mut Value) {
    let metadata = match obj.get_mut("metadata") {
        Some(metadata) if metadata.is_object() => metadata,
        _ => return,
    };
    if let Some(labels) = metadata.get_mut("labels") {
        rewrite_label_map(rules, action, labels);
    }
    if let Some(annotations) = metadata.get_mut("annotations") {
        rewrite_annotation_map(rules, action, annotations);
    }
    if let Some(finalizers) = metadata.get_mut("finalizers") {
        rewrite_finalizers(rules, action, finalizers);
    }
    if let Some(owners) = metadata.get_mut("ownerReferences") {
        rewrite_owner_references(rules, action, owners);
    }
    if let Some(fields) = metadata
        .get_mut("managedFields")
        .and_then(Value::as_array_mut)
    {
        for entry in fields {
            if let Some(api_version) = entry.get("apiVersion").and_then(Value::as_str) {
                let rewritten = rules.rewrite_api_version(action, api_version);
                entry["apiVersion"] = Value::String(rewritten);
            }
        }
    }
}

/// Rewrites the keys of a `{label: value}` map. Values are untouched;
/// ordering is re-established by the map itself (sorted for object maps).
pub fn rewrite_label_map(rules: &RewriteRules, action: Action, value: &mut Value) {
    rewrite_map_keys(&rules.labels, &rules.preserved_prefix, action, value)
}

pub fn rewrite_annotation_map(rules: &RewriteRules, action: Action, value: &mut Value) {
    rewrite_map_keys(&rules.annotations, &rules.preserved_prefix, action, value)
}

fn rewrite_map_keys(
    meta_rules: &crate::rules::MetadataRules,
    preserved_prefix: &str,
    action: Action,
    value: &mut Value,
) {
    let map = match value.as_object_mut() {
        Some(map) => map,
        None => return,
    };
    let mut rewritten = Map::new();
    for (key, entry) in std::mem::take(map) {
        let key = rewrite_metadata_key(meta_rules, preserved_prefix, action, &key);
        rewritten.insert(key, entry);
    }
    *map = rewritten;
}

/// Rewrites finalizer strings in place.
pub fn rewrite_finalizers(rules: &RewriteRules, action: Action, value: &mut Value) {
    let list = match value.as_array_mut() {
        Some(list) => list,
        None => return,
    };
    for entry in list {
        if let Some(finalizer) = entry.as_str() {
            *entry = Value::String(rewrite_metadata_key(
                &rules.finalizers,
                &rules.preserved_prefix,
                action,
                finalizer,
            ));
        }
    }
}

/// Rewrites `ownerReferences[*].{apiVersion,kind}` for owners covered by a
/// resource rule.
pub fn rewrite_owner_references(rules: &RewriteRules, action: Action, value: &mut Value) {
    let list = match value.as_array_mut() {
        Some(list) => list,
        None => return,
    };
    for owner in list {
        let kind = owner.get("kind").and_then(Value::as_str).unwrap_or("");
        if let Some((_, resource, form)) = rules.resource_by_kind(action, kind) {
            owner["kind"] = Value::String(resource.kind_for(action, form).to_string());
        }
        if let Some(api_version) = owner.get("apiVersion").and_then(Value::as_str) {
            owner["apiVersion"] = Value::String(rules.rewrite_api_version(action, api_version));
        }
    }
}

/// Rewrites a `LabelSelector` value: `matchLabels` keys and
/// `matchExpressions[*].key`.
pub fn rewrite_label_selector(rules: &RewriteRules, action: Action, value: &mut Value) {
    if let Some(match_labels) = value.get_mut("matchLabels") {
        rewrite_label_map(rules, action, match_labels);
    }
    rewrite_match_expressions(rules, action, value.get_mut("matchExpressions"));
}

/// Rewrites the `key` of each `{key, operator, values}` expression.
pub fn rewrite_match_expressions(
    rules: &RewriteRules,
    action: Action,
    value: Option<&mut Value>,
) {
    let list = match value.and_then(Value::as_array_mut) {
        Some(list) => list,
        None => return,
    };
    for expr in list {
        if let Some(key) = expr.get("key").and_then(Value::as_str) {
            expr["key"] = Value::String(rewrite_metadata_key(
                &rules.labels,
                &rules.preserved_prefix,
                action,
                key,
            ));
        }
    }
}

/// Rewrites a plain list of label keys (`matchLabelKeys` and friends).
pub fn rewrite_label_key_list(rules: &RewriteRules, action: Action, value: &mut Value) {
    let list = match value.as_array_mut() {
        Some(list) => list,
        None => return,
    };
    for entry in list {
        if let Some(key) = entry.as_str() {
            *entry = Value::String(rewrite_metadata_key(
                &rules.labels,
                &rules.preserved_prefix,
                action,
                key,
            ));
        }
    }
}

/// Rewrites one label key held as a bare string value (`topologyKey`).
pub fn rewrite_label_key_value(rules: &RewriteRules, action: Action, value: &mut Value) {
    if let Some(key) = value.as_str() {
        *value = Value::String(rewrite_metadata_key(
            &rules.labels,
            &rules.preserved_prefix,
            action,
            key,
        ));
    }
}
