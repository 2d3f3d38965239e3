//! JSON Patch and merge patch rewrites, detected by the payload's top
//! level (`[` versus `{`).

use serde_json::Value;

use crate::metadata::{rewrite_annotation_map, rewrite_label_map};
use crate::rules::{rewrite_metadata_key, RewriteRules};
use crate::workloads::{rewrite_affinity, rewrite_label_selector_in_spec, rewrite_pod_spec};
use crate::{Action, RewriteError};

/// Rewrites a PATCH body. Non-JSON payloads pass through (`None`).
pub fn rewrite_patch(
    rules: &RewriteRules,
    action: Action,
    body: &[u8],
) -> Result<Option<Vec<u8>>, RewriteError> {
    let mut value: Value = match serde_json::from_slice(body) {
        Ok(value) => value,
        Err(_) => return Ok(None),
    };
    match &mut value {
        Value::Array(ops) => {
            for op in ops {
                rewrite_json_patch_op(rules, action, op);
            }
        }
        Value::Object(_) => rewrite_merge_patch(rules, action, &mut value),
        _ => return Ok(None),
    }
    serde_json::to_vec(&value)
        .map(Some)
        .map_err(|err| RewriteError::Malformed(err.to_string()))
}

/// Rewrites one JSON Patch operation touching the metadata maps or the
/// spec subtree.
fn rewrite_json_patch_op(rules: &RewriteRules, action: Action, op: &mut Value) {
    let path = op.get("path").and_then(Value::as_str).unwrap_or("").to_string();

    if let Some(key) = path.strip_prefix("/metadata/labels/") {
        let rewritten = rewrite_metadata_key(
            &rules.labels,
            &rules.preserved_prefix,
            action,
            &unescape_pointer(key),
        );
        op["path"] = Value::String(format!("/metadata/labels/{}", escape_pointer(&rewritten)));
        return;
    }
    if let Some(key) = path.strip_prefix("/metadata/annotations/") {
        let rewritten = rewrite_metadata_key(
            &rules.annotations,
            &rules.preserved_prefix,
            action,
            &unescape_pointer(key),
        );
        op["path"] = Value::String(format!(
            "/metadata/annotations/{}",
            escape_pointer(&rewritten)
        ));
        return;
    }

    match path.as_str() {
        "/metadata/labels" => {
            if let Some(value) = op.get_mut("value") {
                rewrite_label_map(rules, action, value);
            }
        }
        "/metadata/annotations" => {
            if let Some(value) = op.get_mut("value") {
                rewrite_annotation_map(rules, action, value);
            }
        }
        "/metadata/finalizers" => {
            if let Some(value) = op.get_mut("value") {
                crate::metadata::rewrite_finalizers(rules, action, value);
            }
        }
        path if path.starts_with("/metadata/finalizers/") => {
            if let Some(finalizer) = op.get("value").and_then(Value::as_str) {
                op["value"] = Value::String(rewrite_metadata_key(
                    &rules.finalizers,
                    &rules.preserved_prefix,
                    action,
                    finalizer,
                ));
            }
        }
        "/spec" => {
            if let Some(value) = op.get_mut("value") {
                rewrite_spec_subtree(rules, action, value);
            }
        }
        _ => {}
    }
}

/// Rewrites the label-bearing structures of a merge patch.
fn rewrite_merge_patch(rules: &RewriteRules, action: Action, patch: &mut Value) {
    if let Some(metadata) = patch.get_mut("metadata") {
        if let Some(labels) = metadata.get_mut("labels") {
            rewrite_label_map(rules, action, labels);
        }
        if let Some(annotations) = metadata.get_mut("annotations") {
            rewrite_annotation_map(rules, action, annotations);
        }
        if let Some(finalizers) = metadata.get_mut("finalizers") {
            crate::metadata::rewrite_finalizers(rules, action, finalizers);
        }
    }
    if let Some(spec) = patch.get_mut("spec") {
        rewrite_spec_subtree(rules, action, spec);
    }
}

/// Best-effort rewrite of a spec fragment: selectors, templates, node
/// selectors, and affinity wherever they appear.
fn rewrite_spec_subtree(rules: &RewriteRules, action: Action, spec: &mut Value) {
    if !spec.is_object() {
        return;
    }
    rewrite_label_selector_in_spec(rules, action, spec);
    rewrite_pod_spec(rules, action, spec);
    if let Some(template) = spec.get_mut("template") {
        if let Some(metadata) = template.get_mut("metadata") {
            if let Some(labels) = metadata.get_mut("labels") {
                rewrite_label_map(rules, action, labels);
            }
        }
        if let Some(pod_spec) = template.get_mut("spec") {
            rewrite_pod_spec(rules, action, pod_spec);
        }
    }
    if let Some(affinity) = spec.get_mut("affinity") {
        rewrite_affinity(rules, action, affinity);
    }
}

/// JSON-Pointer token escaping: `~` is `~0`, `/` is `~1`.
fn unescape_pointer(token: &str) -> String {
    token.replace("~1", "/").replace("~0", "~")
}

fn escape_pointer(token: &str) -> String {
    token.replace('~', "~0").replace('/', "~1")
}
