//! AdmissionReview rewrites for proxied webhook traffic.
//!
//! The API server speaks the renamed form; webhook backends speak the
//! original one. Requests are restored on the way in. Response patches
//! were computed by the backend against the restored object, so their
//! paths and label keys are renamed before heading back to the API
//! server, which stores the renamed form.

use base64::Engine;
use serde_json::Value;

use crate::metadata::rewrite_metadata;
use crate::patches::rewrite_patch;
use crate::rules::RewriteRules;
use crate::{Action, RewriteError};

/// Rewrites whichever halves of an AdmissionReview are present.
pub fn rewrite_admission_review(
    rules: &RewriteRules,
    value: &mut Value,
) -> Result<(), RewriteError> {
    if value.get("request").map(Value::is_object).unwrap_or(false) {
        rewrite_admission_request(rules, &mut value["request"])?;
    }
    if value.get("response").map(Value::is_object).unwrap_or(false) {
        rewrite_admission_response(rules, &mut value["response"])?;
    }
    Ok(())
}

fn rewrite_admission_request(
    rules: &RewriteRules,
    request: &mut Value,
) -> Result<(), RewriteError> {
    for field in ["resource", "requestResource"] {
        if let Some(resource) = request.get_mut(field) {
            if let Some(group) = resource.get("group").and_then(Value::as_str) {
                resource["group"] = Value::String(rules.rewrite_group(Action::Restore, group));
            }
            if let Some(name) = resource.get("resource").and_then(Value::as_str) {
                resource["resource"] =
                    Value::String(rules.rewrite_resource_entry(Action::Restore, name));
            }
        }
    }
    for field in ["kind", "requestKind"] {
        if let Some(kind_ref) = request.get_mut(field) {
            if let Some(group) = kind_ref.get("group").and_then(Value::as_str) {
                kind_ref["group"] = Value::String(rules.rewrite_group(Action::Restore, group));
            }
            if let Some(kind) = kind_ref.get("kind").and_then(Value::as_str) {
                if let Some((_, rule, form)) = rules.resource_by_kind(Action::Restore, kind) {
                    kind_ref["kind"] =
                        Value::String(rule.kind_for(Action::Restore, form).to_string());
                }
            }
        }
    }

    // Subresource reviews (status, scale) carry partial objects that must
    // not be restored.
    let subresource_set = request
        .get("subResource")
        .and_then(Value::as_str)
        .map(|s| !s.is_empty())
        .unwrap_or(false);
    if subresource_set {
        return Ok(());
    }

    for field in ["object", "oldObject"] {
        let obj = match request.get_mut(field) {
            Some(obj) if obj.is_object() => obj,
            _ => continue,
        };
        if let Some(api_version) = obj.get("apiVersion").and_then(Value::as_str) {
            obj["apiVersion"] =
                Value::String(rules.rewrite_api_version(Action::Restore, api_version));
        }
        if let Some(kind) = obj.get("kind").and_then(Value::as_str) {
            if let Some((_, rule, form)) = rules.resource_by_kind(Action::Restore, kind) {
                obj["kind"] = Value::String(rule.kind_for(Action::Restore, form).to_string());
            }
        }
        rewrite_metadata(rules, Action::Restore, obj);
    }
    Ok(())
}

fn rewrite_admission_response(
    rules: &RewriteRules,
    response: &mut Value,
) -> Result<(), RewriteError> {
    if response.get("patchType").and_then(Value::as_str) != Some("JSONPatch") {
        return Ok(());
    }
    let encoded = match response.get("patch").and_then(Value::as_str) {
        Some(encoded) => encoded,
        None => return Ok(()),
    };
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(|err| RewriteError::Malformed(format!("admission patch base64: {}", err)))?;
    // The backend only ever saw the restored (original-domain) object;
    // its patch moves original→renamed on the way to the API server.
    if let Some(rewritten) = rewrite_patch(rules, Action::Rename, &decoded)? {
        response["patch"] =
            Value::String(base64::engine::general_purpose::STANDARD.encode(rewritten));
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testing::test_rules;
    use serde_json::json;

    #[test]
    fn request_is_restored() {
        let rules = test_rules();
        let mut value = json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": {
                "uid": "u1",
                "resource": {"group": "prefixed.resources.group.io", "version": "v1", "resource": "prefixedsomeresources"},
                "requestResource": {"group": "prefixed.resources.group.io", "version": "v1", "resource": "prefixedsomeresources"},
                "kind": {"group": "prefixed.resources.group.io", "version": "v1", "kind": "PrefixedSomeResource"},
                "requestKind": {"group": "prefixed.resources.group.io", "version": "v1", "kind": "PrefixedSomeResource"},
                "object": {
                    "apiVersion": "prefixed.resources.group.io/v1",
                    "kind": "PrefixedSomeResource",
                    "metadata": {"name": "x", "labels": {"replaced.prefixed.resources.group.io/role": "a"}}
                },
                "oldObject": null
            }
        });
        rewrite_admission_review(&rules, &mut value).unwrap();
        let request = &value["request"];
        assert_eq!(request["resource"]["group"], json!("original.group.io"));
        assert_eq!(request["resource"]["resource"], json!("someresources"));
        assert_eq!(request["kind"]["kind"], json!("SomeResource"));
        assert_eq!(request["object"]["apiVersion"], json!("original.group.io/v1"));
        assert_eq!(
            request["object"]["metadata"]["labels"]["original.group.io/role"],
            json!("a")
        );
    }

    #[test]
    fn subresource_skips_object_restoration() {
        let rules = test_rules();
        let mut value = json!({
            "request": {
                "uid": "u1",
                "subResource": "status",
                "resource": {"group": "prefixed.resources.group.io", "version": "v1", "resource": "prefixedsomeresources"},
                "object": {
                    "apiVersion": "prefixed.resources.group.io/v1",
                    "kind": "PrefixedSomeResource"
                }
            }
        });
        rewrite_admission_review(&rules, &mut value).unwrap();
        // The resource reference is still restored.
        assert_eq!(
            value["request"]["resource"]["resource"],
            json!("someresources")
        );
        // But the embedded object is untouched.
        assert_eq!(
            value["request"]["object"]["apiVersion"],
            json!("prefixed.resources.group.io/v1")
        );
    }

    #[test]
    fn response_patch_is_renamed_in_base64() {
        let rules = test_rules();
        // The backend computed this patch against the restored object, so
        // every key is in its original/public form.
        let ops = json!([
            {"op": "add", "path": "/metadata/labels/exact-label", "value": "x"},
            {"op": "add", "path": "/metadata/labels/original.group.io~1role", "value": "worker"},
            {"op": "add", "path": "/metadata/finalizers/-", "value": "original.group.io/protect"}
        ]);
        let encoded =
            base64::engine::general_purpose::STANDARD.encode(serde_json::to_vec(&ops).unwrap());
        let mut value = json!({
            "response": {
                "uid": "u1",
                "allowed": true,
                "patchType": "JSONPatch",
                "patch": encoded
            }
        });
        rewrite_admission_review(&rules, &mut value).unwrap();
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(value["response"]["patch"].as_str().unwrap())
            .unwrap();
        let rewritten: Value = serde_json::from_slice(&decoded).unwrap();
        // Stored objects live in the renamed domain; the patch must too.
        assert_eq!(
            rewritten[0]["path"],
            json!("/metadata/labels/renamed-exact-label")
        );
        assert_eq!(
            rewritten[1]["path"],
            json!("/metadata/labels/replaced.prefixed.resources.group.io~1role")
        );
        assert_eq!(
            rewritten[2]["value"],
            json!("prefixed.resources.group.io/protect")
        );
    }

    #[test]
    fn non_json_patch_type_untouched() {
        let rules = test_rules();
        let mut value = json!({
            "response": {"uid": "u1", "allowed": true, "patch": "bm90IGpzb24="}
        });
        let before = value.clone();
        rewrite_admission_review(&rules, &mut value).unwrap();
        assert_eq!(value, before);
    }
}
