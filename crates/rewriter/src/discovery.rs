//! Discovery document rewrites: legacy group/resource lists and the
//! aggregated discovery form.

use serde_json::Value;

use crate::rules::RewriteRules;
use crate::Action;

/// `APIGroupList.groups[*]` and the single `APIGroup` form.
pub fn rewrite_api_group(rules: &RewriteRules, action: Action, group: &mut Value) {
    let name = group.get("name").and_then(Value::as_str).unwrap_or("");
    let rewritten = rules.rewrite_group(action, name);
    if rewritten != name {
        group["name"] = Value::String(rewritten.clone());
    }
    if let Some(versions) = group.get_mut("versions").and_then(Value::as_array_mut) {
        for version in versions {
            rewrite_group_version(rules, action, version);
        }
    }
    if let Some(preferred) = group.get_mut("preferredVersion") {
        rewrite_group_version(rules, action, preferred);
    }
}

fn rewrite_group_version(rules: &RewriteRules, action: Action, version: &mut Value) {
    if let Some(group_version) = version.get("groupVersion").and_then(Value::as_str) {
        version["groupVersion"] = Value::String(rules.rewrite_api_version(action, group_version));
    }
}

/// `APIGroupList`: each group rewritten; on restore, entries collapsing
/// onto the same group name are merged and duplicates dropped.
pub fn rewrite_api_group_list(rules: &RewriteRules, action: Action, obj: &mut Value) {
    let groups = match obj.get_mut("groups").and_then(Value::as_array_mut) {
        Some(groups) => groups,
        None => return,
    };
    for group in groups.iter_mut() {
        rewrite_api_group(rules, action, group);
    }
    if action == Action::Restore {
        merge_groups_by_name(groups);
    }
}

fn merge_groups_by_name(groups: &mut Vec<Value>) {
    let mut merged: Vec<Value> = Vec::with_capacity(groups.len());
    for group in groups.drain(..) {
        let name = group.get("name").and_then(Value::as_str).unwrap_or("");
        if let Some(existing) = merged
            .iter_mut()
            .find(|g| g.get("name").and_then(Value::as_str) == Some(name))
        {
            // Merge version lists, dropping duplicates.
            let incoming = group
                .get("versions")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            if let Some(versions) = existing.get_mut("versions").and_then(Value::as_array_mut) {
                for version in incoming {
                    if !versions.contains(&version) {
                        versions.push(version);
                    }
                }
            }
            continue;
        }
        merged.push(group);
    }
    *groups = merged;
}

/// `APIResourceList`: groupVersion plus each resource's served names.
pub fn rewrite_api_resource_list(rules: &RewriteRules, action: Action, obj: &mut Value) {
    if let Some(group_version) = obj.get("groupVersion").and_then(Value::as_str) {
        obj["groupVersion"] = Value::String(rules.rewrite_api_version(action, group_version));
    }
    let resources = match obj.get_mut("resources").and_then(Value::as_array_mut) {
        Some(resources) => resources,
        None => return,
    };
    for resource in resources {
        rewrite_api_resource(rules, action, resource);
    }
}

fn rewrite_api_resource(rules: &RewriteRules, action: Action, resource: &mut Value) {
    let name = resource.get("name").and_then(Value::as_str).unwrap_or("");
    let rewritten = rules.rewrite_resource_entry(action, name);
    if rewritten == name {
        return;
    }
    let rule = rules.groups.iter().find_map(|group| {
        rules
            .resource_by_plural(group, action, name)
            .map(|resource| (group, resource))
    });
    resource["name"] = Value::String(rewritten);
    if let Some((_, rule)) = rule {
        let (kind, singular, short_names) = match action {
            Action::Rename => (
                &rule.renamed_kind,
                &rule.renamed_singular,
                &rule.renamed_short_names,
            ),
            Action::Restore => (&rule.kind, &rule.singular, &rule.short_names),
        };
        if resource.get("kind").is_some() {
            resource["kind"] = Value::String(kind.clone());
        }
        // Subresource entries carry an empty singularName; keep it empty
        // so round-trips stay byte-identical.
        if resource
            .get("singularName")
            .and_then(Value::as_str)
            .is_some_and(|s| !s.is_empty())
        {
            resource["singularName"] = Value::String(singular.clone());
        }
        if resource.get("shortNames").is_some() {
            resource["shortNames"] = Value::Array(
                short_names
                    .iter()
                    .map(|s| Value::String(s.clone()))
                    .collect(),
            );
        }
        if resource.get("categories").is_some() {
            resource["categories"] = Value::Array(
                rule.categories
                    .iter()
                    .map(|s| Value::String(s.clone()))
                    .collect(),
            );
        }
    }
}

/// Aggregated discovery (`APIGroupDiscoveryList`): per-group metadata
/// name, per-resource names and responseKinds, and subresources.
pub fn rewrite_api_group_discovery_list(rules: &RewriteRules, action: Action, obj: &mut Value) {
    let items = match obj.get_mut("items").and_then(Value::as_array_mut) {
        Some(items) => items,
        None => return,
    };
    for item in items.iter_mut() {
        let name = item
            .pointer("/metadata/name")
            .and_then(Value::as_str)
            .unwrap_or("");
        let rewritten = rules.rewrite_group(action, name);
        if rewritten != name {
            item["metadata"]["name"] = Value::String(rewritten);
        }
        if let Some(versions) = item.get_mut("versions").and_then(Value::as_array_mut) {
            for version in versions {
                if let Some(resources) =
                    version.get_mut("resources").and_then(Value::as_array_mut)
                {
                    for resource in resources {
                        rewrite_discovery_resource(rules, action, resource);
                    }
                }
            }
        }
    }
    if action == Action::Restore {
        merge_discovery_items(items);
    }
}

fn rewrite_discovery_resource(rules: &RewriteRules, action: Action, resource: &mut Value) {
    if let Some(name) = resource.get("resource").and_then(Value::as_str) {
        resource["resource"] = Value::String(rules.rewrite_resource_entry(action, name));
    }
    if let Some(singular) = resource.get("singularResource").and_then(Value::as_str) {
        resource["singularResource"] =
            Value::String(rules.rewrite_resource_entry(action, singular));
    }
    if let Some(response_kind) = resource.get_mut("responseKind") {
        rewrite_response_kind(rules, action, response_kind);
    }
    if let Some(short_names) = resource.get_mut("shortNames") {
        rewrite_short_names(rules, action, short_names);
    }
    if let Some(subresources) = resource
        .get_mut("subresources")
        .and_then(Value::as_array_mut)
    {
        for subresource in subresources {
            if let Some(response_kind) = subresource.get_mut("responseKind") {
                rewrite_response_kind(rules, action, response_kind);
            }
        }
    }
}

fn rewrite_response_kind(rules: &RewriteRules, action: Action, response_kind: &mut Value) {
    if let Some(group) = response_kind.get("group").and_then(Value::as_str) {
        response_kind["group"] = Value::String(rules.rewrite_group(action, group));
    }
    if let Some(kind) = response_kind.get("kind").and_then(Value::as_str) {
        if let Some((_, rule, form)) = rules.resource_by_kind(action, kind) {
            response_kind["kind"] = Value::String(rule.kind_for(action, form).to_string());
        }
    }
}

fn rewrite_short_names(rules: &RewriteRules, action: Action, short_names: &mut Value) {
    let list = match short_names.as_array_mut() {
        Some(list) => list,
        None => return,
    };
    for entry in list {
        let name = match entry.as_str() {
            Some(name) => name,
            None => continue,
        }
        .to_string();
        for group in &rules.groups {
            for rule in &group.resources {
                let (from, to) = match action {
                    Action::Rename => (&rule.short_names, &rule.renamed_short_names),
                    Action::Restore => (&rule.renamed_short_names, &rule.short_names),
                };
                if let Some(position) = from.iter().position(|s| s == &name) {
                    if let Some(replacement) = to.get(position) {
                        *entry = Value::String(replacement.clone());
                    }
                }
            }
        }
    }
}

fn merge_discovery_items(items: &mut Vec<Value>) {
    let mut merged: Vec<Value> = Vec::with_capacity(items.len());
    for item in items.drain(..) {
        let name = item
            .pointer("/metadata/name")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        if let Some(existing) = merged
            .iter_mut()
            .find(|i| i.pointer("/metadata/name").and_then(Value::as_str) == Some(name.as_str()))
        {
            merge_discovery_versions(existing, &item);
            continue;
        }
        merged.push(item);
    }
    *items = merged;
}

fn merge_discovery_versions(existing: &mut Value, incoming: &Value) {
    let incoming_versions = incoming
        .get("versions")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let versions = match existing.get_mut("versions").and_then(Value::as_array_mut) {
        Some(versions) => versions,
        None => return,
    };
    for version in incoming_versions {
        let version_name = version.get("version").and_then(Value::as_str);
        if let Some(slot) = versions
            .iter_mut()
            .find(|v| v.get("version").and_then(Value::as_str) == version_name)
        {
            let incoming_resources = version
                .get("resources")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            if let Some(resources) = slot.get_mut("resources").and_then(Value::as_array_mut) {
                for resource in incoming_resources {
                    let already = resources.iter().any(|r| {
                        r.get("resource").and_then(Value::as_str)
                            == resource.get("resource").and_then(Value::as_str)
                    });
                    if !already {
                        resources.push(resource);
                    }
                }
            }
        } else {
            versions.push(version);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testing::test_rules;
    use serde_json::{json, Map};

    /// Normalizes map ordering for comparisons.
    fn sorted(value: Value) -> Value {
        match value {
            Value::Object(map) => {
                let mut sorted_map = Map::new();
                for (k, v) in map {
                    sorted_map.insert(k, sorted(v));
                }
                Value::Object(sorted_map)
            }
            Value::Array(list) => Value::Array(list.into_iter().map(sorted).collect()),
            other => other,
        }
    }

    #[test]
    fn api_group_list_round_trip() {
        let rules = test_rules();
        let original = json!({
            "kind": "APIGroupList",
            "apiVersion": "v1",
            "groups": [
                {
                    "name": "original.group.io",
                    "versions": [{"groupVersion": "original.group.io/v1", "version": "v1"}],
                    "preferredVersion": {"groupVersion": "original.group.io/v1", "version": "v1"}
                },
                {
                    "name": "apps",
                    "versions": [{"groupVersion": "apps/v1", "version": "v1"}],
                    "preferredVersion": {"groupVersion": "apps/v1", "version": "v1"}
                }
            ]
        });
        let mut value = original.clone();
        rewrite_api_group_list(&rules, Action::Rename, &mut value);
        assert_eq!(value["groups"][0]["name"], json!("prefixed.resources.group.io"));
        rewrite_api_group_list(&rules, Action::Restore, &mut value);
        assert_eq!(sorted(value), sorted(original));
    }

    #[test]
    fn restore_merges_colliding_groups() {
        let rules = test_rules();
        let mut value = json!({
            "kind": "APIGroupList",
            "groups": [
                {
                    "name": "original.group.io",
                    "versions": [{"groupVersion": "original.group.io/v1", "version": "v1"}]
                },
                {
                    "name": "prefixed.resources.group.io",
                    "versions": [
                        {"groupVersion": "prefixed.resources.group.io/v1", "version": "v1"},
                        {"groupVersion": "prefixed.resources.group.io/v1alpha1", "version": "v1alpha1"}
                    ]
                }
            ]
        });
        rewrite_api_group_list(&rules, Action::Restore, &mut value);
        let groups = value["groups"].as_array().unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0]["name"], json!("original.group.io"));
        // v1 deduplicated, v1alpha1 merged in.
        assert_eq!(groups[0]["versions"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn api_resource_list_rewrites_resources() {
        let rules = test_rules();
        let mut value = json!({
            "kind": "APIResourceList",
            "groupVersion": "original.group.io/v1",
            "resources": [
                {
                    "name": "someresources",
                    "singularName": "someresource",
                    "namespaced": true,
                    "kind": "SomeResource",
                    "shortNames": ["sr"],
                    "categories": ["all"],
                    "verbs": ["get", "list"]
                },
                {
                    "name": "someresources/status",
                    "singularName": "",
                    "namespaced": true,
                    "kind": "SomeResource",
                    "verbs": ["get", "patch"]
                }
            ]
        });
        rewrite_api_resource_list(&rules, Action::Rename, &mut value);
        assert_eq!(value["groupVersion"], json!("prefixed.resources.group.io/v1"));
        assert_eq!(value["resources"][0]["name"], json!("prefixedsomeresources"));
        assert_eq!(value["resources"][0]["kind"], json!("PrefixedSomeResource"));
        assert_eq!(value["resources"][0]["shortNames"], json!(["psr"]));
        assert_eq!(
            value["resources"][1]["name"],
            json!("prefixedsomeresources/status")
        );
    }

    #[test]
    fn aggregated_discovery_round_trip() {
        let rules = test_rules();
        let original = json!({
            "kind": "APIGroupDiscoveryList",
            "apiVersion": "apidiscovery.k8s.io/v2",
            "items": [{
                "metadata": {"name": "original.group.io"},
                "versions": [{
                    "version": "v1",
                    "resources": [{
                        "resource": "someresources",
                        "singularResource": "someresource",
                        "responseKind": {"group": "original.group.io", "version": "v1", "kind": "SomeResource"},
                        "shortNames": ["sr"],
                        "scope": "Namespaced",
                        "subresources": [{
                            "subresource": "status",
                            "responseKind": {"group": "original.group.io", "version": "v1", "kind": "SomeResource"}
                        }]
                    }]
                }]
            }]
        });
        let mut value = original.clone();
        rewrite_api_group_discovery_list(&rules, Action::Rename, &mut value);
        assert_eq!(
            value["items"][0]["metadata"]["name"],
            json!("prefixed.resources.group.io")
        );
        let resource = &value["items"][0]["versions"][0]["resources"][0];
        assert_eq!(resource["resource"], json!("prefixedsomeresources"));
        assert_eq!(
            resource["responseKind"]["kind"],
            json!("PrefixedSomeResource")
        );
        assert_eq!(
            resource["subresources"][0]["responseKind"]["group"],
            json!("prefixed.resources.group.io")
        );

        rewrite_api_group_discovery_list(&rules, Action::Restore, &mut value);
        assert_eq!(value, original);
    }
}
