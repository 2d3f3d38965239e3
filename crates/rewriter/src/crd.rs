//! CustomResourceDefinition rewrites.

use serde_json::Value;

use crate::metadata::rewrite_metadata;
use crate::rules::RewriteRules;
use crate::{Action, RewriteError};

/// Splits `<plural>.<group>` into its parts.
pub fn split_crd_name(name: &str) -> Result<(&str, &str), RewriteError> {
    name.split_once('.')
        .filter(|(plural, group)| !plural.is_empty() && !group.is_empty())
        .ok_or_else(|| RewriteError::InvalidCrdName(name.to_string()))
}

/// Rewrites a CRD's name, group, and served names.
///
/// Restoring skips CRDs already in the original group and drops CRDs of
/// the renamed group whose plural has no rule (`SkipItem`), so private
/// definitions never leak through the proxy.
pub fn rewrite_crd(rules: &RewriteRules, action: Action, obj: &mut Value) -> Result<(), RewriteError> {
    let name = obj["metadata"]["name"].as_str().unwrap_or("");
    let spec_group = obj["spec"]["group"].as_str().unwrap_or("");

    let group_rule = match rules.group_rule(action, spec_group) {
        Some(rule) => rule,
        // Already-original (on restore) and unrelated groups pass as-is.
        None => return Ok(()),
    };

    let (plural, _) = split_crd_name(name)?;
    let resource = match rules.resource_by_plural(group_rule, action, plural) {
        Some(resource) => resource,
        None => {
            return match action {
                // A renamed-group CRD with no rule stays private.
                Action::Restore => Err(RewriteError::SkipItem),
                Action::Rename => Ok(()),
            };
        }
    };

    let target_group = group_rule.group_for(action);
    let target_plural = resource.plural_for(action);
    obj["metadata"]["name"] = Value::String(format!("{}.{}", target_plural, target_group));
    obj["spec"]["group"] = Value::String(target_group.to_string());

    let names = &mut obj["spec"]["names"];
    if names.is_object() {
        let (kind, list_kind, singular, short_names) = match action {
            Action::Rename => (
                &resource.renamed_kind,
                &resource.renamed_list_kind,
                &resource.renamed_singular,
                &resource.renamed_short_names,
            ),
            Action::Restore => (
                &resource.kind,
                &resource.list_kind,
                &resource.singular,
                &resource.short_names,
            ),
        };
        names["kind"] = Value::String(kind.clone());
        names["listKind"] = Value::String(list_kind.clone());
        names["plural"] = Value::String(target_plural.to_string());
        names["singular"] = Value::String(singular.clone());
        if names.get("shortNames").is_some() {
            names["shortNames"] = Value::Array(
                short_names
                    .iter()
                    .map(|s| Value::String(s.clone()))
                    .collect(),
            );
        }
        if names.get("categories").is_some() {
            names["categories"] = Value::Array(
                resource
                    .categories
                    .iter()
                    .map(|s| Value::String(s.clone()))
                    .collect(),
            );
        }
    }

    rewrite_metadata(rules, action, obj);
    Ok(())
}
