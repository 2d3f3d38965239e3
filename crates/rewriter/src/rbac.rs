//! RBAC rule rewrites for Roles and ClusterRoles.

use serde_json::Value;

use crate::metadata::rewrite_metadata;
use crate::rules::RewriteRules;
use crate::Action;

/// Rewrites `rules[*].{apiGroups,resources}` of a Role or ClusterRole.
/// Wildcards and the empty core-group marker pass through untouched.
pub fn rewrite_role(rules: &RewriteRules, action: Action, obj: &mut Value) {
    rewrite_metadata(rules, action, obj);
    let policy_rules = match obj.get_mut("rules").and_then(Value::as_array_mut) {
        Some(policy_rules) => policy_rules,
        None => return,
    };
    for rule in policy_rules {
        rewrite_policy_rule(rules, action, rule);
    }
}

/// Shared by RBAC rules, webhook rules, and admission-policy resource
/// rules, which all carry `{apiGroups, resources}` lists.
pub fn rewrite_policy_rule(rules: &RewriteRules, action: Action, rule: &mut Value) {
    if let Some(groups) = rule.get_mut("apiGroups").and_then(Value::as_array_mut) {
        for group in groups {
            if let Some(name) = group.as_str() {
                if name == "*" || name.is_empty() {
                    continue;
                }
                *group = Value::String(rules.rewrite_group(action, name));
            }
        }
    }
    if let Some(resources) = rule.get_mut("resources").and_then(Value::as_array_mut) {
        for resource in resources {
            if let Some(name) = resource.as_str() {
                *resource = Value::String(rules.rewrite_resource_entry(action, name));
            }
        }
    }
}
