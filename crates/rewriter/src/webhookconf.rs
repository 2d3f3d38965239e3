//! Webhook configuration and validating-admission-policy rewrites.

use serde_json::Value;

use crate::metadata::rewrite_metadata;
use crate::rbac::rewrite_policy_rule;
use crate::rules::RewriteRules;
use crate::Action;

/// Rewrites a Mutating- or ValidatingWebhookConfiguration: each webhook's
/// resource rules plus the client-config service name where a rename is
/// defined.
pub fn rewrite_webhook_configuration(rules: &RewriteRules, action: Action, obj: &mut Value) {
    rewrite_metadata(rules, action, obj);
    let webhooks = match obj.get_mut("webhooks").and_then(Value::as_array_mut) {
        Some(webhooks) => webhooks,
        None => return,
    };
    for webhook in webhooks {
        if let Some(hook_rules) = webhook.get_mut("rules").and_then(Value::as_array_mut) {
            for rule in hook_rules {
                rewrite_policy_rule(rules, action, rule);
            }
        }
        if let Some(service) = webhook
            .get_mut("clientConfig")
            .and_then(|c| c.get_mut("service"))
        {
            if let Some(name) = service.get("name").and_then(Value::as_str) {
                service["name"] = Value::String(rules.rewrite_service_name(action, name));
            }
        }
    }
}

/// Rewrites a ValidatingAdmissionPolicy (`spec.matchConstraints`) or its
/// Binding (`spec.matchResources`).
pub fn rewrite_admission_policy(rules: &RewriteRules, action: Action, obj: &mut Value) {
    rewrite_metadata(rules, action, obj);
    let spec = match obj.get_mut("spec") {
        Some(spec) => spec,
        None => return,
    };
    for field in ["matchConstraints", "matchResources"] {
        if let Some(resource_rules) = spec
            .get_mut(field)
            .and_then(|m| m.get_mut("resourceRules"))
            .and_then(Value::as_array_mut)
        {
            for rule in resource_rules {
                rewrite_policy_rule(rules, action, rule);
            }
        }
    }
}
