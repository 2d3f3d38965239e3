//! Workload rewrites: selector, template, nodeSelector, and the affinity
//! subtree of Pods, controllers, PDBs, and ServiceMonitors.

use serde_json::Value;

use crate::metadata::{
    rewrite_annotation_map, rewrite_label_key_list, rewrite_label_key_value, rewrite_label_map,
    rewrite_label_selector, rewrite_match_expressions, rewrite_metadata,
};
use crate::rules::RewriteRules;
use crate::Action;

/// Rewrites one workload object (Pod, DaemonSet, StatefulSet, Deployment,
/// Job, PodDisruptionBudget, ServiceMonitor).
pub fn rewrite_workload(rules: &RewriteRules, action: Action, obj: &mut Value) {
    rewrite_metadata(rules, action, obj);

    let spec = match obj.get_mut("spec") {
        Some(spec) if spec.is_object() => spec,
        _ => return,
    };

    if let Some(selector) = spec.get_mut("selector") {
        rewrite_label_selector(rules, action, selector);
    }

    if let Some(template) = spec.get_mut("template") {
        if let Some(metadata) = template.get_mut("metadata") {
            if let Some(labels) = metadata.get_mut("labels") {
                rewrite_label_map(rules, action, labels);
            }
            if let Some(annotations) = metadata.get_mut("annotations") {
                rewrite_annotation_map(rules, action, annotations);
            }
        }
        if let Some(pod_spec) = template.get_mut("spec") {
            rewrite_pod_spec(rules, action, pod_spec);
        }
    }

    // Bare Pods carry the pod spec at the top level.
    rewrite_pod_spec(rules, action, spec);
}

/// Rewrites `spec.selector` whether it is a bare label map (Service
/// style) or a `LabelSelector` (workload style).
pub fn rewrite_label_selector_in_spec(rules: &RewriteRules, action: Action, spec: &mut Value) {
    if let Some(selector) = spec.get_mut("selector") {
        if selector.get("matchLabels").is_some() || selector.get("matchExpressions").is_some() {
            rewrite_label_selector(rules, action, selector);
        } else {
            rewrite_label_map(rules, action, selector);
        }
    }
}

/// Rewrites `nodeSelector` and `affinity` of a pod spec.
pub fn rewrite_pod_spec(rules: &RewriteRules, action: Action, spec: &mut Value) {
    if let Some(node_selector) = spec.get_mut("nodeSelector") {
        rewrite_label_map(rules, action, node_selector);
    }
    if let Some(affinity) = spec.get_mut("affinity") {
        rewrite_affinity(rules, action, affinity);
    }
}

/// Recurses through the full affinity subtree.
pub fn rewrite_affinity(rules: &RewriteRules, action: Action, affinity: &mut Value) {
    if let Some(node_affinity) = affinity.get_mut("nodeAffinity") {
        if let Some(required) =
            node_affinity.get_mut("requiredDuringSchedulingIgnoredDuringExecution")
        {
            if let Some(terms) = required
                .get_mut("nodeSelectorTerms")
                .and_then(Value::as_array_mut)
            {
                for term in terms {
                    rewrite_node_selector_term(rules, action, term);
                }
            }
        }
        if let Some(preferred) = node_affinity
            .get_mut("preferredDuringSchedulingIgnoredDuringExecution")
            .and_then(Value::as_array_mut)
        {
            for entry in preferred {
                if let Some(preference) = entry.get_mut("preference") {
                    rewrite_node_selector_term(rules, action, preference);
                }
            }
        }
    }

    for key in ["podAffinity", "podAntiAffinity"] {
        let pod_affinity = match affinity.get_mut(key) {
            Some(value) => value,
            None => continue,
        };
        if let Some(required) = pod_affinity
            .get_mut("requiredDuringSchedulingIgnoredDuringExecution")
            .and_then(Value::as_array_mut)
        {
            for term in required {
                rewrite_pod_affinity_term(rules, action, term);
            }
        }
        if let Some(preferred) = pod_affinity
            .get_mut("preferredDuringSchedulingIgnoredDuringExecution")
            .and_then(Value::as_array_mut)
        {
            for entry in preferred {
                if let Some(term) = entry.get_mut("podAffinityTerm") {
                    rewrite_pod_affinity_term(rules, action, term);
                }
            }
        }
    }
}

fn rewrite_node_selector_term(rules: &RewriteRules, action: Action, term: &mut Value) {
    if let Some(match_labels) = term.get_mut("matchLabels") {
        rewrite_label_map(rules, action, match_labels);
    }
    rewrite_match_expressions(rules, action, term.get_mut("matchExpressions"));
}

fn rewrite_pod_affinity_term(rules: &RewriteRules, action: Action, term: &mut Value) {
    if let Some(selector) = term.get_mut("labelSelector") {
        rewrite_label_selector(rules, action, selector);
    }
    if let Some(selector) = term.get_mut("namespaceSelector") {
        rewrite_label_selector(rules, action, selector);
    }
    if let Some(topology_key) = term.get_mut("topologyKey") {
        rewrite_label_key_value(rules, action, topology_key);
    }
    if let Some(keys) = term.get_mut("matchLabelKeys") {
        rewrite_label_key_list(rules, action, keys);
    }
    if let Some(keys) = term.get_mut("mismatchLabelKeys") {
        rewrite_label_key_list(rules, action, keys);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testing::test_rules;
    use serde_json::json;

    #[test]
    fn deployment_round_trip() {
        let rules = test_rules();
        let original = json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": "controller", "labels": {"original.group.io/app": "c"}},
            "spec": {
                "selector": {"matchLabels": {"original.group.io/app": "c"}},
                "template": {
                    "metadata": {"labels": {"original.group.io/app": "c"}},
                    "spec": {
                        "nodeSelector": {"original.group.io/node": "gpu"},
                        "affinity": {
                            "nodeAffinity": {
                                "requiredDuringSchedulingIgnoredDuringExecution": {
                                    "nodeSelectorTerms": [{
                                        "matchExpressions": [
                                            {"key": "original.group.io/zone", "operator": "Exists"}
                                        ]
                                    }]
                                },
                                "preferredDuringSchedulingIgnoredDuringExecution": [{
                                    "weight": 1,
                                    "preference": {
                                        "matchExpressions": [
                                            {"key": "original.group.io/tier", "operator": "In", "values": ["a"]}
                                        ]
                                    }
                                }]
                            },
                            "podAntiAffinity": {
                                "requiredDuringSchedulingIgnoredDuringExecution": [{
                                    "labelSelector": {"matchLabels": {"original.group.io/app": "c"}},
                                    "topologyKey": "kubernetes.io/hostname",
                                    "matchLabelKeys": ["original.group.io/app"]
                                }],
                                "preferredDuringSchedulingIgnoredDuringExecution": [{
                                    "weight": 10,
                                    "podAffinityTerm": {
                                        "labelSelector": {"matchLabels": {"exact-label": "x"}},
                                        "topologyKey": "topology.kubernetes.io/zone"
                                    }
                                }]
                            }
                        }
                    }
                }
            }
        });

        let mut value = original.clone();
        rewrite_workload(&rules, Action::Rename, &mut value);
        let renamed_key = "replaced.prefixed.resources.group.io/app";
        assert_eq!(
            value["spec"]["selector"]["matchLabels"][renamed_key],
            json!("c")
        );
        assert_eq!(
            value["spec"]["template"]["spec"]["nodeSelector"]
                ["replaced.prefixed.resources.group.io/node"],
            json!("gpu")
        );
        let anti = &value["spec"]["template"]["spec"]["affinity"]["podAntiAffinity"];
        assert_eq!(
            anti["requiredDuringSchedulingIgnoredDuringExecution"][0]["matchLabelKeys"][0],
            json!(renamed_key)
        );
        assert_eq!(
            anti["preferredDuringSchedulingIgnoredDuringExecution"][0]["podAffinityTerm"]
                ["labelSelector"]["matchLabels"]["renamed-exact-label"],
            json!("x")
        );

        rewrite_workload(&rules, Action::Restore, &mut value);
        assert_eq!(value, original);
    }

    #[test]
    fn bare_pod_spec_is_rewritten() {
        let rules = test_rules();
        let mut value = json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {"name": "p"},
            "spec": {"nodeSelector": {"original.group.io/node": "gpu"}}
        });
        rewrite_workload(&rules, Action::Rename, &mut value);
        assert_eq!(
            value["spec"]["nodeSelector"]["replaced.prefixed.resources.group.io/node"],
            json!("gpu")
        );
    }
}
