//! The rename rule set and its lookup surface.

use crate::Action;

/// Everything the rewriter needs to translate between the original and the
/// renamed API surface.
#[derive(Debug, Clone, Default)]
pub struct RewriteRules {
    pub groups: Vec<GroupRule>,
    pub labels: MetadataRules,
    pub annotations: MetadataRules,
    pub finalizers: MetadataRules,
    /// Webhook client-config service renames.
    pub services: Vec<ExactRename>,
    /// Request paths served by proxied webhooks.
    pub webhook_paths: Vec<String>,
    /// Wrapper prefix for the already-original escape; see
    /// [`rewrite_metadata_key`].
    pub preserved_prefix: String,
}

#[derive(Debug, Clone, Default)]
pub struct GroupRule {
    pub group: String,
    pub renamed_group: String,
    pub versions: Vec<String>,
    pub preferred_version: String,
    pub resources: Vec<ResourceRule>,
}

#[derive(Debug, Clone, Default)]
pub struct ResourceRule {
    pub kind: String,
    pub list_kind: String,
    pub plural: String,
    pub singular: String,
    pub short_names: Vec<String>,
    pub categories: Vec<String>,
    pub renamed_kind: String,
    pub renamed_list_kind: String,
    pub renamed_plural: String,
    pub renamed_singular: String,
    pub renamed_short_names: Vec<String>,
    pub versions: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct MetadataRules {
    pub prefixes: Vec<PrefixRename>,
    pub names: Vec<ExactRename>,
}

#[derive(Debug, Clone, Default)]
pub struct PrefixRename {
    pub original: String,
    pub renamed: String,
}

#[derive(Debug, Clone, Default)]
pub struct ExactRename {
    pub original: String,
    pub renamed: String,
}

/// Which side of a resource rule a kind matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KindForm {
    Single,
    List,
}

impl ResourceRule {
    pub fn kind_for(&self, action: Action, form: KindForm) -> &str {
        match (action, form) {
            (Action::Rename, KindForm::Single) => &self.renamed_kind,
            (Action::Rename, KindForm::List) => &self.renamed_list_kind,
            (Action::Restore, KindForm::Single) => &self.kind,
            (Action::Restore, KindForm::List) => &self.list_kind,
        }
    }

    pub fn plural_for(&self, action: Action) -> &str {
        match action {
            Action::Rename => &self.renamed_plural,
            Action::Restore => &self.plural,
        }
    }
}

impl GroupRule {
    pub fn group_for(&self, action: Action) -> &str {
        match action {
            Action::Rename => &self.renamed_group,
            Action::Restore => &self.group,
        }
    }
}

impl RewriteRules {
    /// The group rule whose source-side group (per direction) matches.
    pub fn group_rule(&self, action: Action, group: &str) -> Option<&GroupRule> {
        self.groups.iter().find(|rule| match action {
            Action::Rename => rule.group == group,
            Action::Restore => rule.renamed_group == group,
        })
    }

    /// True when the group matches either side of any rule.
    pub fn known_group(&self, group: &str) -> bool {
        self.groups
            .iter()
            .any(|rule| rule.group == group || rule.renamed_group == group)
    }

    /// Rewrites a bare group name, passing unknown groups through.
    pub fn rewrite_group(&self, action: Action, group: &str) -> String {
        self.group_rule(action, group)
            .map(|rule| rule.group_for(action).to_string())
            .unwrap_or_else(|| group.to_string())
    }

    /// Rewrites `<group>/<version>`, passing unknown groups through.
    pub fn rewrite_api_version(&self, action: Action, api_version: &str) -> String {
        match api_version.split_once('/') {
            Some((group, version)) => {
                format!("{}/{}", self.rewrite_group(action, group), version)
            }
            None => api_version.to_string(),
        }
    }

    /// Looks a kind up against the source side of the rules, accepting the
    /// list form as well.
    pub fn resource_by_kind(
        &self,
        action: Action,
        kind: &str,
    ) -> Option<(&GroupRule, &ResourceRule, KindForm)> {
        for group in &self.groups {
            for resource in &group.resources {
                let (single, list) = match action {
                    Action::Rename => (&resource.kind, &resource.list_kind),
                    Action::Restore => (&resource.renamed_kind, &resource.renamed_list_kind),
                };
                if kind == single {
                    return Some((group, resource, KindForm::Single));
                }
                if kind == list {
                    return Some((group, resource, KindForm::List));
                }
            }
        }
        None
    }

    /// Looks a plural (optionally `<plural>/<subresource>`) up within a
    /// group rule.
    pub fn resource_by_plural<'a>(
        &self,
        group: &'a GroupRule,
        action: Action,
        plural: &str,
    ) -> Option<&'a ResourceRule> {
        let base = plural.split('/').next().unwrap_or(plural);
        group.resources.iter().find(|resource| match action {
            Action::Rename => resource.plural == base,
            Action::Restore => resource.renamed_plural == base,
        })
    }

    /// Rewrites one entry of an RBAC-style `resources` list. Wildcards and
    /// empty strings pass through, as do plurals of unknown resources.
    pub fn rewrite_resource_entry(&self, action: Action, entry: &str) -> String {
        if entry == "*" || entry.is_empty() {
            return entry.to_string();
        }
        let (base, sub) = match entry.split_once('/') {
            Some((base, sub)) => (base, Some(sub)),
            None => (entry, None),
        };
        for group in &self.groups {
            if let Some(resource) = self.resource_by_plural(group, action, base) {
                let renamed = resource.plural_for(action);
                return match sub {
                    Some(sub) => format!("{}/{}", renamed, sub),
                    None => renamed.to_string(),
                };
            }
        }
        entry.to_string()
    }

    pub fn rewrite_service_name(&self, action: Action, name: &str) -> String {
        for rename in &self.services {
            match action {
                Action::Rename if rename.original == name => return rename.renamed.clone(),
                Action::Restore if rename.renamed == name => return rename.original.clone(),
                _ => {}
            }
        }
        name.to_string()
    }

    pub fn is_webhook_path(&self, path: &str) -> bool {
        self.webhook_paths.iter().any(|p| p == path)
    }
}

/// Rewrites a label/annotation/finalizer key.
///
/// Renaming unwraps the preserved prefix before anything else, so a key
/// escaped by an earlier Restore pass round-trips to its original form.
/// Restoring maps renamed keys back, and wraps a key that is *already* in
/// its original exact-rename form: upstream data legitimately carrying the
/// original name must survive Rename ∘ Restore bit-identically.
pub fn rewrite_metadata_key(
    rules: &MetadataRules,
    preserved_prefix: &str,
    action: Action,
    key: &str,
) -> String {
    match action {
        Action::Rename => {
            if !preserved_prefix.is_empty() {
                if let Some(wrapped) = key.strip_prefix(preserved_prefix) {
                    return wrapped.to_string();
                }
            }
            for rename in &rules.names {
                if rename.original == key {
                    return rename.renamed.clone();
                }
            }
            for prefix in &rules.prefixes {
                if let Some(rest) = key.strip_prefix(prefix.original.as_str()) {
                    return format!("{}{}", prefix.renamed, rest);
                }
            }
            key.to_string()
        }
        Action::Restore => {
            for rename in &rules.names {
                if rename.renamed == key {
                    return rename.original.clone();
                }
                if rename.original == key && !preserved_prefix.is_empty() {
                    return format!("{}{}", preserved_prefix, key);
                }
            }
            for prefix in &rules.prefixes {
                if let Some(rest) = key.strip_prefix(prefix.renamed.as_str()) {
                    return format!("{}{}", prefix.original, rest);
                }
            }
            key.to_string()
        }
    }
}
