//! Request classification and path/query rewriting.

use crate::rules::{rewrite_metadata_key, GroupRule, RewriteRules};
use crate::{Action, RewriteError};

const CRD_GROUP: &str = "apiextensions.k8s.io";
const CRD_PLURAL: &str = "customresourcedefinitions";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestClass {
    Unknown,
    Core,
    Apis,
    Watch,
    Webhook,
    Crd,
}

/// One parsed request line.
#[derive(Debug, Clone, Default)]
pub struct PathTarget {
    pub class: Option<RequestClass>,
    pub group: Option<String>,
    pub version: Option<String>,
    pub namespace: Option<String>,
    pub resource_type: Option<String>,
    pub name: Option<String>,
    pub subresource: Option<String>,
    pub remainder: Vec<String>,
    /// Split form of a CRD object name (`<plural>.<group>`).
    pub crd: Option<CrdName>,
    pub is_watch: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrdName {
    pub resource_type: String,
    pub group: String,
}

impl PathTarget {
    pub fn class(&self) -> RequestClass {
        self.class.unwrap_or(RequestClass::Unknown)
    }

    /// Parses a path + query against the rule set.
    pub fn parse(
        rules: &RewriteRules,
        path: &str,
        query: Option<&str>,
    ) -> Result<PathTarget, RewriteError> {
        let mut target = PathTarget {
            is_watch: query.map(|q| has_watch_param(q)).unwrap_or(false),
            ..Default::default()
        };

        if rules.is_webhook_path(path) {
            target.class = Some(RequestClass::Webhook);
            return Ok(target);
        }

        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        match segments.first() {
            Some(&"api") => {
                target.class = Some(RequestClass::Core);
                target.parse_grouped(&segments[1..], false)?;
            }
            Some(&"apis") => {
                target.class = Some(RequestClass::Apis);
                target.parse_grouped(&segments[1..], true)?;
            }
            _ => {
                target.class = Some(RequestClass::Unknown);
                return Ok(target);
            }
        }

        if target.group.as_deref() == Some(CRD_GROUP)
            && target.resource_type.as_deref() == Some(CRD_PLURAL)
        {
            target.class = Some(RequestClass::Crd);
            if let Some(name) = &target.name {
                let (plural, group) = crate::crd::split_crd_name(name)?;
                target.crd = Some(CrdName {
                    resource_type: plural.to_string(),
                    group: group.to_string(),
                });
            }
        } else if target.is_watch {
            target.class = Some(RequestClass::Watch);
        }
        Ok(target)
    }

    /// `[<group>] <version> [namespaces <ns>] <resource> [<name> [<sub>...]]`
    fn parse_grouped(&mut self, segments: &[&str], has_group: bool) -> Result<(), RewriteError> {
        let mut rest = segments;
        if has_group {
            if let Some((group, tail)) = rest.split_first() {
                self.group = Some(group.to_string());
                rest = tail;
            } else {
                return Ok(());
            }
        }
        if let Some((version, tail)) = rest.split_first() {
            self.version = Some(version.to_string());
            rest = tail;
        } else {
            return Ok(());
        }
        if rest.first() == Some(&"namespaces") && rest.len() >= 2 {
            self.namespace = Some(rest[1].to_string());
            rest = &rest[2..];
            // `/namespaces/<ns>` with nothing behind it addresses the
            // namespace object itself; that is a core resource path.
            if rest.is_empty() {
                self.resource_type = Some("namespaces".to_string());
                self.name = self.namespace.take();
                return Ok(());
            }
        }
        if let Some((resource, tail)) = rest.split_first() {
            self.resource_type = Some(resource.to_string());
            rest = tail;
        }
        if let Some((name, tail)) = rest.split_first() {
            self.name = Some(name.to_string());
            rest = tail;
        }
        if let Some((subresource, tail)) = rest.split_first() {
            self.subresource = Some(subresource.to_string());
            rest = tail;
        }
        self.remainder = rest.iter().map(|s| s.to_string()).collect();
        Ok(())
    }

    /// Rebuilds the upstream path with the group and resource renamed.
    pub fn rename_path(&self, rules: &RewriteRules) -> String {
        let mut segments: Vec<String> = Vec::new();
        let group_rule = self
            .group
            .as_deref()
            .and_then(|group| rules.group_rule(Action::Rename, group));
        match self.class() {
            RequestClass::Core => segments.push("api".to_string()),
            _ => segments.push("apis".to_string()),
        }
        if let Some(group) = &self.group {
            segments.push(
                group_rule
                    .map(|rule| rule.renamed_group.clone())
                    .unwrap_or_else(|| group.clone()),
            );
        }
        if let Some(version) = &self.version {
            segments.push(version.clone());
        }
        if let Some(namespace) = &self.namespace {
            segments.push("namespaces".to_string());
            segments.push(namespace.clone());
        }
        if let Some(resource_type) = &self.resource_type {
            segments.push(rename_resource_segment(rules, group_rule, resource_type));
        }
        if let Some(name) = &self.name {
            segments.push(self.rename_object_name(rules, name));
        }
        if let Some(subresource) = &self.subresource {
            segments.push(subresource.clone());
        }
        segments.extend(self.remainder.iter().cloned());
        format!("/{}", segments.join("/"))
    }

    fn rename_object_name(&self, rules: &RewriteRules, name: &str) -> String {
        if self.class() != RequestClass::Crd {
            return name.to_string();
        }
        let crd = match &self.crd {
            Some(crd) => crd,
            None => return name.to_string(),
        };
        let group_rule = match rules.group_rule(Action::Rename, &crd.group) {
            Some(rule) => rule,
            None => return name.to_string(),
        };
        match rules.resource_by_plural(group_rule, Action::Rename, &crd.resource_type) {
            Some(resource) => format!("{}.{}", resource.renamed_plural, group_rule.renamed_group),
            None => name.to_string(),
        }
    }
}

fn rename_resource_segment(
    rules: &RewriteRules,
    group_rule: Option<&GroupRule>,
    resource_type: &str,
) -> String {
    if let Some(rule) = group_rule {
        if let Some(resource) = rules.resource_by_plural(rule, Action::Rename, resource_type) {
            return resource.renamed_plural.clone();
        }
    }
    resource_type.to_string()
}

fn has_watch_param(query: &str) -> bool {
    url::form_urlencoded::parse(query.as_bytes())
        .any(|(key, value)| key == "watch" && value == "true")
}

/// Rewrites `labelSelector` keys and `fieldSelector` values of a query
/// string, leaving everything else (ordering included) intact.
pub fn rename_query(rules: &RewriteRules, target: &PathTarget, query: &str) -> String {
    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
        match key.as_ref() {
            "labelSelector" => {
                serializer.append_pair("labelSelector", &rewrite_label_selector_expr(rules, &value));
            }
            "fieldSelector" => {
                serializer.append_pair(
                    "fieldSelector",
                    &rewrite_field_selector(rules, target, &value),
                );
            }
            _ => {
                serializer.append_pair(&key, &value);
            }
        }
    }
    serializer.finish()
}

/// Rewrites the keys of a Kubernetes label selector expression
/// (`k=v,k2 in (a,b),!k3`), leaving operators and values alone.
pub fn rewrite_label_selector_expr(rules: &RewriteRules, expr: &str) -> String {
    split_top_level(expr)
        .into_iter()
        .map(|segment| {
            let trimmed = segment.trim_start();
            let leading = &segment[..segment.len() - trimmed.len()];
            let (negation, rest) = match trimmed.strip_prefix('!') {
                Some(rest) => ("!", rest.trim_start()),
                None => ("", trimmed),
            };
            let key_end = rest
                .find(|c: char| c == '=' || c == '!' || c == ' ' || c == '<' || c == '>')
                .unwrap_or(rest.len());
            let (key, tail) = rest.split_at(key_end);
            let rewritten =
                rewrite_metadata_key(&rules.labels, &rules.preserved_prefix, Action::Rename, key);
            format!("{}{}{}{}", leading, negation, rewritten, tail)
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// Splits on commas outside parentheses.
fn split_top_level(expr: &str) -> Vec<&str> {
    let mut segments = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    for (i, c) in expr.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                segments.push(&expr[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    segments.push(&expr[start..]);
    segments
}

/// Field selectors carry renamed content in two places: CRD name filters
/// and CRD group filters.
fn rewrite_field_selector(rules: &RewriteRules, target: &PathTarget, expr: &str) -> String {
    expr.split(',')
        .map(|clause| {
            let (field, value) = match clause.split_once('=') {
                Some(parts) => parts,
                None => return clause.to_string(),
            };
            match field {
                "metadata.name" if target.class() == RequestClass::Crd => {
                    if let Ok((plural, group)) = crate::crd::split_crd_name(value) {
                        if let Some(rule) = rules.group_rule(Action::Rename, group) {
                            if let Some(resource) =
                                rules.resource_by_plural(rule, Action::Rename, plural)
                            {
                                return format!(
                                    "{}={}.{}",
                                    field, resource.renamed_plural, rule.renamed_group
                                );
                            }
                        }
                    }
                    clause.to_string()
                }
                "spec.group" => format!(
                    "{}={}",
                    field,
                    rules.rewrite_group(Action::Rename, value)
                ),
                _ => clause.to_string(),
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testing::test_rules;

    #[test]
    fn classifies_and_parses_apis_path() {
        let rules = test_rules();
        let target = PathTarget::parse(
            &rules,
            "/apis/original.group.io/v1/namespaces/ns/someresources/obj/status",
            None,
        )
        .unwrap();
        assert_eq!(target.class(), RequestClass::Apis);
        assert_eq!(target.group.as_deref(), Some("original.group.io"));
        assert_eq!(target.version.as_deref(), Some("v1"));
        assert_eq!(target.namespace.as_deref(), Some("ns"));
        assert_eq!(target.resource_type.as_deref(), Some("someresources"));
        assert_eq!(target.name.as_deref(), Some("obj"));
        assert_eq!(target.subresource.as_deref(), Some("status"));
    }

    #[test]
    fn watch_classification_from_query() {
        let rules = test_rules();
        let target = PathTarget::parse(
            &rules,
            "/apis/original.group.io/v1/someresources",
            Some("watch=true&resourceVersion=5"),
        )
        .unwrap();
        assert_eq!(target.class(), RequestClass::Watch);
        assert!(target.is_watch);
    }

    #[test]
    fn webhook_and_unknown_paths() {
        let rules = test_rules();
        let target = PathTarget::parse(&rules, "/validate-original-group-io", None).unwrap();
        assert_eq!(target.class(), RequestClass::Webhook);

        let target = PathTarget::parse(&rules, "/healthz", None).unwrap();
        assert_eq!(target.class(), RequestClass::Unknown);
    }

    #[test]
    fn crd_name_split() {
        let rules = test_rules();
        let target = PathTarget::parse(
            &rules,
            "/apis/apiextensions.k8s.io/v1/customresourcedefinitions/someresources.original.group.io",
            None,
        )
        .unwrap();
        assert_eq!(target.class(), RequestClass::Crd);
        let crd = target.crd.as_ref().unwrap();
        assert_eq!(crd.resource_type, "someresources");
        assert_eq!(crd.group, "original.group.io");
        assert_eq!(
            target.rename_path(&rules),
            "/apis/apiextensions.k8s.io/v1/customresourcedefinitions/prefixedsomeresources.prefixed.resources.group.io"
        );
    }

    #[test]
    fn renames_path_segments() {
        let rules = test_rules();
        let target = PathTarget::parse(
            &rules,
            "/apis/original.group.io/v1/namespaces/ns/someresources",
            Some("watch=true"),
        )
        .unwrap();
        assert_eq!(
            target.rename_path(&rules),
            "/apis/prefixed.resources.group.io/v1/namespaces/ns/prefixedsomeresources"
        );
    }

    #[test]
    fn unrelated_path_unchanged() {
        let rules = test_rules();
        let target = PathTarget::parse(&rules, "/api/v1/namespaces/ns/pods/p/log", None).unwrap();
        assert_eq!(target.rename_path(&rules), "/api/v1/namespaces/ns/pods/p/log");
    }

    #[test]
    fn label_selector_query_rewritten() {
        let rules = test_rules();
        let expr = "original.group.io/role=worker,exact-label in (a,b),!original.group.io/off";
        let rewritten = rewrite_label_selector_expr(&rules, expr);
        assert_eq!(
            rewritten,
            "replaced.prefixed.resources.group.io/role=worker,renamed-exact-label in (a,b),!replaced.prefixed.resources.group.io/off"
        );
    }

    #[test]
    fn field_selector_for_crd_watch() {
        let rules = test_rules();
        let target = PathTarget::parse(
            &rules,
            "/apis/apiextensions.k8s.io/v1/customresourcedefinitions",
            Some("watch=true&fieldSelector=metadata.name%3Dsomeresources.original.group.io"),
        )
        .unwrap();
        let query = rename_query(
            &rules,
            &target,
            "watch=true&fieldSelector=metadata.name%3Dsomeresources.original.group.io",
        );
        assert!(query.contains("prefixedsomeresources.prefixed.resources.group.io"));
    }
}
