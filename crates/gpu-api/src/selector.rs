//! Compiled Kubernetes label selectors.
//!
//! The control plane evaluates user-supplied `LabelSelector`s in several
//! places (pool admission, approval policy, device selectors). Compilation
//! front-loads the validation so that a malformed selector is rejected once,
//! with a precise reason, instead of silently matching nothing.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SelectorError {
    #[error("unknown operator {0:?} for key {1:?}")]
    UnknownOperator(String, String),
    #[error("operator {0} for key {1:?} requires a non-empty values list")]
    MissingValues(String, String),
    #[error("operator {0} for key {1:?} must not carry values")]
    UnexpectedValues(String, String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Requirement {
    /// `matchLabels` entry or `In` expression.
    In { key: String, values: Vec<String> },
    NotIn { key: String, values: Vec<String> },
    Exists { key: String },
    DoesNotExist { key: String },
}

impl Requirement {
    fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        match self {
            Requirement::In { key, values } => labels
                .get(key)
                .map(|v| values.iter().any(|candidate| candidate == v))
                .unwrap_or(false),
            Requirement::NotIn { key, values } => labels
                .get(key)
                .map(|v| !values.iter().any(|candidate| candidate == v))
                .unwrap_or(true),
            Requirement::Exists { key } => labels.contains_key(key),
            Requirement::DoesNotExist { key } => !labels.contains_key(key),
        }
    }
}

/// A validated label selector. An empty selector matches everything, per
/// Kubernetes semantics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompiledSelector {
    requirements: Vec<Requirement>,
}

impl CompiledSelector {
    /// Compiles a `LabelSelector`, rejecting malformed expressions.
    pub fn compile(selector: &LabelSelector) -> Result<Self, SelectorError> {
        let mut requirements = Vec::new();
        if let Some(match_labels) = &selector.match_labels {
            for (key, value) in match_labels {
                requirements.push(Requirement::In {
                    key: key.clone(),
                    values: vec![value.clone()],
                });
            }
        }
        if let Some(expressions) = &selector.match_expressions {
            for expr in expressions {
                let values = expr.values.clone().unwrap_or_default();
                let requirement = match expr.operator.as_str() {
                    "In" | "NotIn" => {
                        if values.is_empty() {
                            return Err(SelectorError::MissingValues(
                                expr.operator.clone(),
                                expr.key.clone(),
                            ));
                        }
                        if expr.operator == "In" {
                            Requirement::In {
                                key: expr.key.clone(),
                                values,
                            }
                        } else {
                            Requirement::NotIn {
                                key: expr.key.clone(),
                                values,
                            }
                        }
                    }
                    "Exists" | "DoesNotExist" => {
                        if !values.is_empty() {
                            return Err(SelectorError::UnexpectedValues(
                                expr.operator.clone(),
                                expr.key.clone(),
                            ));
                        }
                        if expr.operator == "Exists" {
                            Requirement::Exists {
                                key: expr.key.clone(),
                            }
                        } else {
                            Requirement::DoesNotExist {
                                key: expr.key.clone(),
                            }
                        }
                    }
                    other => {
                        return Err(SelectorError::UnknownOperator(
                            other.to_string(),
                            expr.key.clone(),
                        ))
                    }
                };
                requirements.push(requirement);
            }
        }
        Ok(CompiledSelector { requirements })
    }

    /// Compiles an optional selector; `None` becomes match-all.
    pub fn compile_opt(selector: Option<&LabelSelector>) -> Result<Self, SelectorError> {
        match selector {
            Some(s) => Self::compile(s),
            None => Ok(Self::default()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }

    /// All requirements must hold.
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.requirements.iter().all(|r| r.matches(labels))
    }
}
