//! The policy store: managed-nodes and device-approval policies derived
//! from the module configuration object.
//!
//! Invalid configuration never crashes the controller. Each invalid part
//! logs a warning and falls back to the policy captured at construction.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use gpu_api::config::{ApprovalMode, GPUControllerConfigSpec};
use gpu_api::labels::{DEFAULT_MANAGED_LABEL, GPU_PRESENT_PREFIXES};
use gpu_api::selector::CompiledSelector;
use tracing::warn;

/// Which nodes are in scope for the control plane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedNodesPolicy {
    /// Node label deciding managedness; its value `"true"` wins.
    pub label_key: String,
    /// Applied when the label is absent.
    pub enabled_by_default: bool,
}

impl Default for ManagedNodesPolicy {
    fn default() -> Self {
        ManagedNodesPolicy {
            label_key: DEFAULT_MANAGED_LABEL.to_string(),
            enabled_by_default: false,
        }
    }
}

/// Whether devices on managed nodes auto-attach to pools.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceApprovalPolicy {
    pub mode: ApprovalMode,
    selector: CompiledSelector,
}

impl DeviceApprovalPolicy {
    pub fn manual() -> Self {
        DeviceApprovalPolicy {
            mode: ApprovalMode::Manual,
            selector: CompiledSelector::default(),
        }
    }

    pub fn automatic() -> Self {
        DeviceApprovalPolicy {
            mode: ApprovalMode::Automatic,
            selector: CompiledSelector::default(),
        }
    }

    pub fn with_selector(selector: CompiledSelector) -> Self {
        DeviceApprovalPolicy {
            mode: ApprovalMode::Selector,
            selector,
        }
    }

    /// Policy-level auto-attach verdict. The device service additionally
    /// requires the node to be managed. An empty selector matches all.
    pub fn auto_attach(&self, _managed: bool, node_labels: &BTreeMap<String, String>) -> bool {
        match self.mode {
            ApprovalMode::Manual => false,
            ApprovalMode::Automatic => true,
            ApprovalMode::Selector => self.selector.matches(node_labels),
        }
    }
}

/// Immutable policy pair published by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyState {
    pub managed: ManagedNodesPolicy,
    pub approval: DeviceApprovalPolicy,
}

/// Read-many / write-one holder of the current policies.
pub struct PolicyStore {
    fallback: PolicyState,
    state: RwLock<Arc<PolicyState>>,
}

impl PolicyStore {
    pub fn new(managed: ManagedNodesPolicy, approval: DeviceApprovalPolicy) -> Self {
        let fallback = PolicyState { managed, approval };
        PolicyStore {
            state: RwLock::new(Arc::new(fallback.clone())),
            fallback,
        }
    }

    pub fn current(&self) -> Arc<PolicyState> {
        self.state.read().expect("policy lock poisoned").clone()
    }

    /// Folds a configuration spec into the store. Returns true when the
    /// effective policies changed, which triggers a node resync.
    pub fn apply(&self, spec: &GPUControllerConfigSpec) -> bool {
        let managed = match &spec.managed_nodes {
            Some(section) => {
                let label_key = section
                    .label_key
                    .clone()
                    .unwrap_or_else(|| self.fallback.managed.label_key.clone());
                if label_key.trim().is_empty() {
                    warn!("managed-nodes label key is blank, keeping fallback policy");
                    self.fallback.managed.clone()
                } else {
                    ManagedNodesPolicy {
                        label_key,
                        enabled_by_default: section
                            .enabled_by_default
                            .unwrap_or(self.fallback.managed.enabled_by_default),
                    }
                }
            }
            None => self.fallback.managed.clone(),
        };

        let approval = match &spec.device_approval {
            Some(section) => {
                let mode = section.mode.unwrap_or(self.fallback.approval.mode);
                match mode {
                    ApprovalMode::Manual => DeviceApprovalPolicy::manual(),
                    ApprovalMode::Automatic => DeviceApprovalPolicy::automatic(),
                    ApprovalMode::Selector => {
                        match CompiledSelector::compile_opt(section.selector.as_ref()) {
                            Ok(selector) => DeviceApprovalPolicy::with_selector(selector),
                            Err(err) => {
                                warn!(error = %err, "device-approval selector does not compile, keeping fallback policy");
                                self.fallback.approval.clone()
                            }
                        }
                    }
                }
            }
            None => self.fallback.approval.clone(),
        };

        let next = PolicyState { managed, approval };
        let mut guard = self.state.write().expect("policy lock poisoned");
        if **guard == next {
            return false;
        }
        *guard = Arc::new(next);
        true
    }
}

/// True when the node's labels indicate GPU hardware is or was present.
/// Used to bound policy-change resyncs to relevant nodes.
pub fn gpu_present(labels: &BTreeMap<String, String>) -> bool {
    labels
        .keys()
        .any(|key| GPU_PRESENT_PREFIXES.iter().any(|p| key.starts_with(p)))
}

#[cfg(test)]
mod test {
    use super::*;
    use gpu_api::config::{DeviceApprovalSpec, ManagedNodesSpec};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{
        LabelSelector, LabelSelectorRequirement,
    };

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn selector_mode_matches_node_labels() {
        let selector = LabelSelector {
            match_labels: Some(labels(&[("vendor", "10de")])),
            match_expressions: None,
        };
        let policy =
            DeviceApprovalPolicy::with_selector(CompiledSelector::compile(&selector).unwrap());
        assert!(policy.auto_attach(true, &labels(&[("vendor", "10de")])));
        assert!(!policy.auto_attach(true, &labels(&[("vendor", "1234")])));
    }

    #[test]
    fn empty_selector_matches_all() {
        let policy = DeviceApprovalPolicy::with_selector(CompiledSelector::default());
        assert!(policy.auto_attach(true, &BTreeMap::new()));
    }

    #[test]
    fn invalid_config_returns_fallback() {
        let store = PolicyStore::new(
            ManagedNodesPolicy::default(),
            DeviceApprovalPolicy::manual(),
        );
        let spec = GPUControllerConfigSpec {
            managed_nodes: Some(ManagedNodesSpec {
                label_key: Some("   ".to_string()),
                enabled_by_default: Some(true),
            }),
            device_approval: Some(DeviceApprovalSpec {
                mode: Some(ApprovalMode::Selector),
                selector: Some(LabelSelector {
                    match_labels: None,
                    match_expressions: Some(vec![LabelSelectorRequirement {
                        key: "zone".to_string(),
                        operator: "Near".to_string(),
                        values: None,
                    }]),
                }),
            }),
        };
        store.apply(&spec);
        let state = store.current();
        assert_eq!(state.managed.label_key, DEFAULT_MANAGED_LABEL);
        assert_eq!(state.approval.mode, ApprovalMode::Manual);
    }

    #[test]
    fn apply_reports_change_once() {
        let store = PolicyStore::new(
            ManagedNodesPolicy::default(),
            DeviceApprovalPolicy::manual(),
        );
        let spec = GPUControllerConfigSpec {
            managed_nodes: Some(ManagedNodesSpec {
                label_key: Some("custom/enabled".to_string()),
                enabled_by_default: Some(true),
            }),
            device_approval: None,
        };
        assert!(store.apply(&spec));
        assert!(!store.apply(&spec));
        assert_eq!(store.current().managed.label_key, "custom/enabled");
    }

    #[test]
    fn gpu_present_filter() {
        assert!(gpu_present(&labels(&[(
            "gpu.deckhouse.io/device.00.vendor",
            "10de"
        )])));
        assert!(gpu_present(&labels(&[("nvidia.com/gpu.product", "A100")])));
        assert!(gpu_present(&labels(&[("nvidia.com/mig.capable", "true")])));
        assert!(!gpu_present(&labels(&[("kubernetes.io/os", "linux")])));
    }
}
