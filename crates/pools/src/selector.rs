//! The device selector engine.
//!
//! `include` is a conjunction of rule types, each rule type a disjunction
//! of its entries. `exclude` carves matching devices back out: a device
//! matching any exclude rule type is rejected.

use gpu_api::device::GPUDevice;
use gpu_api::pool::{DeviceSelector, SelectorRules};
use gpu_api::selector::CompiledSelector;

/// Whether a device may join a pool guarded by `selector`. A nil selector
/// admits every device; a nil device matches nothing.
pub fn device_matches(device: Option<&GPUDevice>, selector: Option<&DeviceSelector>) -> bool {
    let selector = match selector {
        Some(selector) => selector,
        None => return device.is_some(),
    };
    let device = match device {
        Some(device) => device,
        None => return false,
    };

    let included = selector
        .include
        .as_ref()
        .map(|rules| all_rules_match(device, rules))
        .unwrap_or(true);
    let excluded = selector
        .exclude
        .as_ref()
        .map(|rules| any_rule_matches(device, rules))
        .unwrap_or(false);
    included && !excluded
}

/// Conjunction across rule types; empty lists are vacuous.
fn all_rules_match(device: &GPUDevice, rules: &SelectorRules) -> bool {
    rule_verdicts(device, rules).into_iter().all(|v| v.unwrap_or(true))
}

/// Disjunction across rule types; empty lists never match.
fn any_rule_matches(device: &GPUDevice, rules: &SelectorRules) -> bool {
    rule_verdicts(device, rules).into_iter().any(|v| v.unwrap_or(false))
}

/// Per-rule-type verdicts; `None` marks an absent rule.
fn rule_verdicts(device: &GPUDevice, rules: &SelectorRules) -> [Option<bool>; 5] {
    let status = device.status.as_ref();
    let hardware = status.map(|s| &s.hardware);

    let inventory_ids = non_empty(&rules.inventory_ids).map(|ids| {
        status
            .map(|s| ids.iter().any(|id| *id == s.inventory_id))
            .unwrap_or(false)
    });
    let vendors = non_empty(&rules.pci_vendors).map(|ids| {
        hardware
            .map(|h| ids.iter().any(|id| id.eq_ignore_ascii_case(&h.vendor)))
            .unwrap_or(false)
    });
    let devices = non_empty(&rules.pci_devices).map(|ids| {
        hardware
            .map(|h| ids.iter().any(|id| id.eq_ignore_ascii_case(&h.device)))
            .unwrap_or(false)
    });
    let mig_profiles = non_empty(&rules.mig_profiles).map(|profiles| {
        hardware
            .map(|h| {
                profiles
                    .iter()
                    .any(|p| h.mig.profiles.iter().any(|have| have == p))
            })
            .unwrap_or(false)
    });
    let labels = rules.match_labels.as_ref().map(|selector| {
        match CompiledSelector::compile(selector) {
            Ok(compiled) => {
                let labels = device.metadata.labels.clone().unwrap_or_default();
                compiled.matches(&labels)
            }
            // Validation rejects uncompilable selectors; an invalid one
            // that slipped through matches nothing.
            Err(_) => false,
        }
    });

    [inventory_ids, vendors, devices, mig_profiles, labels]
}

fn non_empty(values: &[String]) -> Option<&[String]> {
    if values.is_empty() {
        None
    } else {
        Some(values)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use gpu_api::device::{GPUDeviceStatus, GPUHardware, MIGCapability};

    fn device() -> GPUDevice {
        let mut device = GPUDevice::new("worker-a-00-10de-1db5", Default::default());
        device.metadata.labels = Some(
            [("tier".to_string(), "prod".to_string())]
                .into_iter()
                .collect(),
        );
        device.status = Some(GPUDeviceStatus {
            inventory_id: "worker-a-00-10de-1db5".to_string(),
            hardware: GPUHardware {
                vendor: "10de".to_string(),
                device: "1db5".to_string(),
                mig: MIGCapability {
                    capable: true,
                    profiles: vec!["1g.5gb".to_string(), "2g.10gb".to_string()],
                    ..Default::default()
                },
                ..Default::default()
            },
            ..Default::default()
        });
        device
    }

    fn include(rules: SelectorRules) -> DeviceSelector {
        DeviceSelector {
            include: Some(rules),
            exclude: None,
        }
    }

    #[test]
    fn nil_selector_admits_device() {
        assert!(device_matches(Some(&device()), None));
    }

    #[test]
    fn nil_device_never_matches() {
        assert!(!device_matches(None, Some(&DeviceSelector::default())));
        assert!(!device_matches(None, None));
    }

    #[test]
    fn include_is_conjunction_of_rule_types() {
        let selector = include(SelectorRules {
            pci_vendors: vec!["10de".to_string()],
            pci_devices: vec!["ffff".to_string()],
            ..Default::default()
        });
        assert!(!device_matches(Some(&device()), Some(&selector)));

        let selector = include(SelectorRules {
            pci_vendors: vec!["10de".to_string()],
            pci_devices: vec!["1db5".to_string()],
            ..Default::default()
        });
        assert!(device_matches(Some(&device()), Some(&selector)));
    }

    #[test]
    fn entries_within_a_rule_disjoin() {
        let selector = include(SelectorRules {
            pci_vendors: vec!["1002".to_string(), "10DE".to_string()],
            ..Default::default()
        });
        assert!(device_matches(Some(&device()), Some(&selector)));
    }

    #[test]
    fn mig_profile_overlap() {
        let selector = include(SelectorRules {
            mig_profiles: vec!["2g.10gb".to_string()],
            ..Default::default()
        });
        assert!(device_matches(Some(&device()), Some(&selector)));

        let selector = include(SelectorRules {
            mig_profiles: vec!["7g.40gb".to_string()],
            ..Default::default()
        });
        assert!(!device_matches(Some(&device()), Some(&selector)));
    }

    #[test]
    fn exclude_rejects_on_any_rule() {
        let selector = DeviceSelector {
            include: Some(SelectorRules {
                pci_vendors: vec!["10de".to_string()],
                ..Default::default()
            }),
            exclude: Some(SelectorRules {
                inventory_ids: vec!["worker-a-00-10de-1db5".to_string()],
                ..Default::default()
            }),
        };
        assert!(!device_matches(Some(&device()), Some(&selector)));
    }

    #[test]
    fn label_rule_consults_device_labels() {
        let selector = include(SelectorRules {
            match_labels: Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector {
                match_labels: Some(
                    [("tier".to_string(), "prod".to_string())]
                        .into_iter()
                        .collect(),
                ),
                match_expressions: None,
            }),
            ..Default::default()
        });
        assert!(device_matches(Some(&device()), Some(&selector)));
    }

    #[test]
    fn matching_is_deterministic() {
        let selector = include(SelectorRules {
            pci_vendors: vec!["10de".to_string()],
            mig_profiles: vec!["1g.5gb".to_string()],
            ..Default::default()
        });
        let device = device();
        let first = device_matches(Some(&device), Some(&selector));
        for _ in 0..10 {
            assert_eq!(device_matches(Some(&device), Some(&selector)), first);
        }
    }
}
