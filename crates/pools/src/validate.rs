//! Pool spec validation. Runs after [`crate::defaults::apply_defaults`];
//! every violation is collected so the admission response names them all.

use gpu_api::pool::{
    GPUPoolSpec, PoolBackend, PoolProvider, ResourceUnit, SchedulingStrategy,
};
use gpu_api::selector::CompiledSelector;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use lazy_static::lazy_static;
use regex::Regex;
use thiserror::Error;

lazy_static! {
    static ref MIG_PROFILE: Regex = Regex::new(r"^\d+g\.\d+gb$").unwrap();
    static ref PCI_ID: Regex = Regex::new(r"^[0-9a-fA-F]{4}$").unwrap();
}

pub const MIN_SLICES: u32 = 1;
pub const MAX_SLICES: u32 = 64;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{}", .0.join("; "))]
pub struct ValidationErrors(pub Vec<String>);

/// Validates a defaulted pool spec.
pub fn validate_pool(name: &str, spec: &GPUPoolSpec) -> Result<(), ValidationErrors> {
    let mut errors = Vec::new();

    if name.trim().is_empty() {
        errors.push("metadata.name must not be empty".to_string());
    }
    if spec.provider != Some(PoolProvider::Nvidia) {
        errors.push("spec.provider must be Nvidia".to_string());
    }

    validate_resource(spec, &mut errors);
    validate_scheduling(spec, &mut errors);
    validate_selectors(spec, &mut errors);

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ValidationErrors(errors))
    }
}

fn validate_resource(spec: &GPUPoolSpec, errors: &mut Vec<String>) {
    let resource = &spec.resource;
    match resource.unit {
        ResourceUnit::Card => {
            if resource.mig_profile.is_some() {
                errors.push("spec.resource.migProfile is not allowed with unit Card".to_string());
            }
        }
        ResourceUnit::Mig => {
            if resource.mig_profile.is_none() && resource.mig_layout.is_empty() {
                errors.push(
                    "spec.resource with unit MIG requires migProfile or a non-empty migLayout"
                        .to_string(),
                );
            }
        }
    }
    if let Some(profile) = &resource.mig_profile {
        if !MIG_PROFILE.is_match(profile) {
            errors.push(format!(
                "spec.resource.migProfile {:?} does not match the <N>g.<M>gb format",
                profile
            ));
        }
    }
    if !(MIN_SLICES..=MAX_SLICES).contains(&resource.slices_per_unit) {
        errors.push(format!(
            "spec.resource.slicesPerUnit must be within [{}, {}]",
            MIN_SLICES, MAX_SLICES
        ));
    }
    for (i, ts) in resource.time_slicing_resources.iter().enumerate() {
        if ts.name.trim().is_empty() {
            errors.push(format!(
                "spec.resource.timeSlicingResources[{}].name must not be empty",
                i
            ));
        }
        if ts.slices_per_unit < 1 {
            errors.push(format!(
                "spec.resource.timeSlicingResources[{}].slicesPerUnit must be at least 1",
                i
            ));
        }
    }

    if spec.backend == Some(PoolBackend::Dra) {
        if resource.unit != ResourceUnit::Card {
            errors.push("spec.backend DRA requires unit Card".to_string());
        }
        if resource.slices_per_unit != 1 {
            errors.push("spec.backend DRA requires slicesPerUnit 1".to_string());
        }
        if !resource.mig_layout.is_empty() {
            errors.push("spec.backend DRA does not allow a migLayout".to_string());
        }
    }

    for (i, layout) in resource.mig_layout.iter().enumerate() {
        let mut shared_slices: Option<u32> = None;
        for (j, profile) in layout.profiles.iter().enumerate() {
            if profile.name.trim().is_empty() {
                errors.push(format!(
                    "spec.resource.migLayout[{}].profiles[{}].name must not be empty",
                    i, j
                ));
            } else if !MIG_PROFILE.is_match(&profile.name) {
                errors.push(format!(
                    "spec.resource.migLayout[{}].profiles[{}].name {:?} does not match the <N>g.<M>gb format",
                    i, j, profile.name
                ));
            }
            if let Some(count) = profile.count {
                if count < 1 {
                    errors.push(format!(
                        "spec.resource.migLayout[{}].profiles[{}].count must be at least 1",
                        i, j
                    ));
                }
            }
            if let Some(slices) = profile.slices_per_unit {
                match shared_slices {
                    None => shared_slices = Some(slices),
                    Some(shared) if shared != slices => {
                        errors.push(format!(
                            "spec.resource.migLayout[{}] profiles must share one slicesPerUnit",
                            i
                        ));
                    }
                    Some(_) => {}
                }
            }
        }
        if let Some(shared) = shared_slices {
            if shared != resource.slices_per_unit {
                errors.push(format!(
                    "spec.resource.migLayout[{}] slicesPerUnit {} disagrees with spec.resource.slicesPerUnit {}",
                    i, shared, resource.slices_per_unit
                ));
            }
        }
    }
}

fn validate_scheduling(spec: &GPUPoolSpec, errors: &mut Vec<String>) {
    match spec.scheduling.strategy {
        Some(SchedulingStrategy::Spread) => {
            if spec
                .scheduling
                .topology_key
                .as_deref()
                .unwrap_or("")
                .is_empty()
            {
                errors.push("spec.scheduling.strategy Spread requires a topologyKey".to_string());
            }
        }
        Some(SchedulingStrategy::BinPack) => {}
        None => errors.push("spec.scheduling.strategy must be Spread or BinPack".to_string()),
    }
    for (i, taint) in spec.scheduling.taints.iter().enumerate() {
        if taint.key.trim().is_empty() {
            errors.push(format!(
                "spec.scheduling.taints[{}].key must not be empty",
                i
            ));
        }
    }
}

fn validate_selectors(spec: &GPUPoolSpec, errors: &mut Vec<String>) {
    if let Some(selector) = &spec.device_selector {
        for (scope, rules) in [
            ("include", selector.include.as_ref()),
            ("exclude", selector.exclude.as_ref()),
        ] {
            let rules = match rules {
                Some(rules) => rules,
                None => continue,
            };
            for (field, ids) in [
                ("pciVendors", &rules.pci_vendors),
                ("pciDevices", &rules.pci_devices),
            ] {
                for id in ids {
                    if !PCI_ID.is_match(id) {
                        errors.push(format!(
                            "spec.deviceSelector.{}.{} entry {:?} must be exactly 4 hex characters",
                            scope, field, id
                        ));
                    }
                }
            }
            for profile in &rules.mig_profiles {
                if !MIG_PROFILE.is_match(profile) {
                    errors.push(format!(
                        "spec.deviceSelector.{}.migProfiles entry {:?} does not match the <N>g.<M>gb format",
                        scope, profile
                    ));
                }
            }
            check_selector(
                &format!("spec.deviceSelector.{}.matchLabels", scope),
                rules.match_labels.as_ref(),
                errors,
            );
        }
    }
    check_selector("spec.nodeSelector", spec.node_selector.as_ref(), errors);
    if let Some(assignment) = &spec.device_assignment {
        check_selector(
            "spec.deviceAssignment.autoApproveSelector",
            assignment.auto_approve_selector.as_ref(),
            errors,
        );
    }
}

fn check_selector(field: &str, selector: Option<&LabelSelector>, errors: &mut Vec<String>) {
    if let Some(selector) = selector {
        if let Err(err) = CompiledSelector::compile(selector) {
            errors.push(format!("{} does not compile: {}", field, err));
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::defaults::apply_defaults;
    use gpu_api::pool::{
        DeviceSelector, MIGLayout, MIGLayoutProfile, SelectorRules, TimeSlicingResource,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelectorRequirement;

    fn defaulted(mut spec: GPUPoolSpec) -> GPUPoolSpec {
        apply_defaults(&mut spec);
        spec
    }

    #[test]
    fn defaulted_empty_spec_is_valid() {
        let spec = defaulted(GPUPoolSpec::default());
        assert!(validate_pool("pool-a", &spec).is_ok());
    }

    #[test]
    fn empty_name_rejected() {
        let spec = defaulted(GPUPoolSpec::default());
        let err = validate_pool("", &spec).unwrap_err();
        assert!(err.0[0].contains("metadata.name"));
    }

    #[test]
    fn card_unit_forbids_mig_profile() {
        let mut spec = GPUPoolSpec::default();
        spec.resource.mig_profile = Some("1g.5gb".to_string());
        let spec = defaulted(spec);
        assert!(validate_pool("pool-a", &spec).is_err());
    }

    #[test]
    fn mig_unit_requires_profile_or_layout() {
        let mut spec = GPUPoolSpec::default();
        spec.resource.unit = ResourceUnit::Mig;
        let spec = defaulted(spec);
        assert!(validate_pool("pool-a", &spec).is_err());

        let mut spec = GPUPoolSpec::default();
        spec.resource.unit = ResourceUnit::Mig;
        spec.resource.mig_profile = Some("3g.20gb".to_string());
        let spec = defaulted(spec);
        assert!(validate_pool("pool-a", &spec).is_ok());
    }

    #[test]
    fn mig_profile_format_enforced() {
        let mut spec = GPUPoolSpec::default();
        spec.resource.unit = ResourceUnit::Mig;
        spec.resource.mig_profile = Some("huge".to_string());
        let spec = defaulted(spec);
        let err = validate_pool("pool-a", &spec).unwrap_err();
        assert!(err.0.iter().any(|e| e.contains("migProfile")));
    }

    #[test]
    fn slices_bounds_enforced() {
        let mut spec = GPUPoolSpec::default();
        spec.resource.slices_per_unit = 65;
        let spec = defaulted(spec);
        assert!(validate_pool("pool-a", &spec).is_err());
    }

    #[test]
    fn time_slicing_entries_checked() {
        let mut spec = GPUPoolSpec::default();
        spec.resource.time_slicing_resources = vec![TimeSlicingResource {
            name: "".to_string(),
            slices_per_unit: 0,
        }];
        let spec = defaulted(spec);
        let err = validate_pool("pool-a", &spec).unwrap_err();
        assert_eq!(err.0.len(), 2);
    }

    #[test]
    fn dra_backend_constraints() {
        let mut spec = GPUPoolSpec {
            backend: Some(PoolBackend::Dra),
            ..Default::default()
        };
        spec.resource.slices_per_unit = 2;
        let spec = defaulted(spec);
        let err = validate_pool("pool-a", &spec).unwrap_err();
        assert!(err.0.iter().any(|e| e.contains("DRA")));

        // DRA with time slicing resources is accepted.
        let mut spec = GPUPoolSpec {
            backend: Some(PoolBackend::Dra),
            ..Default::default()
        };
        spec.resource.time_slicing_resources = vec![TimeSlicingResource {
            name: "shared".to_string(),
            slices_per_unit: 2,
        }];
        let spec = defaulted(spec);
        assert!(validate_pool("pool-a", &spec).is_ok());
    }

    #[test]
    fn layout_slices_must_agree() {
        let mut spec = GPUPoolSpec::default();
        spec.resource.unit = ResourceUnit::Mig;
        spec.resource.slices_per_unit = 2;
        spec.resource.mig_layout = vec![MIGLayout {
            name: "mixed".to_string(),
            profiles: vec![
                MIGLayoutProfile {
                    name: "1g.5gb".to_string(),
                    count: Some(4),
                    slices_per_unit: Some(2),
                },
                MIGLayoutProfile {
                    name: "2g.10gb".to_string(),
                    count: Some(1),
                    slices_per_unit: Some(3),
                },
            ],
        }];
        let spec = defaulted(spec);
        let err = validate_pool("pool-a", &spec).unwrap_err();
        assert!(err.0.iter().any(|e| e.contains("share one slicesPerUnit")));
    }

    #[test]
    fn spread_requires_topology_key() {
        let mut spec = defaulted(GPUPoolSpec::default());
        spec.scheduling.topology_key = Some("".to_string());
        let err = validate_pool("pool-a", &spec).unwrap_err();
        assert!(err.0.iter().any(|e| e.contains("topologyKey")));
    }

    #[test]
    fn pci_ids_must_be_hex4() {
        let mut spec = GPUPoolSpec {
            device_selector: Some(DeviceSelector {
                include: Some(SelectorRules {
                    pci_vendors: vec!["10de".to_string(), "xyz".to_string()],
                    ..Default::default()
                }),
                exclude: None,
            }),
            ..Default::default()
        };
        apply_defaults(&mut spec);
        let err = validate_pool("pool-a", &spec).unwrap_err();
        assert_eq!(err.0.len(), 1);
        assert!(err.0[0].contains("xyz"));
    }

    #[test]
    fn bad_label_selector_rejected() {
        let spec = defaulted(GPUPoolSpec {
            node_selector: Some(LabelSelector {
                match_labels: None,
                match_expressions: Some(vec![LabelSelectorRequirement {
                    key: "zone".to_string(),
                    operator: "Near".to_string(),
                    values: None,
                }]),
            }),
            ..Default::default()
        });
        let err = validate_pool("pool-a", &spec).unwrap_err();
        assert!(err.0.iter().any(|e| e.contains("nodeSelector")));
    }
}
