//! The mutating defaulting pass, applied before validation.

use gpu_api::pool::{
    GPUPoolSpec, PoolBackend, PoolProvider, SchedulingStrategy,
};

pub const DEFAULT_TOPOLOGY_KEY: &str = "topology.kubernetes.io/zone";

/// Fills unset fields with their documented defaults and normalizes every
/// user-supplied list (trimmed, deduplicated, order-preserving).
pub fn apply_defaults(spec: &mut GPUPoolSpec) {
    if spec.provider.is_none() {
        spec.provider = Some(PoolProvider::Nvidia);
    }
    if spec.backend.is_none() {
        spec.backend = Some(PoolBackend::DevicePlugin);
    }
    if spec.resource.slices_per_unit == 0 {
        spec.resource.slices_per_unit = 1;
    }
    if spec.scheduling.strategy.is_none() {
        spec.scheduling.strategy = Some(SchedulingStrategy::Spread);
    }
    if spec.scheduling.strategy == Some(SchedulingStrategy::Spread)
        && spec
            .scheduling
            .topology_key
            .as_deref()
            .unwrap_or("")
            .is_empty()
    {
        spec.scheduling.topology_key = Some(DEFAULT_TOPOLOGY_KEY.to_string());
    }
    if spec.scheduling.taints_enabled.is_none() {
        spec.scheduling.taints_enabled = Some(true);
    }

    if let Some(access) = &mut spec.access {
        dedup_trim(&mut access.namespaces);
        dedup_trim(&mut access.service_accounts);
    }
    if let Some(selector) = &mut spec.device_selector {
        for rules in [selector.include.as_mut(), selector.exclude.as_mut()]
            .into_iter()
            .flatten()
        {
            dedup_trim(&mut rules.inventory_ids);
            dedup_trim(&mut rules.pci_vendors);
            dedup_trim(&mut rules.pci_devices);
            dedup_trim(&mut rules.mig_profiles);
        }
    }
}

fn dedup_trim(values: &mut Vec<String>) {
    let mut seen = std::collections::BTreeSet::new();
    values.retain_mut(|value| {
        *value = value.trim().to_string();
        !value.is_empty() && seen.insert(value.clone())
    });
}
