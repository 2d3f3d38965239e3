//! The state builder: node labels + `NodeFeature` + managed policy in, a
//! [`NodeSnapshot`] out.
//!
//! Building never fails. Absent inputs yield an empty snapshot and
//! unparseable numeric labels yield absent optional fields.

use std::collections::BTreeMap;

use gpu_api::device::{GPUHardware, MIGInstanceCount, MIGStrategy};
use gpu_api::feature::NodeFeature;
use gpu_api::labels::{DEVICE_LABEL_PREFIX, NVIDIA_GPU_FEATURE};
use k8s_openapi::api::core::v1::Node;
use lazy_static::lazy_static;
use regex::Regex;

use crate::policy::ManagedNodesPolicy;

/// One device's identity and hardware attributes as observed this instant.
/// The shape is exactly the persisted hardware block, so the device service
/// copies it wholesale into the status.
pub type DeviceSnapshot = GPUHardware;

/// Derived per-node view. Never persisted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeSnapshot {
    pub managed: bool,
    pub feature_detected: bool,
    pub labels: BTreeMap<String, String>,
    /// Ordered by device index (zero-padded label form).
    pub devices: Vec<DeviceSnapshot>,
}

/// Object name (and inventory id) for a device snapshot.
pub fn device_name(node_name: &str, snapshot: &DeviceSnapshot) -> String {
    format!(
        "{}-{}-{}-{}",
        node_name, snapshot.index, snapshot.vendor, snapshot.device
    )
}

/// Node-scope labels overlaid onto every extracted device.
const LABEL_PRODUCT: &str = "nvidia.com/gpu.product";
const LABEL_MEMORY: &str = "nvidia.com/gpu.memory";
const LABEL_COMPUTE_MAJOR: &str = "nvidia.com/gpu.compute.major";
const LABEL_COMPUTE_MINOR: &str = "nvidia.com/gpu.compute.minor";
const LABEL_NUMA_NODE: &str = "nvidia.com/gpu.numa-node";
const LABEL_POWER_LIMIT: &str = "nvidia.com/gpu.power-limit";
const LABEL_SM_COUNT: &str = "nvidia.com/gpu.sm-count";
const LABEL_MEM_BANDWIDTH: &str = "nvidia.com/gpu.memory-bandwidth";
const LABEL_PCIE_GEN: &str = "nvidia.com/gpu.pcie-gen";
const LABEL_PCIE_LINK_WIDTH: &str = "nvidia.com/gpu.pcie-link-width";
const LABEL_BOARD: &str = "nvidia.com/gpu.board";
const LABEL_FAMILY: &str = "nvidia.com/gpu.family";
const LABEL_SERIAL: &str = "nvidia.com/gpu.serial";
const LABEL_PSTATE: &str = "nvidia.com/gpu.pstate";
const LABEL_DISPLAY_MODE: &str = "nvidia.com/gpu.display-mode";
const LABEL_MIG_CAPABLE: &str = "nvidia.com/mig.capable";
const LABEL_MIG_STRATEGY: &str = "nvidia.com/mig.strategy";

/// Builds the snapshot for a node. Pure: byte-identical inputs produce
/// byte-identical snapshots.
pub fn build(
    node: &Node,
    feature: Option<&NodeFeature>,
    policy: &ManagedNodesPolicy,
) -> NodeSnapshot {
    let labels = node
        .metadata
        .labels
        .clone()
        .unwrap_or_default()
        .into_iter()
        .collect::<BTreeMap<_, _>>();

    let managed = match labels.get(&policy.label_key) {
        Some(value) => value == "true",
        None => policy.enabled_by_default,
    };

    let mut devices = extract_devices(&labels);
    for device in &mut devices {
        overlay_node_labels(device, &labels);
    }
    if let Some(feature) = feature {
        overlay_feature(&mut devices, feature);
    }

    NodeSnapshot {
        managed,
        feature_detected: feature.is_some(),
        labels,
        devices,
    }
}

/// Scans `<prefix>/device.<idx>.<field>` labels and groups them by index.
/// An index is emitted only when both vendor and device are present.
fn extract_devices(labels: &BTreeMap<String, String>) -> Vec<DeviceSnapshot> {
    #[derive(Default)]
    struct Partial {
        vendor: Option<String>,
        device: Option<String>,
        class: Option<String>,
    }

    let mut by_index: BTreeMap<String, Partial> = BTreeMap::new();
    for (key, value) in labels {
        let rest = match key.strip_prefix(DEVICE_LABEL_PREFIX) {
            Some(rest) => rest,
            None => continue,
        };
        let (index, field) = match rest.split_once('.') {
            Some(parts) => parts,
            None => continue,
        };
        let entry = by_index.entry(index.to_string()).or_default();
        match field {
            "vendor" => entry.vendor = Some(value.clone()),
            "device" => entry.device = Some(value.clone()),
            "class" => entry.class = Some(value.clone()),
            _ => {}
        }
    }

    by_index
        .into_iter()
        .filter_map(|(index, partial)| {
            let vendor = partial.vendor?;
            let device = partial.device?;
            Some(DeviceSnapshot {
                index,
                vendor,
                device,
                class: partial.class.unwrap_or_default(),
                ..Default::default()
            })
        })
        .collect()
}

fn overlay_node_labels(device: &mut DeviceSnapshot, labels: &BTreeMap<String, String>) {
    let get = |key: &str| labels.get(key).cloned();
    let get_int = |key: &str| labels.get(key).and_then(|v| v.trim().parse::<i64>().ok());

    if let Some(product) = get(LABEL_PRODUCT) {
        device.product = product;
    }
    if let Some(board) = get(LABEL_BOARD) {
        device.board = board;
    }
    if let Some(family) = get(LABEL_FAMILY) {
        device.family = family;
    }
    if let Some(serial) = get(LABEL_SERIAL) {
        device.serial = serial;
    }
    if let Some(pstate) = get(LABEL_PSTATE) {
        device.p_state = pstate;
    }
    if let Some(display_mode) = get(LABEL_DISPLAY_MODE) {
        device.display_mode = display_mode;
    }
    device.memory_mib = get_int(LABEL_MEMORY).or(device.memory_mib);
    device.compute_major = get_int(LABEL_COMPUTE_MAJOR).or(device.compute_major);
    device.compute_minor = get_int(LABEL_COMPUTE_MINOR).or(device.compute_minor);
    device.numa_node = get_int(LABEL_NUMA_NODE).or(device.numa_node);
    device.power_limit_mw = get_int(LABEL_POWER_LIMIT).or(device.power_limit_mw);
    device.sm_count = get_int(LABEL_SM_COUNT).or(device.sm_count);
    device.mem_bandwidth = get_int(LABEL_MEM_BANDWIDTH).or(device.mem_bandwidth);
    device.pcie_gen = get_int(LABEL_PCIE_GEN).or(device.pcie_gen);
    device.pcie_link_width = get_int(LABEL_PCIE_LINK_WIDTH).or(device.pcie_link_width);

    if labels.get(LABEL_MIG_CAPABLE).map(String::as_str) == Some("true") {
        device.mig.capable = true;
    }
    if let Some(strategy) = labels.get(LABEL_MIG_STRATEGY) {
        device.mig.strategy = match strategy.as_str() {
            "single" => MIGStrategy::Single,
            "mixed" => MIGStrategy::Mixed,
            _ => MIGStrategy::None,
        };
    }
}

/// Folds `NodeFeature` instance attributes over label-derived values.
/// Feature attributes win.
fn overlay_feature(devices: &mut [DeviceSnapshot], feature: &NodeFeature) {
    let instances = feature
        .spec
        .features
        .as_ref()
        .and_then(|f| f.instances.get(NVIDIA_GPU_FEATURE));
    let instances = match instances {
        Some(set) => &set.elements,
        None => return,
    };

    for element in instances {
        let attrs = &element.attributes;
        let index = match attrs.get("index") {
            Some(index) => index,
            None => continue,
        };
        let device = match devices
            .iter_mut()
            .find(|d| index_matches(&d.index, index))
        {
            Some(device) => device,
            None => continue,
        };

        let get = |key: &str| attrs.get(key).map(|v| v.trim().to_string());
        let get_int = |key: &str| attrs.get(key).and_then(|v| v.trim().parse::<i64>().ok());

        if let Some(uuid) = get("uuid") {
            device.uuid = uuid;
        }
        if let Some(product) = get("product") {
            device.product = product;
        }
        if let Some(address) = get("pciAddress") {
            device.pci_address = canonical_pci_address(&address);
        }
        if let Some(serial) = get("serial") {
            device.serial = serial;
        }
        if let Some(board) = get("board") {
            device.board = board;
        }
        if let Some(family) = get("family") {
            device.family = family;
        }
        device.memory_mib = get_int("memory").or(device.memory_mib);
        device.numa_node = get_int("numaNode").or(device.numa_node);
        device.compute_major = get_int("computeMajor").or(device.compute_major);
        device.compute_minor = get_int("computeMinor").or(device.compute_minor);
        device.power_limit_mw = get_int("powerLimit").or(device.power_limit_mw);
        device.sm_count = get_int("smCount").or(device.sm_count);
        if let Some(capable) = get("migCapable") {
            device.mig.capable = capable == "true";
        }
        if let Some(profiles) = get("migProfiles") {
            device.mig.profiles = profiles
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(counts) = get("migInstanceCounts") {
            // `1g.5gb=7,2g.10gb=3`
            device.mig.instances = counts
                .split(',')
                .filter_map(|pair| {
                    let (profile, count) = pair.split_once('=')?;
                    Some(MIGInstanceCount {
                        profile: profile.trim().to_string(),
                        count: count.trim().parse().ok()?,
                    })
                })
                .collect();
        }
    }
}

/// Compares device indexes ignoring zero padding: label-derived `00`
/// matches feature-reported `0`. Non-numeric forms compare exactly.
pub fn index_matches(a: &str, b: &str) -> bool {
    canonical_index(a) == canonical_index(b)
}

pub fn canonical_index(index: &str) -> String {
    let trimmed = index.trim().trim_start_matches('0');
    if trimmed.is_empty() && index.trim().chars().all(|c| c == '0') && !index.trim().is_empty() {
        "0".to_string()
    } else if trimmed.is_empty() {
        index.trim().to_string()
    } else {
        trimmed.to_string()
    }
}

lazy_static! {
    static ref CANONICAL_PCI: Regex =
        Regex::new(r"^[0-9a-f]{4}:[0-9a-f]{2}:[0-9a-f]{2}\.[0-9a-f]$").unwrap();
    static ref LONG_DOMAIN_PCI: Regex =
        Regex::new(r"^[0-9a-f]{8}:[0-9a-f]{2}:[0-9a-f]{2}\.[0-9a-f]$").unwrap();
}

/// Canonicalizes a PCI address to `dddd:bb:dd.f` lowercase. Eight-digit
/// domains are truncated to four; anything else passes through unchanged.
pub fn canonical_pci_address(address: &str) -> String {
    let lowered = address.trim().to_lowercase();
    if CANONICAL_PCI.is_match(&lowered) {
        return lowered;
    }
    if LONG_DOMAIN_PCI.is_match(&lowered) {
        return lowered[4..].to_string();
    }
    address.to_string()
}
