//! The `GPUDevice` custom resource: one object per physical or logical GPU.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A single GPU discovered on a node. The object name is
/// `<node>-<index>-<vendor>-<device>` and doubles as the inventory id.
///
/// The spec is intentionally empty: desired state (pool assignment) is
/// requested through annotations and admitted by the pool webhook, while
/// everything observed lives in the status.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "internal.gpu.deckhouse.io",
    version = "v1alpha1",
    kind = "GPUDevice",
    plural = "gpudevices",
    status = "GPUDeviceStatus",
    shortname = "gdev"
)]
#[serde(rename_all = "camelCase")]
pub struct GPUDeviceSpec {}

/// Observed state of one GPU.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GPUDeviceStatus {
    /// Name of the node carrying this device.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub node_name: String,
    /// Stable identifier, equal to the object name.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub inventory_id: String,
    /// Whether the managed-nodes policy places this device in scope.
    #[serde(default)]
    pub managed: bool,
    /// Whether the device is eligible for automatic pool assignment.
    #[serde(default)]
    pub auto_attach: bool,
    /// Position in the device lifecycle.
    #[serde(default)]
    pub state: DeviceState,
    #[serde(default)]
    pub hardware: GPUHardware,
    /// Last recorded health failure, absent while the device is healthy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health: Option<DeviceHealth>,
}

/// Lifecycle states of a device.
///
/// `PendingAssignment`, `Reserved`, `Assigned`, and `InUse` belong to the
/// pool machinery and are never entered or left by the inventory loop.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash, JsonSchema)]
pub enum DeviceState {
    #[default]
    Discovered,
    Validating,
    Ready,
    PendingAssignment,
    Reserved,
    Assigned,
    InUse,
    Faulted,
    NoPoolMatched,
}

impl DeviceState {
    /// Every state, for exhaustive sweeps.
    pub const ALL: [DeviceState; 9] = [
        DeviceState::Discovered,
        DeviceState::Validating,
        DeviceState::Ready,
        DeviceState::PendingAssignment,
        DeviceState::Reserved,
        DeviceState::Assigned,
        DeviceState::InUse,
        DeviceState::Faulted,
        DeviceState::NoPoolMatched,
    ];

    /// True for states owned by the pool assignment machinery.
    pub fn is_assignment(&self) -> bool {
        matches!(
            self,
            DeviceState::PendingAssignment
                | DeviceState::Reserved
                | DeviceState::Assigned
                | DeviceState::InUse
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceState::Discovered => "Discovered",
            DeviceState::Validating => "Validating",
            DeviceState::Ready => "Ready",
            DeviceState::PendingAssignment => "PendingAssignment",
            DeviceState::Reserved => "Reserved",
            DeviceState::Assigned => "Assigned",
            DeviceState::InUse => "InUse",
            DeviceState::Faulted => "Faulted",
            DeviceState::NoPoolMatched => "NoPoolMatched",
        }
    }
}

/// Hardware attributes of a device, merged from node labels, the NodeFeature
/// object, and the health-telemetry endpoint.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GPUHardware {
    /// Zero-padded index as it appears in discovery labels.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub index: String,
    /// PCI vendor id, 4 hex chars.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub vendor: String,
    /// PCI device id, 4 hex chars.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub device: String,
    /// PCI class, hex.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub class: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uuid: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub product: String,
    /// Canonical `dddd:bb:dd.f` form, lowercase.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub pci_address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub numa_node: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub power_limit_mw: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sm_count: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mem_bandwidth: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pcie_gen: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pcie_link_width: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_mib: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compute_major: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compute_minor: Option<i64>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub board: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub family: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub serial: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub p_state: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub display_mode: String,
    #[serde(default)]
    pub mig: MIGCapability,
}

/// MIG capability of a device.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MIGCapability {
    #[serde(default)]
    pub capable: bool,
    #[serde(default)]
    pub strategy: MIGStrategy,
    /// Profiles the device supports, e.g. `1g.5gb`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub profiles: Vec<String>,
    /// How many instances of each type the device can host.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub instances: Vec<MIGInstanceCount>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum MIGStrategy {
    #[default]
    None,
    Single,
    Mixed,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MIGInstanceCount {
    pub profile: String,
    pub count: i64,
}

/// Last health failure observed for a device.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeviceHealth {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
}
