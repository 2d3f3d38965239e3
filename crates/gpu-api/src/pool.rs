//! `GPUPool` and `ClusterGPUPool`: named selection + allocation policies
//! over GPU devices. Both scopes share [`GPUPoolSpec`].

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A namespaced pool of GPU devices.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    group = "internal.gpu.deckhouse.io",
    version = "v1alpha1",
    kind = "GPUPool",
    plural = "gpupools",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct GPUPoolSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<PoolProvider>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<PoolBackend>,
    #[serde(default)]
    pub resource: PoolResource,
    #[serde(default)]
    pub scheduling: PoolScheduling,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_selector: Option<DeviceSelector>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_assignment: Option<DeviceAssignment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_selector: Option<LabelSelector>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access: Option<PoolAccess>,
}

/// A cluster-wide pool. The spec is identical to the namespaced form; only
/// the assignment annotation and resolution rules differ.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    group = "internal.gpu.deckhouse.io",
    version = "v1alpha1",
    kind = "ClusterGPUPool",
    plural = "clustergpupools"
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterGPUPoolSpec {
    #[serde(flatten)]
    pub pool: GPUPoolSpec,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum PoolProvider {
    Nvidia,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum PoolBackend {
    DevicePlugin,
    #[serde(rename = "DRA")]
    Dra,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PoolResource {
    #[serde(default)]
    pub unit: ResourceUnit,
    /// Required when `unit` is `MIG` and no layout is given; format `NgMgb`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mig_profile: Option<String>,
    /// Time-slicing replica count per unit; defaulted to 1.
    #[serde(default)]
    pub slices_per_unit: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mig_layout: Vec<MIGLayout>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub time_slicing_resources: Vec<TimeSlicingResource>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum ResourceUnit {
    #[default]
    Card,
    #[serde(rename = "MIG")]
    Mig,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MIGLayout {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub profiles: Vec<MIGLayoutProfile>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MIGLayoutProfile {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slices_per_unit: Option<u32>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TimeSlicingResource {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default)]
    pub slices_per_unit: u32,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PoolScheduling {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<SchedulingStrategy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topology_key: Option<String>,
    /// Whether pool taints are applied to member nodes; defaults to true.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub taints_enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub taints: Vec<PoolTaint>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum SchedulingStrategy {
    Spread,
    BinPack,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PoolTaint {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub key: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub value: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub effect: String,
}

/// Which devices a pool may take. `include` is a conjunction of rule types,
/// `exclude` carves devices back out.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSelector {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include: Option<SelectorRules>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclude: Option<SelectorRules>,
}

/// One rule set. Each list is a disjunction of its entries; the lists
/// combine as a conjunction.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SelectorRules {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inventory_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pci_vendors: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pci_devices: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mig_profiles: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_labels: Option<LabelSelector>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeviceAssignment {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<AssignmentMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_approve_selector: Option<LabelSelector>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum AssignmentMode {
    Manual,
    Automatic,
    Selector,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PoolAccess {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub namespaces: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub service_accounts: Vec<String>,
}
