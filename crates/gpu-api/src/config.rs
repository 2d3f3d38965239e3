//! The module configuration object watched by the policy store.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Name of the singleton configuration object.
pub const CONFIG_NAME: &str = "default";

/// Cluster-wide controller configuration. A single object named
/// [`CONFIG_NAME`] is honored; changes trigger a resync of gpu-present
/// nodes.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "internal.gpu.deckhouse.io",
    version = "v1alpha1",
    kind = "GPUControllerConfig",
    plural = "gpucontrollerconfigs"
)]
#[serde(rename_all = "camelCase")]
pub struct GPUControllerConfigSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub managed_nodes: Option<ManagedNodesSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_approval: Option<DeviceApprovalSpec>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ManagedNodesSpec {
    /// Node label deciding managedness. Blank is invalid and falls back.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_key: Option<String>,
    /// Applied when the label is absent from a node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled_by_default: Option<bool>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeviceApprovalSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<ApprovalMode>,
    /// Consulted only in `Selector` mode; evaluated against node labels.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<LabelSelector>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum ApprovalMode {
    #[default]
    Manual,
    Automatic,
    Selector,
}
