//! The `GPUNodeState` custom resource: the per-node inventory aggregate.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Condition type maintained by the inventory service.
pub const CONDITION_INVENTORY_COMPLETE: &str = "InventoryComplete";

/// Condition reasons for [`CONDITION_INVENTORY_COMPLETE`].
pub const REASON_INVENTORY_SYNCED: &str = "InventorySynced";
pub const REASON_NO_DEVICES: &str = "NoDevicesDiscovered";
pub const REASON_FEATURE_MISSING: &str = "NodeFeatureMissing";

/// Per-node aggregate of the GPU inventory. Named after its node and owned
/// by it, so node deletion garbage-collects the aggregate.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "internal.gpu.deckhouse.io",
    version = "v1alpha1",
    kind = "GPUNodeState",
    plural = "gpunodestates",
    status = "GPUNodeStateStatus",
    shortname = "gns"
)]
#[serde(rename_all = "camelCase")]
pub struct GPUNodeStateSpec {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub node_name: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GPUNodeStateStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl GPUNodeStateStatus {
    /// The current `InventoryComplete` condition, if set.
    pub fn inventory_complete(&self) -> Option<&Condition> {
        self.conditions
            .iter()
            .find(|c| c.type_ == CONDITION_INVENTORY_COMPLETE)
    }
}
