//! Controller configuration. The binary fills this from flags; defaults
//! suit the standard in-cluster deployment.

/// Settings for the inventory controller.
#[derive(Clone, Debug)]
pub struct InventoryConfig {
    /// Namespace of the health-telemetry pods.
    pub workloads_namespace: String,
    /// Namespace NFD publishes `NodeFeature` objects into.
    pub feature_namespace: String,
    /// Namespace node events are written to.
    pub events_namespace: String,
}

impl Default for InventoryConfig {
    fn default() -> Self {
        InventoryConfig {
            workloads_namespace: "d8-gpu".to_string(),
            feature_namespace: "d8-gpu".to_string(),
            events_namespace: "default".to_string(),
        }
    }
}
