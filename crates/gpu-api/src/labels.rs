//! Well-known label, annotation, and group names shared across the control
//! plane.

/// API group served by the controllers.
pub const GROUP: &str = "internal.gpu.deckhouse.io";
/// API group exposed to cluster users by the rewriting proxy.
pub const PUBLIC_GROUP: &str = "gpu.deckhouse.io";
/// Version used by every resource in [`GROUP`].
pub const VERSION: &str = "v1alpha1";

/// Back-reference from a `GPUDevice` to the node that carries it.
pub const LABEL_DEVICE_NODE: &str = "gpu.deckhouse.io/device-node";
/// The device index within its node, zero-padded as discovered.
pub const LABEL_DEVICE_INDEX: &str = "gpu.deckhouse.io/device-index";
/// Devices carrying this label with value `"true"` are skipped by admission.
pub const LABEL_IGNORE: &str = "gpu.deckhouse.io/ignore";
/// Node label marking degraded GPU infrastructure.
pub const LABEL_INFRA_DEGRADED: &str = "gpu.deckhouse.io/infra-degraded";
/// Default node label consulted by the managed-nodes policy.
pub const DEFAULT_MANAGED_LABEL: &str = "gpu.deckhouse.io/enabled";

/// Prefix of per-device discovery labels: `gpu.deckhouse.io/device.<idx>.<field>`.
pub const DEVICE_LABEL_PREFIX: &str = "gpu.deckhouse.io/device.";

/// Assignment request to a namespaced `GPUPool`.
pub const ANNOTATION_ASSIGNMENT: &str = "gpu.deckhouse.io/assignment";
/// Assignment request to a `ClusterGPUPool`.
pub const ANNOTATION_CLUSTER_ASSIGNMENT: &str = "cluster.gpu.deckhouse.io/assignment";

/// Label NFD puts on `NodeFeature` objects to point back at their node.
pub const NODE_FEATURE_NODE_NAME_LABEL: &str = "nfd.node.kubernetes.io/node-name";
/// The feature-instance key carrying per-GPU attributes.
pub const NVIDIA_GPU_FEATURE: &str = "nvidia.com/gpu";

/// App label of the health-telemetry sidecar pods.
pub const TELEMETRY_APP_LABEL: &str = "app.kubernetes.io/name";
pub const TELEMETRY_APP_NAME: &str = "gpu-health-telemetry";
/// Container inside the telemetry pod that serves detections.
pub const TELEMETRY_CONTAINER: &str = "gfd-extender";

/// Node label prefixes that indicate GPU hardware is (or was) present.
/// A node is resynced on policy change only when one of these matches.
pub const GPU_PRESENT_PREFIXES: &[&str] = &[
    "gpu.deckhouse.io/device.",
    "nvidia.com/gpu.product",
    "nvidia.com/gpu.memory",
    "nvidia.com/mig-",
    "nvidia.com/mig.",
];
