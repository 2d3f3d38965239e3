//! Persisted API types for the GPU control plane.
//!
//! All custom resources served by the controllers live in the private
//! `internal.gpu.deckhouse.io` group. The public `gpu.deckhouse.io` group is
//! projected by the API rewriter and never appears in controller code.

pub mod config;
pub mod device;
pub mod feature;
pub mod labels;
pub mod node_state;
pub mod pool;
pub mod selector;

pub use config::{ApprovalMode, GPUControllerConfig, GPUControllerConfigSpec};
pub use device::{
    DeviceHealth, DeviceState, GPUDevice, GPUDeviceSpec, GPUDeviceStatus, GPUHardware,
    MIGCapability, MIGInstanceCount, MIGStrategy,
};
pub use feature::{NodeFeature, NodeFeatureSpec};
pub use node_state::{GPUNodeState, GPUNodeStateSpec, GPUNodeStateStatus};
pub use pool::{
    AssignmentMode, ClusterGPUPool, DeviceAssignment, DeviceSelector, GPUPool, GPUPoolSpec,
    MIGLayout, MIGLayoutProfile, PoolAccess, PoolBackend, PoolProvider, PoolResource,
    PoolScheduling, PoolTaint, ResourceUnit, SchedulingStrategy, SelectorRules,
    TimeSlicingResource,
};
pub use selector::{CompiledSelector, SelectorError};
