//! Inventory gauges and counters. Registered on the default registry;
//! exposition wiring lives outside this crate.

use gpu_api::device::{DeviceState, GPUDevice};
use lazy_static::lazy_static;
use prometheus::{register_int_counter_vec, register_int_gauge_vec, IntCounterVec, IntGaugeVec};

lazy_static! {
    static ref NODE_DEVICES: IntGaugeVec = register_int_gauge_vec!(
        "gpu_inventory_node_devices",
        "Number of GPU devices currently recorded for a node",
        &["node"]
    )
    .expect("gpu_inventory_node_devices registration");
    static ref DEVICE_STATES: IntGaugeVec = register_int_gauge_vec!(
        "gpu_inventory_device_state",
        "Number of a node's GPU devices per lifecycle state",
        &["node", "state"]
    )
    .expect("gpu_inventory_device_state registration");
    static ref HANDLER_ERRORS: IntCounterVec = register_int_counter_vec!(
        "gpu_inventory_handler_errors_total",
        "Device handler failures by handler name",
        &["handler"]
    )
    .expect("gpu_inventory_handler_errors_total registration");
}

/// Replaces the per-node gauges with the freshly reconciled device set.
pub fn update_node_devices(node: &str, devices: &[GPUDevice]) {
    NODE_DEVICES
        .with_label_values(&[node])
        .set(devices.len() as i64);
    for state in DeviceState::ALL {
        let count = devices
            .iter()
            .filter(|d| d.status.as_ref().map(|s| s.state) == Some(state))
            .count();
        DEVICE_STATES
            .with_label_values(&[node, state.as_str()])
            .set(count as i64);
    }
}

/// Drops every series recorded for a node.
pub fn clear_node(node: &str) {
    let _ = NODE_DEVICES.remove_label_values(&[node]);
    for state in DeviceState::ALL {
        let _ = DEVICE_STATES.remove_label_values(&[node, state.as_str()]);
    }
}

pub fn handler_error(handler: &str) {
    HANDLER_ERRORS.with_label_values(&[handler]).inc();
}
