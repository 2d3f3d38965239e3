//! Cleanup of per-node derived state.
//!
//! Orphan removal runs only while the node is being deleted. A snapshot
//! that transiently loses a device on a live node is a label-sync race,
//! not a decommission, and the device is kept.

use std::collections::BTreeSet;

use k8s_openapi::api::core::v1::Node;
use tracing::{info, instrument};

use crate::device::DeviceStore;
use crate::error::Error;
use crate::events::{EventSeverity, EventSink, REASON_DEVICE_REMOVED};
use crate::metrics;
use crate::node_state::NodeStateStore;

pub struct CleanupService<D, N, E> {
    devices: D,
    node_states: N,
    events: E,
}

impl<D: DeviceStore, N: NodeStateStore, E: EventSink> CleanupService<D, N, E> {
    pub fn new(devices: D, node_states: N, events: E) -> Self {
        CleanupService {
            devices,
            node_states,
            events,
        }
    }

    /// Removes every trace of a node: its devices, its aggregate, and its
    /// gauges. Absent objects are fine.
    #[instrument(level = "info", skip(self))]
    pub async fn cleanup_node(&self, node_name: &str) -> Result<(), Error> {
        for device in self.devices.list_for_node(node_name).await? {
            if let Some(name) = device.metadata.name.as_deref() {
                self.devices.delete(name).await?;
            }
        }
        self.node_states.delete(node_name).await?;
        metrics::clear_node(node_name);
        Ok(())
    }

    /// Deletes named orphan devices, emitting one event per removal.
    /// Only called for nodes being deleted.
    #[instrument(level = "info", skip(self, node, orphans), fields(node = %node.metadata.name.as_deref().unwrap_or("")))]
    pub async fn remove_orphans(
        &self,
        node: &Node,
        orphans: &BTreeSet<String>,
    ) -> Result<(), Error> {
        for name in orphans {
            self.devices.delete(name).await?;
            info!(device = %name, "removed orphan device");
            self.events
                .publish(
                    node,
                    EventSeverity::Normal,
                    REASON_DEVICE_REMOVED,
                    &format!("orphan device {} removed", name),
                )
                .await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::device::testing::{test_node, FakeDeviceStore};
    use crate::events::testing::RecordingSink;
    use crate::node_state::testing::FakeNodeStateStore;
    use gpu_api::device::GPUDevice;
    use gpu_api::labels::LABEL_DEVICE_NODE;
    use std::sync::Arc;

    fn device_on_node(name: &str, node: &str) -> GPUDevice {
        let mut device = GPUDevice::new(name, Default::default());
        device.metadata.labels = Some(
            [(LABEL_DEVICE_NODE.to_string(), node.to_string())]
                .into_iter()
                .collect(),
        );
        device
    }

    #[tokio::test]
    async fn cleanup_removes_devices_and_aggregate() {
        let devices = FakeDeviceStore::default();
        devices.insert(device_on_node("worker-a-00-10de-1db5", "worker-a"));
        devices.insert(device_on_node("worker-b-00-10de-1db5", "worker-b"));
        let service = CleanupService::new(
            devices,
            FakeNodeStateStore::default(),
            Arc::new(RecordingSink::default()),
        );
        service.cleanup_node("worker-a").await.unwrap();

        assert_eq!(
            service.devices.deletes.lock().unwrap().as_slice(),
            ["worker-a-00-10de-1db5".to_string()]
        );
        assert_eq!(
            service.node_states.deletes.lock().unwrap().as_slice(),
            ["worker-a".to_string()]
        );
    }

    #[tokio::test]
    async fn orphan_removal_emits_events() {
        let devices = FakeDeviceStore::default();
        devices.insert(device_on_node("worker-a-00-10de-1db5", "worker-a"));
        let events = Arc::new(RecordingSink::default());
        let service = CleanupService::new(devices, FakeNodeStateStore::default(), events.clone());

        let orphans: BTreeSet<String> = ["worker-a-00-10de-1db5".to_string()].into();
        service
            .remove_orphans(&test_node("worker-a", true), &orphans)
            .await
            .unwrap();
        assert_eq!(events.reasons(), vec![REASON_DEVICE_REMOVED.to_string()]);
    }
}
