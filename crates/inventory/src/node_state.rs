//! The inventory service: one `GPUNodeState` aggregate per node.

use async_trait::async_trait;
use chrono::Utc;
use gpu_api::device::GPUDevice;
use gpu_api::node_state::{
    GPUNodeState, GPUNodeStateSpec, GPUNodeStateStatus, CONDITION_INVENTORY_COMPLETE,
    REASON_FEATURE_MISSING, REASON_INVENTORY_SYNCED, REASON_NO_DEVICES,
};
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use kube::api::{Api, DeleteParams, ObjectMeta, Patch, PatchParams, PostParams};
use serde_json::json;
use tracing::{debug, instrument};

use crate::device::node_owner_reference;
use crate::error::{is_kube_conflict, is_kube_not_found, Error};
use crate::events::{EventSeverity, EventSink, REASON_INVENTORY_CHANGED};
use crate::snapshot::NodeSnapshot;

/// Storage seam for `GPUNodeState` objects.
#[async_trait]
pub trait NodeStateStore: Send + Sync {
    async fn get(&self, name: &str) -> Result<Option<GPUNodeState>, Error>;
    async fn create(&self, state: &GPUNodeState) -> Result<GPUNodeState, Error>;
    async fn patch(&self, name: &str, patch: serde_json::Value) -> Result<GPUNodeState, Error>;
    /// [`Error::Conflict`] on a stale resource version; the caller turns
    /// it into a requeue.
    async fn patch_status(&self, name: &str, status: &GPUNodeStateStatus) -> Result<(), Error>;
    async fn delete(&self, name: &str) -> Result<(), Error>;
}

#[async_trait]
impl<T: NodeStateStore + ?Sized> NodeStateStore for std::sync::Arc<T> {
    async fn get(&self, name: &str) -> Result<Option<GPUNodeState>, Error> {
        (**self).get(name).await
    }

    async fn create(&self, state: &GPUNodeState) -> Result<GPUNodeState, Error> {
        (**self).create(state).await
    }

    async fn patch(&self, name: &str, patch: serde_json::Value) -> Result<GPUNodeState, Error> {
        (**self).patch(name, patch).await
    }

    async fn patch_status(&self, name: &str, status: &GPUNodeStateStatus) -> Result<(), Error> {
        (**self).patch_status(name, status).await
    }

    async fn delete(&self, name: &str) -> Result<(), Error> {
        (**self).delete(name).await
    }
}

pub struct KubeNodeStateStore {
    api: Api<GPUNodeState>,
}

impl KubeNodeStateStore {
    pub fn new(client: kube::Client) -> Self {
        KubeNodeStateStore {
            api: Api::all(client),
        }
    }
}

#[async_trait]
impl NodeStateStore for KubeNodeStateStore {
    async fn get(&self, name: &str) -> Result<Option<GPUNodeState>, Error> {
        Ok(self.api.get_opt(name).await?)
    }

    async fn create(&self, state: &GPUNodeState) -> Result<GPUNodeState, Error> {
        Ok(self.api.create(&PostParams::default(), state).await?)
    }

    async fn patch(
        &self,
        name: &str,
        patch: serde_json::Value,
    ) -> Result<GPUNodeState, Error> {
        Ok(self
            .api
            .patch(name, &PatchParams::default(), &Patch::Merge(patch))
            .await?)
    }

    async fn patch_status(&self, name: &str, status: &GPUNodeStateStatus) -> Result<(), Error> {
        let patch = json!({ "status": status });
        match self
            .api
            .patch_status(name, &PatchParams::default(), &Patch::Merge(patch))
            .await
        {
            Ok(_) => Ok(()),
            Err(err) if is_kube_conflict(&err) => Err(Error::Conflict(name.to_string())),
            Err(err) => Err(err.into()),
        }
    }

    async fn delete(&self, name: &str) -> Result<(), Error> {
        match self.api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(err) if is_kube_not_found(&err) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

pub struct InventoryService<S, E> {
    store: S,
    events: E,
}

impl<S: NodeStateStore, E: EventSink> InventoryService<S, E> {
    pub fn new(store: S, events: E) -> Self {
        InventoryService { store, events }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Converges the aggregate for one node. The aggregate is created on
    /// the first non-empty device set and never before.
    #[instrument(level = "debug", skip_all, fields(node = %node.metadata.name.as_deref().unwrap_or("")))]
    pub async fn reconcile(
        &self,
        node: &Node,
        snapshot: &NodeSnapshot,
        reconciled_devices: &[GPUDevice],
    ) -> Result<(), Error> {
        let node_name = node.metadata.name.clone().unwrap_or_default();

        let existing = self.store.get(&node_name).await?;
        let state = match existing {
            None if reconciled_devices.is_empty() => return Ok(()),
            None => {
                let state = new_node_state(&node_name, node);
                self.store.create(&state).await?
            }
            Some(state) => self.ensure_spec(state, node).await?,
        };

        let stored_status = state.status.clone().unwrap_or_default();
        let previous = stored_status.inventory_complete();

        let (status, reason, message) = condition_for(snapshot);
        let flipped = previous
            .map(|c| c.status != status || c.reason != reason || c.message != message)
            .unwrap_or(false);
        let changed = flipped || previous.is_none();

        let condition = if changed {
            Condition {
                type_: CONDITION_INVENTORY_COMPLETE.to_string(),
                status: status.to_string(),
                reason: reason.to_string(),
                message: message.clone(),
                last_transition_time: Time(Utc::now()),
                observed_generation: None,
            }
        } else {
            previous.cloned().expect("unchanged condition exists")
        };

        let desired = GPUNodeStateStatus {
            conditions: vec![condition],
        };

        // The initial condition is not a flip; events mark transitions.
        if flipped {
            self.events
                .publish(
                    node,
                    EventSeverity::Normal,
                    REASON_INVENTORY_CHANGED,
                    &format!("{}={} ({}): {}", CONDITION_INVENTORY_COMPLETE, status, reason, message),
                )
                .await;
        }

        if desired == stored_status {
            debug!(node = %node_name, "aggregate status converged, skipping patch");
            return Ok(());
        }
        self.store.patch_status(&node_name, &desired).await
    }

    /// Keeps spec and owner reference current, merge-patching on drift.
    async fn ensure_spec(
        &self,
        state: GPUNodeState,
        node: &Node,
    ) -> Result<GPUNodeState, Error> {
        let node_name = node.metadata.name.clone().unwrap_or_default();
        let owner = node_owner_reference(node);
        let spec_ok = state.spec.node_name == node_name;
        let owner_ok = state
            .metadata
            .owner_references
            .as_ref()
            .map(|refs| refs.iter().any(|r| r.uid == owner.uid && r.kind == "Node"))
            .unwrap_or(false);
        if spec_ok && owner_ok {
            return Ok(state);
        }
        let patch = json!({
            "metadata": { "ownerReferences": [owner] },
            "spec": { "nodeName": node_name },
        });
        self.store.patch(&node_name, patch).await
    }
}

fn new_node_state(node_name: &str, node: &Node) -> GPUNodeState {
    let mut state = GPUNodeState::new(
        node_name,
        GPUNodeStateSpec {
            node_name: node_name.to_string(),
        },
    );
    state.metadata = ObjectMeta {
        name: Some(node_name.to_string()),
        owner_references: Some(vec![node_owner_reference(node)]),
        ..Default::default()
    };
    state
}

/// Condition for the current snapshot.
fn condition_for(snapshot: &NodeSnapshot) -> (&'static str, &'static str, String) {
    if !snapshot.feature_detected {
        (
            "False",
            REASON_FEATURE_MISSING,
            "the node's NodeFeature object has not been observed".to_string(),
        )
    } else if snapshot.devices.is_empty() {
        (
            "False",
            REASON_NO_DEVICES,
            "feature discovery ran but no GPU devices were found".to_string(),
        )
    } else {
        (
            "True",
            REASON_INVENTORY_SYNCED,
            format!("{} device(s) inventoried", snapshot.devices.len()),
        )
    }
}


#[cfg(test)]
mod test {
    use super::testing::FakeNodeStateStore;
    use super::*;
    use crate::device::testing::test_node;
    use crate::events::testing::RecordingSink;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    fn device(name: &str) -> GPUDevice {
        GPUDevice::new(name, Default::default())
    }

    fn snapshot(feature: bool, devices: usize) -> NodeSnapshot {
        NodeSnapshot {
            feature_detected: feature,
            devices: (0..devices)
                .map(|i| crate::snapshot::DeviceSnapshot {
                    index: format!("{:02}", i),
                    vendor: "10de".to_string(),
                    device: "1db5".to_string(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }
    }

    fn service() -> InventoryService<FakeNodeStateStore, Arc<RecordingSink>> {
        InventoryService::new(FakeNodeStateStore::default(), Arc::new(RecordingSink::default()))
    }

    #[tokio::test]
    async fn no_aggregate_without_devices() {
        let service = service();
        let node = test_node("worker-a", true);
        service
            .reconcile(&node, &snapshot(false, 0), &[])
            .await
            .unwrap();
        assert!(service.store().objects.lock().unwrap().is_empty());
        assert_eq!(service.store().status_patch_count(), 0);
    }

    #[tokio::test]
    async fn creates_aggregate_with_owner_and_condition() {
        let service = service();
        let node = test_node("worker-a", true);
        service
            .reconcile(&node, &snapshot(true, 1), &[device("worker-a-00-10de-1db5")])
            .await
            .unwrap();

        let objects = service.store().objects.lock().unwrap();
        let state = objects.get("worker-a").unwrap();
        assert_eq!(state.spec.node_name, "worker-a");
        assert_eq!(
            state.metadata.owner_references.as_ref().unwrap()[0].uid,
            "worker-a-uid"
        );
        let condition = state.status.as_ref().unwrap().inventory_complete().unwrap();
        assert_eq!(condition.status, "True");
        assert_eq!(condition.reason, REASON_INVENTORY_SYNCED);
    }

    #[tokio::test]
    async fn condition_reasons_follow_snapshot() {
        let service = service();
        let node = test_node("worker-a", true);
        let devices = [device("worker-a-00-10de-1db5")];

        service
            .reconcile(&node, &snapshot(false, 0), &devices)
            .await
            .unwrap();
        {
            let objects = service.store().objects.lock().unwrap();
            let condition = objects["worker-a"]
                .status
                .as_ref()
                .unwrap()
                .inventory_complete()
                .unwrap()
                .clone();
            assert_eq!(condition.status, "False");
            assert_eq!(condition.reason, REASON_FEATURE_MISSING);
        }

        service
            .reconcile(&node, &snapshot(true, 0), &devices)
            .await
            .unwrap();
        let objects = service.store().objects.lock().unwrap();
        let condition = objects["worker-a"]
            .status
            .as_ref()
            .unwrap()
            .inventory_complete()
            .unwrap()
            .clone();
        assert_eq!(condition.reason, REASON_NO_DEVICES);
    }

    #[tokio::test]
    async fn event_only_on_condition_flip() {
        let events = Arc::new(RecordingSink::default());
        let service = InventoryService::new(FakeNodeStateStore::default(), events.clone());
        let node = test_node("worker-a", true);
        let devices = [device("worker-a-00-10de-1db5")];

        // Initial condition: recorded, but not a flip.
        service
            .reconcile(&node, &snapshot(false, 1), &devices)
            .await
            .unwrap();
        assert!(events.reasons().is_empty());

        // Feature arrives: NodeFeatureMissing flips to InventorySynced.
        service
            .reconcile(&node, &snapshot(true, 1), &devices)
            .await
            .unwrap();
        assert_eq!(events.reasons(), vec![REASON_INVENTORY_CHANGED.to_string()]);
        assert_eq!(service.store().status_patch_count(), 2);

        // Converged: no patch, no event.
        service
            .reconcile(&node, &snapshot(true, 1), &devices)
            .await
            .unwrap();
        assert_eq!(events.reasons().len(), 1);
        assert_eq!(service.store().status_patch_count(), 2);
    }

    #[tokio::test]
    async fn conflict_propagates_to_caller() {
        let service = service();
        let node = test_node("worker-a", true);
        service
            .store()
            .conflict_next_status
            .store(true, Ordering::SeqCst);
        let err = service
            .reconcile(&node, &snapshot(true, 1), &[device("worker-a-00-10de-1db5")])
            .await
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn drifted_spec_is_patched_back() {
        let service = service();
        let node = test_node("worker-a", true);
        let mut state = GPUNodeState::new(
            "worker-a",
            GPUNodeStateSpec {
                node_name: "stale".to_string(),
            },
        );
        state.metadata.name = Some("worker-a".to_string());
        service
            .store()
            .objects
            .lock()
            .unwrap()
            .insert("worker-a".to_string(), state);

        service
            .reconcile(&node, &snapshot(true, 1), &[device("worker-a-00-10de-1db5")])
            .await
            .unwrap();
        let objects = service.store().objects.lock().unwrap();
        assert_eq!(objects["worker-a"].spec.node_name, "worker-a");
        assert!(objects["worker-a"].metadata.owner_references.is_some());
    }
}
