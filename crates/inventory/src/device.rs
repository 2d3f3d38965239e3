//! The device service: converges one `GPUDevice` per device snapshot.
//!
//! Writes are minimal by construction. Metadata is merge-patched only when
//! the labels or owner reference drift, and the status patch is skipped
//! entirely when the desired status deep-equals the stored one.

use std::collections::BTreeMap;

use async_trait::async_trait;
use gpu_api::device::{GPUDevice, GPUDeviceSpec, GPUDeviceStatus};
use gpu_api::labels::{LABEL_DEVICE_INDEX, LABEL_DEVICE_NODE};
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Api, DeleteParams, ListParams, ObjectMeta, Patch, PatchParams, PostParams};
use serde_json::json;
use tracing::{debug, instrument};

use crate::error::{is_kube_conflict, is_kube_not_found, Error};
use crate::handler::HandlerChain;
use crate::policy::DeviceApprovalPolicy;
use crate::result::ReconcileResult;
use crate::snapshot::{device_name, DeviceSnapshot};
use crate::state_machine::{desired_state, Observation};

/// Folds a detection overlay into a device status. The reconciler binds
/// the node's collected telemetry into this shape.
pub type DetectionApplier<'a> = &'a (dyn Fn(&mut GPUDeviceStatus, &DeviceSnapshot) + Send + Sync);

/// Storage seam for `GPUDevice` objects.
#[async_trait]
pub trait DeviceStore: Send + Sync {
    async fn get(&self, name: &str) -> Result<Option<GPUDevice>, Error>;
    async fn create(&self, device: &GPUDevice) -> Result<GPUDevice, Error>;
    /// Merge-patch, returning the updated object.
    async fn patch_metadata(&self, name: &str, patch: serde_json::Value)
        -> Result<GPUDevice, Error>;
    /// Merge-patch of the status subresource. A stale resource version
    /// yields [`Error::Conflict`].
    async fn patch_status(&self, name: &str, status: &GPUDeviceStatus) -> Result<(), Error>;
    async fn list_for_node(&self, node_name: &str) -> Result<Vec<GPUDevice>, Error>;
    /// Absent objects are fine.
    async fn delete(&self, name: &str) -> Result<(), Error>;
}

#[async_trait]
impl<T: DeviceStore + ?Sized> DeviceStore for std::sync::Arc<T> {
    async fn get(&self, name: &str) -> Result<Option<GPUDevice>, Error> {
        (**self).get(name).await
    }

    async fn create(&self, device: &GPUDevice) -> Result<GPUDevice, Error> {
        (**self).create(device).await
    }

    async fn patch_metadata(
        &self,
        name: &str,
        patch: serde_json::Value,
    ) -> Result<GPUDevice, Error> {
        (**self).patch_metadata(name, patch).await
    }

    async fn patch_status(&self, name: &str, status: &GPUDeviceStatus) -> Result<(), Error> {
        (**self).patch_status(name, status).await
    }

    async fn list_for_node(&self, node_name: &str) -> Result<Vec<GPUDevice>, Error> {
        (**self).list_for_node(node_name).await
    }

    async fn delete(&self, name: &str) -> Result<(), Error> {
        (**self).delete(name).await
    }
}

/// Kubernetes-backed store.
pub struct KubeDeviceStore {
    api: Api<GPUDevice>,
}

impl KubeDeviceStore {
    pub fn new(client: kube::Client) -> Self {
        KubeDeviceStore {
            api: Api::all(client),
        }
    }
}

#[async_trait]
impl DeviceStore for KubeDeviceStore {
    async fn get(&self, name: &str) -> Result<Option<GPUDevice>, Error> {
        Ok(self.api.get_opt(name).await?)
    }

    async fn create(&self, device: &GPUDevice) -> Result<GPUDevice, Error> {
        Ok(self.api.create(&PostParams::default(), device).await?)
    }

    async fn patch_metadata(
        &self,
        name: &str,
        patch: serde_json::Value,
    ) -> Result<GPUDevice, Error> {
        Ok(self
            .api
            .patch(name, &PatchParams::default(), &Patch::Merge(patch))
            .await?)
    }

    async fn patch_status(&self, name: &str, status: &GPUDeviceStatus) -> Result<(), Error> {
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

    async fn list_for_node(&self, node_name: &str) -> Result<Vec<GPUDevice>, Error> {
        let params =
            ListParams::default().labels(&format!("{}={}", LABEL_DEVICE_NODE, node_name));
        Ok(self.api.list(&params).await?.items)
    }

    async fn delete(&self, name: &str) -> Result<(), Error> {
        match self.api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(err) if is_kube_not_found(&err) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

/// Owner reference tying a derived object to its node.
pub(crate) fn node_owner_reference(node: &Node) -> OwnerReference {
    OwnerReference {
        api_version: "v1".to_string(),
        kind: "Node".to_string(),
        name: node.metadata.name.clone().unwrap_or_default(),
        uid: node.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: None,
    }
}

pub struct DeviceService<S> {
    store: S,
    handlers: HandlerChain,
}

impl<S: DeviceStore> DeviceService<S> {
    pub fn new(store: S, handlers: HandlerChain) -> Self {
        DeviceService { store, handlers }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Converges the `GPUDevice` for one snapshot. Returns the converged
    /// object and the merged requeue signal. A status-patch conflict is a
    /// requeue, not an error.
    #[instrument(level = "debug", skip_all, fields(node = %node.metadata.name.as_deref().unwrap_or("")))]
    #[allow(clippy::too_many_arguments)]
    pub async fn reconcile(
        &self,
        node: &Node,
        snapshot: &DeviceSnapshot,
        node_labels: &BTreeMap<String, String>,
        managed: bool,
        approval: &DeviceApprovalPolicy,
        observation: Observation,
        apply_detection: DetectionApplier<'_>,
    ) -> Result<(GPUDevice, ReconcileResult), Error> {
        let node_name = node.metadata.name.clone().unwrap_or_default();
        let name = device_name(&node_name, snapshot);

        let mut device = match self.store.get(&name).await? {
            Some(existing) => self.ensure_metadata(existing, node, snapshot).await?,
            None => {
                let device = new_device(&name, node, snapshot);
                self.store.create(&device).await?
            }
        };

        let stored_status = device.status.clone();
        let current = stored_status.clone().unwrap_or_default();

        let mut desired = current.clone();
        desired.hardware = snapshot.clone();
        desired.node_name = node_name;
        desired.inventory_id = name.clone();
        desired.managed = managed;
        let (state, _) = desired_state(
            current.state,
            observation.with_health(current.health.is_some()),
        );
        desired.state = state;
        desired.auto_attach = managed && approval.auto_attach(managed, node_labels);

        apply_detection(&mut desired, snapshot);

        device.status = Some(desired);
        let mut result = self.handlers.run(&mut device).await?;

        if device.status == stored_status {
            debug!(device = %name, "status converged, skipping patch");
            return Ok((device, result));
        }

        let status = device.status.clone().unwrap_or_default();
        match self.store.patch_status(&name, &status).await {
            Ok(()) => {}
            Err(Error::Conflict(_)) => {
                debug!(device = %name, "status patch conflicted, requeueing");
                result = result.merge(ReconcileResult::requeue());
            }
            Err(err) => return Err(err),
        }
        Ok((device, result))
    }

    /// Ensures the back-reference labels and the owner reference, patching
    /// and refetching only on drift.
    async fn ensure_metadata(
        &self,
        device: GPUDevice,
        node: &Node,
        snapshot: &DeviceSnapshot,
    ) -> Result<GPUDevice, Error> {
        let node_name = node.metadata.name.clone().unwrap_or_default();
        let labels = device.metadata.labels.clone().unwrap_or_default();
        let labels_ok = labels.get(LABEL_DEVICE_NODE) == Some(&node_name)
            && labels.get(LABEL_DEVICE_INDEX) == Some(&snapshot.index);

        let owner = node_owner_reference(node);
        let owner_ok = device
            .metadata
            .owner_references
            .as_ref()
            .map(|refs| refs.iter().any(|r| r.uid == owner.uid && r.kind == "Node"))
            .unwrap_or(false);

        if labels_ok && owner_ok {
            return Ok(device);
        }

        let name = device.metadata.name.clone().unwrap_or_default();
        let patch = json!({
            "metadata": {
                "labels": {
                    LABEL_DEVICE_NODE: node_name,
                    LABEL_DEVICE_INDEX: snapshot.index,
                },
                "ownerReferences": [owner],
            }
        });
        self.store.patch_metadata(&name, patch).await
    }
}

fn new_device(name: &str, node: &Node, snapshot: &DeviceSnapshot) -> GPUDevice {
    let node_name = node.metadata.name.clone().unwrap_or_default();
    let mut device = GPUDevice::new(name, GPUDeviceSpec::default());
    device.metadata = ObjectMeta {
        name: Some(name.to_string()),
        labels: Some(BTreeMap::from([
            (LABEL_DEVICE_NODE.to_string(), node_name),
            (LABEL_DEVICE_INDEX.to_string(), snapshot.index.clone()),
        ])),
        owner_references: Some(vec![node_owner_reference(node)]),
        ..Default::default()
    };
    device
}
