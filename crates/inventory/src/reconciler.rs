//! Per-node orchestration: snapshot, detection, device convergence, orphan
//! handling, and the aggregate, in that order.

use std::collections::BTreeSet;
use std::sync::Arc;

use gpu_api::device::{GPUDevice, GPUDeviceStatus};
use gpu_api::feature::NodeFeature;
use gpu_api::labels::{LABEL_INFRA_DEGRADED, NODE_FEATURE_NODE_NAME_LABEL};
use k8s_openapi::api::core::v1::Node;
use kube::api::{Api, ListParams};
use kube::ResourceExt;
use tracing::{debug, instrument, warn};

use crate::cleanup::CleanupService;
use crate::config::InventoryConfig;
use crate::detect::{apply_detection, DetectionCollector, DetectionSource, NodeDetection};
use crate::device::{DeviceService, DeviceStore, KubeDeviceStore};
use crate::error::Error;
use crate::events::{EventSeverity, EventSink, NodeEventRecorder, REASON_DETECTION_UNAVAILABLE};
use crate::handler::HandlerChain;
use crate::metrics;
use crate::node_state::{InventoryService, KubeNodeStateStore, NodeStateStore};
use crate::policy::PolicyStore;
use crate::result::ReconcileResult;
use crate::snapshot::{self, DeviceSnapshot, NodeSnapshot};
use crate::state_machine::Observation;

/// The per-node reconciler. Generic over its storage and detection seams;
/// production wiring uses the Kubernetes-backed implementations.
pub struct Reconciler<D: DeviceStore, N: NodeStateStore, C: DetectionSource> {
    client: kube::Client,
    feature_namespace: String,
    policies: Arc<PolicyStore>,
    devices: DeviceService<Arc<D>>,
    inventory: InventoryService<Arc<N>, Arc<dyn EventSink>>,
    cleanup: CleanupService<Arc<D>, Arc<N>, Arc<dyn EventSink>>,
    detections: C,
    events: Arc<dyn EventSink>,
}

/// Production reconciler type.
pub type KubeReconciler = Reconciler<KubeDeviceStore, KubeNodeStateStore, DetectionCollector>;

impl KubeReconciler {
    pub fn new(
        client: kube::Client,
        config: &InventoryConfig,
        policies: Arc<PolicyStore>,
        handlers: HandlerChain,
    ) -> Self {
        let events: Arc<dyn EventSink> = Arc::new(NodeEventRecorder::new(
            client.clone(),
            &config.events_namespace,
        ));
        let collector = DetectionCollector::new(client.clone(), &config.workloads_namespace);
        Self::with_parts(
            client.clone(),
            &config.feature_namespace,
            policies,
            Arc::new(KubeDeviceStore::new(client.clone())),
            Arc::new(KubeNodeStateStore::new(client)),
            collector,
            events,
            handlers,
        )
    }
}

impl<D: DeviceStore, N: NodeStateStore, C: DetectionSource> Reconciler<D, N, C> {
    #[allow(clippy::too_many_arguments)]
    pub fn with_parts(
        client: kube::Client,
        feature_namespace: &str,
        policies: Arc<PolicyStore>,
        device_store: Arc<D>,
        node_state_store: Arc<N>,
        detections: C,
        events: Arc<dyn EventSink>,
        handlers: HandlerChain,
    ) -> Self {
        Reconciler {
            client,
            feature_namespace: feature_namespace.to_string(),
            policies,
            devices: DeviceService::new(device_store.clone(), handlers),
            inventory: InventoryService::new(node_state_store.clone(), events.clone()),
            cleanup: CleanupService::new(device_store, node_state_store, events.clone()),
            detections,
            events,
        }
    }

    #[instrument(level = "info", skip(self))]
    pub async fn reconcile(&self, node_name: &str) -> Result<ReconcileResult, Error> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        let node = match nodes.get_opt(node_name).await? {
            Some(node) => node,
            None => {
                // Owner references garbage-collect the derived objects.
                metrics::clear_node(node_name);
                return Ok(ReconcileResult::default());
            }
        };

        let policies = self.policies.current();
        let feature = self.lookup_feature(node_name).await?;
        let built = snapshot::build(&node, feature.as_ref(), &policies.managed);

        let deleting = node.metadata.deletion_timestamp.is_some();
        if deleting && built.devices.is_empty() {
            self.cleanup.cleanup_node(node_name).await?;
            return Ok(ReconcileResult::default());
        }
        if !built.feature_detected && built.devices.is_empty() {
            debug!(node = node_name, "nothing observed yet, waiting for the feature watch");
            return Ok(ReconcileResult::default());
        }

        let existing = self.devices.store().list_for_node(node_name).await?;
        let mut orphans = compute_orphans(&existing, node_name, &built, deleting);

        let detection = match self.detections.collect(node_name).await {
            Ok(detection) => detection,
            Err(err) => {
                warn!(node = node_name, error = %err, "detection collection failed");
                self.events
                    .publish(
                        &node,
                        EventSeverity::Warning,
                        REASON_DETECTION_UNAVAILABLE,
                        &err.to_string(),
                    )
                    .await;
                NodeDetection::default()
            }
        };

        let observation = observe(&node, &built);
        let applier = |status: &mut GPUDeviceStatus, snap: &DeviceSnapshot| {
            apply_detection(status, snap, &detection)
        };

        let mut merged = ReconcileResult::default();
        let mut reconciled = Vec::with_capacity(built.devices.len());
        for snap in &built.devices {
            let (device, result) = self
                .devices
                .reconcile(
                    &node,
                    snap,
                    &built.labels,
                    built.managed,
                    &policies.approval,
                    observation,
                    &applier,
                )
                .await?;
            orphans.remove(&device.name_any());
            merged = merged.merge(result);
            reconciled.push(device);
        }

        if deleting {
            self.cleanup.remove_orphans(&node, &orphans).await?;
        }

        match self.inventory.reconcile(&node, &built, &reconciled).await {
            Ok(()) => {}
            Err(err) if err.is_conflict() => {
                debug!(node = node_name, "aggregate status conflicted, requeueing");
                merged = merged.merge(ReconcileResult::requeue());
            }
            Err(err) => return Err(err),
        }

        metrics::update_node_devices(node_name, &reconciled);
        Ok(merged)
    }

    /// Looks the feature object up by name first, then by the node-name
    /// label, keeping the newest of the labeled candidates.
    async fn lookup_feature(&self, node_name: &str) -> Result<Option<NodeFeature>, Error> {
        let api: Api<NodeFeature> =
            Api::namespaced(self.client.clone(), &self.feature_namespace);
        if let Some(feature) = api.get_opt(node_name).await? {
            return Ok(Some(feature));
        }
        let params = ListParams::default()
            .labels(&format!("{}={}", NODE_FEATURE_NODE_NAME_LABEL, node_name));
        let features = api.list(&params).await?.items;
        Ok(pick_feature(features, node_name))
    }
}

#[async_trait::async_trait]
impl<D, N, C> crate::queue::Reconcile for Reconciler<D, N, C>
where
    D: DeviceStore + 'static,
    N: NodeStateStore + 'static,
    C: DetectionSource + 'static,
{
    async fn reconcile(&self, node_name: &str) -> Result<ReconcileResult, Error> {
        Reconciler::reconcile(self, node_name).await
    }
}

/// Chooses the newest feature object by resource version: numeric compare
/// when both parse, lexicographic otherwise, name matches win ties.
pub fn pick_feature(features: Vec<NodeFeature>, node_name: &str) -> Option<NodeFeature> {
    features.into_iter().max_by(|a, b| {
        compare_resource_versions(
            a.metadata.resource_version.as_deref().unwrap_or(""),
            b.metadata.resource_version.as_deref().unwrap_or(""),
        )
        .then_with(|| {
            let a_named = a.metadata.name.as_deref() == Some(node_name);
            let b_named = b.metadata.name.as_deref() == Some(node_name);
            a_named.cmp(&b_named)
        })
    })
}

fn compare_resource_versions(a: &str, b: &str) -> std::cmp::Ordering {
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(a), Ok(b)) => a.cmp(&b),
        _ => a.cmp(b),
    }
}

/// Existing devices without a snapshot counterpart. Empty unless the node
/// is being deleted: transient label loss on a live node must not delete.
pub fn compute_orphans(
    existing: &[GPUDevice],
    node_name: &str,
    snapshot: &NodeSnapshot,
    cleanup_allowed: bool,
) -> BTreeSet<String> {
    if !cleanup_allowed {
        return BTreeSet::new();
    }
    let current: BTreeSet<String> = snapshot
        .devices
        .iter()
        .map(|snap| snapshot::device_name(node_name, snap))
        .collect();
    existing
        .iter()
        .filter_map(|device| device.metadata.name.clone())
        .filter(|name| !current.contains(name))
        .collect()
}

/// Node-level observation for the device state machine.
fn observe(node: &Node, snapshot: &NodeSnapshot) -> Observation {
    let bootstrapped = node
        .status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .and_then(|conditions| {
            conditions
                .iter()
                .find(|c| c.type_ == "Ready")
                .map(|c| c.status == "True")
        })
        .unwrap_or(false);
    let infra_degraded = snapshot
        .labels
        .get(LABEL_INFRA_DEGRADED)
        .map(String::as_str)
        == Some("true");
    Observation {
        bootstrapped,
        infra_ready: bootstrapped && snapshot.feature_detected,
        infra_degraded,
        health_error: false,
    }
}
