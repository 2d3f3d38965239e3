//! Wires watcher streams into the node queue and owns the controller
//! lifecycle.

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use gpu_api::config::{GPUControllerConfig, CONFIG_NAME};
use gpu_api::device::GPUDevice;
use gpu_api::feature::NodeFeature;
use gpu_api::labels::{
    LABEL_DEVICE_NODE, NODE_FEATURE_NODE_NAME_LABEL, TELEMETRY_APP_LABEL, TELEMETRY_APP_NAME,
};
use gpu_api::node_state::GPUNodeState;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::api::{Api, ListParams};
use kube::runtime::watcher::{self, watcher, Event};
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use tracing::{info, warn};

use crate::config::InventoryConfig;
use crate::error::Error;
use crate::handler::HandlerChain;
use crate::policy::{gpu_present, PolicyStore};
use crate::queue::{NodeQueue, Reconcile};
use crate::reconciler::KubeReconciler;

/// Bound on the initial node list at startup.
pub const CACHE_SYNC_TIMEOUT: Duration = Duration::from_secs(600);

pub struct InventoryController<R: Reconcile> {
    client: kube::Client,
    config: InventoryConfig,
    policies: Arc<PolicyStore>,
    queue: Arc<NodeQueue<R>>,
}

impl InventoryController<KubeReconciler> {
    pub fn new(
        client: kube::Client,
        config: InventoryConfig,
        policies: Arc<PolicyStore>,
        handlers: HandlerChain,
    ) -> Self {
        let reconciler = Arc::new(KubeReconciler::new(
            client.clone(),
            &config,
            policies.clone(),
            handlers,
        ));
        InventoryController {
            client,
            config,
            policies,
            queue: Arc::new(NodeQueue::new(reconciler)),
        }
    }
}

impl<R: Reconcile> InventoryController<R> {
    /// Runs until the surrounding task is cancelled. Fails only when the
    /// initial node sync cannot complete within [`CACHE_SYNC_TIMEOUT`].
    pub async fn run(self) -> Result<(), Error> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        let initial = tokio::time::timeout(CACHE_SYNC_TIMEOUT, nodes.list(&ListParams::default()))
            .await
            .map_err(|_| Error::Startup("initial node sync timed out".to_string()))??;
        info!(nodes = initial.items.len(), "initial node sync complete");

        let features: Api<NodeFeature> =
            Api::namespaced(self.client.clone(), &self.config.feature_namespace);
        let devices: Api<GPUDevice> = Api::all(self.client.clone());
        let node_states: Api<GPUNodeState> = Api::all(self.client.clone());
        let pods: Api<Pod> =
            Api::namespaced(self.client.clone(), &self.config.workloads_namespace);
        let configs: Api<GPUControllerConfig> = Api::all(self.client.clone());

        let pod_config = watcher::Config::default()
            .labels(&format!("{}={}", TELEMETRY_APP_LABEL, TELEMETRY_APP_NAME));

        tokio::join!(
            watch_and_enqueue(nodes, watcher::Config::default(), self.queue.clone(), |node: &Node| {
                Some(node.name_any())
            }),
            watch_and_enqueue(
                features,
                watcher::Config::default(),
                self.queue.clone(),
                |feature: &NodeFeature| {
                    feature
                        .labels()
                        .get(NODE_FEATURE_NODE_NAME_LABEL)
                        .cloned()
                        .or_else(|| feature.metadata.name.clone())
                },
            ),
            watch_and_enqueue(
                devices,
                watcher::Config::default(),
                self.queue.clone(),
                |device: &GPUDevice| {
                    device
                        .labels()
                        .get(LABEL_DEVICE_NODE)
                        .cloned()
                        .or_else(|| device.status.as_ref().map(|s| s.node_name.clone()))
                        .filter(|name| !name.is_empty())
                },
            ),
            watch_and_enqueue(
                node_states,
                watcher::Config::default(),
                self.queue.clone(),
                |state: &GPUNodeState| state.metadata.name.clone(),
            ),
            watch_and_enqueue(pods, pod_config, self.queue.clone(), |pod: &Pod| {
                pod.spec.as_ref().and_then(|spec| spec.node_name.clone())
            }),
            self.watch_module_config(configs),
        );
        Ok(())
    }

    /// Tracks the module configuration object. Policy changes resync every
    /// node whose labels indicate GPU presence.
    async fn watch_module_config(&self, api: Api<GPUControllerConfig>) {
        let mut stream = watcher(api, watcher::Config::default()).boxed();
        while let Some(item) = stream.next().await {
            let changed = match item {
                Ok(Event::Apply(config)) | Ok(Event::InitApply(config)) => {
                    if config.metadata.name.as_deref() != Some(CONFIG_NAME) {
                        continue;
                    }
                    self.policies.apply(&config.spec)
                }
                Ok(Event::Delete(config)) => {
                    if config.metadata.name.as_deref() != Some(CONFIG_NAME) {
                        continue;
                    }
                    self.policies.apply(&Default::default())
                }
                Ok(Event::Init) | Ok(Event::InitDone) => false,
                Err(err) => {
                    warn!(error = %err, "module config watch error");
                    false
                }
            };
            if changed {
                info!("policies changed, resyncing gpu-present nodes");
                self.resync_gpu_nodes().await;
            }
        }
    }

    async fn resync_gpu_nodes(&self) {
        let nodes: Api<Node> = Api::all(self.client.clone());
        let listed = match nodes.list(&ListParams::default()).await {
            Ok(listed) => listed,
            Err(err) => {
                warn!(error = %err, "node list for policy resync failed");
                return;
            }
        };
        for node in listed.items {
            let labels = node
                .metadata
                .labels
                .clone()
                .unwrap_or_default()
                .into_iter()
                .collect();
            if gpu_present(&labels) {
                self.queue.enqueue(&node.name_any()).await;
            }
        }
    }
}

/// Forwards a watcher stream into the queue, mapping each object to its
/// node key. Watch errors are logged; the watcher re-establishes itself.
async fn watch_and_enqueue<K, R, F>(
    api: Api<K>,
    config: watcher::Config,
    queue: Arc<NodeQueue<R>>,
    map: F,
) where
    K: Resource + Clone + DeserializeOwned + Debug + Send + 'static,
    K::DynamicType: Default + Eq + std::hash::Hash + Clone,
    R: Reconcile,
    F: Fn(&K) -> Option<String>,
{
    let mut stream = watcher(api, config).boxed();
    while let Some(item) = stream.next().await {
        match item {
            Ok(Event::Apply(obj)) | Ok(Event::InitApply(obj)) | Ok(Event::Delete(obj)) => {
                if let Some(key) = map(&obj) {
                    queue.enqueue(&key).await;
                }
            }
            Ok(Event::Init) | Ok(Event::InitDone) => {}
            Err(err) => warn!(error = %err, "watch error"),
        }
    }
}
