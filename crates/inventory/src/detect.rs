//! The detection collector: per-node health telemetry fetched over HTTP
//! from the gfd-extender sidecar.
//!
//! Missing pods, unready pods, and unreachable endpoints are routine during
//! rollouts and yield an empty detection without an error. Only failures
//! past a successful 200 (body transport, decode) surface as errors, and
//! even those never fail the reconcile.

use std::collections::HashMap;

use async_trait::async_trait;
use gpu_api::device::{DeviceHealth, GPUDeviceStatus};
use gpu_api::labels::{TELEMETRY_APP_LABEL, TELEMETRY_APP_NAME, TELEMETRY_CONTAINER};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams};
use serde::Deserialize;
use tracing::debug;
use url::Url;

use crate::error::Error;
use crate::snapshot::{canonical_index, DeviceSnapshot};

/// One entry of the telemetry report.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectEntry {
    #[serde(default)]
    pub index: i64,
    #[serde(default)]
    pub uuid: String,
    #[serde(default)]
    pub memory_info: MemoryInfo,
    #[serde(default)]
    pub power_usage: i64,
    #[serde(default)]
    pub utilization: Utilization,
    #[serde(default)]
    pub product: Option<String>,
    #[serde(default)]
    pub pci_address: Option<String>,
    #[serde(default)]
    pub serial: Option<String>,
    #[serde(default)]
    pub power_limit: Option<i64>,
    #[serde(default)]
    pub sm_count: Option<i64>,
    #[serde(default)]
    pub p_state: Option<String>,
    #[serde(default)]
    pub display_mode: Option<String>,
    /// Set when the device driver reports a fault.
    #[serde(default)]
    pub health_error: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MemoryInfo {
    #[serde(rename = "Total", default)]
    pub total: i64,
    #[serde(rename = "Free", default)]
    pub free: i64,
    #[serde(rename = "Used", default)]
    pub used: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Utilization {
    #[serde(rename = "Gpu", default)]
    pub gpu: i64,
    #[serde(rename = "Memory", default)]
    pub memory: i64,
}

/// Telemetry for one node, indexed for overlay lookups.
#[derive(Debug, Clone, Default)]
pub struct NodeDetection {
    by_uuid: HashMap<String, DetectEntry>,
    by_index: HashMap<String, DetectEntry>,
}

impl NodeDetection {
    pub fn from_entries(entries: Vec<DetectEntry>) -> Self {
        let mut detection = NodeDetection::default();
        for entry in entries {
            detection
                .by_index
                .insert(canonical_index(&entry.index.to_string()), entry.clone());
            if !entry.uuid.is_empty() {
                detection.by_uuid.insert(entry.uuid.clone(), entry);
            }
        }
        detection
    }

    pub fn is_empty(&self) -> bool {
        self.by_index.is_empty() && self.by_uuid.is_empty()
    }

    /// UUID first, then device index.
    pub fn lookup(&self, uuid: &str, index: &str) -> Option<&DetectEntry> {
        if !uuid.is_empty() {
            if let Some(entry) = self.by_uuid.get(uuid) {
                return Some(entry);
            }
        }
        self.by_index.get(&canonical_index(index))
    }
}

/// Folds the telemetry overlay for one device into its status.
pub fn apply_detection(
    status: &mut GPUDeviceStatus,
    snapshot: &DeviceSnapshot,
    detection: &NodeDetection,
) {
    let entry = match detection.lookup(&snapshot.uuid, &snapshot.index) {
        Some(entry) => entry,
        None => return,
    };
    let hardware = &mut status.hardware;
    if hardware.uuid.is_empty() && !entry.uuid.is_empty() {
        hardware.uuid = entry.uuid.clone();
    }
    if let Some(address) = &entry.pci_address {
        hardware.pci_address = crate::snapshot::canonical_pci_address(address);
    }
    if let Some(product) = &entry.product {
        hardware.product = product.clone();
    }
    if let Some(serial) = &entry.serial {
        hardware.serial = serial.clone();
    }
    if let Some(p_state) = &entry.p_state {
        hardware.p_state = p_state.clone();
    }
    if let Some(display_mode) = &entry.display_mode {
        hardware.display_mode = display_mode.clone();
    }
    if entry.power_limit.is_some() {
        hardware.power_limit_mw = entry.power_limit;
    }
    if entry.sm_count.is_some() {
        hardware.sm_count = entry.sm_count;
    }
    if entry.memory_info.total > 0 {
        hardware.memory_mib = Some(entry.memory_info.total / (1024 * 1024));
    }
    match &entry.health_error {
        Some(message) if !message.is_empty() => {
            status.health = Some(DeviceHealth {
                message: message.clone(),
                reason: "TelemetryReport".to_string(),
            });
        }
        _ => status.health = None,
    }
}

/// Source of per-node detections, trait-shaped so the reconciler can run
/// against a fake in tests.
#[async_trait]
pub trait DetectionSource: Send + Sync {
    async fn collect(&self, node_name: &str) -> Result<NodeDetection, Error>;
}

/// The production collector: finds the telemetry pod for a node and
/// fetches its report.
pub struct DetectionCollector {
    pods: Api<Pod>,
    http: reqwest::Client,
}

impl DetectionCollector {
    pub fn new(client: kube::Client, namespace: &str) -> Self {
        DetectionCollector {
            pods: Api::namespaced(client, namespace),
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl DetectionSource for DetectionCollector {
    async fn collect(&self, node_name: &str) -> Result<NodeDetection, Error> {
        let params = ListParams::default()
            .labels(&format!("{}={}", TELEMETRY_APP_LABEL, TELEMETRY_APP_NAME))
            .fields(&format!("spec.nodeName={}", node_name));
        let pods = self.pods.list(&params).await?;

        let (ip, port) = match select_endpoint(&pods.items) {
            Some(endpoint) => endpoint,
            None => {
                debug!(node = node_name, "no ready telemetry pod, skipping detection");
                return Ok(NodeDetection::default());
            }
        };
        let url = match Url::parse(&format!("http://{}:{}/", ip, port)) {
            Ok(url) => url,
            Err(err) => {
                debug!(node = node_name, error = %err, "unresolvable telemetry URL");
                return Ok(NodeDetection::default());
            }
        };
        let entries = fetch_entries(&self.http, url).await?;
        Ok(NodeDetection::from_entries(entries))
    }
}

/// Picks the endpoint of the first running, ready telemetry pod that
/// declares a port on the gfd-extender container.
pub fn select_endpoint(pods: &[Pod]) -> Option<(String, i32)> {
    for pod in pods {
        let status = pod.status.as_ref()?;
        if status.phase.as_deref() != Some("Running") {
            continue;
        }
        let ready = status
            .conditions
            .as_ref()
            .and_then(|conditions| {
                conditions
                    .iter()
                    .find(|c| c.type_ == "Ready")
                    .map(|c| c.status == "True")
            })
            .unwrap_or(false);
        if !ready {
            continue;
        }
        let ip = match &status.pod_ip {
            Some(ip) if !ip.is_empty() => ip.clone(),
            _ => continue,
        };
        let port = pod.spec.as_ref().and_then(|spec| {
            spec.containers
                .iter()
                .find(|c| c.name == TELEMETRY_CONTAINER)
                .and_then(|c| c.ports.as_ref())
                .and_then(|ports| ports.first())
                .map(|p| p.container_port)
        });
        if let Some(port) = port {
            return Some((ip, port));
        }
    }
    None
}

/// Fetches and decodes the report. Request failures and non-200 statuses
/// are silent; failures past a successful 200 are errors.
pub async fn fetch_entries(
    http: &reqwest::Client,
    url: Url,
) -> Result<Vec<DetectEntry>, Error> {
    let url_text = url.to_string();
    let response = match http.get(url).send().await {
        Ok(response) => response,
        Err(err) => {
            debug!(url = %url_text, error = %err, "telemetry request failed");
            return Ok(Vec::new());
        }
    };
    if response.status().as_u16() != 200 {
        debug!(url = %url_text, status = %response.status(), "telemetry endpoint not serving");
        return Ok(Vec::new());
    }
    let body = response
        .bytes()
        .await
        .map_err(|err| Error::DetectionTransport {
            url: url_text.clone(),
            message: err.to_string(),
        })?;
    serde_json::from_slice(&body).map_err(|err| Error::DetectionDecode {
        url: url_text,
        message: err.to_string(),
    })
}
