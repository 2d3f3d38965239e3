//! Admission of device→pool assignment requests.

use async_trait::async_trait;
use gpu_api::device::{DeviceState, GPUDevice};
use gpu_api::labels::{ANNOTATION_ASSIGNMENT, ANNOTATION_CLUSTER_ASSIGNMENT, LABEL_IGNORE};
use gpu_api::pool::{ClusterGPUPool, GPUPool};
use kube::ResourceExt;

use crate::resolve::{resolve_named, PoolResolution};
use crate::selector::device_matches;

/// Pool lookups the webhook needs.
#[async_trait]
pub trait PoolSource: Send + Sync {
    async fn cluster_pool(&self, name: &str) -> Result<Option<ClusterGPUPool>, kube::Error>;
    /// Every `GPUPool` with the given name, across all namespaces.
    async fn pools_named(&self, name: &str) -> Result<Vec<GPUPool>, kube::Error>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub allowed: bool,
    pub message: String,
}

impl Verdict {
    fn allow() -> Self {
        Verdict {
            allowed: true,
            message: String::new(),
        }
    }

    fn deny(message: impl Into<String>) -> Self {
        Verdict {
            allowed: false,
            message: message.into(),
        }
    }
}

/// Decides whether a `GPUDevice` create/update may carry its assignment
/// annotations.
pub async fn review_device(
    source: &(impl PoolSource + ?Sized),
    device: &GPUDevice,
) -> Result<Verdict, kube::Error> {
    let annotations = device.annotations();
    let namespaced = annotations.get(ANNOTATION_ASSIGNMENT);
    let cluster = annotations.get(ANNOTATION_CLUSTER_ASSIGNMENT);

    let (pool_name, is_cluster) = match (namespaced, cluster) {
        (None, None) => return Ok(Verdict::allow()),
        (Some(_), Some(_)) => {
            return Ok(Verdict::deny(format!(
                "a device must not carry both {} and {}",
                ANNOTATION_ASSIGNMENT, ANNOTATION_CLUSTER_ASSIGNMENT
            )))
        }
        (Some(name), None) => (name.clone(), false),
        (None, Some(name)) => (name.clone(), true),
    };

    if device.labels().get(LABEL_IGNORE).map(String::as_str) == Some("true") {
        return Ok(Verdict::deny(format!(
            "device {} is excluded from assignment by the {} label",
            device.name_any(),
            LABEL_IGNORE
        )));
    }

    let status = device.status.clone().unwrap_or_default();
    if status.state != DeviceState::Ready {
        return Ok(Verdict::deny(format!(
            "device {} is not assignable in state {}",
            device.name_any(),
            status.state.as_str()
        )));
    }
    if status.hardware.uuid.is_empty() || status.hardware.pci_address.is_empty() {
        return Ok(Verdict::deny(format!(
            "device {} has incomplete inventory (uuid and PCI address are required)",
            device.name_any()
        )));
    }

    if is_cluster {
        let pool = match source.cluster_pool(&pool_name).await? {
            Some(pool) => pool,
            None => {
                return Ok(Verdict::deny(format!(
                    "ClusterGPUPool {} does not exist",
                    pool_name
                )))
            }
        };
        if !device_matches(Some(device), pool.spec.pool.device_selector.as_ref()) {
            return Ok(Verdict::deny(format!(
                "device {} does not match the selector of ClusterGPUPool {}",
                device.name_any(),
                pool_name
            )));
        }
        return Ok(Verdict::allow());
    }

    match resolve_named(source.pools_named(&pool_name).await?, &pool_name) {
        PoolResolution::Found(_) => Ok(Verdict::allow()),
        PoolResolution::NotFound => Ok(Verdict::deny(format!(
            "GPUPool {} does not exist in any namespace",
            pool_name
        ))),
        PoolResolution::Ambiguous(namespaces) => Ok(Verdict::deny(format!(
            "GPUPool name {} is ambiguous across namespaces: {}",
            pool_name,
            namespaces.join(", ")
        ))),
    }
}


#[cfg(test)]
mod test {
    use super::testing::FakePoolSource;
    use super::*;
    use gpu_api::device::{GPUDeviceStatus, GPUHardware};
    use gpu_api::pool::{ClusterGPUPoolSpec, DeviceSelector, GPUPoolSpec, SelectorRules};
    use kube::api::ObjectMeta;

    fn assignable_device(annotation: Option<(&str, &str)>) -> GPUDevice {
        let mut device = GPUDevice::new("worker-a-00-10de-1db5", Default::default());
        if let Some((key, value)) = annotation {
            device.metadata.annotations = Some(
                [(key.to_string(), value.to_string())]
                    .into_iter()
                    .collect(),
            );
        }
        device.status = Some(GPUDeviceStatus {
            state: DeviceState::Ready,
            hardware: GPUHardware {
                uuid: "GPU-A".to_string(),
                pci_address: "0000:01:00.0".to_string(),
                vendor: "10de".to_string(),
                ..Default::default()
            },
            ..Default::default()
        });
        device
    }

    fn namespaced_pool(name: &str, namespace: &str) -> GPUPool {
        GPUPool {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            spec: Default::default(),
        }
    }

    fn cluster_pool(name: &str, selector: Option<DeviceSelector>) -> ClusterGPUPool {
        ClusterGPUPool {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec: ClusterGPUPoolSpec {
                pool: GPUPoolSpec {
                    device_selector: selector,
                    ..Default::default()
                },
            },
        }
    }

    #[tokio::test]
    async fn no_annotation_is_admitted() {
        let source = FakePoolSource::default();
        let verdict = review_device(&source, &assignable_device(None))
            .await
            .unwrap();
        assert!(verdict.allowed);
    }

    #[tokio::test]
    async fn both_annotations_rejected() {
        let source = FakePoolSource::default();
        let mut device = assignable_device(Some((ANNOTATION_ASSIGNMENT, "pool-a")));
        device
            .metadata
            .annotations
            .as_mut()
            .unwrap()
            .insert(ANNOTATION_CLUSTER_ASSIGNMENT.to_string(), "pool-b".to_string());
        let verdict = review_device(&source, &device).await.unwrap();
        assert!(!verdict.allowed);
        assert!(verdict.message.contains("both"));
    }

    #[tokio::test]
    async fn ignored_device_rejected() {
        let source = FakePoolSource::default();
        let mut device = assignable_device(Some((ANNOTATION_ASSIGNMENT, "pool-a")));
        device.metadata.labels = Some(
            [(LABEL_IGNORE.to_string(), "true".to_string())]
                .into_iter()
                .collect(),
        );
        let verdict = review_device(&source, &device).await.unwrap();
        assert!(!verdict.allowed);
    }

    #[tokio::test]
    async fn non_ready_device_rejected() {
        let source = FakePoolSource::default();
        source
            .pools
            .lock()
            .unwrap()
            .push(namespaced_pool("pool-a", "ns-1"));
        let mut device = assignable_device(Some((ANNOTATION_ASSIGNMENT, "pool-a")));
        device.status.as_mut().unwrap().state = DeviceState::Discovered;
        let verdict = review_device(&source, &device).await.unwrap();
        assert!(!verdict.allowed);
        assert!(verdict.message.contains("Discovered"));
    }

    #[tokio::test]
    async fn incomplete_inventory_rejected() {
        let source = FakePoolSource::default();
        source
            .pools
            .lock()
            .unwrap()
            .push(namespaced_pool("pool-a", "ns-1"));
        let mut device = assignable_device(Some((ANNOTATION_ASSIGNMENT, "pool-a")));
        device.status.as_mut().unwrap().hardware.uuid.clear();
        let verdict = review_device(&source, &device).await.unwrap();
        assert!(!verdict.allowed);
        assert!(verdict.message.contains("incomplete inventory"));
    }

    #[tokio::test]
    async fn unique_namespaced_pool_admitted() {
        let source = FakePoolSource::default();
        source
            .pools
            .lock()
            .unwrap()
            .push(namespaced_pool("pool-a", "ns-1"));
        let device = assignable_device(Some((ANNOTATION_ASSIGNMENT, "pool-a")));
        let verdict = review_device(&source, &device).await.unwrap();
        assert!(verdict.allowed);
    }

    #[tokio::test]
    async fn ambiguous_pool_lists_namespaces_sorted() {
        let source = FakePoolSource::default();
        source
            .pools
            .lock()
            .unwrap()
            .extend([namespaced_pool("pool-a", "ns-2"), namespaced_pool("pool-a", "ns-1")]);
        let device = assignable_device(Some((ANNOTATION_ASSIGNMENT, "pool-a")));
        let verdict = review_device(&source, &device).await.unwrap();
        assert!(!verdict.allowed);
        assert!(verdict.message.contains("ns-1, ns-2"));
    }

    #[tokio::test]
    async fn missing_cluster_pool_rejected() {
        let source = FakePoolSource::default();
        let device = assignable_device(Some((ANNOTATION_CLUSTER_ASSIGNMENT, "shared")));
        let verdict = review_device(&source, &device).await.unwrap();
        assert!(!verdict.allowed);
        assert!(verdict.message.contains("does not exist"));
    }

    #[tokio::test]
    async fn cluster_pool_selector_is_enforced() {
        let source = FakePoolSource::default();
        source.cluster_pools.lock().unwrap().push(cluster_pool(
            "shared",
            Some(DeviceSelector {
                include: Some(SelectorRules {
                    pci_vendors: vec!["1002".to_string()],
                    ..Default::default()
                }),
                exclude: None,
            }),
        ));
        let device = assignable_device(Some((ANNOTATION_CLUSTER_ASSIGNMENT, "shared")));
        let verdict = review_device(&source, &device).await.unwrap();
        assert!(!verdict.allowed);
        assert!(verdict.message.contains("selector"));

        // A nil selector admits the device.
        source.cluster_pools.lock().unwrap().clear();
        source
            .cluster_pools
            .lock()
            .unwrap()
            .push(cluster_pool("shared", None));
        let verdict = review_device(&source, &device).await.unwrap();
        assert!(verdict.allowed);
    }
}
