//! Pool resolution by name.

use async_trait::async_trait;
use gpu_api::pool::{ClusterGPUPool, GPUPool};
use kube::api::{Api, ListParams};
use kube::ResourceExt;

use crate::admission::PoolSource;

/// Result of resolving a namespaced pool name across the cluster.
#[derive(Debug, Clone)]
pub enum PoolResolution {
    Found(Box<GPUPool>),
    NotFound,
    /// More than one namespace hosts a pool with the name; the conflicting
    /// namespaces, sorted.
    Ambiguous(Vec<String>),
}

/// Resolves a name against a pre-listed pool set.
pub fn resolve_named(pools: Vec<GPUPool>, name: &str) -> PoolResolution {
    let mut matching: Vec<GPUPool> = pools
        .into_iter()
        .filter(|pool| pool.name_any() == name)
        .collect();
    match matching.len() {
        0 => PoolResolution::NotFound,
        1 => PoolResolution::Found(Box::new(matching.remove(0))),
        _ => {
            let mut namespaces: Vec<String> = matching
                .iter()
                .filter_map(|pool| pool.metadata.namespace.clone())
                .collect();
            namespaces.sort();
            namespaces.dedup();
            PoolResolution::Ambiguous(namespaces)
        }
    }
}

/// Kubernetes-backed pool lookups.
pub struct KubePoolSource {
    cluster_pools: Api<ClusterGPUPool>,
    pools: Api<GPUPool>,
}

impl KubePoolSource {
    pub fn new(client: kube::Client) -> Self {
        KubePoolSource {
            cluster_pools: Api::all(client.clone()),
            pools: Api::all(client),
        }
    }
}

#[async_trait]
impl PoolSource for KubePoolSource {
    async fn cluster_pool(&self, name: &str) -> Result<Option<ClusterGPUPool>, kube::Error> {
        self.cluster_pools.get_opt(name).await
    }

    async fn pools_named(&self, name: &str) -> Result<Vec<GPUPool>, kube::Error> {
        // Names are not list-selectable; list and filter.
        let pools = self.pools.list(&ListParams::default()).await?;
        Ok(pools
            .items
            .into_iter()
            .filter(|pool| pool.name_any() == name)
            .collect())
    }
}
