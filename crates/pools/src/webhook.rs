//! The admission webhook server.
//!
//! Three admission paths plus a health probe:
//!   `POST /validate/gpudevice`    assignment-annotation admission
//!   `POST /mutate/gpupool`        defaulting + validation
//!   `POST /mutate/clustergpupool` defaulting + validation
//! TLS termination is deployment-provided (the Service fronting the
//! webhook), so the server itself speaks plain HTTP unless certificates
//! are configured.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use gpu_api::device::GPUDevice;
use gpu_api::pool::{ClusterGPUPool, GPUPool};
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview};
use kube::core::DynamicObject;
use kube::ResourceExt;
use tracing::{info, warn};
use warp::Filter;

use crate::admission::{review_device, PoolSource};
use crate::defaults::apply_defaults;
use crate::validate::validate_pool;

/// Listener configuration.
#[derive(Clone, Debug)]
pub struct WebhookConfig {
    pub addr: SocketAddr,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
}

/// Builds the route tree over a pool source.
pub fn routes<S: PoolSource + 'static>(
    source: Arc<S>,
) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
    let health = warp::get()
        .and(warp::path("healthz"))
        .map(|| "gpu pool admission webhook");

    let device = warp::post()
        .and(warp::path!("validate" / "gpudevice"))
        .and(warp::body::json())
        .and_then(move |review: AdmissionReview<GPUDevice>| {
            let source = source.clone();
            async move { Ok::<_, Infallible>(warp::reply::json(&admit_device(&*source, review).await)) }
        });

    let pool = warp::post()
        .and(warp::path!("mutate" / "gpupool"))
        .and(warp::body::json())
        .map(|review: AdmissionReview<GPUPool>| warp::reply::json(&admit_pool(review)));

    let cluster_pool = warp::post()
        .and(warp::path!("mutate" / "clustergpupool"))
        .and(warp::body::json())
        .map(|review: AdmissionReview<ClusterGPUPool>| {
            warp::reply::json(&admit_cluster_pool(review))
        });

    health.or(device).or(pool).or(cluster_pool)
}

/// Serves until the surrounding task is cancelled.
pub async fn serve<S: PoolSource + 'static>(source: Arc<S>, config: WebhookConfig) {
    info!(addr = %config.addr, "starting pool admission webhook");
    let filter = routes(source);
    match (config.cert_file, config.key_file) {
        (Some(cert), Some(key)) => {
            warp::serve(filter)
                .tls()
                .cert_path(cert)
                .key_path(key)
                .run(config.addr)
                .await
        }
        _ => warp::serve(filter).run(config.addr).await,
    }
}

async fn admit_device<S: PoolSource + ?Sized>(
    source: &S,
    review: AdmissionReview<GPUDevice>,
) -> AdmissionReview<DynamicObject> {
    let req: AdmissionRequest<GPUDevice> = match review.try_into() {
        Ok(req) => req,
        Err(err) => return bad_review(format!("malformed admission review: {}", err)),
    };
    let mut resp = AdmissionResponse::from(&req);
    if let Some(device) = &req.object {
        match review_device(source, device).await {
            Ok(verdict) if verdict.allowed => {}
            Ok(verdict) => resp = resp.deny(verdict.message),
            Err(err) => {
                warn!(device = %device.name_any(), error = %err, "pool lookup failed during admission");
                resp = resp.deny(format!("pool lookup failed: {}", err));
            }
        }
    }
    resp.into_review()
}

fn admit_pool(review: AdmissionReview<GPUPool>) -> AdmissionReview<DynamicObject> {
    let req: AdmissionRequest<GPUPool> = match review.try_into() {
        Ok(req) => req,
        Err(err) => return bad_review(format!("malformed admission review: {}", err)),
    };
    let mut resp = AdmissionResponse::from(&req);
    if let Some(pool) = &req.object {
        let mut defaulted = pool.spec.clone();
        apply_defaults(&mut defaulted);
        eprintln!("DEBUG defaulted={:?} spec={:?} validate={:?}", defaulted, pool.spec, validate_pool(&pool.name_any(), &defaulted));
        resp = match validate_pool(&pool.name_any(), &defaulted) {
            Ok(()) if defaulted != pool.spec => patch_spec(resp, &defaulted),
            Ok(()) => resp,
            Err(errors) => resp.deny(errors.to_string()),
        };
    }
    resp.into_review()
}

fn admit_cluster_pool(review: AdmissionReview<ClusterGPUPool>) -> AdmissionReview<DynamicObject> {
    let req: AdmissionRequest<ClusterGPUPool> = match review.try_into() {
        Ok(req) => req,
        Err(err) => return bad_review(format!("malformed admission review: {}", err)),
    };
    let mut resp = AdmissionResponse::from(&req);
    if let Some(pool) = &req.object {
        let mut defaulted = pool.spec.pool.clone();
        apply_defaults(&mut defaulted);
        resp = match validate_pool(&pool.name_any(), &defaulted) {
            Ok(()) if defaulted != pool.spec.pool => patch_spec(resp, &defaulted),
            Ok(()) => resp,
            Err(errors) => resp.deny(errors.to_string()),
        };
    }
    resp.into_review()
}

/// Replaces the whole spec with its defaulted form via a JSON patch.
fn patch_spec<T: serde::Serialize>(
    resp: AdmissionResponse,
    defaulted: &T,
) -> AdmissionResponse {
    let ops = serde_json::json!([
        { "op": "replace", "path": "/spec", "value": defaulted }
    ]);
    match serde_json::from_value::<json_patch::Patch>(ops) {
        Ok(patch) => match resp.clone().with_patch(patch) {
            Ok(patched) => { eprintln!("DEBUG patched ok, as_json={}", serde_json::to_string(&patched.clone().into_review()).unwrap_or_default()); patched },
            Err(err) => {
                eprintln!("DEBUG with_patch err={}", err);
                warn!(error = %err, "failed to attach defaulting patch");
                resp
            }
        },
        Err(err) => {
            eprintln!("DEBUG from_value err={}", err);
            warn!(error = %err, "failed to build defaulting patch");
            resp
        }
    }
}

fn bad_review(message: String) -> AdmissionReview<DynamicObject> {
    AdmissionResponse::invalid(message).into_review()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::admission::testing::FakePoolSource;
    use serde_json::json;

    fn device_review(annotations: serde_json::Value) -> serde_json::Value {
        json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": {
                "uid": "705ab4f5-6393-11e8-b7cc-42010a800002",
                "kind": {"group": "internal.gpu.deckhouse.io", "version": "v1alpha1", "kind": "GPUDevice"},
                "resource": {"group": "internal.gpu.deckhouse.io", "version": "v1alpha1", "resource": "gpudevices"},
                "operation": "UPDATE",
                "userInfo": {},
                "object": {
                    "apiVersion": "internal.gpu.deckhouse.io/v1alpha1",
                    "kind": "GPUDevice",
                    "metadata": {
                        "name": "worker-a-00-10de-1db5",
                        "annotations": annotations,
                    },
                    "spec": {},
                    "status": {
                        "state": "Ready",
                        "hardware": {"uuid": "GPU-A", "pciAddress": "0000:01:00.0"}
                    }
                }
            }
        })
    }

    #[tokio::test]
    async fn device_route_denies_ambiguous_pool() {
        use gpu_api::pool::GPUPool;
        use kube::api::ObjectMeta;
        let source = Arc::new(FakePoolSource::default());
        for namespace in ["ns-2", "ns-1"] {
            source.pools.lock().unwrap().push(GPUPool {
                metadata: ObjectMeta {
                    name: Some("pool-a".to_string()),
                    namespace: Some(namespace.to_string()),
                    ..Default::default()
                },
                spec: Default::default(),
            });
        }
        let filter = routes(source);
        let body = device_review(json!({"gpu.deckhouse.io/assignment": "pool-a"}));
        let reply = warp::test::request()
            .method("POST")
            .path("/validate/gpudevice")
            .json(&body)
            .reply(&filter)
            .await;
        assert_eq!(reply.status(), 200);
        let review: serde_json::Value = serde_json::from_slice(reply.body()).unwrap();
        assert_eq!(review["response"]["allowed"], json!(false));
        let message = review["response"]["status"]["message"].as_str().unwrap();
        assert!(message.contains("ns-1, ns-2"), "got {}", message);
    }

    #[tokio::test]
    async fn device_route_admits_plain_update() {
        let source = Arc::new(FakePoolSource::default());
        let filter = routes(source);
        let body = device_review(json!({}));
        let reply = warp::test::request()
            .method("POST")
            .path("/validate/gpudevice")
            .json(&body)
            .reply(&filter)
            .await;
        let review: serde_json::Value = serde_json::from_slice(reply.body()).unwrap();
        assert_eq!(review["response"]["allowed"], json!(true));
    }

    #[tokio::test]
    async fn pool_route_defaults_and_patches() {
        let source = Arc::new(FakePoolSource::default());
        let filter = routes(source);
        let body = json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": {
                "uid": "705ab4f5-6393-11e8-b7cc-42010a800002",
                "kind": {"group": "internal.gpu.deckhouse.io", "version": "v1alpha1", "kind": "GPUPool"},
                "resource": {"group": "internal.gpu.deckhouse.io", "version": "v1alpha1", "resource": "gpupools"},
                "operation": "CREATE",
                "userInfo": {},
                "object": {
                    "apiVersion": "internal.gpu.deckhouse.io/v1alpha1",
                    "kind": "GPUPool",
                    "metadata": {"name": "pool-a", "namespace": "ns-1"},
                    "spec": {}
                }
            }
        });
        let reply = warp::test::request()
            .method("POST")
            .path("/mutate/gpupool")
            .json(&body)
            .reply(&filter)
            .await;
        let review: serde_json::Value = serde_json::from_slice(reply.body()).unwrap();
        assert_eq!(review["response"]["allowed"], json!(true));
        assert_eq!(review["response"]["patchType"], json!("JSONPatch"));
        let patch = review["response"]["patch"].as_str().unwrap();
        use base64::Engine;
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(patch)
            .unwrap();
        let ops: serde_json::Value = serde_json::from_slice(&decoded).unwrap();
        assert_eq!(ops[0]["path"], json!("/spec"));
        assert_eq!(ops[0]["value"]["provider"], json!("Nvidia"));
    }

    #[tokio::test]
    async fn pool_route_rejects_invalid_spec() {
        let source = Arc::new(FakePoolSource::default());
        let filter = routes(source);
        let body = json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": {
                "uid": "705ab4f5-6393-11e8-b7cc-42010a800002",
                "kind": {"group": "internal.gpu.deckhouse.io", "version": "v1alpha1", "kind": "GPUPool"},
                "resource": {"group": "internal.gpu.deckhouse.io", "version": "v1alpha1", "resource": "gpupools"},
                "operation": "CREATE",
                "userInfo": {},
                "object": {
                    "apiVersion": "internal.gpu.deckhouse.io/v1alpha1",
                    "kind": "GPUPool",
                    "metadata": {"name": "pool-a", "namespace": "ns-1"},
                    "spec": {"resource": {"unit": "MIG"}}
                }
            }
        });
        let reply = warp::test::request()
            .method("POST")
            .path("/mutate/gpupool")
            .json(&body)
            .reply(&filter)
            .await;
        let review: serde_json::Value = serde_json::from_slice(reply.body()).unwrap();
        assert_eq!(review["response"]["allowed"], json!(false));
    }
}
