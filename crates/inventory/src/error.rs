//! Error surface of the inventory crate.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// A status patch raced a concurrent writer. Recovered by requeueing,
    /// never surfaced to the work queue as a failure.
    #[error("write conflict on {0}")]
    Conflict(String),

    #[error("detection transport error from {url}: {message}")]
    DetectionTransport { url: String, message: String },

    #[error("detection decode error from {url}: {message}")]
    DetectionDecode { url: String, message: String },

    #[error("device handler {handler} failed: {source}")]
    Handler {
        handler: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("startup failed: {0}")]
    Startup(String),
}

impl Error {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict(_))
    }
}

/// True for a stale-resource-version rejection.
pub fn is_kube_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == 409)
}

/// True for a 404 from the API server.
pub fn is_kube_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == 404)
}
