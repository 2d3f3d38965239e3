//! The API rewriter: a rules-driven bidirectional transformer between an
//! original and a renamed Kubernetes API group, and the streaming proxy
//! that applies it to live traffic.

pub mod admission;
pub mod crd;
pub mod discovery;
pub mod metadata;
pub mod patches;
pub mod proxy;
pub mod rbac;
pub mod rewriter;
pub mod rules;
pub mod stream;
pub mod target;
pub mod webhookconf;
pub mod workloads;

use thiserror::Error;

/// Transformation direction.
///
/// `Rename` moves payloads from the original (public) form to the renamed
/// (private) form on their way to the upstream API; `Restore` is the
/// inverse, applied to everything flowing back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Rename,
    Restore,
}

impl Action {
    pub fn invert(self) -> Action {
        match self {
            Action::Rename => Action::Restore,
            Action::Restore => Action::Rename,
        }
    }
}

#[derive(Error, Debug)]
pub enum RewriteError {
    #[error("malformed payload: {0}")]
    Malformed(String),

    #[error("unknown watch event type {0:?}")]
    UnknownWatchEvent(String),

    /// Control signal, not a failure: the rules decided this object must
    /// not cross the boundary. Dropped from lists; a 404 for singles.
    #[error("item skipped by rewrite rules")]
    SkipItem,

    #[error("invalid CRD name {0:?}")]
    InvalidCrdName(String),
}
