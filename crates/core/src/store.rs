//! Seams to the remote object store. Production implementations live in
//! `kfold-kubehub`; `kfold-store` provides an in-memory one.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::{Gvk, RawObj, ServerVersion};

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("api error {code}: {message}")]
    Api { code: u16, message: String },
    #[error("transport: {0}")]
    Transport(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }
}

/// A served resource kind as reported by discovery.
///
/// Discovery reports every served version of a kind; exactly one of them is
/// `preferred`. Objects are shared between versions, so walks over all
/// objects visit only preferred entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceKind {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub plural: String,
    pub namespaced: bool,
    pub verbs: SmallVec<[String; 8]>,
    pub preferred: bool,
}

impl ResourceKind {
    pub fn gvk(&self) -> Gvk {
        Gvk::new(self.group.clone(), self.version.clone(), self.kind.clone())
    }

    pub fn supports(&self, verb: &str) -> bool {
        self.verbs.iter().any(|v| v == verb)
    }

    pub fn matches(&self, gvk: &Gvk) -> bool {
        self.group == gvk.group && self.version == gvk.version && self.kind == gvk.kind
    }
}

/// Patch flavours the engine sends.
#[derive(Debug, Clone, PartialEq)]
pub enum PatchBody {
    /// RFC 7386 JSON merge patch.
    Merge(serde_json::Value),
    /// Kubernetes strategic merge patch.
    Strategic(serde_json::Value),
}

impl PatchBody {
    pub fn value(&self) -> &serde_json::Value {
        match self {
            PatchBody::Merge(v) | PatchBody::Strategic(v) => v,
        }
    }
}

/// How dependents of a deleted object are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeletePropagation {
    /// Pre-1.6 servers: `orphanDependents: false`.
    LegacyNoOrphan,
    /// 1.6+ servers: `propagationPolicy: Foreground`.
    Foreground,
}

impl DeletePropagation {
    pub fn for_server(version: &ServerVersion) -> Self {
        if version.compare(1, 6) == Ordering::Less {
            DeletePropagation::LegacyNoOrphan
        } else {
            DeletePropagation::Foreground
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteOptions {
    pub propagation: DeletePropagation,
    /// Only delete when the live UID still matches.
    pub precondition_uid: Option<String>,
    pub grace_period_seconds: Option<i64>,
}

impl DeleteOptions {
    pub fn new(propagation: DeletePropagation) -> Self {
        Self { propagation, precondition_uid: None, grace_period_seconds: None }
    }
}

/// Client bound to one resource kind and an optional namespace.
/// A namespaced kind with no namespace addresses all namespaces (list only).
#[async_trait::async_trait]
pub trait ResourceClient: Send + Sync {
    async fn get(&self, name: &str) -> Result<Option<RawObj>, StoreError>;
    async fn patch(&self, name: &str, body: &PatchBody) -> Result<RawObj, StoreError>;
    async fn create(&self, obj: &RawObj) -> Result<RawObj, StoreError>;
    async fn delete(&self, name: &str, opts: &DeleteOptions) -> Result<(), StoreError>;
    async fn list(&self) -> Result<Vec<RawObj>, StoreError>;
}

pub trait ResourceClientFactory: Send + Sync {
    fn client_for(&self, resource: &ResourceKind, namespace: Option<&str>) -> Result<Box<dyn ResourceClient>, StoreError>;
}

#[async_trait::async_trait]
pub trait Discovery: Send + Sync {
    /// Served resource kinds, one entry per served version.
    async fn resources(&self) -> Result<Vec<ResourceKind>, StoreError>;
    async fn server_version(&self) -> Result<ServerVersion, StoreError>;
    /// The published OpenAPI v2 document, if the server has one.
    async fn openapi_v2(&self) -> Result<Option<serde_json::Value>, StoreError>;
}
