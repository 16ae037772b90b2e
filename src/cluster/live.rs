//! Live cluster access
//!
//! Talks to a real API server through `kube::Client`. Object types are
//! resolved to REST endpoints through discovery and cached per kind.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use kube::api::{Api, ApiResource, DeleteParams, DynamicObject, PostParams};
use kube::core::GroupVersionKind;
use kube::discovery::{self, Scope};
use kube::Client;
use tracing::{debug, instrument};

use super::{ClusterApi, ClusterError, Operation};
use crate::resource::{resource_id, ResourceId};

/// Cluster reached through a kube client
pub struct KubeCluster {
    client: Client,
    resources: Mutex<HashMap<(String, String), (ApiResource, Scope)>>,
}

impl KubeCluster {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self {
            client,
            resources: Mutex::new(HashMap::new()),
        }
    }

    /// Connect using the ambient kubeconfig or in-cluster config
    pub async fn try_default() -> Result<Self, ClusterError> {
        let client = Client::try_default()
            .await
            .map_err(|e| ClusterError::Client(e.to_string()))?;
        Ok(Self::new(client))
    }

    /// The underlying client, for calls outside the fixture boundary
    #[must_use]
    pub fn client(&self) -> &Client {
        &self.client
    }

    async fn resolve(&self, id: &ResourceId) -> Result<(ApiResource, Scope), ClusterError> {
        let key = (id.api_version.clone(), id.kind.clone());
        let cached = self.lock_cache().get(&key).cloned();
        if let Some(hit) = cached {
            return Ok(hit);
        }

        let (group, version) = id.group_version();
        let gvk = GroupVersionKind::gvk(group, version, &id.kind);
        let (resource, caps) = discovery::pinned_kind(&self.client, &gvk)
            .await
            .map_err(|e| ClusterError::Discovery {
                api_version: id.api_version.clone(),
                kind: id.kind.clone(),
                message: e.to_string(),
            })?;

        debug!(kind = %id.kind, plural = %resource.plural, "Resolved API resource");
        let resolved = (resource, caps.scope);
        self.lock_cache().insert(key, resolved.clone());
        Ok(resolved)
    }

    fn lock_cache(&self) -> MutexGuard<'_, HashMap<(String, String), (ApiResource, Scope)>> {
        // A poisoned cache only ever holds complete entries
        self.resources.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn api(&self, id: &ResourceId) -> Result<Api<DynamicObject>, ClusterError> {
        let (resource, scope) = self.resolve(id).await?;
        let api = match (scope, id.namespace.as_deref()) {
            (Scope::Cluster, _) => Api::all_with(self.client.clone(), &resource),
            (Scope::Namespaced, Some(ns)) => {
                Api::namespaced_with(self.client.clone(), ns, &resource)
            }
            (Scope::Namespaced, None) => {
                Api::default_namespaced_with(self.client.clone(), &resource)
            }
        };
        Ok(api)
    }
}

/// Translate a kube error into the boundary's error taxonomy
fn classify(err: &kube::Error, id: &ResourceId, op: Operation) -> ClusterError {
    if let kube::Error::Api(status) = err {
        return match status.code {
            404 => ClusterError::NotFound(id.clone()),
            409 if op == Operation::Create => ClusterError::AlreadyExists(id.clone()),
            409 => ClusterError::Conflict(id.clone()),
            429 | 500..=599 => ClusterError::Transient {
                id: id.clone(),
                message: err.to_string(),
            },
            _ => ClusterError::Rejected {
                id: id.clone(),
                message: err.to_string(),
            },
        };
    }

    let raw = err.to_string();
    let lowered = raw.to_lowercase();
    if lowered.contains("connection refused")
        || lowered.contains("connection reset")
        || lowered.contains("timed out")
        || lowered.contains("timeout")
    {
        return ClusterError::Transient {
            id: id.clone(),
            message: raw,
        };
    }

    ClusterError::Rejected {
        id: id.clone(),
        message: raw,
    }
}

#[async_trait]
impl ClusterApi for KubeCluster {
    #[instrument(
        skip(self, obj),
        fields(
            cluster = "kube",
            kind = %crate::resource::kind_of(obj),
            name = ?obj.metadata.name
        )
    )]
    async fn create(&self, obj: &DynamicObject) -> Result<DynamicObject, ClusterError> {
        let id = resource_id(obj)?;
        let api = self.api(&id).await?;
        api.create(&PostParams::default(), obj)
            .await
            .map_err(|e| classify(&e, &id, Operation::Create))
    }

    #[instrument(skip(self), fields(cluster = "kube", resource = %id))]
    async fn get(&self, id: &ResourceId) -> Result<DynamicObject, ClusterError> {
        let api = self.api(id).await?;
        api.get(&id.name)
            .await
            .map_err(|e| classify(&e, id, Operation::Get))
    }

    #[instrument(
        skip(self, obj),
        fields(
            cluster = "kube",
            kind = %crate::resource::kind_of(obj),
            name = ?obj.metadata.name
        )
    )]
    async fn update(&self, obj: &DynamicObject) -> Result<DynamicObject, ClusterError> {
        let id = resource_id(obj)?;
        let api = self.api(&id).await?;

        // Replace needs the version we are overwriting
        let mut obj = obj.clone();
        if obj.metadata.resource_version.is_none() {
            let current = api
                .get(&id.name)
                .await
                .map_err(|e| classify(&e, &id, Operation::Get))?;
            obj.metadata.resource_version = current.metadata.resource_version;
        }

        api.replace(&id.name, &PostParams::default(), &obj)
            .await
            .map_err(|e| classify(&e, &id, Operation::Update))
    }

    #[instrument(skip(self), fields(cluster = "kube", resource = %id))]
    async fn delete(&self, id: &ResourceId) -> Result<(), ClusterError> {
        let api = self.api(id).await?;
        api.delete(&id.name, &DeleteParams::background())
            .await
            .map_err(|e| classify(&e, id, Operation::Delete))?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "kube"
    }
}
