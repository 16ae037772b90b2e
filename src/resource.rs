//! Generic resource objects
//!
//! Manifests are held as `kube::api::DynamicObject`: type meta, object
//! metadata and a schema-less JSON body. This module adds identity and
//! typed views on top of it.

use std::fmt;

use kube::api::DynamicObject;
use kube::core::TypeMeta;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Kinds that have no namespace dimension
const CLUSTER_SCOPED_KINDS: &[&str] = &[
    "Namespace",
    "ClusterRole",
    "ClusterRoleBinding",
    "CustomResourceDefinition",
];

/// Whether `kind` is known to be cluster-scoped
#[must_use]
pub fn is_cluster_scoped(kind: &str) -> bool {
    CLUSTER_SCOPED_KINDS.contains(&kind)
}

/// Identity of a cluster object
///
/// `namespace` is `None` for cluster-scoped kinds.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceId {
    /// API group and version (e.g., "apps/v1", "v1")
    pub api_version: String,
    /// Kind (e.g., "Deployment")
    pub kind: String,
    /// Namespace, if the kind is namespaced
    pub namespace: Option<String>,
    /// Object name
    pub name: String,
}

impl ResourceId {
    /// Identity of a namespaced object
    pub fn namespaced(
        api_version: impl Into<String>,
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            api_version: api_version.into(),
            kind: kind.into(),
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }

    /// Identity of a cluster-scoped object
    pub fn cluster(
        api_version: impl Into<String>,
        kind: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            api_version: api_version.into(),
            kind: kind.into(),
            namespace: None,
            name: name.into(),
        }
    }

    /// Identity of an apps/v1 Deployment
    pub fn deployment(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self::namespaced("apps/v1", "Deployment", namespace, name)
    }

    /// Identity of a core/v1 Namespace
    pub fn namespace(name: impl Into<String>) -> Self {
        Self::cluster("v1", "Namespace", name)
    }

    /// Split `api_version` into (group, version); the core group is ""
    #[must_use]
    pub fn group_version(&self) -> (&str, &str) {
        match self.api_version.split_once('/') {
            Some((group, version)) => (group, version),
            None => ("", self.api_version.as_str()),
        }
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{} in namespace {}", self.kind, self.name, ns),
            None => write!(f, "{}/{}", self.kind, self.name),
        }
    }
}

/// Errors from interpreting a generic object
#[derive(Debug, thiserror::Error)]
pub enum ObjectError {
    #[error("object has no apiVersion/kind")]
    MissingType,

    #[error("{kind} object has no metadata.name")]
    MissingName { kind: String },

    #[error("cannot convert {kind}: {message}")]
    Conversion { kind: String, message: String },
}

/// Kind of a generic object, or "" if it has none
#[must_use]
pub fn kind_of(obj: &DynamicObject) -> &str {
    obj.types.as_ref().map_or("", |t| t.kind.as_str())
}

/// Identity of a generic object
pub fn resource_id(obj: &DynamicObject) -> Result<ResourceId, ObjectError> {
    let types = obj
        .types
        .as_ref()
        .filter(|t| !t.kind.is_empty() && !t.api_version.is_empty())
        .ok_or(ObjectError::MissingType)?;

    let name = obj
        .metadata
        .name
        .clone()
        .filter(|n| !n.is_empty())
        .ok_or_else(|| ObjectError::MissingName {
            kind: types.kind.clone(),
        })?;

    let namespace = if is_cluster_scoped(&types.kind) {
        None
    } else {
        obj.metadata.namespace.clone()
    };

    Ok(ResourceId {
        api_version: types.api_version.clone(),
        kind: types.kind.clone(),
        namespace,
        name,
    })
}

/// Convert a generic object into a typed `k8s-openapi` (or CRD) struct
pub fn typed<K: DeserializeOwned>(obj: &DynamicObject) -> Result<K, ObjectError> {
    let conversion = |message: String| ObjectError::Conversion {
        kind: kind_of(obj).to_string(),
        message,
    };
    let value = serde_json::to_value(obj).map_err(|e| conversion(e.to_string()))?;
    serde_json::from_value(value).map_err(|e| conversion(e.to_string()))
}

/// Convert a typed struct into a generic object
pub fn dynamic<K: Serialize>(resource: &K) -> Result<DynamicObject, ObjectError> {
    let value = serde_json::to_value(resource).map_err(|e| ObjectError::Conversion {
        kind: "unknown".to_string(),
        message: e.to_string(),
    })?;
    let kind = value
        .get("kind")
        .and_then(serde_json::Value::as_str)
        .unwrap_or("unknown")
        .to_string();
    serde_json::from_value(value).map_err(|e| ObjectError::Conversion {
        kind,
        message: e.to_string(),
    })
}

/// Empty generic object with the given type and name
pub fn new_object(api_version: &str, kind: &str, name: &str) -> DynamicObject {
    let mut obj = DynamicObject {
        types: Some(TypeMeta {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
        }),
        metadata: kube::api::ObjectMeta::default(),
        data: serde_json::Value::Object(serde_json::Map::new()),
    };
    obj.metadata.name = Some(name.to_string());
    obj
}
