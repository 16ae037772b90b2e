//! Manifest rewriting
//!
//! Every object read from a manifest passes through a [`Patch`] exactly once
//! before it reaches the cluster. [`NamespacePatch`] adapts controller
//! manifests to one fixture:
//!
//! | Kind | Rewrite |
//! |---|---|
//! | `ClusterRoleBinding` | name suffixed, subject namespaces replaced, `ClusterRole` ref renamed |
//! | `ClusterRole` | name suffixed with the namespace |
//! | `ServiceAccount`, `Role` | namespace set |
//! | `RoleBinding` | namespace set, `ClusterRole` ref renamed |
//! | `Deployment` | namespace set, container image / pull policy / watch namespace overridden |
//!
//! Any other kind is rejected with [`PatchError::UnsupportedKind`].
//!
//! Suffixing cluster-scoped names keeps concurrent fixtures from colliding
//! without any central allocator.

use k8s_openapi::api::core::v1::EnvVar;
use kube::api::DynamicObject;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::PatchOptions;
use crate::resource::kind_of;

/// Env var that tells an operator which namespace to watch
pub const WATCH_NAMESPACE_ENV: &str = "WATCH_NAMESPACE";

/// Errors from patching an object
#[derive(Debug, thiserror::Error)]
pub enum PatchError {
    #[error("unexpected resource kind '{0}'")]
    UnsupportedKind(String),

    #[error("malformed {kind} '{name}': {reason}")]
    Malformed {
        kind: String,
        name: String,
        reason: String,
    },
}

/// A transformation applied to an object before it is sent to the cluster
pub trait Patch: Send + Sync {
    /// Rewrite `obj` in place
    fn patch(&self, obj: &mut DynamicObject) -> Result<(), PatchError>;
}

impl<F> Patch for F
where
    F: Fn(&mut DynamicObject) -> Result<(), PatchError> + Send + Sync,
{
    fn patch(&self, obj: &mut DynamicObject) -> Result<(), PatchError> {
        self(obj)
    }
}

/// Kinds that controller manifests may contain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagedKind {
    ClusterRoleBinding,
    ClusterRole,
    ServiceAccount,
    Role,
    RoleBinding,
    Deployment,
}

impl ManagedKind {
    /// Classify a kind string
    #[must_use]
    pub fn from_kind(kind: &str) -> Option<Self> {
        match kind {
            "ClusterRoleBinding" => Some(Self::ClusterRoleBinding),
            "ClusterRole" => Some(Self::ClusterRole),
            "ServiceAccount" => Some(Self::ServiceAccount),
            "Role" => Some(Self::Role),
            "RoleBinding" => Some(Self::RoleBinding),
            "Deployment" => Some(Self::Deployment),
            _ => None,
        }
    }

    /// Whether objects of this kind live outside any namespace
    #[must_use]
    pub fn is_cluster_scoped(self) -> bool {
        matches!(self, Self::ClusterRoleBinding | Self::ClusterRole)
    }
}

/// Append `suffix` unless `name` already carries it
///
/// Keeps renaming stable when an object is patched more than once. The
/// price is that a name which already ended in `suffix` before any
/// patching is left as is, so `role-ns-1` patched for `ns-1` stays
/// `role-ns-1`. Allocated namespaces carry a random uuid, which keeps that
/// case out of reach for fixtures.
#[must_use]
pub fn suffixed(name: &str, suffix: &str) -> String {
    if name.ends_with(suffix) {
        name.to_string()
    } else {
        format!("{name}{suffix}")
    }
}

/// Rewrites controller manifests for one fixture namespace
#[derive(Debug, Clone)]
pub struct NamespacePatch {
    options: PatchOptions,
}

impl NamespacePatch {
    #[must_use]
    pub fn new(options: PatchOptions) -> Self {
        Self { options }
    }

    #[must_use]
    pub fn options(&self) -> &PatchOptions {
        &self.options
    }

    fn rename(&self, obj: &mut DynamicObject) {
        let name = obj.metadata.name.as_deref().unwrap_or_default();
        obj.metadata.name = Some(suffixed(name, &self.options.namespace));
    }

    fn set_namespace(&self, obj: &mut DynamicObject) {
        obj.metadata.namespace = Some(self.options.namespace.clone());
    }

    fn rewrite_subjects(&self, obj: &mut DynamicObject) {
        let Some(subjects) = obj.data.get_mut("subjects").and_then(Value::as_array_mut) else {
            return;
        };
        for subject in subjects.iter_mut().filter_map(Value::as_object_mut) {
            if let Some(ns) = subject.get_mut("namespace").filter(|v| v.is_string()) {
                *ns = Value::String(self.options.namespace.clone());
            }
        }
    }

    fn rename_cluster_role_ref(&self, obj: &mut DynamicObject) {
        let Some(role_ref) = obj.data.get_mut("roleRef").and_then(Value::as_object_mut) else {
            return;
        };
        if role_ref.get("kind").and_then(Value::as_str) != Some("ClusterRole") {
            return;
        }
        if let Some(Value::String(name)) = role_ref.get_mut("name") {
            *name = suffixed(name, &self.options.namespace);
        }
    }

    fn patch_deployment(&self, obj: &mut DynamicObject) -> Result<(), PatchError> {
        let malformed = |reason: String| PatchError::Malformed {
            kind: "Deployment".to_string(),
            name: obj.metadata.name.clone().unwrap_or_default(),
            reason,
        };

        let Some(slot) = obj.data.pointer_mut("/spec/template/spec/containers") else {
            return Err(malformed("missing spec.template.spec.containers".to_string()));
        };

        let mut containers: Vec<ContainerView> =
            serde_json::from_value(slot.take()).map_err(|e| malformed(e.to_string()))?;

        for container in &mut containers {
            if let Some(image) = &self.options.image {
                container.image = Some(image.clone());
            }
            if let Some(policy) = self.options.image_pull_policy {
                container.image_pull_policy = Some(policy.as_str().to_string());
            }
            if let Some(watch) = &self.options.watch_namespace {
                container.set_env(WATCH_NAMESPACE_ENV, watch);
            }
        }

        *slot = serde_json::to_value(&containers).map_err(|e| malformed(e.to_string()))?;
        Ok(())
    }
}

impl Patch for NamespacePatch {
    fn patch(&self, obj: &mut DynamicObject) -> Result<(), PatchError> {
        let kind = kind_of(obj);
        let managed = ManagedKind::from_kind(kind)
            .ok_or_else(|| PatchError::UnsupportedKind(kind.to_string()))?;

        match managed {
            ManagedKind::ClusterRoleBinding => {
                self.rename(obj);
                self.rewrite_subjects(obj);
                self.rename_cluster_role_ref(obj);
            }
            ManagedKind::ClusterRole => self.rename(obj),
            ManagedKind::ServiceAccount | ManagedKind::Role => self.set_namespace(obj),
            ManagedKind::RoleBinding => {
                self.set_namespace(obj);
                self.rename_cluster_role_ref(obj);
            }
            ManagedKind::Deployment => {
                self.set_namespace(obj);
                self.patch_deployment(obj)?;
            }
        }

        Ok(())
    }
}

/// Passes CustomResourceDefinitions through untouched and rejects the rest
#[derive(Debug, Clone, Copy, Default)]
pub struct CrdPatch;

impl Patch for CrdPatch {
    fn patch(&self, obj: &mut DynamicObject) -> Result<(), PatchError> {
        match kind_of(obj) {
            "CustomResourceDefinition" => Ok(()),
            other => Err(PatchError::UnsupportedKind(other.to_string())),
        }
    }
}

/// The container fields a patch may touch; everything else round-trips
/// through `rest` unchanged
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContainerView {
    name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    image: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    image_pull_policy: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    env: Vec<EnvVar>,

    #[serde(flatten)]
    rest: serde_json::Map<String, Value>,
}

impl ContainerView {
    fn set_env(&mut self, name: &str, value: &str) {
        match self.env.iter_mut().find(|e| e.name == name) {
            Some(var) => {
                var.value = Some(value.to_string());
                var.value_from = None;
            }
            None => self.env.push(EnvVar {
                name: name.to_string(),
                value: Some(value.to_string()),
                ..Default::default()
            }),
        }
    }
}
