//! Fixture namespaces
//!
//! Each fixture owns its namespaces outright; names are random so
//! concurrent runs against one cluster never share one.

use k8s_openapi::api::core::v1::Namespace;
use kube::api::{DynamicObject, ObjectMeta};
use tracing::info;

use crate::apply::{ApplyError, Applier, RemoveError};
use crate::resource::{dynamic, ObjectError, ResourceId};

/// Label set on every namespace a fixture creates
pub const FIXTURE_LABEL: &str = "opfixture.io/fixture";

/// A globally unique namespace name starting with `prefix`
#[must_use]
pub fn unique_namespace(prefix: &str) -> String {
    format!("{prefix}{}", uuid::Uuid::new_v4())
}

/// The Namespace object for `name`, labeled as fixture-owned
pub fn namespace_object(name: &str) -> Result<DynamicObject, ObjectError> {
    let ns = Namespace {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(
                [(FIXTURE_LABEL.to_string(), "true".to_string())]
                    .into_iter()
                    .collect(),
            ),
            ..Default::default()
        },
        ..Default::default()
    };
    dynamic(&ns)
}

/// Create a fixture namespace
pub async fn create_namespace(applier: &Applier, name: &str) -> Result<ResourceId, ApplyError> {
    applier.apply(&namespace_object(name)?).await?;
    info!(namespace = %name, "Created fixture namespace");
    Ok(ResourceId::namespace(name))
}

/// Delete a fixture namespace and everything in it
pub async fn delete_namespace(applier: &Applier, name: &str) -> Result<(), RemoveError> {
    applier.remove(&namespace_object(name)?).await?;
    info!(namespace = %name, "Deleted fixture namespace");
    Ok(())
}
