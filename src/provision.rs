//! Manifest sets
//!
//! [`provision`] runs read, patch and apply for each file in order and
//! stops at the first failure. [`teardown`] runs read, patch and remove in
//! reverse order, attempts every file, and reports all failures together.

use std::fmt;
use std::path::{Path, PathBuf};

use tracing::{info, instrument, warn};

use crate::apply::{ApplyError, Applier};
use crate::manifest::{expand_paths, read_manifest, ManifestError};
use crate::patch::{Patch, PatchError};
use crate::resource::ResourceId;

/// A provisioning step failed; carries the offending file
#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: ManifestError,
    },

    #[error("failed to patch {}: {source}", path.display())]
    Patch {
        path: PathBuf,
        #[source]
        source: PatchError,
    },

    #[error("failed to apply {}: {source}", path.display())]
    Apply {
        path: PathBuf,
        #[source]
        source: ApplyError,
    },
}

impl ProvisionError {
    /// The manifest that failed
    #[must_use]
    pub fn path(&self) -> &Path {
        match self {
            Self::Read { path, .. } | Self::Patch { path, .. } | Self::Apply { path, .. } => path,
        }
    }
}

/// One or more deletions failed during teardown
#[derive(Debug)]
pub struct TeardownError {
    /// Every failed manifest with its error message
    pub failures: Vec<(PathBuf, String)>,
}

impl fmt::Display for TeardownError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "teardown failed for {} manifest(s)", self.failures.len())?;
        for (path, message) in &self.failures {
            write!(f, "\n  {}: {}", path.display(), message)?;
        }
        Ok(())
    }
}

impl std::error::Error for TeardownError {}

/// Read, patch and create every manifest in order
///
/// Returns the identities of the objects applied, in order.
#[instrument(skip_all, fields(cluster = applier.cluster().name(), manifests = manifests.len()))]
pub async fn provision(
    applier: &Applier,
    manifests: &[PathBuf],
    patch: &dyn Patch,
) -> Result<Vec<ResourceId>, ProvisionError> {
    let mut applied = Vec::with_capacity(manifests.len());

    for entry in manifests {
        let files = expand_paths(std::slice::from_ref(entry)).map_err(|source| {
            ProvisionError::Read {
                path: entry.clone(),
                source,
            }
        })?;

        for path in files {
            let mut obj = read_manifest(&path).map_err(|source| ProvisionError::Read {
                path: path.clone(),
                source,
            })?;
            patch.patch(&mut obj).map_err(|source| ProvisionError::Patch {
                path: path.clone(),
                source,
            })?;
            applier
                .apply(&obj)
                .await
                .map_err(|source| ProvisionError::Apply {
                    path: path.clone(),
                    source,
                })?;

            if let Ok(id) = crate::resource::resource_id(&obj) {
                applied.push(id);
            }
        }
    }

    info!(objects = applied.len(), "Provisioned manifests");
    Ok(applied)
}

/// Read, patch and delete every manifest, last one first
///
/// A failure on one file does not stop the others.
#[instrument(skip_all, fields(cluster = applier.cluster().name(), manifests = manifests.len()))]
pub async fn teardown(
    applier: &Applier,
    manifests: &[PathBuf],
    patch: &dyn Patch,
) -> Result<(), TeardownError> {
    let mut failures = Vec::new();

    let mut files = Vec::with_capacity(manifests.len());
    for entry in manifests {
        match expand_paths(std::slice::from_ref(entry)) {
            Ok(expanded) => files.extend(expanded),
            Err(e) => failures.push((entry.clone(), e.to_string())),
        }
    }

    for path in files.iter().rev() {
        if let Err(message) = remove_one(applier, path, patch).await {
            warn!(path = %path.display(), error = %message, "Teardown step failed");
            failures.push((path.clone(), message));
        }
    }

    if failures.is_empty() {
        info!(files = files.len(), "Tore down manifests");
        Ok(())
    } else {
        Err(TeardownError { failures })
    }
}

async fn remove_one(applier: &Applier, path: &Path, patch: &dyn Patch) -> Result<(), String> {
    let mut obj = read_manifest(path).map_err(|e| e.to_string())?;
    patch.patch(&mut obj).map_err(|e| e.to_string())?;
    applier.remove(&obj).await.map_err(|e| e.to_string())?;
    Ok(())
}
