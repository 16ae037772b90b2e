//! Manifest reading
//!
//! A manifest file holds exactly one Kubernetes object in YAML. Reading
//! only touches the filesystem; nothing is sent to the cluster.

use std::path::{Path, PathBuf};

use kube::api::DynamicObject;
use tracing::debug;

use crate::resource::{self, ObjectError};

/// Errors from reading manifests
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("{path} contains no object")]
    Empty { path: PathBuf },

    #[error("{path} is not a Kubernetes object: {reason}")]
    Invalid { path: PathBuf, reason: String },
}

/// Read the single object stored in `path`
///
/// # Example
///
/// ```no_run
/// use opfixture::manifest::read_manifest;
///
/// let obj = read_manifest("deploy/service_account.yaml")?;
/// # Ok::<(), opfixture::manifest::ManifestError>(())
/// ```
pub fn read_manifest(path: impl AsRef<Path>) -> Result<DynamicObject, ManifestError> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).map_err(|source| ManifestError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let obj = parse_manifest(path, &text)?;
    debug!(
        path = %path.display(),
        kind = %resource::kind_of(&obj),
        name = ?obj.metadata.name,
        "Read manifest"
    );
    Ok(obj)
}

/// Parse manifest text; `path` is only used for error context
pub fn parse_manifest(path: &Path, text: &str) -> Result<DynamicObject, ManifestError> {
    let value: serde_json::Value =
        serde_yaml::from_str(text).map_err(|source| ManifestError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

    let invalid = |reason: String| ManifestError::Invalid {
        path: path.to_path_buf(),
        reason,
    };

    match value {
        serde_json::Value::Null => {
            return Err(ManifestError::Empty {
                path: path.to_path_buf(),
            })
        }
        serde_json::Value::Object(_) => {}
        other => return Err(invalid(format!("expected a mapping, found {other}"))),
    }

    let obj: DynamicObject = serde_json::from_value(value).map_err(|e| invalid(e.to_string()))?;

    // Identity must be derivable before anything else touches the object
    resource::resource_id(&obj).map_err(|e: ObjectError| invalid(e.to_string()))?;

    Ok(obj)
}

/// Expand directories into the manifest files they contain
///
/// Files are kept in the order given. A directory contributes its `.yaml`
/// and `.yml` files in lexical order; subdirectories are not descended.
pub fn expand_paths(paths: &[PathBuf]) -> Result<Vec<PathBuf>, ManifestError> {
    let mut files = Vec::with_capacity(paths.len());

    for path in paths {
        if !path.is_dir() {
            files.push(path.clone());
            continue;
        }

        let io_err = |source| ManifestError::Io {
            path: path.clone(),
            source,
        };
        let mut entries: Vec<PathBuf> = std::fs::read_dir(path)
            .map_err(io_err)?
            .map(|entry| entry.map(|e| e.path()))
            .collect::<Result<_, _>>()
            .map_err(io_err)?;

        entries.retain(|p| {
            p.is_file()
                && p
                    .extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|e| e == "yaml" || e == "yml")
        });
        entries.sort();

        debug!(dir = %path.display(), files = entries.len(), "Expanded manifest directory");
        files.extend(entries);
    }

    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    const SERVICE_ACCOUNT: &str = "\
apiVersion: v1
kind: ServiceAccount
metadata:
  name: memcached-operator
";

    #[test]
    fn test_read_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("service_account.yaml");
        fs::write(&path, SERVICE_ACCOUNT).unwrap();

        let obj = read_manifest(&path).unwrap();
        assert_eq!(resource::kind_of(&obj), "ServiceAccount");
        assert_eq!(obj.metadata.name.as_deref(), Some("memcached-operator"));
        assert_eq!(obj.metadata.namespace, None);
    }

    #[test]
    fn test_read_missing_file() {
        let err = read_manifest("/nonexistent/opfixture/manifest.yaml").unwrap_err();
        assert!(matches!(err, ManifestError::Io { .. }));
        assert!(err.to_string().contains("manifest.yaml"));
    }

    #[test]
    fn test_parse_malformed_yaml() {
        let err = parse_manifest(Path::new("bad.yaml"), "kind: [unclosed").unwrap_err();
        assert!(matches!(err, ManifestError::Parse { .. }));
    }

    #[test]
    fn test_parse_rejects_multiple_documents() {
        let text = format!("{SERVICE_ACCOUNT}---\n{SERVICE_ACCOUNT}");
        let err = parse_manifest(Path::new("two.yaml"), &text).unwrap_err();
        assert!(matches!(err, ManifestError::Parse { .. }));
    }

    #[test]
    fn test_parse_leading_separator() {
        let text = format!("---\n{SERVICE_ACCOUNT}");
        let obj = parse_manifest(Path::new("sa.yaml"), &text).unwrap();
        assert_eq!(resource::kind_of(&obj), "ServiceAccount");
    }

    #[test]
    fn test_parse_empty_document() {
        let err = parse_manifest(Path::new("empty.yaml"), "").unwrap_err();
        assert!(matches!(err, ManifestError::Empty { .. } | ManifestError::Parse { .. }));
    }

    #[test]
    fn test_parse_rejects_non_objects() {
        let err = parse_manifest(Path::new("list.yaml"), "- a\n- b\n").unwrap_err();
        assert!(matches!(err, ManifestError::Invalid { .. }));

        let err = parse_manifest(Path::new("nokind.yaml"), "metadata:\n  name: x\n").unwrap_err();
        assert!(matches!(err, ManifestError::Invalid { .. }));

        let err =
            parse_manifest(Path::new("noname.yaml"), "apiVersion: v1\nkind: Pod\n").unwrap_err();
        assert!(matches!(err, ManifestError::Invalid { .. }));
    }

    #[test]
    fn test_parse_keeps_nested_fields() {
        let text = "\
apiVersion: rbac.authorization.k8s.io/v1
kind: ClusterRoleBinding
metadata:
  name: role-binding
subjects:
- kind: ServiceAccount
  name: memcached-operator
  namespace: old-ns
roleRef:
  kind: ClusterRole
  name: role-A
  apiGroup: rbac.authorization.k8s.io
";
        let obj = parse_manifest(Path::new("crb.yaml"), text).unwrap();
        assert_eq!(obj.data["subjects"][0]["namespace"], "old-ns");
        assert_eq!(obj.data["roleRef"]["name"], "role-A");
    }

    #[test]
    fn test_expand_paths() {
        let dir = tempfile::tempdir().unwrap();
        let crds = dir.path().join("crds");
        fs::create_dir(&crds).unwrap();
        fs::write(crds.join("b_crd.yaml"), "").unwrap();
        fs::write(crds.join("a_crd.yml"), "").unwrap();
        fs::write(crds.join("README.md"), "").unwrap();
        fs::create_dir(crds.join("nested")).unwrap();

        let single = dir.path().join("operator.yaml");
        let files = expand_paths(&[single.clone(), crds.clone()]).unwrap();

        assert_eq!(
            files,
            vec![single, crds.join("a_crd.yml"), crds.join("b_crd.yaml")]
        );
    }
}
