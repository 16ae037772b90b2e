//! Configuration types for opfixture
//!
//! These types describe how a suite locates its manifests and how each
//! fixture rewrites them. Build them programmatically or from environment
//! variables - no config files needed.
//!
//! # Example
//!
//! ```
//! use opfixture::config::{PatchOptions, PullPolicy, SuiteConfig};
//!
//! let suite = SuiteConfig::new("/src/memcached-operator")
//!     .image("quay.io/example/memcached-operator:dev")
//!     .image_pull_policy(PullPolicy::IfNotPresent);
//!
//! let opts = PatchOptions::new("osdk-e2e-1234")
//!     .image("quay.io/example/memcached-operator:dev")
//!     .image_pull_policy(PullPolicy::Never);
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Environment variable naming the project root
pub const ENV_ROOT: &str = "OPFIXTURE_ROOT";
/// Comma-separated cluster-scoped manifests (CRDs)
pub const ENV_GLOBAL_MANIFESTS: &str = "OPFIXTURE_GLOBAL_MANIFESTS";
/// Comma-separated namespaced controller manifests
pub const ENV_LOCAL_MANIFESTS: &str = "OPFIXTURE_LOCAL_MANIFESTS";
/// Controller image override
pub const ENV_IMAGE: &str = "OPFIXTURE_IMAGE";
/// Controller image pull policy override
pub const ENV_IMAGE_PULL_POLICY: &str = "OPFIXTURE_IMAGE_PULL_POLICY";
/// Skip fixture teardown entirely (debug mode)
pub const ENV_KEEP_ALL: &str = "OPFIXTURE_KEEP_ALL";

/// Errors from building configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid image pull policy '{0}' (expected Always, IfNotPresent or Never)")]
    InvalidPullPolicy(String),

    #[error("cannot determine project root: {0}")]
    Root(String),

    #[error("{0} is set but contains no manifest paths")]
    EmptyManifestList(&'static str),
}

/// Container image pull policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullPolicy {
    Always,
    IfNotPresent,
    Never,
}

impl PullPolicy {
    /// The value written into `imagePullPolicy`
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Always => "Always",
            Self::IfNotPresent => "IfNotPresent",
            Self::Never => "Never",
        }
    }
}

impl fmt::Display for PullPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PullPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "Always" => Ok(Self::Always),
            "IfNotPresent" => Ok(Self::IfNotPresent),
            "Never" => Ok(Self::Never),
            other => Err(ConfigError::InvalidPullPolicy(other.to_string())),
        }
    }
}

/// How manifests are rewritten for one fixture
///
/// Created once per fixture and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchOptions {
    /// Namespace the controller is deployed into; also the suffix for
    /// cluster-scoped names
    pub namespace: String,

    /// Replaces every container image in controller Deployments
    pub image: Option<String>,

    /// Replaces every container pull policy in controller Deployments
    pub image_pull_policy: Option<PullPolicy>,

    /// Exported to controller containers as `WATCH_NAMESPACE`
    pub watch_namespace: Option<String>,
}

impl PatchOptions {
    /// Options targeting `namespace` with no overrides
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            image: None,
            image_pull_policy: None,
            watch_namespace: None,
        }
    }

    /// Override container images
    #[must_use]
    pub fn image(mut self, image: impl Into<String>) -> Self {
        self.image = Some(image.into());
        self
    }

    /// Override container pull policies
    #[must_use]
    pub fn image_pull_policy(mut self, policy: PullPolicy) -> Self {
        self.image_pull_policy = Some(policy);
        self
    }

    /// Set the namespace the controller should watch
    #[must_use]
    pub fn watch_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.watch_namespace = Some(namespace.into());
        self
    }
}

/// Suite-wide configuration shared by every fixture
#[derive(Debug, Clone)]
pub struct SuiteConfig {
    /// Project root; relative manifest paths resolve against it
    pub root: PathBuf,

    /// Cluster-scoped prerequisites (files or directories), installed once
    pub global_manifests: Vec<PathBuf>,

    /// Namespaced controller manifests, applied in order per fixture
    pub local_manifests: Vec<PathBuf>,

    /// Controller image override
    pub image: Option<String>,

    /// Controller image pull policy override
    pub image_pull_policy: Option<PullPolicy>,

    /// Prefix for allocated namespaces
    pub namespace_prefix: String,

    /// Interval between convergence checks
    pub poll_interval: Duration,

    /// Deadline for convergence checks
    pub poll_timeout: Duration,

    /// Deadline for a single apply or remove
    pub operation_timeout: Duration,

    /// Leave fixtures in the cluster after they finish
    pub keep_all: bool,
}

impl SuiteConfig {
    /// Config rooted at `root` with the operator-sdk project layout
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let deploy = root.join("deploy");
        Self {
            global_manifests: vec![deploy.join("crds")],
            local_manifests: vec![
                deploy.join("service_account.yaml"),
                deploy.join("role.yaml"),
                deploy.join("role_binding.yaml"),
                deploy.join("operator.yaml"),
            ],
            root,
            image: None,
            image_pull_policy: None,
            namespace_prefix: "osdk-e2e-".to_string(),
            poll_interval: crate::wait::DEFAULT_INTERVAL,
            poll_timeout: crate::wait::DEFAULT_TIMEOUT,
            operation_timeout: crate::apply::DEFAULT_OPERATION_TIMEOUT,
            keep_all: false,
        }
    }

    /// Build from `OPFIXTURE_*` environment variables
    ///
    /// Without `OPFIXTURE_ROOT` the root is two levels above the current
    /// directory, matching a test crate living at `<root>/test/e2e`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let cwd = std::env::current_dir().map_err(|e| ConfigError::Root(e.to_string()))?;
        Self::from_lookup(&cwd, |key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup
    pub fn from_lookup<F>(cwd: &Path, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let root = match lookup(ENV_ROOT).filter(|v| !v.trim().is_empty()) {
            Some(root) => PathBuf::from(root.trim()),
            None => cwd.join("..").join(".."),
        };

        let mut config = Self::new(root);

        if let Some(list) = lookup(ENV_GLOBAL_MANIFESTS).filter(|v| !v.is_empty()) {
            config.global_manifests = config.resolve_list(&list, ENV_GLOBAL_MANIFESTS)?;
        }
        if let Some(list) = lookup(ENV_LOCAL_MANIFESTS).filter(|v| !v.is_empty()) {
            config.local_manifests = config.resolve_list(&list, ENV_LOCAL_MANIFESTS)?;
        }
        if let Some(image) = lookup(ENV_IMAGE).filter(|v| !v.trim().is_empty()) {
            config.image = Some(image.trim().to_string());
        }
        if let Some(policy) = lookup(ENV_IMAGE_PULL_POLICY).filter(|v| !v.trim().is_empty()) {
            config.image_pull_policy = Some(policy.parse()?);
        }
        if let Some(keep) = lookup(ENV_KEEP_ALL) {
            config.keep_all = !matches!(keep.trim(), "" | "0" | "false");
        }

        Ok(config)
    }

    fn resolve_list(&self, list: &str, var: &'static str) -> Result<Vec<PathBuf>, ConfigError> {
        let paths: Vec<PathBuf> = list
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(|p| self.resolve(p))
            .collect();

        if paths.is_empty() {
            return Err(ConfigError::EmptyManifestList(var));
        }
        Ok(paths)
    }

    /// Resolve a manifest path against the root
    #[must_use]
    pub fn resolve(&self, path: impl AsRef<Path>) -> PathBuf {
        let path = path.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }

    /// Replace the cluster-scoped manifests
    #[must_use]
    pub fn global_manifests(mut self, paths: impl IntoIterator<Item = impl AsRef<Path>>) -> Self {
        self.global_manifests = paths.into_iter().map(|p| self.resolve(p)).collect();
        self
    }

    /// Replace the namespaced manifests
    #[must_use]
    pub fn local_manifests(mut self, paths: impl IntoIterator<Item = impl AsRef<Path>>) -> Self {
        self.local_manifests = paths.into_iter().map(|p| self.resolve(p)).collect();
        self
    }

    /// Set the controller image override
    #[must_use]
    pub fn image(mut self, image: impl Into<String>) -> Self {
        self.image = Some(image.into());
        self
    }

    /// Set the controller pull policy override
    #[must_use]
    pub fn image_pull_policy(mut self, policy: PullPolicy) -> Self {
        self.image_pull_policy = Some(policy);
        self
    }

    /// Set the namespace prefix
    #[must_use]
    pub fn namespace_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.namespace_prefix = prefix.into();
        self
    }

    /// Set convergence polling cadence and deadline
    #[must_use]
    pub fn poll(mut self, interval: Duration, timeout: Duration) -> Self {
        self.poll_interval = interval;
        self.poll_timeout = timeout;
        self
    }

    /// Set the per-operation deadline for apply and remove
    #[must_use]
    pub fn operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    /// Keep fixtures after they finish instead of tearing them down
    #[must_use]
    pub fn keep_all(mut self, keep: bool) -> Self {
        self.keep_all = keep;
        self
    }

    /// Patch options for a fixture deployed into `namespace`
    #[must_use]
    pub fn patch_options(&self, namespace: &str) -> PatchOptions {
        PatchOptions {
            namespace: namespace.to_string(),
            image: self.image.clone(),
            image_pull_policy: self.image_pull_policy,
            watch_namespace: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_pull_policy_parse() {
        assert_eq!("Always".parse::<PullPolicy>().unwrap(), PullPolicy::Always);
        assert_eq!(
            " IfNotPresent ".parse::<PullPolicy>().unwrap(),
            PullPolicy::IfNotPresent
        );
        assert_eq!(PullPolicy::Never.to_string(), "Never");

        let err = "sometimes".parse::<PullPolicy>().unwrap_err();
        assert!(err.to_string().contains("sometimes"));
    }

    #[test]
    fn test_patch_options_builder() {
        let opts = PatchOptions::new("ns-123")
            .image("ctrl:dev")
            .image_pull_policy(PullPolicy::Never)
            .watch_namespace("watched");

        assert_eq!(opts.namespace, "ns-123");
        assert_eq!(opts.image.as_deref(), Some("ctrl:dev"));
        assert_eq!(opts.image_pull_policy, Some(PullPolicy::Never));
        assert_eq!(opts.watch_namespace.as_deref(), Some("watched"));
    }

    #[test]
    fn test_suite_config_defaults() {
        let config = SuiteConfig::new("/proj");

        assert_eq!(config.global_manifests, vec![PathBuf::from("/proj/deploy/crds")]);
        assert_eq!(config.local_manifests.len(), 4);
        assert!(config.local_manifests[0].ends_with("service_account.yaml"));
        assert!(config.local_manifests[3].ends_with("operator.yaml"));
        assert_eq!(config.poll_interval, Duration::from_secs(5));
        assert_eq!(config.poll_timeout, Duration::from_secs(60));
        assert_eq!(config.namespace_prefix, "osdk-e2e-");
        assert!(!config.keep_all);
    }

    #[test]
    fn test_from_lookup_resolves_relative_paths() {
        let lookup = lookup_from(&[
            (ENV_ROOT, "/proj"),
            (ENV_GLOBAL_MANIFESTS, "deploy/crds/a.yaml, /abs/b.yaml"),
            (ENV_LOCAL_MANIFESTS, "deploy/operator.yaml"),
            (ENV_IMAGE, "ctrl:e2e"),
            (ENV_IMAGE_PULL_POLICY, "Never"),
        ]);

        let config = SuiteConfig::from_lookup(Path::new("/cwd"), lookup).unwrap();

        assert_eq!(
            config.global_manifests,
            vec![
                PathBuf::from("/proj/deploy/crds/a.yaml"),
                PathBuf::from("/abs/b.yaml")
            ]
        );
        assert_eq!(
            config.local_manifests,
            vec![PathBuf::from("/proj/deploy/operator.yaml")]
        );
        assert_eq!(config.image.as_deref(), Some("ctrl:e2e"));
        assert_eq!(config.image_pull_policy, Some(PullPolicy::Never));
    }

    #[test]
    fn test_from_lookup_defaults_root_relative_to_cwd() {
        let config = SuiteConfig::from_lookup(Path::new("/proj/test/e2e"), |_| None).unwrap();
        assert_eq!(config.root, Path::new("/proj/test/e2e").join("..").join(".."));
        assert!(config.image.is_none());
    }

    #[test]
    fn test_from_lookup_keep_all() {
        let keep = |value: &'static str| {
            SuiteConfig::from_lookup(Path::new("/cwd"), lookup_from(&[(ENV_KEEP_ALL, value)]))
                .unwrap()
                .keep_all
        };

        assert!(keep("true"));
        assert!(keep("1"));
        assert!(!keep("false"));
        assert!(!keep(""));
    }

    #[test]
    fn test_from_lookup_rejects_bad_policy() {
        let lookup = lookup_from(&[(ENV_IMAGE_PULL_POLICY, "Maybe")]);
        let result = SuiteConfig::from_lookup(Path::new("/cwd"), lookup);
        assert!(matches!(result, Err(ConfigError::InvalidPullPolicy(_))));
    }

    #[test]
    fn test_from_lookup_rejects_empty_list() {
        let lookup = lookup_from(&[(ENV_LOCAL_MANIFESTS, " , ")]);
        let result = SuiteConfig::from_lookup(Path::new("/cwd"), lookup);
        assert!(matches!(result, Err(ConfigError::EmptyManifestList(_))));
    }

    #[test]
    fn test_patch_options_from_suite() {
        let config = SuiteConfig::new("/proj")
            .image("ctrl:dev")
            .image_pull_policy(PullPolicy::Always);
        let opts = config.patch_options("osdk-e2e-1");

        assert_eq!(opts.namespace, "osdk-e2e-1");
        assert_eq!(opts.image.as_deref(), Some("ctrl:dev"));
        assert_eq!(opts.image_pull_policy, Some(PullPolicy::Always));
        assert!(opts.watch_namespace.is_none());
    }
}
