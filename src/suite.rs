//! Suite-wide setup
//!
//! Cluster-scoped prerequisites (CRDs) are shared by every fixture in a run,
//! so they are installed once and removed once. [`Suite`] owns the cluster
//! handle and configuration; [`Rendezvous`] lines up parallel workers so a
//! single leader performs that shared setup and teardown.
//!
//! # Example
//!
//! ```ignore
//! let rendezvous = Arc::new(Rendezvous::new(workers));
//!
//! // on every worker
//! rendezvous
//!     .before_suite(worker, || async { suite.install_prerequisites().await.map(drop) })
//!     .await?;
//! // ... run fixtures ...
//! rendezvous
//!     .after_suite(worker, || suite.remove_prerequisites())
//!     .await?;
//! ```

use std::future::Future;
use std::sync::{Arc, OnceLock};

use tokio::sync::{Barrier, OnceCell};
use tracing::{debug, info, instrument};

use crate::apply::Applier;
use crate::cluster::{ClusterApi, ClusterError, KubeCluster};
use crate::config::{ConfigError, SuiteConfig};
use crate::patch::CrdPatch;
use crate::provision::{self, ProvisionError, TeardownError};
use crate::resource::ResourceId;

/// Error type for suite setup and teardown
#[derive(Debug, thiserror::Error)]
pub enum SuiteError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to connect to cluster: {0}")]
    Connect(#[source] ClusterError),

    #[error("failed to install prerequisites: {0}")]
    Install(#[from] ProvisionError),

    #[error("failed to remove prerequisites: {0}")]
    Remove(#[from] TeardownError),

    #[error("suite leader failed its setup: {0}")]
    LeaderSetupFailed(String),

    #[error("worker {worker} is out of range for {workers} workers")]
    InvalidWorker { worker: usize, workers: usize },
}

/// Prerequisites installed by any `Suite` sharing the process-wide flag
fn process_install() -> Arc<OnceCell<()>> {
    static INSTALLED: OnceLock<Arc<OnceCell<()>>> = OnceLock::new();
    INSTALLED.get_or_init(|| Arc::new(OnceCell::new())).clone()
}

/// Cluster handle plus the configuration every fixture shares
#[derive(Clone)]
pub struct Suite {
    cluster: Arc<dyn ClusterApi>,
    config: SuiteConfig,
    applier: Applier,
    installed: Arc<OnceCell<()>>,
}

impl Suite {
    pub fn new(cluster: Arc<dyn ClusterApi>, config: SuiteConfig) -> Self {
        let applier = Applier::new(cluster.clone()).timeout(config.operation_timeout);
        Self {
            cluster,
            config,
            applier,
            installed: Arc::new(OnceCell::new()),
        }
    }

    /// Connect to the ambient cluster
    pub async fn connect(config: SuiteConfig) -> Result<Self, SuiteError> {
        let cluster = KubeCluster::try_default()
            .await
            .map_err(SuiteError::Connect)?;
        Ok(Self::new(Arc::new(cluster), config))
    }

    /// Connect with configuration from `OPFIXTURE_*` variables
    ///
    /// Suites built this way share one install flag for the whole process,
    /// so [`ensure_prerequisites`](Self::ensure_prerequisites) installs once
    /// however many tests call it.
    pub async fn from_env() -> Result<Self, SuiteError> {
        let config = SuiteConfig::from_env()?;
        Ok(Self::connect(config).await?.share_install_flag())
    }

    /// Share the process-wide install flag
    #[must_use]
    pub fn share_install_flag(mut self) -> Self {
        self.installed = process_install();
        self
    }

    #[must_use]
    pub fn cluster(&self) -> &Arc<dyn ClusterApi> {
        &self.cluster
    }

    #[must_use]
    pub fn config(&self) -> &SuiteConfig {
        &self.config
    }

    #[must_use]
    pub fn applier(&self) -> &Applier {
        &self.applier
    }

    /// Install the cluster-scoped manifests
    #[instrument(skip(self), fields(cluster = self.cluster.name()))]
    pub async fn install_prerequisites(&self) -> Result<Vec<ResourceId>, SuiteError> {
        let ids =
            provision::provision(&self.applier, &self.config.global_manifests, &CrdPatch).await?;
        info!(objects = ids.len(), "Installed suite prerequisites");
        Ok(ids)
    }

    /// Remove the cluster-scoped manifests
    #[instrument(skip(self), fields(cluster = self.cluster.name()))]
    pub async fn remove_prerequisites(&self) -> Result<(), SuiteError> {
        provision::teardown(&self.applier, &self.config.global_manifests, &CrdPatch).await?;
        info!("Removed suite prerequisites");
        Ok(())
    }

    /// Install prerequisites unless this suite's install flag is already set
    ///
    /// Concurrent callers wait for the first install. A failed install
    /// leaves the flag unset so a later caller retries.
    pub async fn ensure_prerequisites(&self) -> Result<(), SuiteError> {
        self.installed
            .get_or_try_init(|| async {
                self.install_prerequisites().await?;
                Ok::<(), SuiteError>(())
            })
            .await?;
        Ok(())
    }
}

/// One-leader/all-followers rendezvous for `workers` parallel workers
///
/// Worker 0 is the leader. Every worker must call both
/// [`before_suite`](Self::before_suite) and [`after_suite`](Self::after_suite)
/// exactly once, or the others wait forever.
pub struct Rendezvous {
    workers: usize,
    setup_done: Barrier,
    workers_done: Barrier,
    setup_outcome: OnceLock<Result<(), String>>,
}

impl Rendezvous {
    #[must_use]
    pub fn new(workers: usize) -> Self {
        let workers = workers.max(1);
        Self {
            workers,
            setup_done: Barrier::new(workers),
            workers_done: Barrier::new(workers),
            setup_outcome: OnceLock::new(),
        }
    }

    #[must_use]
    pub fn workers(&self) -> usize {
        self.workers
    }

    #[must_use]
    pub fn is_leader(worker: usize) -> bool {
        worker == 0
    }

    fn check(&self, worker: usize) -> Result<(), SuiteError> {
        if worker < self.workers {
            Ok(())
        } else {
            Err(SuiteError::InvalidWorker {
                worker,
                workers: self.workers,
            })
        }
    }

    /// Leader runs `setup`; nobody returns until it has finished
    ///
    /// The leader gets its own setup error back. Followers get
    /// [`SuiteError::LeaderSetupFailed`] if the leader's setup failed.
    pub async fn before_suite<F, Fut>(&self, worker: usize, setup: F) -> Result<(), SuiteError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), SuiteError>>,
    {
        self.check(worker)?;

        let mut own = Ok(());
        if Self::is_leader(worker) {
            own = setup().await;
            let shared = own.as_ref().copied().map_err(|e| e.to_string());
            // Only the leader writes, and only once
            let _ = self.setup_outcome.set(shared);
        }

        debug!(worker, "Waiting for suite setup");
        self.setup_done.wait().await;

        if Self::is_leader(worker) {
            return own;
        }
        match self.setup_outcome.get() {
            Some(Ok(())) => Ok(()),
            Some(Err(message)) => Err(SuiteError::LeaderSetupFailed(message.clone())),
            None => Err(SuiteError::LeaderSetupFailed(
                "leader did not run setup".to_string(),
            )),
        }
    }

    /// Wait for every worker, then the leader runs `teardown`
    pub async fn after_suite<F, Fut>(&self, worker: usize, teardown: F) -> Result<(), SuiteError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), SuiteError>>,
    {
        self.check(worker)?;

        debug!(worker, "Waiting for all workers to finish");
        self.workers_done.wait().await;

        if Self::is_leader(worker) {
            teardown().await
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{MemoryCluster, Operation};
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const CRD: &str = "\
apiVersion: apiextensions.k8s.io/v1
kind: CustomResourceDefinition
metadata:
  name: memcacheds.cache.example.com
spec:
  group: cache.example.com
  scope: Namespaced
";

    fn suite_with_crd() -> (tempfile::TempDir, Arc<MemoryCluster>, Suite) {
        let dir = tempfile::tempdir().unwrap();
        let crds = dir.path().join("deploy").join("crds");
        fs::create_dir_all(&crds).unwrap();
        fs::write(crds.join("memcached_crd.yaml"), CRD).unwrap();

        let cluster = Arc::new(MemoryCluster::new());
        let suite = Suite::new(cluster.clone(), SuiteConfig::new(dir.path()));
        (dir, cluster, suite)
    }

    #[tokio::test]
    async fn test_install_and_remove_prerequisites() {
        let (_dir, cluster, suite) = suite_with_crd();

        let ids = suite.install_prerequisites().await.unwrap();
        assert_eq!(ids.len(), 1);
        assert_eq!(ids[0].name, "memcacheds.cache.example.com");
        assert!(cluster.contains(&ids[0]));

        suite.remove_prerequisites().await.unwrap();
        assert!(cluster.objects().is_empty());
    }

    #[tokio::test]
    async fn test_ensure_prerequisites_installs_once() {
        let (_dir, cluster, suite) = suite_with_crd();
        let clone = suite.clone();

        suite.ensure_prerequisites().await.unwrap();
        clone.ensure_prerequisites().await.unwrap();

        assert_eq!(cluster.calls_for(Operation::Create).len(), 1);
    }

    #[tokio::test]
    async fn test_ensure_prerequisites_retries_after_failure() {
        let (_dir, cluster, suite) = suite_with_crd();
        cluster.fail(Operation::Create, None, "crd admission denied");

        assert!(suite.ensure_prerequisites().await.is_err());
        assert!(suite.ensure_prerequisites().await.is_err());
        assert_eq!(cluster.calls_for(Operation::Create).len(), 2);
    }

    #[tokio::test]
    async fn test_prerequisites_reject_namespaced_kinds() {
        let (dir, _cluster, suite) = suite_with_crd();
        fs::write(
            dir.path().join("deploy").join("crds").join("z_sa.yaml"),
            "apiVersion: v1\nkind: ServiceAccount\nmetadata:\n  name: sa\n",
        )
        .unwrap();

        let err = suite.install_prerequisites().await.unwrap_err();
        assert!(matches!(err, SuiteError::Install(ProvisionError::Patch { .. })));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_rendezvous_leader_sets_up_first() {
        let rendezvous = Arc::new(Rendezvous::new(3));
        let setups = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..3)
            .map(|worker| {
                let rendezvous = rendezvous.clone();
                let setups = setups.clone();
                tokio::spawn(async move {
                    rendezvous
                        .before_suite(worker, || async {
                            setups.fetch_add(1, Ordering::SeqCst);
                            Ok(())
                        })
                        .await
                        .unwrap();
                    // Setup is visible to every worker once it returns
                    setups.load(Ordering::SeqCst)
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.await.unwrap(), 1);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_rendezvous_followers_see_leader_failure() {
        let rendezvous = Arc::new(Rendezvous::new(2));

        let follower = {
            let rendezvous = rendezvous.clone();
            tokio::spawn(async move { rendezvous.before_suite(1, || async { Ok(()) }).await })
        };
        let leader = rendezvous
            .before_suite(0, || async {
                Err(SuiteError::LeaderSetupFailed("no CRDs".to_string()))
            })
            .await;

        assert!(leader.is_err());
        let err = follower.await.unwrap().unwrap_err();
        assert!(matches!(err, SuiteError::LeaderSetupFailed(ref m) if m.contains("no CRDs")));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_rendezvous_leader_tears_down_last() {
        let rendezvous = Arc::new(Rendezvous::new(3));
        let finished = Arc::new(AtomicUsize::new(0));
        let teardowns = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..3)
            .map(|worker| {
                let rendezvous = rendezvous.clone();
                let finished = finished.clone();
                let teardowns = teardowns.clone();
                tokio::spawn(async move {
                    if worker != 0 {
                        finished.fetch_add(1, Ordering::SeqCst);
                    }
                    rendezvous
                        .after_suite(worker, || async {
                            assert_eq!(finished.load(Ordering::SeqCst), 2);
                            teardowns.fetch_add(1, Ordering::SeqCst);
                            Ok(())
                        })
                        .await
                })
            })
            .collect();

        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(teardowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_rendezvous_rejects_unknown_worker() {
        let rendezvous = Rendezvous::new(2);
        let err = rendezvous.before_suite(5, || async { Ok(()) }).await.unwrap_err();
        assert!(matches!(err, SuiteError::InvalidWorker { worker: 5, workers: 2 }));
    }
}
