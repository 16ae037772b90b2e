//! Per-scenario fixtures
//!
//! A [`Fixture`] is the set of namespaces and controller objects one
//! scenario runs against:
//!
//! 1. an operator namespace the controller is deployed into
//! 2. a watch namespace the controller is told to reconcile
//! 3. any extra namespaces the scenario asks for
//!
//! Namespaced controller manifests are applied with a [`NamespacePatch`]
//! targeting the operator namespace, so fixtures never touch each other's
//! objects even when cluster-scoped RBAC is involved.

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::FutureExt;
use tracing::{info, instrument, warn};

use crate::apply::ApplyError;
use crate::cluster::ClusterApi;
use crate::config::PatchOptions;
use crate::namespace::{create_namespace, delete_namespace, unique_namespace};
use crate::patch::NamespacePatch;
use crate::provision::{self, ProvisionError};
use crate::suite::Suite;
use crate::wait::{self, WaitError};

/// Error type for fixture setup and teardown
#[derive(Debug, thiserror::Error)]
pub enum FixtureError {
    #[error("failed to create namespace {namespace}: {source}")]
    Namespace {
        namespace: String,
        #[source]
        source: ApplyError,
    },

    #[error("failed to deploy controller: {0}")]
    Provision(#[from] ProvisionError),

    #[error("fixture teardown failed with {} error(s): {}", failures.len(), failures.join("; "))]
    Teardown { failures: Vec<String> },
}

/// Namespaces and controller objects for one scenario
///
/// Clones share the namespace list, so a namespace allocated through any
/// clone is removed by [`teardown`](Self::teardown).
#[derive(Clone)]
pub struct Fixture {
    suite: Suite,
    operator_namespace: String,
    watch_namespace: String,
    options: PatchOptions,
    namespaces: Arc<Mutex<Vec<String>>>,
}

impl Fixture {
    /// Allocate namespaces and deploy the controller
    ///
    /// Anything created before a failure is removed again before the error
    /// is returned.
    #[instrument(skip(suite), fields(cluster = suite.cluster().name()))]
    pub async fn setup(suite: &Suite) -> Result<Self, FixtureError> {
        let namespaces = Arc::new(Mutex::new(Vec::new()));

        let allocated = async {
            let operator = allocate(suite, &namespaces).await?;
            let watch = allocate(suite, &namespaces).await?;
            Ok::<_, FixtureError>((operator, watch))
        }
        .await;

        let (operator_namespace, watch_namespace) = match allocated {
            Ok(pair) => pair,
            Err(e) => {
                release(suite, &namespaces).await;
                return Err(e);
            }
        };

        let options = suite
            .config()
            .patch_options(&operator_namespace)
            .watch_namespace(&watch_namespace);

        let fixture = Self {
            suite: suite.clone(),
            operator_namespace,
            watch_namespace,
            options,
            namespaces,
        };

        let patch = NamespacePatch::new(fixture.options.clone());
        if let Err(e) =
            provision::provision(suite.applier(), &suite.config().local_manifests, &patch).await
        {
            if let Err(cleanup) = fixture.clone().teardown().await {
                warn!(error = %cleanup, "Cleanup after failed setup was incomplete");
            }
            return Err(e.into());
        }

        info!(
            operator_namespace = %fixture.operator_namespace,
            watch_namespace = %fixture.watch_namespace,
            "Fixture ready"
        );
        Ok(fixture)
    }

    /// Namespace the controller runs in
    #[must_use]
    pub fn operator_namespace(&self) -> &str {
        &self.operator_namespace
    }

    /// Namespace the controller is told to watch
    #[must_use]
    pub fn watch_namespace(&self) -> &str {
        &self.watch_namespace
    }

    /// Patch options used for the controller manifests
    #[must_use]
    pub fn options(&self) -> &PatchOptions {
        &self.options
    }

    #[must_use]
    pub fn suite(&self) -> &Suite {
        &self.suite
    }

    #[must_use]
    pub fn cluster(&self) -> &Arc<dyn ClusterApi> {
        self.suite.cluster()
    }

    /// Every namespace this fixture still owns, in allocation order
    #[must_use]
    pub fn namespaces(&self) -> Vec<String> {
        self.lock_namespaces().clone()
    }

    fn lock_namespaces(&self) -> MutexGuard<'_, Vec<String>> {
        self.namespaces.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocate another namespace the controller does not watch
    pub async fn extra_namespace(&self) -> Result<String, FixtureError> {
        allocate(&self.suite, &self.namespaces).await
    }

    /// Wait until a Deployment in the watch namespace has `replicas`
    /// available replicas, using the suite's poll settings
    pub async fn wait_for_deployment(&self, name: &str, replicas: i32) -> Result<(), WaitError> {
        let config = self.suite.config();
        wait::wait_for_deployment(
            self.cluster().as_ref(),
            &self.watch_namespace,
            name,
            replicas,
            config.poll_interval,
            config.poll_timeout,
        )
        .await
    }

    /// Remove controller objects, then every namespace, newest first
    ///
    /// Every step is attempted; failures are reported together.
    #[instrument(skip(self), fields(operator_namespace = %self.operator_namespace))]
    pub async fn teardown(self) -> Result<(), FixtureError> {
        let mut failures = Vec::new();
        let applier = self.suite.applier();

        let patch = NamespacePatch::new(self.options.clone());
        if let Err(e) =
            provision::teardown(applier, &self.suite.config().local_manifests, &patch).await
        {
            failures.extend(
                e.failures
                    .into_iter()
                    .map(|(path, message)| format!("{}: {message}", path.display())),
            );
        }

        let namespaces = std::mem::take(&mut *self.lock_namespaces());
        for namespace in namespaces.iter().rev() {
            if let Err(e) = delete_namespace(applier, namespace).await {
                failures.push(e.to_string());
            }
        }

        if failures.is_empty() {
            info!(namespaces = namespaces.len(), "Fixture torn down");
            Ok(())
        } else {
            Err(FixtureError::Teardown { failures })
        }
    }

    /// Set up a fixture, run `body` against it, and tear it down
    ///
    /// A teardown failure is logged as a warning and never replaces the
    /// body's outcome. A panic in `body` is re-raised after teardown. With
    /// `keep_all` configured, the fixture is left in place.
    pub async fn run<F, Fut, T>(suite: &Suite, body: F) -> Result<T, FixtureError>
    where
        F: FnOnce(Fixture) -> Fut,
        Fut: Future<Output = T>,
    {
        let fixture = Self::setup(suite).await?;

        let outcome = AssertUnwindSafe(body(fixture.clone())).catch_unwind().await;

        if suite.config().keep_all {
            warn!(namespaces = ?fixture.namespaces(), "Keeping fixture");
        } else if let Err(e) = fixture.teardown().await {
            warn!(error = %e, "Fixture teardown failed");
        }

        match outcome {
            Ok(value) => Ok(value),
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
}

impl fmt::Debug for Fixture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fixture")
            .field("cluster", &self.cluster().name())
            .field("operator_namespace", &self.operator_namespace)
            .field("watch_namespace", &self.watch_namespace)
            .field("namespaces", &self.namespaces())
            .finish_non_exhaustive()
    }
}

async fn allocate(suite: &Suite, namespaces: &Mutex<Vec<String>>) -> Result<String, FixtureError> {
    let namespace = unique_namespace(&suite.config().namespace_prefix);
    create_namespace(suite.applier(), &namespace)
        .await
        .map_err(|source| FixtureError::Namespace {
            namespace: namespace.clone(),
            source,
        })?;

    namespaces
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .push(namespace.clone());
    Ok(namespace)
}

async fn release(suite: &Suite, namespaces: &Mutex<Vec<String>>) {
    let owned = std::mem::take(&mut *namespaces.lock().unwrap_or_else(PoisonError::into_inner));
    for namespace in owned.iter().rev() {
        if let Err(e) = delete_namespace(suite.applier(), namespace).await {
            warn!(namespace = %namespace, error = %e, "Failed to release namespace");
        }
    }
}
