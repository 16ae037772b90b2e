//! Convergence polling
//!
//! Controllers react asynchronously, so scenarios observe their effect by
//! polling: the predicate is checked immediately and then once per interval
//! until it reports [`Convergence::Reached`] or the deadline passes.
//!
//! # Example
//!
//! ```ignore
//! use opfixture::wait::{wait_until, Convergence, DEFAULT_INTERVAL, DEFAULT_TIMEOUT};
//!
//! wait_until("memcached/example", DEFAULT_INTERVAL, DEFAULT_TIMEOUT, || async {
//!     let size = current_size(&cluster).await?;
//!     Ok(if size == 4 {
//!         Convergence::Reached
//!     } else {
//!         Convergence::Pending(format!("size {size}/4"))
//!     })
//! })
//! .await?;
//! ```

use std::fmt;
use std::future::Future;
use std::time::Duration;

use k8s_openapi::api::apps::v1::Deployment;
use tokio::time::{sleep, timeout_at, Instant};
use tracing::{debug, info};

use crate::cluster::{ClusterApi, ClusterError};
use crate::resource::{typed, ResourceId};

/// Poll interval for steady-state checks
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(5);

/// Poll deadline for steady-state checks
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Shortest pause between checks; smaller intervals are raised to this
pub const MIN_INTERVAL: Duration = Duration::from_millis(100);

/// Result of one predicate check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Convergence {
    /// The expected condition holds
    Reached,
    /// Not there yet; carries the observed state (e.g., "available 1/3")
    Pending(String),
}

/// The condition was not observed before the deadline
#[derive(Debug, Clone)]
pub struct TimeoutError {
    /// What was being waited on (e.g., "Deployment/app in namespace ns")
    pub resource: String,
    /// Description of the last observed state
    pub last_state: String,
    /// How long we waited before giving up
    pub elapsed: Duration,
    /// The timeout that was configured
    pub timeout: Duration,
    /// Predicate checks made
    pub attempts: u32,
}

impl fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Wait timeout for {}", self.resource)?;
        writeln!(f, "├─ Last state: {}", self.last_state)?;
        writeln!(f, "├─ Attempts: {}", self.attempts)?;
        writeln!(f, "├─ Elapsed: {:?}", self.elapsed)?;
        write!(f, "└─ Timeout: {:?}", self.timeout)
    }
}

impl std::error::Error for TimeoutError {}

/// Error type for convergence polling
#[derive(Debug, thiserror::Error)]
pub enum WaitError {
    #[error(transparent)]
    Timeout(#[from] TimeoutError),

    #[error("polling {resource} failed: {source}")]
    Failed {
        resource: String,
        #[source]
        source: ClusterError,
    },
}

impl WaitError {
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

/// Poll `predicate` until it reports [`Convergence::Reached`]
///
/// `NotFound` from the predicate means the object has not been created yet
/// and polling continues; any other error aborts immediately. A check still
/// in flight when the deadline passes is dropped, so this returns no later
/// than `timeout` after it was called. `interval` is raised to
/// [`MIN_INTERVAL`] if it is shorter.
pub async fn wait_until<F, Fut>(
    resource: &str,
    interval: Duration,
    timeout: Duration,
    mut predicate: F,
) -> Result<(), WaitError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Convergence, ClusterError>>,
{
    let interval = interval.max(MIN_INTERVAL);
    let start = Instant::now();
    let deadline = start + timeout;
    let mut last_state = "not observed".to_string();
    let mut attempts = 0u32;

    let timed_out = |last_state: String, attempts: u32| {
        WaitError::Timeout(TimeoutError {
            resource: resource.to_string(),
            last_state,
            elapsed: start.elapsed(),
            timeout,
            attempts,
        })
    };

    loop {
        attempts += 1;

        match timeout_at(deadline, predicate()).await {
            Err(_) => return Err(timed_out(last_state, attempts)),
            Ok(Ok(Convergence::Reached)) => {
                info!(resource, attempts, elapsed = ?start.elapsed(), "Converged");
                return Ok(());
            }
            Ok(Ok(Convergence::Pending(state))) => {
                info!(
                    resource,
                    state = %state,
                    elapsed = ?start.elapsed(),
                    "Waiting for convergence"
                );
                last_state = state;
            }
            Ok(Err(e)) if e.is_not_found() => {
                debug!(resource, elapsed = ?start.elapsed(), "Not found yet");
                last_state = "not found".to_string();
            }
            Ok(Err(source)) => {
                return Err(WaitError::Failed {
                    resource: resource.to_string(),
                    source,
                })
            }
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(timed_out(last_state, attempts));
        }
        sleep(interval.min(deadline - now)).await;
    }
}

/// Helper trait for describing a workload's rollout progress
pub trait ResourceState {
    /// Get a human-readable description of the resource's current state
    fn state_description(&self) -> String;
}

impl ResourceState for Deployment {
    fn state_description(&self) -> String {
        let spec_replicas = self.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
        let status = self.status.as_ref();
        let ready = status.and_then(|s| s.ready_replicas).unwrap_or(0);
        let available = status.and_then(|s| s.available_replicas).unwrap_or(0);
        let unavailable = status.and_then(|s| s.unavailable_replicas).unwrap_or(0);

        if unavailable > 0 {
            format!("{ready}/{spec_replicas} ready, {unavailable} unavailable")
        } else {
            format!("{ready}/{spec_replicas} ready, {available}/{spec_replicas} available")
        }
    }
}

/// Check whether a Deployment reports exactly `replicas` available replicas
pub async fn deployment_available(
    cluster: &dyn ClusterApi,
    id: &ResourceId,
    replicas: i32,
) -> Result<Convergence, ClusterError> {
    let obj = cluster.get(id).await?;
    let deployment: Deployment = typed(&obj)?;

    let available = deployment
        .status
        .as_ref()
        .and_then(|s| s.available_replicas)
        .unwrap_or(0);

    if available == replicas {
        Ok(Convergence::Reached)
    } else {
        Ok(Convergence::Pending(format!(
            "available {available}/{replicas} ({})",
            deployment.state_description()
        )))
    }
}

/// Wait until the named Deployment has `replicas` available replicas
pub async fn wait_for_deployment(
    cluster: &dyn ClusterApi,
    namespace: &str,
    name: &str,
    replicas: i32,
    interval: Duration,
    timeout: Duration,
) -> Result<(), WaitError> {
    let id = ResourceId::deployment(namespace, name);
    wait_until(&id.to_string(), interval, timeout, || {
        deployment_available(cluster, &id, replicas)
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::MemoryCluster;
    use k8s_openapi::api::apps::v1::{DeploymentSpec, DeploymentStatus};
    use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};

    fn deployment_object(ns: &str, name: &str, available: i32) -> kube::api::DynamicObject {
        let deployment = Deployment {
            metadata: kube::api::ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(ns.to_string()),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                replicas: Some(3),
                ..Default::default()
            }),
            status: Some(DeploymentStatus {
                available_replicas: Some(available),
                ..Default::default()
            }),
        };
        crate::resource::dynamic(&deployment).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_reached_immediately() {
        let start = Instant::now();

        wait_until("thing", DEFAULT_INTERVAL, DEFAULT_TIMEOUT, || async {
            Ok(Convergence::Reached)
        })
        .await
        .unwrap();

        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_returns_on_first_success() {
        let available = AtomicI32::new(0);
        let checks = AtomicU32::new(0);
        let start = Instant::now();

        wait_until("deployment", DEFAULT_INTERVAL, DEFAULT_TIMEOUT, || async {
            checks.fetch_add(1, Ordering::SeqCst);
            let now = available.fetch_add(1, Ordering::SeqCst);
            Ok(if now == 3 {
                Convergence::Reached
            } else {
                Convergence::Pending(format!("available {now}/3"))
            })
        })
        .await
        .unwrap();

        // Checks at 0s, 5s, 10s, 15s; the last one sees 3
        assert_eq!(checks.load(Ordering::SeqCst), 4);
        assert_eq!(start.elapsed(), Duration::from_secs(15));
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out_within_one_interval() {
        let interval = Duration::from_secs(7);
        let timeout = Duration::from_secs(30);
        let start = Instant::now();

        let err = wait_until("never", interval, timeout, || async {
            Ok(Convergence::Pending("available 0/3".to_string()))
        })
        .await
        .unwrap_err();

        assert!(start.elapsed() <= timeout + interval);
        match err {
            WaitError::Timeout(t) => {
                assert_eq!(t.last_state, "available 0/3");
                assert_eq!(t.timeout, timeout);
                // 0, 7, 14, 21, 28 and a final check at the deadline
                assert_eq!(t.attempts, 6);
            }
            other => panic!("expected timeout, got {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_interval_is_raised_to_minimum() {
        let start = Instant::now();

        let err = wait_until("busy", Duration::ZERO, Duration::from_secs(1), || async {
            Ok(Convergence::Pending("available 0/1".to_string()))
        })
        .await
        .unwrap_err();

        assert_eq!(start.elapsed(), Duration::from_secs(1));
        match err {
            WaitError::Timeout(t) => {
                // 0ms, 100ms, ... 900ms and a final check at the deadline
                assert_eq!(t.attempts, 11);
            }
            other => panic!("expected timeout, got {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_drops_check_in_flight_at_deadline() {
        let start = Instant::now();

        let err = wait_until("hung", DEFAULT_INTERVAL, Duration::from_secs(12), || async {
            sleep(Duration::from_secs(3600)).await;
            Ok(Convergence::Reached)
        })
        .await
        .unwrap_err();

        assert!(err.is_timeout());
        assert_eq!(start.elapsed(), Duration::from_secs(12));
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_found_keeps_polling() {
        let checks = AtomicU32::new(0);

        wait_until("late", DEFAULT_INTERVAL, DEFAULT_TIMEOUT, || async {
            if checks.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(ClusterError::NotFound(ResourceId::deployment("ns", "late")))
            } else {
                Ok(Convergence::Reached)
            }
        })
        .await
        .unwrap();

        assert_eq!(checks.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_other_errors_abort() {
        let checks = AtomicU32::new(0);

        let err = wait_until("denied", DEFAULT_INTERVAL, DEFAULT_TIMEOUT, || async {
            checks.fetch_add(1, Ordering::SeqCst);
            Err::<Convergence, _>(ClusterError::Rejected {
                id: ResourceId::deployment("ns", "denied"),
                message: "forbidden".to_string(),
            })
        })
        .await
        .unwrap_err();

        assert!(matches!(err, WaitError::Failed { .. }));
        assert_eq!(checks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_deployment_available() {
        let cluster = MemoryCluster::new();
        let id = cluster
            .insert(deployment_object("ns-1", "example-memcached", 2))
            .unwrap();

        let pending = deployment_available(&cluster, &id, 3).await.unwrap();
        assert!(matches!(pending, Convergence::Pending(ref s) if s.starts_with("available 2/3")));

        cluster
            .modify(&id, |obj| obj.data["status"]["availableReplicas"] = 3.into())
            .unwrap();
        assert_eq!(
            deployment_available(&cluster, &id, 3).await.unwrap(),
            Convergence::Reached
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_missing_deployment_times_out() {
        let cluster = MemoryCluster::new();

        let err = wait_for_deployment(
            &cluster,
            "ns-1",
            "example-memcached",
            3,
            Duration::from_secs(1),
            Duration::from_secs(3),
        )
        .await
        .unwrap_err();

        match err {
            WaitError::Timeout(t) => {
                assert_eq!(t.last_state, "not found");
                assert!(t.to_string().contains("Deployment/example-memcached in namespace ns-1"));
            }
            other => panic!("expected timeout, got {other}"),
        }
    }

    #[test]
    fn test_deployment_state_description() {
        let deployment = Deployment {
            spec: Some(DeploymentSpec {
                replicas: Some(3),
                ..Default::default()
            }),
            status: Some(DeploymentStatus {
                ready_replicas: Some(1),
                available_replicas: Some(1),
                unavailable_replicas: Some(2),
                ..Default::default()
            }),
            ..Default::default()
        };

        let state = deployment.state_description();
        assert!(state.contains("1/3 ready"));
        assert!(state.contains("2 unavailable"));
    }
}
