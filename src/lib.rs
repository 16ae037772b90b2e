//! opfixture - namespace-isolated fixtures for Kubernetes controller tests
//!
//! Stands up everything an end-to-end test of a controller needs and tears
//! it down again: CRDs once per run, then per scenario a fresh operator
//! namespace, a watch namespace, and the controller's manifests rewritten
//! for those namespaces. Scenarios then drive a custom resource and poll
//! the cluster until the controller's reaction is observed.
//!
//! # Example
//!
//! ```ignore
//! use opfixture::{wait_until, Convergence, Fixture};
//!
//! #[opfixture::scenario]
//! async fn test_scale(fx: Fixture) {
//!     create_memcached(fx.cluster(), fx.watch_namespace(), 3).await;
//!     fx.wait_for_deployment("example-memcached", 3).await.unwrap();
//! }
//! ```
//!
//! # Prerequisite Teardown
//!
//! `#[scenario]` installs the CRDs at most once per test binary and never
//! removes them, since no single test knows it is the last one. When the
//! CRDs must go away after a run, call [`Suite::remove_prerequisites`] once
//! every scenario is done, or drive parallel workers through a
//! [`Rendezvous`] so the leader removes them in
//! [`after_suite`](Rendezvous::after_suite).
//!
//! # Environment Variables
//!
//! - `OPFIXTURE_ROOT` - project root (default: `../..`)
//! - `OPFIXTURE_GLOBAL_MANIFESTS` / `OPFIXTURE_LOCAL_MANIFESTS` - comma-separated manifest paths
//! - `OPFIXTURE_IMAGE` / `OPFIXTURE_IMAGE_PULL_POLICY` - controller container overrides
//! - `OPFIXTURE_KEEP_ALL` - never tear fixtures down (debug mode)
//! - `OPFIXTURE_LOG` - log filter, falls back to `RUST_LOG`

pub mod apply;
pub mod cluster;
pub mod config;
pub mod fixture;
pub mod manifest;
pub mod namespace;
pub mod patch;
pub mod provision;
pub mod resource;
pub mod retry;
pub mod suite;
pub mod telemetry;
pub mod wait;

// Re-export commonly used types
pub use apply::{ApplyError, Applier, RemoveError};
pub use cluster::{ClusterApi, ClusterError, KubeCluster, MemoryCluster};
pub use config::{ConfigError, PatchOptions, PullPolicy, SuiteConfig};
pub use fixture::{Fixture, FixtureError};
pub use manifest::{read_manifest, ManifestError};
pub use patch::{CrdPatch, NamespacePatch, Patch, PatchError};
pub use provision::{provision, teardown, ProvisionError, TeardownError};
pub use resource::ResourceId;
pub use suite::{Rendezvous, Suite, SuiteError};
pub use telemetry::init_logging;
pub use wait::{wait_for_deployment, wait_until, Convergence, WaitError};

// Re-export the scenario macro
pub use opfixture_macros::scenario;
