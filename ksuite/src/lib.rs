/*!

Provides an ephemeral k3s cluster, run in docker by [k3d], for the duration of a test suite.

```no_run
use ksuite::{KubeSuite, StartOptions, StopOptions};

# async fn doc() {
KubeSuite::new(StartOptions::default(), StopOptions::default())
    .unwrap()
    .run(|cluster| async move {
        let _client = cluster.client().unwrap();
        // talk to the cluster
    })
    .await;
# }
```

Without the suite, [`start_cluster`] and [`stop_cluster`] can be called directly. Every cluster
returned by [`start_cluster`] must be passed to [`stop_cluster`] once, otherwise its containers
keep running.

[k3d]: https://k3d.io/

!*/

pub mod cluster;
pub mod config;
mod error;
pub mod exposure;
pub mod k3d;
pub mod settings;
pub mod suite;

use async_trait::async_trait;
pub use cluster::{
    start_cluster, start_cluster_with, stop_cluster, stop_cluster_with, StartOptions, StopOptions,
    TestClusterConfig,
};
pub use config::{Merge, SimpleConfig};
pub use error::{Error, Result};
pub use k3d::{ClusterHandle, K3d, K3dError};
use kube::config::Kubeconfig;
pub use settings::Settings;
use std::fmt::{Debug, Display};
pub use suite::KubeSuite;

/// The `ClusterLifecycle` trait is the interface to whatever actually runs clusters. The purpose
/// of the interface is to allow injection of a mock so that suites can be tested without docker.
/// In practice you will use the provided implementation, [`K3d`].
#[async_trait]
pub trait ClusterLifecycle: Send + Sync {
    /// The error type returned by this trait's functions.
    type E: Debug + Display + Send + Sync + 'static;

    /// Creates and starts a cluster matching `config`, returning once the cluster is ready.
    /// `config.name` is always set.
    async fn create_cluster(
        &self,
        config: &SimpleConfig,
    ) -> std::result::Result<ClusterHandle, Self::E>;

    /// Removes every container, network and volume that belongs to `cluster`.
    async fn delete_cluster(&self, cluster: &ClusterHandle) -> std::result::Result<(), Self::E>;

    /// Gets the credentials and API endpoint of a running cluster.
    async fn kubeconfig(&self, cluster: &ClusterHandle)
        -> std::result::Result<Kubeconfig, Self::E>;
}
