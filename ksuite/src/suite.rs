use crate::cluster::{
    start_cluster_with, stop_cluster_with, StartOptions, StopOptions, TestClusterConfig,
};
use crate::error::{self, Result};
use crate::k3d::K3d;
use crate::ClusterLifecycle;
use futures::FutureExt;
use log::error;
use snafu::{ensure, OptionExt};
use std::future::Future;
use std::panic::{resume_unwind, AssertUnwindSafe};

/// A test suite that owns one cluster. `setup_suite` starts the cluster and `tear_down_suite`
/// deletes it; in between, every test in the suite shares it through [`KubeSuite::cluster`].
///
/// Suites are independent of each other: each one creates its own uniquely named cluster with
/// its own API port, so suites may run concurrently.
#[derive(Debug)]
pub struct KubeSuite<L = K3d> {
    lifecycle: L,
    start_opts: StartOptions,
    stop_opts: StopOptions,
    cluster: Option<TestClusterConfig>,
}

impl KubeSuite<K3d> {
    /// A suite whose cluster is run by the k3d binary named in the environment.
    pub fn new(start_opts: StartOptions, stop_opts: StopOptions) -> Result<Self> {
        Ok(Self::with_lifecycle(K3d::from_env()?, start_opts, stop_opts))
    }
}

impl<L> KubeSuite<L>
where
    L: ClusterLifecycle,
{
    pub fn with_lifecycle(lifecycle: L, start_opts: StartOptions, stop_opts: StopOptions) -> Self {
        Self {
            lifecycle,
            start_opts,
            stop_opts,
            cluster: None,
        }
    }

    /// The cluster, if `setup_suite` has succeeded and `tear_down_suite` has not run yet.
    pub fn cluster(&self) -> Option<&TestClusterConfig> {
        self.cluster.as_ref()
    }

    /// Starts the suite's cluster.
    pub async fn setup_suite(&mut self) -> Result<&TestClusterConfig> {
        ensure!(self.cluster.is_none(), error::SuiteAlreadySetUpSnafu);
        let cluster = start_cluster_with(&self.lifecycle, self.start_opts.clone()).await?;
        Ok(self.cluster.insert(cluster))
    }

    /// Deletes the suite's cluster. The suite no longer holds a cluster afterwards, even if the
    /// deletion failed.
    pub async fn tear_down_suite(&mut self) -> Result<()> {
        let cluster = self.cluster.take().context(error::SuiteNotSetUpSnafu)?;
        stop_cluster_with(&self.lifecycle, &cluster, self.stop_opts.clone()).await
    }

    /// Runs `body` against a fresh cluster and deletes the cluster afterwards.
    ///
    /// # Panics
    ///
    /// Panics, failing the test, if the cluster cannot be started (`body` does not run) or
    /// deleted. If `body` panics the cluster is still deleted and the panic is resumed.
    pub async fn run<F, Fut>(mut self, body: F)
    where
        F: FnOnce(TestClusterConfig) -> Fut,
        Fut: Future<Output = ()>,
    {
        let cluster = match self.setup_suite().await {
            Ok(cluster) => cluster.clone(),
            Err(e) => panic!("Unable to set up suite: {}", e),
        };

        let outcome = AssertUnwindSafe(async move { body(cluster).await })
            .catch_unwind()
            .await;

        let teardown = self.tear_down_suite().await;
        match (outcome, teardown) {
            (Ok(()), Ok(())) => {}
            (Ok(()), Err(e)) => panic!("Unable to tear down suite: {}", e),
            (Err(panic), teardown) => {
                if let Err(e) = teardown {
                    error!("Unable to tear down suite: {}", e);
                }
                resume_unwind(panic)
            }
        }
    }
}
