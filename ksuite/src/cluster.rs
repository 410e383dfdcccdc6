use crate::config::{k3s_image, ExposeApi, Merge, SimpleConfig, DEFAULT_API_PORT};
use crate::error::{self, Result};
use crate::exposure::{PortExposure, RANDOM_PORT};
use crate::k3d::{ClusterHandle, K3d};
use crate::settings::Settings;
use crate::ClusterLifecycle;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use log::{debug, info, warn, LevelFilter};
use snafu::ResultExt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

/// Options to start the cluster.
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    /// If not set, defaults to `KSUITE_K3S_VERSION` or the k3s version this crate was built
    /// against. You can find K3s tags at https://hub.docker.com/r/rancher/k3s/tags.
    pub k3s_image_tag: Option<String>,

    /// Creation options that are merged into the default. If not specified, a small K3s server
    /// with a single server and no agents is started.
    pub create_cluster_opts: Option<SimpleConfig>,

    /// Only log errors while the cluster is being started.
    pub silent: bool,
}

/// Options to stop the cluster. There are none yet.
#[derive(Debug, Clone, Default)]
pub struct StopOptions {}

/// Everything a test needs to talk to a cluster created by [`start_cluster`].
#[derive(Debug, Clone)]
pub struct TestClusterConfig {
    kubeconfig: Kubeconfig,
    rest_config: Config,
    handle: ClusterHandle,
    name: String,
}

impl TestClusterConfig {
    pub fn kubeconfig(&self) -> &Kubeconfig {
        &self.kubeconfig
    }

    pub fn rest_config(&self) -> &Config {
        &self.rest_config
    }

    pub fn handle(&self) -> &ClusterHandle {
        &self.handle
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Create the k8s client for the cluster.
    pub fn client(&self) -> Result<Client> {
        Ok(Client::try_from(self.rest_config.clone())
            .context(error::ClientCreateSnafu { name: &self.name })?)
    }
}

/// The number of live [`LogLevelGuard`]s and the log level in effect before the first of them.
static LOWERED: Mutex<(usize, LevelFilter)> = Mutex::new((0, LevelFilter::Off));

fn lowered() -> MutexGuard<'static, (usize, LevelFilter)> {
    LOWERED.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Lowers the process-wide log level while alive. Guards may overlap and drop in any order; the
/// level from before the first guard is put back when the last one drops.
#[derive(Debug)]
pub(crate) struct LogLevelGuard {
    _private: (),
}

impl LogLevelGuard {
    pub(crate) fn new(level: LevelFilter) -> Self {
        let mut lowered = lowered();
        if lowered.0 == 0 {
            lowered.1 = log::max_level();
        }
        lowered.0 += 1;
        log::set_max_level(level.min(log::max_level()));
        Self { _private: () }
    }
}

impl Drop for LogLevelGuard {
    fn drop(&mut self) {
        let mut lowered = lowered();
        lowered.0 -= 1;
        if lowered.0 == 0 {
            log::set_max_level(lowered.1);
        }
    }
}

/// Builds the config submitted to k3d: the defaults with `opts` merged over them, `wait` forced
/// on, and the API exposed on a random host port unless the caller picked one.
pub fn cluster_config(opts: &StartOptions, settings: &Settings) -> Result<SimpleConfig> {
    let image = k3s_image(
        opts.k3s_image_tag.as_deref(),
        settings.k3s_version.as_deref(),
    );
    let defaults = SimpleConfig::default_cluster(Uuid::new_v4().to_string(), image);
    let mut config = defaults.merge(opts.create_cluster_opts.clone().unwrap_or_default());
    config.set_wait(true);
    if config.api_host_port().is_none() {
        // Only the port is always taken from the resolved exposure, host and host IP set by
        // the caller win.
        let resolved = ExposeApi::from(PortExposure::parse(RANDOM_PORT, DEFAULT_API_PORT)?);
        let host_port = resolved.host_port.clone();
        let mut expose = resolved.merge(config.expose_api.take().unwrap_or_default());
        expose.host_port = host_port;
        config.expose_api = Some(expose);
    }
    Ok(config)
}

/// Creates a small and ephemeral K3s cluster for testing purposes using the k3d binary named in
/// the environment (see [`Settings`]). The returned config must be passed to [`stop_cluster`]
/// exactly once, otherwise the cluster's containers are left running. If the cluster is created
/// but its kubeconfig cannot be read, it is deleted before the error is returned.
pub async fn start_cluster(opts: StartOptions) -> Result<TestClusterConfig> {
    let settings = Settings::from_env()?;
    start(&K3d::from_settings(&settings), opts, &settings).await
}

/// Same as [`start_cluster`], with a caller provided [`ClusterLifecycle`].
pub async fn start_cluster_with<L>(lifecycle: &L, opts: StartOptions) -> Result<TestClusterConfig>
where
    L: ClusterLifecycle,
{
    start(lifecycle, opts, &Settings::from_env()?).await
}

async fn start<L>(
    lifecycle: &L,
    opts: StartOptions,
    settings: &Settings,
) -> Result<TestClusterConfig>
where
    L: ClusterLifecycle,
{
    let _quiet = opts.silent.then(|| LogLevelGuard::new(LevelFilter::Error));

    let config = cluster_config(&opts, settings)?;
    let name = config.name.clone().unwrap_or_default();
    info!(
        "Creating cluster '{}' with image '{}'",
        name,
        config.image.as_deref().unwrap_or_default()
    );
    debug!("Cluster config: {:?}", config);

    let handle = match lifecycle.create_cluster(&config).await {
        Ok(handle) => handle,
        Err(create) => {
            // k3d may have created some of the containers and networks before failing.
            let partial = ClusterHandle::new(&name);
            return match lifecycle.delete_cluster(&partial).await {
                Ok(()) => error::ClusterCreateSnafu {
                    name,
                    message: create.to_string(),
                }
                .fail(),
                Err(cleanup) => {
                    warn!("Unable to clean up cluster '{}': {}", name, cleanup);
                    error::ClusterCreateCleanupSnafu {
                        name,
                        create: create.to_string(),
                        cleanup: cleanup.to_string(),
                    }
                    .fail()
                }
            }
            .map_err(Into::into);
        }
    };

    let (kubeconfig, rest_config) = match connect(lifecycle, &handle, &name).await {
        Ok(configs) => configs,
        Err(e) => {
            if let Err(cleanup) = lifecycle.delete_cluster(&handle).await {
                warn!("Unable to clean up cluster '{}': {}", name, cleanup);
            }
            return Err(e);
        }
    };
    info!("Cluster '{}' is ready at '{}'", name, rest_config.cluster_url);

    Ok(TestClusterConfig {
        kubeconfig,
        rest_config,
        handle,
        name,
    })
}

/// Reads the kubeconfig of a running cluster and derives its rest config.
async fn connect<L>(
    lifecycle: &L,
    handle: &ClusterHandle,
    name: &str,
) -> Result<(Kubeconfig, Config)>
where
    L: ClusterLifecycle,
{
    let kubeconfig = lifecycle.kubeconfig(handle).await.map_err(|e| {
        error::KubeconfigSnafu {
            name,
            message: e.to_string(),
        }
        .build()
    })?;
    let rest_config =
        Config::from_custom_kubeconfig(kubeconfig.clone(), &KubeConfigOptions::default())
            .await
            .context(error::RestConfigSnafu { name })?;
    Ok((kubeconfig, rest_config))
}

/// Deletes a cluster created by [`start_cluster`]. Calling this twice for the same cluster
/// returns whatever k3d reports for a missing cluster.
pub async fn stop_cluster(cluster: &TestClusterConfig, opts: StopOptions) -> Result<()> {
    stop_cluster_with(&K3d::from_env()?, cluster, opts).await
}

/// Same as [`stop_cluster`], with a caller provided [`ClusterLifecycle`].
pub async fn stop_cluster_with<L>(
    lifecycle: &L,
    cluster: &TestClusterConfig,
    _opts: StopOptions,
) -> Result<()>
where
    L: ClusterLifecycle,
{
    info!("Deleting cluster '{}'", cluster.name);
    lifecycle
        .delete_cluster(&cluster.handle)
        .await
        .map_err(|e| {
            error::ClusterDeleteSnafu {
                name: &cluster.name,
                message: e.to_string(),
            }
            .build()
        })?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::DEFAULT_K3S_IMAGE_REPO;

    #[test]
    fn default_cluster_config() {
        let config = cluster_config(&StartOptions::default(), &Settings::default()).unwrap();
        assert_eq!(config.servers, Some(1));
        assert_eq!(config.agents, Some(0));
        assert_eq!(config.options.unwrap().k3d.unwrap().wait, Some(true));
        let image = config.image.unwrap();
        assert!(image.starts_with(&format!("{}:", DEFAULT_K3S_IMAGE_REPO)));
        assert!(image.len() > DEFAULT_K3S_IMAGE_REPO.len() + 1);
        let expose = config.expose_api.unwrap();
        assert_eq!(expose.host_ip.as_deref(), Some("0.0.0.0"));
        let port: u16 = expose.host_port.unwrap().parse().unwrap();
        assert_ne!(port, 0);
        assert!(Uuid::parse_str(&config.name.unwrap()).is_ok());
    }

    #[test]
    fn tag_and_settings_pick_the_image() {
        let settings = Settings {
            k3s_version: Some("v1.23.1+k3s2".into()),
            ..Settings::default()
        };
        let config = cluster_config(&StartOptions::default(), &settings).unwrap();
        assert_eq!(
            config.image.as_deref(),
            Some("docker.io/rancher/k3s:v1.23.1-k3s2")
        );

        let opts = StartOptions {
            k3s_image_tag: Some("v1.22.5-k3s1".into()),
            ..StartOptions::default()
        };
        let config = cluster_config(&opts, &settings).unwrap();
        assert_eq!(
            config.image.as_deref(),
            Some("docker.io/rancher/k3s:v1.22.5-k3s1")
        );
    }

    #[test]
    fn override_wins_but_wait_is_forced() {
        let opts = StartOptions {
            k3s_image_tag: Some("ignored".into()),
            create_cluster_opts: Some(SimpleConfig {
                name: Some("named".into()),
                image: Some("registry.local/k3s:dev".into()),
                agents: Some(2),
                options: Some(crate::config::Options {
                    k3d: Some(crate::config::K3dOptions {
                        wait: Some(false),
                        timeout: Some("90s".into()),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                ..SimpleConfig::default()
            }),
            silent: false,
        };
        let config = cluster_config(&opts, &Settings::default()).unwrap();
        assert_eq!(config.name.as_deref(), Some("named"));
        assert_eq!(config.image.as_deref(), Some("registry.local/k3s:dev"));
        assert_eq!(config.agents, Some(2));
        assert_eq!(config.servers, Some(1));
        let k3d = config.options.unwrap().k3d.unwrap();
        assert_eq!(k3d.wait, Some(true));
        assert_eq!(k3d.timeout.as_deref(), Some("90s"));
    }

    #[test]
    fn explicit_port_is_kept() {
        let opts = StartOptions {
            create_cluster_opts: Some(SimpleConfig {
                expose_api: Some(ExposeApi {
                    host_port: Some("6550".into()),
                    ..ExposeApi::default()
                }),
                ..SimpleConfig::default()
            }),
            ..StartOptions::default()
        };
        let expose = cluster_config(&opts, &Settings::default())
            .unwrap()
            .expose_api
            .unwrap();
        assert_eq!(expose.host_port.as_deref(), Some("6550"));
        assert!(expose.host_ip.is_none());
    }

    #[test]
    fn explicit_host_ip_is_kept() {
        let opts = StartOptions {
            create_cluster_opts: Some(SimpleConfig {
                expose_api: Some(ExposeApi {
                    host_ip: Some("127.0.0.1".into()),
                    ..ExposeApi::default()
                }),
                ..SimpleConfig::default()
            }),
            ..StartOptions::default()
        };
        let expose = cluster_config(&opts, &Settings::default())
            .unwrap()
            .expose_api
            .unwrap();
        assert_eq!(expose.host_ip.as_deref(), Some("127.0.0.1"));
        let port: u16 = expose.host_port.unwrap().parse().unwrap();
        assert_ne!(port, 0);
    }

    #[test]
    fn empty_port_is_resolved() {
        let opts = StartOptions {
            create_cluster_opts: Some(SimpleConfig {
                expose_api: Some(ExposeApi {
                    host: Some("k3d.local".into()),
                    host_port: Some(String::new()),
                    ..ExposeApi::default()
                }),
                ..SimpleConfig::default()
            }),
            ..StartOptions::default()
        };
        let expose = cluster_config(&opts, &Settings::default())
            .unwrap()
            .expose_api
            .unwrap();
        assert_eq!(expose.host.as_deref(), Some("k3d.local"));
        assert!(!expose.host_port.unwrap().is_empty());
    }

    #[test]
    fn names_are_unique() {
        let a = cluster_config(&StartOptions::default(), &Settings::default()).unwrap();
        let b = cluster_config(&StartOptions::default(), &Settings::default()).unwrap();
        assert_ne!(a.name, b.name);
    }

    // One test, since the log level is shared by every test in this binary.
    #[test]
    fn log_level_is_restored() {
        log::set_max_level(LevelFilter::Info);
        {
            let _guard = LogLevelGuard::new(LevelFilter::Error);
            assert_eq!(log::max_level(), LevelFilter::Error);
        }
        assert_eq!(log::max_level(), LevelFilter::Info);

        // Overlapping guards dropped out of order.
        let first = LogLevelGuard::new(LevelFilter::Error);
        let second = LogLevelGuard::new(LevelFilter::Error);
        drop(first);
        assert_eq!(log::max_level(), LevelFilter::Error);
        drop(second);
        assert_eq!(log::max_level(), LevelFilter::Info);
    }
}
