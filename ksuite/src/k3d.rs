use crate::config::SimpleConfig;
use crate::settings::Settings;
use crate::ClusterLifecycle;
use async_trait::async_trait;
use kube::config::Kubeconfig;
use log::{debug, info};
use snafu::{ensure, OptionExt, ResultExt, Snafu};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Output;
use tempfile::TempDir;
use tokio::process::Command;

pub const CONFIG_FILENAME: &str = "k3d-config.yaml";

/// An opaque reference to a cluster known to the [`ClusterLifecycle`] client.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClusterHandle {
    name: String,
}

impl ClusterHandle {
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self { name: name.into() }
    }

    /// The k3d name of the cluster.
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// The public error type for [`K3d`].
#[derive(Debug, Snafu)]
pub struct K3dError(InnerError);

#[derive(Debug, Snafu)]
enum InnerError {
    #[snafu(display("k3d config has no cluster name"))]
    MissingName,

    #[snafu(display("Unable to create temp dir for k3d config: {}", source))]
    TempDir { source: std::io::Error },

    #[snafu(display("Unable to serialize k3d config: {}", source))]
    ConfigSerialize { source: crate::Error },

    #[snafu(display("Unable to write '{}': {}", path.display(), source))]
    ConfigWrite {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Unable to run '{}': {}", command, source))]
    Spawn {
        command: String,
        source: std::io::Error,
    },

    #[snafu(display(
        "'{}' failed with exit status '{}'\n\n{}\n\n{}",
        command,
        code,
        stdout,
        stderr
    ))]
    ExitStatus {
        command: String,
        code: i32,
        stdout: String,
        stderr: String,
    },

    #[snafu(display("Unable to parse kubeconfig of cluster '{}': {}", name, source))]
    KubeconfigParse {
        name: String,
        source: kube::config::KubeconfigError,
    },
}

/// The default [`ClusterLifecycle`]. Drives the [k3d] binary, which runs k3s inside docker.
///
/// [k3d]: https://k3d.io/
#[derive(Debug, Clone)]
pub struct K3d {
    path: PathBuf,
}

impl K3d {
    /// Uses the k3d binary at `path` (or a name found via `$PATH`).
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    /// Uses the k3d binary named by `KSUITE_K3D_PATH`, `k3d` by default.
    pub fn from_env() -> crate::Result<Self> {
        Ok(Self::from_settings(&Settings::from_env()?))
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(&settings.k3d_path)
    }

    /// Uses `k3d image import` to load an image from the machine to the cluster.
    pub async fn import_image(
        &self,
        cluster: &ClusterHandle,
        image: &str,
    ) -> Result<(), K3dError> {
        info!("Importing image '{}' into cluster '{}'", image, cluster.name());
        self.run(["image", "import", image, "--cluster", cluster.name()])
            .await?;
        Ok(())
    }

    async fn run<I, S>(&self, args: I) -> Result<Output, InnerError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let args: Vec<S> = args.into_iter().collect();
        let command = std::iter::once(self.path.as_os_str())
            .chain(args.iter().map(OsStr::new))
            .map(OsStr::to_string_lossy)
            .collect::<Vec<_>>()
            .join(" ");
        debug!("Running '{}'", command);
        let output = Command::new(&self.path)
            .args(&args)
            .output()
            .await
            .context(SpawnSnafu { command: &command })?;
        ensure!(
            output.status.success(),
            ExitStatusSnafu {
                command,
                code: output.status.code().unwrap_or(1),
                stdout: String::from_utf8_lossy(&output.stdout),
                stderr: String::from_utf8_lossy(&output.stderr),
            }
        );
        Ok(output)
    }
}

impl Default for K3d {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

fn write_config(dir: &Path, config: &SimpleConfig) -> Result<PathBuf, InnerError> {
    let path = dir.join(CONFIG_FILENAME);
    let yaml = config.to_yaml().context(ConfigSerializeSnafu)?;
    debug!("k3d config:\n{}", yaml);
    std::fs::write(&path, yaml).context(ConfigWriteSnafu { path: &path })?;
    Ok(path)
}

#[async_trait]
impl ClusterLifecycle for K3d {
    type E = K3dError;

    async fn create_cluster(&self, config: &SimpleConfig) -> Result<ClusterHandle, Self::E> {
        let name = config.name.as_deref().context(MissingNameSnafu)?;
        let dir = TempDir::new().context(TempDirSnafu)?;
        let path = write_config(dir.path(), config)?;
        self.run([
            OsStr::new("cluster"),
            OsStr::new("create"),
            OsStr::new("--config"),
            path.as_os_str(),
        ])
        .await?;
        Ok(ClusterHandle::new(name))
    }

    async fn delete_cluster(&self, cluster: &ClusterHandle) -> Result<(), Self::E> {
        self.run(["cluster", "delete", cluster.name()]).await?;
        Ok(())
    }

    async fn kubeconfig(&self, cluster: &ClusterHandle) -> Result<Kubeconfig, Self::E> {
        let output = self.run(["kubeconfig", "get", cluster.name()]).await?;
        Ok(
            Kubeconfig::from_yaml(&String::from_utf8_lossy(&output.stdout)).context(
                KubeconfigParseSnafu {
                    name: cluster.name(),
                },
            )?,
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::k3s_image;

    #[test]
    fn config_is_written_to_dir() {
        let dir = TempDir::new().unwrap();
        let config = SimpleConfig::default_cluster("written", k3s_image(None, None));
        let path = write_config(dir.path(), &config).unwrap();
        assert_eq!(path, dir.path().join(CONFIG_FILENAME));
        let written = std::fs::read_to_string(path).unwrap();
        assert_eq!(SimpleConfig::from_yaml(&written).unwrap(), config);
    }

    #[tokio::test]
    async fn missing_binary_is_an_error() {
        let k3d = K3d::new("/nonexistent/k3d");
        let error = k3d
            .delete_cluster(&ClusterHandle::new("nothing"))
            .await
            .unwrap_err();
        assert!(error
            .to_string()
            .contains("/nonexistent/k3d cluster delete nothing"));
    }

    #[tokio::test]
    async fn nameless_config_is_rejected() {
        let error = K3d::new("k3d")
            .create_cluster(&SimpleConfig::default())
            .await
            .unwrap_err();
        assert!(error.to_string().contains("no cluster name"));
    }

    #[tokio::test]
    async fn non_zero_exit_is_an_error() {
        let error = K3d::new("false")
            .delete_cluster(&ClusterHandle::new("anything"))
            .await
            .unwrap_err();
        assert!(error.to_string().contains("exit status '1'"));
    }
}
