use crate::error::{self, Result};
use serde::Deserialize;
use snafu::ResultExt;

/// The prefix of every environment variable read into [`Settings`].
pub const ENV_PREFIX: &str = "KSUITE_";

/// Settings provide a way to send arguments into test suites using environment variables.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Settings {
    /// The path to the [k3d] binary. Defaults to `k3d` (i.e. by default the k3d binary is
    /// expected to be found via `$PATH`).
    ///
    /// # Example
    ///
    /// ```text
    /// KSUITE_K3D_PATH=/wherever/k3d
    /// ```
    ///
    /// [k3d]: https://k3d.io/
    #[serde(default = "k3d")]
    pub k3d_path: String,

    /// The k3s version used when a suite does not ask for a specific image tag. You can find K3s
    /// tags at https://hub.docker.com/r/rancher/k3s/tags.
    ///
    /// ```text
    /// KSUITE_K3S_VERSION=v1.24.4-k3s1
    /// ```
    #[serde(default)]
    pub k3s_version: Option<String>,
}

impl Settings {
    /// Reads `KSUITE_*` variables from the environment.
    pub fn from_env() -> Result<Self> {
        Ok(envy::prefixed(ENV_PREFIX)
            .from_env::<Self>()
            .context(error::SettingsSnafu)?)
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            k3d_path: k3d(),
            k3s_version: None,
        }
    }
}

/// We need this to provide a default for serde.
fn k3d() -> String {
    String::from("k3d")
}
