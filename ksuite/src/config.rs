/*!

A typed model of the k3d `Simple` configuration file (`apiVersion: k3d.io/v1alpha2`) and the
[`Merge`] rules used to overlay user overrides on top of the defaults.

Every field is an `Option` so that an override can tell "not set" apart from a zero value.

!*/

use crate::error::{self, Result};
use serde::{Deserialize, Serialize};
use snafu::ResultExt;

pub const API_VERSION: &str = "k3d.io/v1alpha2";
pub const KIND: &str = "Simple";

/// The repository k3s images are pulled from.
pub const DEFAULT_K3S_IMAGE_REPO: &str = "docker.io/rancher/k3s";

/// The k3s version used when neither the caller nor `KSUITE_K3S_VERSION` picks one.
pub const DEFAULT_K3S_VERSION: &str = "v1.24.4-k3s1";

/// The port the Kubernetes API listens on inside the server container.
pub const DEFAULT_API_PORT: u16 = 6443;

/// Overlay `over` on top of `self`. Any field set in `over` replaces the field in `self`, nested
/// sections are merged field by field, and lists are replaced as a whole.
pub trait Merge {
    fn merge(self, over: Self) -> Self;
}

impl<T: Merge> Merge for Option<T> {
    fn merge(self, over: Self) -> Self {
        match (self, over) {
            (Some(base), Some(over)) => Some(base.merge(over)),
            (base, over) => over.or(base),
        }
    }
}

/// Implements [`Merge`] for a struct. Leaf fields are replaced when set, `nested` fields are
/// merged recursively.
macro_rules! impl_merge {
    ($t:ident { $($leaf:ident),* $(,)? } $(nested { $($nested:ident),* $(,)? })?) => {
        impl Merge for $t {
            fn merge(self, over: Self) -> Self {
                Self {
                    $($leaf: over.$leaf.or(self.$leaf),)*
                    $($($nested: self.$nested.merge(over.$nested),)*)?
                }
            }
        }
    };
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimpleConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub servers: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agents: Option<u32>,
    #[serde(rename = "kubeAPI", skip_serializing_if = "Option::is_none")]
    pub expose_api: Option<ExposeApi>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volumes: Option<Vec<VolumeWithNodeFilters>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ports: Option<Vec<PortWithNodeFilters>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<Vec<LabelWithNodeFilters>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env: Option<Vec<EnvVarWithNodeFilters>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registries: Option<Registries>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<Options>,
}

impl_merge!(SimpleConfig {
    name, servers, agents, image, network, token, volumes, ports, labels, env,
} nested { expose_api, registries, options });

/// Where the Kubernetes API is exposed on the host.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExposeApi {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(rename = "hostIP", skip_serializing_if = "Option::is_none")]
    pub host_ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_port: Option<String>,
}

impl_merge!(ExposeApi { host, host_ip, host_port });

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeWithNodeFilters {
    pub volume: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub node_filters: Vec<String>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortWithNodeFilters {
    pub port: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub node_filters: Vec<String>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelWithNodeFilters {
    pub label: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub node_filters: Vec<String>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvVarWithNodeFilters {
    pub env_var: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub node_filters: Vec<String>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Registries {
    #[serde(rename = "use", skip_serializing_if = "Option::is_none")]
    pub use_registries: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub create: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<String>,
}

impl_merge!(Registries {
    use_registries,
    create,
    config
});

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Options {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub k3d: Option<K3dOptions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub k3s: Option<K3sOptions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kubeconfig: Option<KubeconfigOptions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime: Option<RuntimeOptions>,
}

impl_merge!(Options {} nested { k3d, k3s, kubeconfig, runtime });

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct K3dOptions {
    /// Block until the cluster is ready. Always forced to `true` by `start_cluster`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wait: Option<bool>,
    /// A duration understood by k3d, e.g. `120s`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disable_loadbalancer: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disable_image_volume: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disable_rollback: Option<bool>,
}

impl_merge!(K3dOptions {
    wait,
    timeout,
    disable_loadbalancer,
    disable_image_volume,
    disable_rollback,
});

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct K3sOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra_server_args: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra_agent_args: Option<Vec<String>>,
}

impl_merge!(K3sOptions {
    extra_server_args,
    extra_agent_args
});

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KubeconfigOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub update_default_kubeconfig: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub switch_current_context: Option<bool>,
}

impl_merge!(KubeconfigOptions {
    update_default_kubeconfig,
    switch_current_context
});

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gpu_request: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub servers_memory: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agents_memory: Option<String>,
}

impl_merge!(RuntimeOptions {
    gpu_request,
    servers_memory,
    agents_memory
});

/// The k3d config file layout: `apiVersion` and `kind` followed by the config itself.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Document<'a> {
    api_version: &'a str,
    kind: &'a str,
    #[serde(flatten)]
    config: &'a SimpleConfig,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct OwnedDocument {
    #[serde(default)]
    api_version: Option<String>,
    #[serde(default)]
    kind: Option<String>,
    #[serde(flatten)]
    config: SimpleConfig,
}

impl SimpleConfig {
    /// The small cluster started when nothing is overridden: one server, no agents, and a
    /// kubeconfig that is not written into the user's default kubeconfig.
    pub fn default_cluster(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            image: Some(image.into()),
            servers: Some(1),
            agents: Some(0),
            options: Some(Options {
                kubeconfig: Some(KubeconfigOptions {
                    update_default_kubeconfig: Some(false),
                    switch_current_context: Some(false),
                }),
                ..Options::default()
            }),
            ..Self::default()
        }
    }

    /// Serializes the config as a k3d config file.
    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(&Document {
            api_version: API_VERSION,
            kind: KIND,
            config: self,
        })
        .context(error::SerdeYamlSnafu {
            action: "serialize k3d config",
        })?)
    }

    /// Parses a k3d config file. `apiVersion` and `kind` are optional, but when present they
    /// must be `k3d.io/v1alpha2` and `Simple`.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let document: OwnedDocument =
            serde_yaml::from_str(yaml).context(error::SerdeYamlSnafu {
                action: "parse k3d config",
            })?;
        let header_matches = document.api_version.as_deref().unwrap_or(API_VERSION)
            == API_VERSION
            && document.kind.as_deref().unwrap_or(KIND) == KIND;
        snafu::ensure!(
            header_matches,
            error::UnsupportedConfigSnafu {
                api_version: document.api_version.unwrap_or_default(),
                kind: document.kind.unwrap_or_default(),
            }
        );
        Ok(document.config)
    }

    /// Sets `options.k3d.wait`, leaving the other options untouched.
    pub(crate) fn set_wait(&mut self, wait: bool) {
        self.options
            .get_or_insert_with(Options::default)
            .k3d
            .get_or_insert_with(K3dOptions::default)
            .wait = Some(wait);
    }

    /// The configured API host port, treating an empty string as unset.
    pub(crate) fn api_host_port(&self) -> Option<&str> {
        self.expose_api
            .as_ref()
            .and_then(|expose| expose.host_port.as_deref())
            .filter(|port| !port.is_empty())
    }
}

/// Resolves the image reference for a cluster: `tag` when given, otherwise `version` (usually
/// `KSUITE_K3S_VERSION`), otherwise [`DEFAULT_K3S_VERSION`]. Docker tags cannot contain `+`, so
/// k3s versions such as `v1.24.4+k3s1` are rewritten to `v1.24.4-k3s1`.
pub fn k3s_image(tag: Option<&str>, version: Option<&str>) -> String {
    let tag = tag
        .filter(|tag| !tag.is_empty())
        .or_else(|| version.filter(|version| !version.is_empty()))
        .unwrap_or(DEFAULT_K3S_VERSION);
    format!("{}:{}", DEFAULT_K3S_IMAGE_REPO, tag.replace('+', "-"))
}
