use snafu::Snafu;

/// The public error type for `ksuite`. Failures are only distinguishable by their message.
#[derive(Debug, Snafu)]
pub struct Error(InnerError);
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub(crate) enum InnerError {
    #[snafu(display("Unable to build a kubernetes client for cluster '{}': {}", name, source))]
    ClientCreate { name: String, source: kube::Error },

    #[snafu(display("Unable to create cluster '{}': {}", name, message))]
    ClusterCreate { name: String, message: String },

    #[snafu(display(
        "Unable to create cluster '{}': {}; cleanup of the partially created cluster also \
        failed: {}",
        name,
        create,
        cleanup
    ))]
    ClusterCreateCleanup {
        name: String,
        create: String,
        cleanup: String,
    },

    #[snafu(display("Unable to delete cluster '{}': {}", name, message))]
    ClusterDelete { name: String, message: String },

    #[snafu(display("Unable to get kubeconfig for cluster '{}': {}", name, message))]
    Kubeconfig { name: String, message: String },

    #[snafu(display("Unable to find a free host port: {}", source))]
    PortResolution { source: std::io::Error },

    #[snafu(display("Invalid port exposure spec '{}': {}", spec, reason))]
    PortSpec { spec: String, reason: String },

    #[snafu(display("Unable to derive rest config for cluster '{}': {}", name, source))]
    RestConfig {
        name: String,
        source: kube::config::KubeconfigError,
    },

    #[snafu(display("Unable to {}: {}", action, source))]
    SerdeYaml {
        action: String,
        source: serde_yaml::Error,
    },

    #[snafu(display("Error parsing settings environment variables: {}", source))]
    Settings { source: envy::Error },

    #[snafu(display(
        "Unsupported k3d config '{}/{}', expected '{}/{}'",
        api_version,
        kind,
        crate::config::API_VERSION,
        crate::config::KIND
    ))]
    UnsupportedConfig { api_version: String, kind: String },

    #[snafu(display("The suite already has a cluster, 'tear_down_suite' has not run"))]
    SuiteAlreadySetUp,

    #[snafu(display("The suite has no cluster, 'setup_suite' has not succeeded"))]
    SuiteNotSetUp,
}
