use models::job::error::Error as JobStoreError;

use snafu::Snafu;

/// The crate-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// The crate-wide error type.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("Unable to create kubernetes client: '{}'", source))]
    ClientCreate { source: kube::Error },

    #[snafu(display("Error configuring tracing: '{}'", source))]
    TracingConfiguration {
        source: models::telemetry::TelemetryConfigError,
    },

    #[snafu(display("Unable to load configuration from the environment: '{}'", source))]
    ConfigFromEnvironment {
        source: crate::config::config_error::Error,
    },

    #[snafu(display("Unable to patch MigrationJob via the object store: '{}'", source))]
    JobStore { source: JobStoreError },

    #[snafu(display(
        "Could not resolve expected scale for workload owning pod '{}/{}': '{}'",
        namespace,
        name,
        source
    ))]
    ExpectedScale {
        source: crate::filter::ControllerFinderError,
        namespace: String,
        name: String,
    },
}
