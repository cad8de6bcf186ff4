use super::MigrationJob;

use snafu::Snafu;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("Unable to list MigrationJobs via kubernetes API: '{}'", source))]
    ListMigrationJobs { source: kube::Error },

    #[snafu(display("Unable to get pod '{}/{}': '{}'", namespace, name, source))]
    GetPod {
        source: kube::Error,
        namespace: String,
        name: String,
    },

    #[snafu(display("Unable to create patch to send to Kubernetes API: '{}'", source))]
    CreateK8SPatch { source: serde_json::error::Error },

    #[snafu(display(
        "Unable to patch MigrationJob '{}/{}': '{}'",
        namespace,
        name,
        source
    ))]
    PatchMigrationJob {
        source: kube::Error,
        namespace: String,
        name: String,
    },

    #[snafu(display("MigrationJob is missing a namespace: '{:?}'", job))]
    MissingNamespace { job: MigrationJob },
}
