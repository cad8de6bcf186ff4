//! The `MigrationJob` custom resource: its CRD type, the errors this subsystem's
//! k8s client calls can raise, and the `MigrationJobStore` abstraction the
//! arbitration core reads and writes through.
mod client;
mod crd;
pub mod error;

pub use client::{pod_ref_of, KubeMigrationJobStore, MigrationJobStore};
#[cfg(feature = "mockall")]
pub use client::MockMigrationJobStore;
pub use crd::{
    MigrationJob, MigrationJobPhase, MigrationJobReason, MigrationJobSpec, MigrationJobStatus,
    K8S_JOB_API_VERSION, K8S_JOB_KIND, K8S_JOB_PLURAL, K8S_JOB_SHORTNAME, K8S_JOB_STATUS,
};
