use crate::constants::ANNOTATION_PASSED_ARBITRATION;
use crate::pod::PodRef;

use chrono::{DateTime, Utc};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub const K8S_JOB_KIND: &str = "PodMigrationJob";
pub const K8S_JOB_PLURAL: &str = "podmigrationjobs";
pub const K8S_JOB_STATUS: &str = "podmigrationjobs/status";
pub const K8S_JOB_SHORTNAME: &str = "pmj";
pub const K8S_JOB_API_VERSION: &str = "descheduler.scheduling.koordinator.sh/v1alpha1";

/// The phase of a `MigrationJob`'s lifecycle, as tracked by this subsystem. An empty
/// (unset) phase on the wire is treated as `Pending` everywhere it's read.
#[derive(Copy, Clone, Serialize, Deserialize, Debug, Default, Eq, PartialEq, JsonSchema)]
pub enum MigrationJobPhase {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
}

/// Reasons this subsystem writes when it aborts a job.
#[derive(Copy, Clone, Serialize, Deserialize, Debug, Eq, PartialEq, JsonSchema)]
pub enum MigrationJobReason {
    ForbiddenMigratePod,
    PodNotFound,
}

impl MigrationJobReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationJobReason::ForbiddenMigratePod => "ForbiddenMigratePod",
            MigrationJobReason::PodNotFound => "PodNotFound",
        }
    }
}

/// `MigrationJobSpec` identifies the pod a migration job targets. The spec is
/// immutable after creation; all arbitration bookkeeping lives in annotations and
/// `status`, mirroring how the descheduler's actual `PodMigrationJob` CRD is shaped.
#[derive(Clone, CustomResource, Serialize, Deserialize, Debug, Default, Eq, PartialEq, JsonSchema)]
#[kube(
    derive = "Default",
    derive = "PartialEq",
    group = "descheduler.scheduling.koordinator.sh",
    kind = "MigrationJob",
    namespaced,
    plural = "podmigrationjobs",
    shortname = "pmj",
    singular = "podmigrationjob",
    status = "MigrationJobStatus",
    version = "v1alpha1",
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Pod", "type":"string", "jsonPath":".spec.podRef.name"}"#,
    printcolumn = r#"{"name":"Reason", "type":"string", "jsonPath":".status.reason"}"#
)]
pub struct MigrationJobSpec {
    pub pod_ref: PodRef,
    /// RFC3339-encoded creation time. Stored as a string (rather than `DateTime<Utc>`
    /// directly) so that `MigrationJobSpec` can derive `Default`.
    creation_timestamp: String,
}

impl MigrationJobSpec {
    pub fn new(pod_ref: PodRef, creation_timestamp: DateTime<Utc>) -> Self {
        MigrationJobSpec {
            pod_ref,
            creation_timestamp: creation_timestamp.to_rfc3339(),
        }
    }

    /// Falls back to the earliest representable instant on a malformed value
    /// rather than panicking: `MigrationJob`s are read from the live reflector
    /// store, so a single corrupt object must not be able to crash the
    /// arbitration cycle for every other job.
    pub fn creation_timestamp(&self) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(&self.creation_timestamp)
            .map(Into::into)
            .unwrap_or_else(|source| {
                tracing::event!(
                    tracing::Level::WARN,
                    %source,
                    raw = %self.creation_timestamp,
                    "MigrationJobSpec.creation_timestamp is not a valid rfc3339 string; sorting it as earliest."
                );
                DateTime::<Utc>::MIN_UTC
            })
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct MigrationJobStatus {
    pub phase: MigrationJobPhase,
    pub reason: Option<String>,
}

impl MigrationJob {
    pub fn phase(&self) -> MigrationJobPhase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }

    pub fn has_passed_arbitration(&self) -> bool {
        self.annotations()
            .get(ANNOTATION_PASSED_ARBITRATION)
            .map(|v| v == "true")
            .unwrap_or(false)
    }
}
