use super::error::{self, Result};
use super::{MigrationJob, MigrationJobPhase, MigrationJobReason};
use crate::constants::ANNOTATION_PASSED_ARBITRATION;
use crate::pod::PodRef;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::reflector::Store;
use kube::ResourceExt;
use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{event, instrument, Level};

#[cfg(feature = "mockall")]
use mockall::{mock, predicate::*};

/// Abstracts the cluster object store capabilities the admission/arbitration core
/// depends on: field-indexed listing of `MigrationJob`s joined against their target
/// pod, and the handful of patches the Arbitrator issues. Kept as a trait so unit
/// tests can substitute an in-memory fake without standing up a cluster.
#[async_trait]
pub trait MigrationJobStore: Clone + Send + Sync {
    /// Jobs whose `PodRef.uid` matches exactly.
    fn list_by_pod_uid(&self, uid: &str) -> Vec<Arc<MigrationJob>>;
    /// Jobs whose `PodRef.{namespace,name}` matches; used as a fallback when `uid`
    /// is empty because the pod has since been recreated.
    fn list_by_pod_namespaced_name(&self, namespace: &str, name: &str) -> Vec<Arc<MigrationJob>>;
    /// Jobs whose target pod lives in the given namespace.
    fn list_by_pod_namespace(&self, namespace: &str) -> Vec<Arc<MigrationJob>>;
    /// Jobs whose target pod is currently scheduled onto the given node.
    fn list_by_node(&self, node_name: &str) -> Vec<Arc<MigrationJob>>;

    /// Looks up a pod from the locally cached store (no live API round-trip).
    fn get_pod(&self, namespace: &str, name: &str) -> Option<Arc<Pod>>;

    /// Persists the terminal, non-retryable outcome of a job.
    async fn patch_failed(&self, job: &MigrationJob, reason: MigrationJobReason) -> Result<()>;
    /// Persists the `passed-arbitration` annotation that hands a job to the executor.
    async fn patch_passed_arbitration(&self, job: &MigrationJob) -> Result<()>;
}

#[cfg(feature = "mockall")]
mock! {
    pub MigrationJobStore {}

    impl Clone for MigrationJobStore {
        fn clone(&self) -> Self;
    }

    #[async_trait]
    impl MigrationJobStore for MigrationJobStore {
        fn list_by_pod_uid(&self, uid: &str) -> Vec<Arc<MigrationJob>>;
        fn list_by_pod_namespaced_name(&self, namespace: &str, name: &str) -> Vec<Arc<MigrationJob>>;
        fn list_by_pod_namespace(&self, namespace: &str) -> Vec<Arc<MigrationJob>>;
        fn list_by_node(&self, node_name: &str) -> Vec<Arc<MigrationJob>>;
        fn get_pod(&self, namespace: &str, name: &str) -> Option<Arc<Pod>>;
        async fn patch_failed(&self, job: &MigrationJob, reason: MigrationJobReason) -> Result<()>;
        async fn patch_passed_arbitration(&self, job: &MigrationJob) -> Result<()>;
    }
}

#[async_trait]
impl<T> MigrationJobStore for Arc<T>
where
    T: MigrationJobStore,
{
    fn list_by_pod_uid(&self, uid: &str) -> Vec<Arc<MigrationJob>> {
        (**self).list_by_pod_uid(uid)
    }
    fn list_by_pod_namespaced_name(&self, namespace: &str, name: &str) -> Vec<Arc<MigrationJob>> {
        (**self).list_by_pod_namespaced_name(namespace, name)
    }
    fn list_by_pod_namespace(&self, namespace: &str) -> Vec<Arc<MigrationJob>> {
        (**self).list_by_pod_namespace(namespace)
    }
    fn list_by_node(&self, node_name: &str) -> Vec<Arc<MigrationJob>> {
        (**self).list_by_node(node_name)
    }
    fn get_pod(&self, namespace: &str, name: &str) -> Option<Arc<Pod>> {
        (**self).get_pod(namespace, name)
    }
    async fn patch_failed(&self, job: &MigrationJob, reason: MigrationJobReason) -> Result<()> {
        (**self).patch_failed(job, reason).await
    }
    async fn patch_passed_arbitration(&self, job: &MigrationJob) -> Result<()> {
        (**self).patch_passed_arbitration(job).await
    }
}

/// Helper struct used to serialize and send merge-patches to the k8s API.
#[derive(Debug, Serialize, Deserialize)]
struct MigrationJobStatusPatch {
    #[serde(rename = "apiVersion")]
    api_version: String,
    kind: String,
    status: super::MigrationJobStatus,
}

/// Helper struct for patching only the `passed-arbitration` annotation.
#[derive(Debug, Serialize, Deserialize)]
struct MigrationJobAnnotationPatch {
    #[serde(rename = "apiVersion")]
    api_version: String,
    kind: String,
    metadata: AnnotationsOnly,
}

#[derive(Debug, Serialize, Deserialize)]
struct AnnotationsOnly {
    annotations: HashMap<String, String>,
}

/// Production `MigrationJobStore` backed by `kube::runtime::reflector::Store`s for
/// reads (consistent with the teacher's `brs_reader`/`node_reader` pattern) and a
/// live `kube::Client` for writes.
#[derive(Clone)]
pub struct KubeMigrationJobStore {
    k8s_client: kube::client::Client,
    namespace: String,
    job_reader: Store<MigrationJob>,
    pod_reader: Store<Pod>,
}

impl KubeMigrationJobStore {
    pub fn new(
        k8s_client: kube::client::Client,
        namespace: &str,
        job_reader: Store<MigrationJob>,
        pod_reader: Store<Pod>,
    ) -> Self {
        KubeMigrationJobStore {
            k8s_client,
            namespace: namespace.to_string(),
            job_reader,
            pod_reader,
        }
    }

    fn all_jobs(&self) -> Vec<Arc<MigrationJob>> {
        self.job_reader.state()
    }

    /// Builds a transient pod-uid -> node-name map from the cached pod store. This
    /// stands in for a true field index on `PodByNodeName`; given the small number
    /// of pods a cluster has in-flight migrations for at once, rebuilding it on each
    /// query is cheap and keeps the store free of secondary-index bookkeeping.
    fn node_by_pod_uid(&self) -> HashMap<String, String> {
        self.pod_reader
            .state()
            .iter()
            .filter_map(|pod| {
                let uid = pod.uid()?;
                let node_name = pod.spec.as_ref()?.node_name.clone()?;
                Some((uid, node_name))
            })
            .collect()
    }
}

#[async_trait]
impl MigrationJobStore for KubeMigrationJobStore {
    #[instrument(skip(self))]
    fn list_by_pod_uid(&self, uid: &str) -> Vec<Arc<MigrationJob>> {
        self.all_jobs()
            .into_iter()
            .filter(|job| job.spec.pod_ref.uid == uid)
            .collect()
    }

    #[instrument(skip(self))]
    fn list_by_pod_namespaced_name(&self, namespace: &str, name: &str) -> Vec<Arc<MigrationJob>> {
        self.all_jobs()
            .into_iter()
            .filter(|job| job.spec.pod_ref.namespace == namespace && job.spec.pod_ref.name == name)
            .collect()
    }

    #[instrument(skip(self))]
    fn list_by_pod_namespace(&self, namespace: &str) -> Vec<Arc<MigrationJob>> {
        self.all_jobs()
            .into_iter()
            .filter(|job| job.spec.pod_ref.namespace == namespace)
            .collect()
    }

    #[instrument(skip(self))]
    fn list_by_node(&self, node_name: &str) -> Vec<Arc<MigrationJob>> {
        let node_by_uid = self.node_by_pod_uid();
        self.all_jobs()
            .into_iter()
            .filter(|job| node_by_uid.get(&job.spec.pod_ref.uid).map(String::as_str) == Some(node_name))
            .collect()
    }

    #[instrument(skip(self))]
    fn get_pod(&self, namespace: &str, name: &str) -> Option<Arc<Pod>> {
        self.pod_reader
            .state()
            .into_iter()
            .find(|pod| pod.namespace().as_deref() == Some(namespace) && pod.name_any() == name)
    }

    #[instrument(skip(self, job))]
    async fn patch_failed(&self, job: &MigrationJob, reason: MigrationJobReason) -> Result<()> {
        let patch = MigrationJobStatusPatch {
            api_version: super::crd::K8S_JOB_API_VERSION.to_string(),
            kind: super::crd::K8S_JOB_KIND.to_string(),
            status: super::MigrationJobStatus {
                phase: MigrationJobPhase::Failed,
                reason: Some(reason.as_str().to_string()),
            },
        };
        let patch = serde_json::to_value(patch).context(error::CreateK8SPatchSnafu)?;

        let namespace = job.namespace().context(error::MissingNamespaceSnafu {
            job: job.clone(),
        })?;
        let api: Api<MigrationJob> = Api::namespaced(self.k8s_client.clone(), &namespace);

        event!(Level::INFO, job = %job.name_any(), ?reason, "Marking MigrationJob as failed.");
        api.patch_status(&job.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .context(error::PatchMigrationJobSnafu {
                namespace,
                name: job.name_any(),
            })?;
        Ok(())
    }

    #[instrument(skip(self, job))]
    async fn patch_passed_arbitration(&self, job: &MigrationJob) -> Result<()> {
        let patch = MigrationJobAnnotationPatch {
            api_version: super::crd::K8S_JOB_API_VERSION.to_string(),
            kind: super::crd::K8S_JOB_KIND.to_string(),
            metadata: AnnotationsOnly {
                annotations: [(ANNOTATION_PASSED_ARBITRATION.to_string(), "true".to_string())]
                    .into_iter()
                    .collect(),
            },
        };
        let patch = serde_json::to_value(patch).context(error::CreateK8SPatchSnafu)?;

        let namespace = job.namespace().context(error::MissingNamespaceSnafu {
            job: job.clone(),
        })?;
        let api: Api<MigrationJob> = Api::namespaced(self.k8s_client.clone(), &namespace);

        event!(Level::INFO, job = %job.name_any(), "Marking MigrationJob as passed arbitration.");
        api.patch(&job.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .context(error::PatchMigrationJobSnafu {
                namespace,
                name: job.name_any(),
            })?;
        Ok(())
    }
}

/// Helper for constructing a `PodRef` as stored on a freshly created `MigrationJob`.
pub fn pod_ref_of(pod: &Pod) -> PodRef {
    PodRef::from_pod(pod)
}
