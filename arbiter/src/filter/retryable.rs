//! The retryable chain: failure here means "not now" — the job stays in the
//! waiting collection for the next cycle.
use super::{resolve_workload, AdmissionFilter, ControllerFinder};
use crate::index::{self, ActivePredicate, IndexScope};
use models::job::MigrationJobStore;
use models::pod::pod_is_unavailable;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use std::collections::HashSet;
use tracing::{event, Level};

#[async_trait]
pub trait RetryablePodFilter: Send + Sync {
    async fn filter(&self, pod: &Pod) -> bool;
}

/// Invoked once a job is handed to the executor, drawing one token from the
/// workload's rate limiter; this is the sole consuming operation on a
/// workload's bucket (`RetryablePodFilter` only peeks).
#[async_trait]
pub trait TrackEvictedPod: Send + Sync {
    async fn track_evicted_pod(&self, pod: &Pod);
}

#[async_trait]
impl<S, C> RetryablePodFilter for AdmissionFilter<S, C>
where
    S: MigrationJobStore,
    C: ControllerFinder,
{
    async fn filter(&self, pod: &Pod) -> bool {
        let workload = match resolve_workload(&self.controller_finder, pod).await {
            Ok(workload) => workload,
            Err(source) => {
                event!(Level::ERROR, pod = %pod.name_any(), %source, "Unable to resolve workload; failing closed.");
                return false;
            }
        };
        let workload_uid = workload.owner_ref.uid.clone();
        let pod_uid = pod.uid().unwrap_or_default();

        if !self.limiters.lock().unwrap().peek(&workload_uid, workload.expected_replicas) {
            event!(Level::DEBUG, pod = %pod.name_any(), workload = %workload_uid, "Workload rate limiter denied migration.");
            return false;
        }

        if let Some(max_per_node) = self.config.max_migrating_per_node {
            if max_per_node > 0 {
                if let Some(node_name) = pod.spec.as_ref().and_then(|s| s.node_name.as_deref()) {
                    let active = index::count_active_excluding(
                        &self.store,
                        IndexScope::ByPodNode(node_name),
                        ActivePredicate::RunningOrAdmittedPending,
                        &pod_uid,
                    );
                    if active as u32 >= max_per_node {
                        event!(Level::DEBUG, pod = %pod.name_any(), node = node_name, "Per-node migration cap reached.");
                        return false;
                    }
                }
            }
        }

        if let Some(max_per_namespace) = self.config.max_migrating_per_namespace {
            if max_per_namespace > 0 {
                let namespace = pod.namespace().unwrap_or_default();
                let active = index::count_active_excluding(
                    &self.store,
                    IndexScope::ByPodNamespace(&namespace),
                    ActivePredicate::RunningOrAdmittedPending,
                    &pod_uid,
                );
                if active as u32 >= max_per_namespace {
                    event!(Level::DEBUG, pod = %pod.name_any(), namespace = %namespace, "Per-namespace migration cap reached.");
                    return false;
                }
            }
        }

        if !self.max_migrating_or_unavailable_allows(pod, &workload) {
            return false;
        }

        true
    }
}

#[async_trait]
impl<S, C> TrackEvictedPod for AdmissionFilter<S, C>
where
    S: MigrationJobStore,
    C: ControllerFinder,
{
    async fn track_evicted_pod(&self, pod: &Pod) {
        let workload = match resolve_workload(&self.controller_finder, pod).await {
            Ok(workload) => workload,
            Err(source) => {
                event!(Level::WARN, pod = %pod.name_any(), %source, "Could not resolve workload to track evicted pod.");
                return;
            }
        };
        let workload_uid = workload.owner_ref.uid;
        self.limiters.lock().unwrap().reserve(&workload_uid, workload.expected_replicas);
    }
}

impl<S, C> AdmissionFilter<S, C>
where
    S: MigrationJobStore,
    C: ControllerFinder,
{
    fn max_migrating_or_unavailable_allows(&self, pod: &Pod, workload: &super::WorkloadContext) -> bool {
        use super::quantity::resolve_quantity;

        // Reuses the same `expected_replicas` the non-retryable chain resolved
        // via `ControllerFinder::get_expected_scale_for_pod` for this pod, so
        // the two chains can't disagree about what "expected replicas" means
        // within one cycle.
        let expected_replicas = workload.expected_replicas;
        let sibling_pods = &workload.sibling_pods;
        let max_migrating = resolve_quantity(self.config.max_migrating_per_workload, expected_replicas);
        let max_unavailable = resolve_quantity(self.config.max_unavailable_per_workload, expected_replicas);
        let namespace = pod.namespace().unwrap_or_default();

        let migrating_refs = index::migrating_pod_refs(&self.store, &namespace, ActivePredicate::RunningOrAdmittedPending);
        let migrating_uids: HashSet<&str> = migrating_refs.iter().map(|r| r.uid.as_str()).collect();

        let sibling_uids: HashSet<&str> = sibling_pods.iter().filter_map(|p| p.metadata.uid.as_deref()).collect();
        let migrating_in_workload = migrating_uids.intersection(&sibling_uids).count() as u32;

        if migrating_in_workload >= max_migrating {
            event!(Level::DEBUG, pod = %pod.name_any(), "Per-workload migrating cap reached.");
            return false;
        }

        let unavailable_or_migrating: HashSet<&str> = sibling_pods
            .iter()
            .filter(|p| pod_is_unavailable(p))
            .filter_map(|p| p.metadata.uid.as_deref())
            .chain(migrating_uids.iter().copied())
            .collect();

        if unavailable_or_migrating.len() as u32 >= max_unavailable {
            event!(Level::DEBUG, pod = %pod.name_any(), "Per-workload unavailable budget reached.");
            return false;
        }

        true
    }
}
