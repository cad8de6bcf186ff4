//! The Arbitrator (component E): the waiting collection, the four-method
//! event handler that feeds it, and the sort-filter-dispatch cycle that drains
//! it into the work queue. Grounded on the teacher's `BrupopController::run()`
//! event loop (`controller/src/controller.rs`) and its `main.rs` wiring of the
//! reflector store against a periodic reconciliation tick.
use crate::filter::{
    AdmissionFilter, ControllerFinder, NonRetryablePodFilter, PreEvictionFilter, RetryablePodFilter, TrackEvictedPod,
};
use crate::metrics::ArbiterMetrics;
use crate::queue::{JobRef, WorkQueue};
use crate::sort::{self, SortFn};
use models::job::{MigrationJob, MigrationJobReason, MigrationJobStore};
use models::pod::evict_now_requested;

use kube::ResourceExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::{event, instrument, Level};

/// Jobs observed via watch events that have not yet passed arbitration, keyed
/// by UID. A job enters here on `Create` (absent the `passed-arbitration`
/// annotation) and leaves either by being admitted, or by being failed
/// outright when its target pod can no longer be found.
#[derive(Default)]
struct WaitingCollection {
    jobs: Mutex<HashMap<String, Arc<MigrationJob>>>,
}

impl WaitingCollection {
    fn insert(&self, job: Arc<MigrationJob>) {
        if let Some(uid) = job.uid() {
            self.jobs.lock().unwrap().insert(uid, job);
        }
    }

    fn remove(&self, uid: &str) {
        self.jobs.lock().unwrap().remove(uid);
    }

    fn snapshot(&self) -> Vec<Arc<MigrationJob>> {
        self.jobs.lock().unwrap().values().cloned().collect()
    }

    fn len(&self) -> usize {
        self.jobs.lock().unwrap().len()
    }
}

/// Owns the waiting collection and drives it through the admission filter
/// chain on a fixed interval, handing admitted jobs to `Q`'s work queue.
pub struct Arbitrator<S, C, Q> {
    filter: AdmissionFilter<S, C>,
    waiting: WaitingCollection,
    queue: Q,
    sorters: Vec<SortFn>,
    metrics: ArbiterMetrics,
}

impl<S, C, Q> Arbitrator<S, C, Q>
where
    S: MigrationJobStore,
    C: ControllerFinder,
    Q: WorkQueue,
{
    pub fn new(filter: AdmissionFilter<S, C>, queue: Q, sorters: Vec<SortFn>, metrics: ArbiterMetrics) -> Self {
        Arbitrator {
            filter,
            waiting: WaitingCollection::default(),
            queue,
            sorters,
            metrics,
        }
    }

    /// `Create`: a job without `passed-arbitration` is stashed in the waiting
    /// collection for the next cycle; one that already carries the annotation
    /// (e.g. on controller restart, replaying existing objects) is enqueued
    /// immediately without waiting for a cycle to pick it up.
    pub fn handle_create(&self, job: Arc<MigrationJob>) {
        if job.has_passed_arbitration() {
            self.enqueue(&job);
        } else {
            self.waiting.insert(job);
        }
    }

    /// `Update`, `Delete`, `Generic`: the executor side of the system is
    /// responsible for reacting to these; this subsystem's only obligation is
    /// to make sure the work queue observes the change.
    pub fn handle_update(&self, job: Arc<MigrationJob>) {
        self.enqueue(&job);
    }

    pub fn handle_delete(&self, job: Arc<MigrationJob>) {
        self.enqueue(&job);
    }

    pub fn handle_generic(&self, job: Arc<MigrationJob>) {
        self.enqueue(&job);
    }

    fn enqueue(&self, job: &MigrationJob) {
        self.queue.add(JobRef {
            namespace: job.namespace().unwrap_or_default(),
            name: job.name_any(),
        });
    }

    pub fn waiting_len(&self) -> usize {
        self.waiting.len()
    }

    /// Runs the sort-filter-dispatch cycle once: snapshots the waiting
    /// collection, hydrates each job's target pod, sorts the batch, then walks
    /// it in order through the non-retryable and retryable chains. Per-job
    /// store errors are logged and do not abort the cycle.
    #[instrument(skip(self))]
    pub async fn run_cycle(&self) {
        let snapshot = self.waiting.snapshot();
        self.metrics.set_waiting_size(snapshot.len());

        let mut candidates = Vec::with_capacity(snapshot.len());
        for job in snapshot {
            let pod_ref = &job.spec.pod_ref;
            match self.filter.store().get_pod(&pod_ref.namespace, &pod_ref.name) {
                Some(pod) => candidates.push(((*job).clone(), (*pod).clone())),
                None => {
                    event!(Level::INFO, job = %job.name_any(), "Target pod no longer found; failing job.");
                    self.fail_job(&job, MigrationJobReason::PodNotFound).await;
                }
            }
        }

        sort::apply(&mut candidates, &self.sorters);

        for (job, pod) in candidates {
            if !NonRetryablePodFilter::filter(&self.filter, &pod).await {
                self.fail_job(&job, MigrationJobReason::ForbiddenMigratePod).await;
                continue;
            }

            // An evict-now pod skips the capacity/rate-limit chain entirely but
            // still has to clear the pre-eviction freshness recheck below.
            if !evict_now_requested(&pod) && !RetryablePodFilter::filter(&self.filter, &pod).await {
                self.metrics.record_requeued();
                continue;
            }

            if !PreEvictionFilter::pre_eviction_filter(&self.filter, &pod).await {
                self.metrics.record_requeued();
                continue;
            }

            self.admit_job(&job).await;
            TrackEvictedPod::track_evicted_pod(&self.filter, &pod).await;
        }
    }

    async fn fail_job(&self, job: &MigrationJob, reason: MigrationJobReason) {
        if let Some(uid) = job.uid() {
            self.waiting.remove(&uid);
        }
        if let Err(source) = self.filter.store().patch_failed(job, reason).await {
            event!(Level::ERROR, job = %job.name_any(), %source, "Failed to patch MigrationJob status.");
        }
        self.metrics.record_aborted(reason.as_str());
    }

    async fn admit_job(&self, job: &MigrationJob) {
        if let Some(uid) = job.uid() {
            self.waiting.remove(&uid);
        }
        if let Err(source) = self.filter.store().patch_passed_arbitration(job).await {
            event!(Level::ERROR, job = %job.name_any(), %source, "Failed to patch passed-arbitration annotation.");
            return;
        }
        self.enqueue(job);
        self.metrics.record_admitted();
    }

    /// Runs cycles on `interval` until `stop` is set. A cycle already in
    /// flight when the stop signal arrives runs to completion; the loop only
    /// checks at cycle boundaries.
    pub async fn run(&self, interval: std::time::Duration, mut stop: watch::Receiver<bool>) {
        loop {
            self.run_cycle().await;
            if *stop.borrow() {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = stop.changed() => {}
            }
            if *stop.borrow() {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ArbiterConfig;
    use crate::filter::ControllerFinderError;
    use crate::queue::InMemoryWorkQueue;
    use async_trait::async_trait;
    use k8s_openapi::api::core::v1::Pod;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
    use kube::api::ObjectMeta;
    use models::job::{MigrationJobSpec, MigrationJobStatus, MockMigrationJobStore};
    use models::pod::PodRef;

    struct NoopControllerFinder;

    #[async_trait]
    impl ControllerFinder for NoopControllerFinder {
        async fn get_pods_for_ref(&self, _owner_ref: &OwnerReference, _namespace: &str) -> Result<Vec<Pod>, ControllerFinderError> {
            Ok(vec![])
        }

        async fn get_expected_scale_for_pod(&self, _pod: &Pod) -> Result<u32, ControllerFinderError> {
            Ok(1)
        }

        async fn get_node_labels(&self, _node_name: &str) -> Result<std::collections::BTreeMap<String, String>, ControllerFinderError> {
            Ok(std::collections::BTreeMap::new())
        }
    }

    fn job_with(name: &str, pod_ref: PodRef) -> Arc<MigrationJob> {
        Arc::new(MigrationJob {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                uid: Some(format!("uid-{name}")),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            spec: MigrationJobSpec::new(pod_ref, chrono::Utc::now()),
            status: Some(MigrationJobStatus {
                phase: models::job::MigrationJobPhase::Pending,
                reason: None,
            }),
        })
    }

    #[tokio::test]
    async fn missing_target_pod_fails_job_and_leaves_waiting_collection_empty() {
        let mut store = MockMigrationJobStore::new();
        store.expect_get_pod().returning(|_, _| None);
        store.expect_patch_failed().returning(|_, _| Ok(()));
        store.expect_clone().returning(MockMigrationJobStore::new);

        let filter = AdmissionFilter::new(store, NoopControllerFinder, ArbiterConfig::default());
        let metrics = test_metrics();
        let arbitrator = Arbitrator::new(filter, InMemoryWorkQueue::new(), vec![], metrics);

        arbitrator.handle_create(job_with(
            "job-a",
            PodRef { uid: "pod-a".into(), namespace: "default".into(), name: "pod-a".into() },
        ));
        assert_eq!(arbitrator.waiting_len(), 1);

        arbitrator.run_cycle().await;
        assert_eq!(arbitrator.waiting_len(), 0);
        assert_eq!(arbitrator.queue.len(), 0);
    }

    #[tokio::test]
    async fn create_with_passed_annotation_enqueues_without_a_cycle() {
        let store = MockMigrationJobStore::new();
        let filter = AdmissionFilter::new(store, NoopControllerFinder, ArbiterConfig::default());
        let metrics = test_metrics();
        let arbitrator = Arbitrator::new(filter, InMemoryWorkQueue::new(), vec![], metrics);

        let mut job = job_with(
            "job-b",
            PodRef { uid: "pod-b".into(), namespace: "default".into(), name: "pod-b".into() },
        );
        Arc::get_mut(&mut job).unwrap().metadata.annotations = Some(
            [(models::constants::ANNOTATION_PASSED_ARBITRATION.to_string(), "true".to_string())]
                .into_iter()
                .collect(),
        );

        arbitrator.handle_create(job);
        assert_eq!(arbitrator.waiting_len(), 0);
        assert_eq!(arbitrator.queue.len(), 1);
    }

    fn test_metrics() -> ArbiterMetrics {
        use opentelemetry::global;
        ArbiterMetrics::new(global::meter("test"))
    }
}
