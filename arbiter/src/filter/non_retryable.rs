//! The non-retryable chain: failure here means the job is aborted, never retried.
use super::quantity::resolve_quantity;
use super::{evictor, resolve_workload, AdmissionFilter, ControllerFinder};
use crate::config::JobMode;
use models::constants::{ANNOTATION_EVICTION_COST, ANNOTATION_SKIP_EXPECTED_REPLICAS};
use models::job::MigrationJobStore;
use models::pod::scheduler_name;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use tracing::{event, Level};

/// Pods that set this annotation above the threshold opt out of eviction
/// entirely, mirroring the real descheduler's "never evict me" sentinel.
const MAX_EVICTION_COST: i64 = i32::MAX as i64;

#[async_trait]
pub trait NonRetryablePodFilter: Send + Sync {
    async fn filter(&self, pod: &Pod) -> bool;
}

#[async_trait]
impl<S, C> NonRetryablePodFilter for AdmissionFilter<S, C>
where
    S: MigrationJobStore,
    C: ControllerFinder,
{
    async fn filter(&self, pod: &Pod) -> bool {
        if !max_eviction_cost_allows(pod) {
            event!(Level::INFO, pod = %pod.name_any(), "Rejected: eviction-cost exceeds threshold.");
            return false;
        }
        let node_labels = self.node_labels_for(pod).await;
        if !evictor::default_evictor_allows(pod, &self.config, node_labels.as_ref()) {
            event!(Level::INFO, pod = %pod.name_any(), "Rejected by default evictor checks.");
            return false;
        }
        if !self.expected_replicas_allows(pod).await {
            event!(Level::INFO, pod = %pod.name_any(), "Rejected: expected-replicas guard.");
            return false;
        }
        if !reservation_allows(pod, &self.config) {
            event!(Level::INFO, pod = %pod.name_any(), "Rejected: ReservationFirst scheduler mismatch.");
            return false;
        }
        true
    }
}

impl<S, C> AdmissionFilter<S, C>
where
    S: MigrationJobStore,
    C: ControllerFinder,
{
    async fn expected_replicas_allows(&self, pod: &Pod) -> bool {
        if self.config.skip_check_expected_replicas
            || pod.annotations().contains_key(ANNOTATION_SKIP_EXPECTED_REPLICAS)
        {
            return true;
        }

        let workload = match resolve_workload(&self.controller_finder, pod).await {
            Ok(workload) => workload,
            Err(source) => {
                event!(Level::ERROR, pod = %pod.name_any(), %source, "Unable to resolve workload for expected-replicas guard.");
                return false;
            }
        };

        if workload.expected_replicas <= 1 {
            return false;
        }

        let max_migrating = resolve_quantity(self.config.max_migrating_per_workload, workload.expected_replicas);
        let max_unavailable =
            resolve_quantity(self.config.max_unavailable_per_workload, workload.expected_replicas);

        workload.expected_replicas != max_migrating && workload.expected_replicas != max_unavailable
    }
}

fn max_eviction_cost_allows(pod: &Pod) -> bool {
    pod.annotations()
        .get(ANNOTATION_EVICTION_COST)
        .and_then(|raw| raw.parse::<i64>().ok())
        .map(|cost| cost <= MAX_EVICTION_COST)
        .unwrap_or(true)
}

fn reservation_allows(pod: &Pod, config: &crate::config::ArbiterConfig) -> bool {
    if config.default_job_mode != JobMode::ReservationFirst {
        return true;
    }
    config.scheduler_names.contains(scheduler_name(pod))
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
    use kube::api::ObjectMeta;
    use maplit::btreemap;

    fn pod_with_cost(cost: Option<&str>) -> Pod {
        Pod {
            metadata: ObjectMeta {
                annotations: cost.map(|c| {
                    btreemap! { ANNOTATION_EVICTION_COST.to_string() => c.to_string() }
                }),
                owner_references: Some(vec![OwnerReference {
                    controller: Some(true),
                    ..Default::default()
                }]),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn default_cost_is_allowed() {
        assert!(max_eviction_cost_allows(&pod_with_cost(None)));
    }

    #[test]
    fn cost_above_threshold_is_rejected() {
        let over = (i32::MAX as i64 + 1).to_string();
        assert!(!max_eviction_cost_allows(&pod_with_cost(Some(&over))));
    }

    #[test]
    fn cost_at_threshold_is_allowed() {
        let at = (i32::MAX as i64).to_string();
        assert!(max_eviction_cost_allows(&pod_with_cost(Some(&at))));
    }

    #[test]
    fn reservation_first_requires_whitelisted_scheduler() {
        use crate::config::ArbiterConfig;
        use std::collections::BTreeSet;

        let mut config = ArbiterConfig::default();
        config.default_job_mode = JobMode::ReservationFirst;
        config.scheduler_names = BTreeSet::from(["koord-scheduler".to_string()]);

        let mut pod = pod_with_cost(None);
        pod.spec = Some(k8s_openapi::api::core::v1::PodSpec {
            scheduler_name: Some("default-scheduler".to_string()),
            ..Default::default()
        });
        assert!(!reservation_allows(&pod, &config));

        pod.spec.as_mut().unwrap().scheduler_name = Some("koord-scheduler".to_string());
        assert!(reservation_allows(&pod, &config));
    }
}
