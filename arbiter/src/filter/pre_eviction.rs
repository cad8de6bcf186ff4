//! `PreEvictionFilter`: a final default-evictor recheck against the freshest
//! cached pod state, run immediately before a job is handed to the executor.
//! The candidate snapshot `Arbitrator::run_cycle` sorts and walks is taken
//! once at the start of the cycle; by the time a later candidate in the batch
//! reaches admission, its pod may have changed underneath it (deleted,
//! rescheduled, re-labeled). This re-runs the same safety predicate the
//! non-retryable chain already ran, against whatever the store holds now.
use super::{evictor, AdmissionFilter, ControllerFinder};
use models::job::MigrationJobStore;
use models::pod::pod_is_active;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use tracing::{event, Level};

#[async_trait]
pub trait PreEvictionFilter: Send + Sync {
    async fn pre_eviction_filter(&self, pod: &Pod) -> bool;
}

#[async_trait]
impl<S, C> PreEvictionFilter for AdmissionFilter<S, C>
where
    S: MigrationJobStore,
    C: ControllerFinder,
{
    async fn pre_eviction_filter(&self, pod: &Pod) -> bool {
        let namespace = pod.namespace().unwrap_or_default();
        let current = match self.store.get_pod(&namespace, &pod.name_any()) {
            Some(current) => current,
            None => {
                event!(Level::INFO, pod = %pod.name_any(), "Rejected at pre-eviction: pod no longer in the cache.");
                return false;
            }
        };

        if !pod_is_active(&current) {
            event!(Level::INFO, pod = %pod.name_any(), "Rejected at pre-eviction: pod is no longer active.");
            return false;
        }

        let node_labels = self.node_labels_for(&current).await;
        if !evictor::default_evictor_allows(&current, &self.config, node_labels.as_ref()) {
            event!(Level::INFO, pod = %pod.name_any(), "Rejected at pre-eviction: default evictor checks no longer pass.");
            return false;
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ArbiterConfig;
    use crate::filter::ControllerFinderError;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
    use kube::api::ObjectMeta;
    use models::job::MockMigrationJobStore;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    struct NoopControllerFinder;

    #[async_trait]
    impl ControllerFinder for NoopControllerFinder {
        async fn get_pods_for_ref(&self, _owner_ref: &OwnerReference, _namespace: &str) -> Result<Vec<Pod>, ControllerFinderError> {
            Ok(vec![])
        }
        async fn get_expected_scale_for_pod(&self, _pod: &Pod) -> Result<u32, ControllerFinderError> {
            Ok(1)
        }
        async fn get_node_labels(&self, _node_name: &str) -> Result<BTreeMap<String, String>, ControllerFinderError> {
            Ok(BTreeMap::new())
        }
    }

    fn pod(name: &str) -> Pod {
        Pod {
            metadata: ObjectMeta { name: Some(name.to_string()), namespace: Some("default".to_string()), ..Default::default() },
            spec: Some(k8s_openapi::api::core::v1::PodSpec { node_name: Some("node-a".to_string()), ..Default::default() }),
            status: Some(k8s_openapi::api::core::v1::PodStatus { phase: Some("Running".to_string()), ..Default::default() }),
        }
    }

    #[tokio::test]
    async fn rejects_when_pod_is_gone_from_the_cache() {
        let mut store = MockMigrationJobStore::new();
        store.expect_get_pod().returning(|_, _| None);
        store.expect_clone().returning(MockMigrationJobStore::new);

        let filter = AdmissionFilter::new(store, NoopControllerFinder, ArbiterConfig::default());
        assert!(!PreEvictionFilter::pre_eviction_filter(&filter, &pod("p")).await);
    }

    #[tokio::test]
    async fn admits_when_the_freshest_copy_still_passes() {
        let mut store = MockMigrationJobStore::new();
        store.expect_get_pod().returning(|_, _| Some(Arc::new(pod("p"))));
        store.expect_clone().returning(MockMigrationJobStore::new);

        let filter = AdmissionFilter::new(store, NoopControllerFinder, ArbiterConfig::default());
        assert!(PreEvictionFilter::pre_eviction_filter(&filter, &pod("p")).await);
    }
}
