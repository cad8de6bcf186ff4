//! The admission filter (component D): composes the non-retryable and retryable
//! predicate chains described in the component design, plus the `Filter`
//! de-duplication check run before a migration job is ever created.
pub mod evictor;
mod non_retryable;
mod pre_eviction;
mod retryable;
pub mod quantity;

pub use non_retryable::NonRetryablePodFilter;
pub use pre_eviction::PreEvictionFilter;
pub use retryable::{RetryablePodFilter, TrackEvictedPod};

use crate::config::ArbiterConfig;
use crate::limiter::ObjectLimiters;
use models::job::MigrationJobStore;
use models::pod::PodRef;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use snafu::{OptionExt, Snafu};
use std::collections::BTreeMap;
use std::sync::Mutex;

/// Resolves a pod back to its owning workload, external to this subsystem (the
/// descheduler's own ReplicaSet/StatefulSet-aware controller-finder).
#[async_trait]
pub trait ControllerFinder: Send + Sync {
    async fn get_pods_for_ref(
        &self,
        owner_ref: &OwnerReference,
        namespace: &str,
    ) -> Result<Vec<Pod>, ControllerFinderError>;

    async fn get_expected_scale_for_pod(&self, pod: &Pod) -> Result<u32, ControllerFinderError>;

    /// Resolves the labels of the node a pod is currently scheduled onto, for
    /// the `NodeSelector`/`NodeFit` default-evictor checks.
    async fn get_node_labels(&self, node_name: &str) -> Result<BTreeMap<String, String>, ControllerFinderError>;
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ControllerFinderError {
    #[snafu(display("Pod '{}/{}' has no controller owner reference", namespace, name))]
    NoController { namespace: String, name: String },

    #[snafu(display("Unable to list pods for owner via kubernetes API: '{}'", source))]
    ListPods { source: kube::Error },

    #[snafu(display("Unable to fetch node '{}' via kubernetes API: '{}'", name, source))]
    GetNode { name: String, source: kube::Error },
}

/// De-duplication check run before a migration job is created for a pod: a pod
/// already targeted by an active job cannot be targeted again.
pub trait Filter: Send + Sync {
    fn filter(&self, pod: &Pod) -> bool;
}

/// Composes the non-retryable and retryable chains, the NUMA-adjacent
/// workload-limiter state, and the de-duplication check into the single
/// object the Arbitrator's cycle and external plugin callers both use.
pub struct AdmissionFilter<S, C> {
    pub(crate) store: S,
    pub(crate) controller_finder: C,
    pub(crate) config: ArbiterConfig,
    pub(crate) limiters: Mutex<ObjectLimiters>,
}

impl<S, C> AdmissionFilter<S, C>
where
    S: MigrationJobStore,
    C: ControllerFinder,
{
    pub fn new(store: S, controller_finder: C, config: ArbiterConfig) -> Self {
        let limiters = Mutex::new(ObjectLimiters::new(config.object_limiter_duration));
        AdmissionFilter {
            store,
            controller_finder,
            config,
            limiters,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Resolves the current node's labels for a pod, only when the default
    /// evictor's node-selector/node-fit checks are actually configured; those
    /// are the only checks that need this, and most clusters never enable them.
    pub(crate) async fn node_labels_for(&self, pod: &Pod) -> Option<BTreeMap<String, String>> {
        if self.config.node_selector.is_empty() && !self.config.node_fit {
            return None;
        }
        let node_name = pod.spec.as_ref().and_then(|s| s.node_name.as_deref())?;
        match self.controller_finder.get_node_labels(node_name).await {
            Ok(labels) => Some(labels),
            Err(source) => {
                tracing::event!(tracing::Level::WARN, pod = %kube::ResourceExt::name_any(pod), node = node_name, %source, "Unable to resolve node labels for evictor checks.");
                None
            }
        }
    }
}

impl<S, C> Filter for AdmissionFilter<S, C>
where
    S: MigrationJobStore,
    C: ControllerFinder,
{
    fn filter(&self, pod: &Pod) -> bool {
        !crate::index::existing_pod_migration_job(&self.store, pod)
    }
}

/// The workload a pod belongs to, as resolved once per filter call and shared
/// across the retryable chain's per-workload checks.
pub(crate) struct WorkloadContext {
    pub owner_ref: OwnerReference,
    pub expected_replicas: u32,
    pub sibling_pods: Vec<Pod>,
}

pub(crate) async fn resolve_workload<C: ControllerFinder>(
    controller_finder: &C,
    pod: &Pod,
) -> Result<WorkloadContext, ControllerFinderError> {
    use kube::ResourceExt;

    let owner_ref = models::pod::controller_owner_ref(pod)
        .cloned()
        .context(NoControllerSnafu {
            namespace: pod.namespace().unwrap_or_default(),
            name: pod.name_any(),
        })?;
    let namespace = pod.namespace().unwrap_or_default();
    let sibling_pods = controller_finder.get_pods_for_ref(&owner_ref, &namespace).await?;
    let expected_replicas = controller_finder.get_expected_scale_for_pod(pod).await?;

    Ok(WorkloadContext {
        owner_ref,
        expected_replicas,
        sibling_pods,
    })
}

pub(crate) fn pod_ref(pod: &Pod) -> PodRef {
    PodRef::from_pod(pod)
}
