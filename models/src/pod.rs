//! Helpers for reading the subset of `Pod` state that admission decisions depend on.
use crate::constants::ANNOTATION_EVICT_NOW;

use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::ResourceExt;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Identifies a pod independently of whether the object itself is still reachable,
/// since a `MigrationJob`'s target pod may have since been deleted and recreated.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub struct PodRef {
    pub uid: String,
    pub namespace: String,
    pub name: String,
}

impl PodRef {
    pub fn from_pod(pod: &Pod) -> Self {
        PodRef {
            uid: pod.uid().unwrap_or_default(),
            namespace: pod.namespace().unwrap_or_default(),
            name: pod.name_any(),
        }
    }
}

/// Returns the pod's owning controller, if any (a ReplicaSet, StatefulSet, etc.).
///
/// `ControllerFinder` implementations use this reference, together with the pod's
/// namespace, to resolve the set of sibling pods belonging to the same workload.
pub fn controller_owner_ref(pod: &Pod) -> Option<&OwnerReference> {
    pod.metadata
        .owner_references
        .as_ref()?
        .iter()
        .find(|owner| owner.controller.unwrap_or(false))
}

/// A pod is "active" when it has been scheduled and has not reached a terminal phase.
///
/// Mirrors the common descheduler/evictor notion of "active" used to distinguish
/// pods that still occupy capacity from ones that are Succeeded/Failed/unknown.
pub fn pod_is_active(pod: &Pod) -> bool {
    pod.spec
        .as_ref()
        .map(|spec| !spec.node_name.unwrap_or_default().is_empty())
        .unwrap_or(false)
        && !matches!(
            pod.status.as_ref().and_then(|s| s.phase.as_deref()),
            Some("Succeeded") | Some("Failed") | None
        )
}

/// A pod is "ready" when its `Ready` condition reports `True`.
pub fn pod_is_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|condition| condition.type_ == "Ready" && condition.status == "True")
        })
        .unwrap_or(false)
}

/// A pod is "unavailable" for workload-budget accounting when it is not both active
/// and ready: `not(active AND ready)`.
pub fn pod_is_unavailable(pod: &Pod) -> bool {
    !(pod_is_active(pod) && pod_is_ready(pod))
}

/// Returns the pod's configured scheduler name, defaulting to the Kubernetes default
/// scheduler's name when unset, matching the default `PodSpec.scheduler_name` behavior.
pub fn scheduler_name(pod: &Pod) -> &str {
    pod.spec
        .as_ref()
        .and_then(|spec| spec.scheduler_name.as_deref())
        .unwrap_or("default-scheduler")
}

/// An "evict now" pod bypasses the retryable admission chain entirely: an operator
/// or automation marked it to override migration-concurrency budgets.
pub fn evict_now_requested(pod: &Pod) -> bool {
    pod.annotations()
        .get(ANNOTATION_EVICT_NOW)
        .map(|v| v == "true")
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{PodCondition, PodSpec, PodStatus};
    use kube::api::ObjectMeta;
    use maplit::btreemap;

    fn pod_with(
        node_name: Option<&str>,
        phase: Option<&str>,
        ready: Option<&str>,
    ) -> Pod {
        Pod {
            metadata: ObjectMeta::default(),
            spec: Some(PodSpec {
                node_name: node_name.map(String::from),
                ..Default::default()
            }),
            status: Some(PodStatus {
                phase: phase.map(String::from),
                conditions: ready.map(|status| {
                    vec![PodCondition {
                        type_: "Ready".to_string(),
                        status: status.to_string(),
                        ..Default::default()
                    }]
                }),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn active_requires_assigned_node_and_non_terminal_phase() {
        assert!(pod_is_active(&pod_with(Some("node-a"), Some("Running"), None)));
        assert!(!pod_is_active(&pod_with(None, Some("Running"), None)));
        assert!(!pod_is_active(&pod_with(Some("node-a"), Some("Succeeded"), None)));
        assert!(!pod_is_active(&pod_with(Some("node-a"), None, None)));
    }

    #[test]
    fn ready_requires_true_ready_condition() {
        assert!(pod_is_ready(&pod_with(Some("node-a"), Some("Running"), Some("True"))));
        assert!(!pod_is_ready(&pod_with(Some("node-a"), Some("Running"), Some("False"))));
        assert!(!pod_is_ready(&pod_with(Some("node-a"), Some("Running"), None)));
    }

    #[test]
    fn unavailable_is_not_active_and_ready() {
        let healthy = pod_with(Some("node-a"), Some("Running"), Some("True"));
        assert!(!pod_is_unavailable(&healthy));

        let not_ready = pod_with(Some("node-a"), Some("Running"), Some("False"));
        assert!(pod_is_unavailable(&not_ready));
    }

    #[test]
    fn evict_now_reads_annotation() {
        let mut pod = pod_with(Some("node-a"), Some("Running"), Some("True"));
        pod.metadata.annotations = Some(btreemap! {
            ANNOTATION_EVICT_NOW.to_string() => "true".to_string(),
        });
        assert!(evict_now_requested(&pod));
    }
}
