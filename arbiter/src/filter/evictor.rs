//! The default evictor's safety checks: the same baseline a descheduler plugin
//! applies before it will ever consider evicting a pod, independent of migration
//! concurrency budgets.
use crate::config::ArbiterConfig;

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use std::collections::BTreeMap;

const SYSTEM_CRITICAL_PRIORITY_CLASSES: &[&str] =
    &["system-cluster-critical", "system-node-critical"];

/// Evaluates the baseline safety predicate a migration candidate must pass
/// regardless of concurrency budgets: not system-critical (unless opted in),
/// not using local storage (unless opted in), not backed by a PVC (unless
/// opted in), not a failed bare pod (unless opted in), at or below the
/// configured priority threshold, matching any configured label selector,
/// node selector and namespace include/exclude lists, and (narrowly) still
/// fitting the node it's currently scheduled on.
///
/// `node_labels` is the label set of the node the pod is currently scheduled
/// onto; callers that haven't resolved it (e.g. no `NodeSelector`/`NodeFit`
/// configured) may pass `None`, in which case those two checks are skipped.
pub fn default_evictor_allows(pod: &Pod, config: &ArbiterConfig, node_labels: Option<&BTreeMap<String, String>>) -> bool {
    if !config.evict_system_critical_pods && is_system_critical(pod) {
        return false;
    }
    if !config.evict_local_storage_pods && uses_local_storage(pod) {
        return false;
    }
    if config.ignore_pvc_pods && uses_pvc(pod) {
        return false;
    }
    if !config.evict_failed_bare_pods && is_failed_bare_pod(pod) {
        return false;
    }
    if let Some(threshold) = config.priority_threshold {
        if pod.spec.as_ref().and_then(|s| s.priority).unwrap_or(0) > threshold {
            return false;
        }
    }
    if !namespace_allows(pod, config) {
        return false;
    }
    if !label_selector_allows(pod, &config.label_selector) {
        return false;
    }
    if let Some(node_labels) = node_labels {
        if !config.node_selector.is_empty() && !is_subset(&config.node_selector, node_labels) {
            return false;
        }
        if config.node_fit && !node_fit_allows(pod, node_labels) {
            return false;
        }
    }
    true
}

fn is_system_critical(pod: &Pod) -> bool {
    pod.spec
        .as_ref()
        .and_then(|spec| spec.priority_class_name.as_deref())
        .map(|class| SYSTEM_CRITICAL_PRIORITY_CLASSES.contains(&class))
        .unwrap_or(false)
}

fn uses_local_storage(pod: &Pod) -> bool {
    pod.spec
        .as_ref()
        .and_then(|spec| spec.volumes.as_ref())
        .map(|volumes| volumes.iter().any(|v| v.empty_dir.is_some() || v.host_path.is_some()))
        .unwrap_or(false)
}

fn uses_pvc(pod: &Pod) -> bool {
    pod.spec
        .as_ref()
        .and_then(|spec| spec.volumes.as_ref())
        .map(|volumes| volumes.iter().any(|v| v.persistent_volume_claim.is_some()))
        .unwrap_or(false)
}

/// A "bare" pod has no controller owner; bare pods that have already failed are
/// excluded by default since nothing will recreate them after eviction.
fn is_failed_bare_pod(pod: &Pod) -> bool {
    let has_controller = pod
        .metadata
        .owner_references
        .as_ref()
        .map(|owners| owners.iter().any(|o| o.controller.unwrap_or(false)))
        .unwrap_or(false);
    let failed = pod.status.as_ref().and_then(|s| s.phase.as_deref()) == Some("Failed");
    !has_controller && failed
}

fn namespace_allows(pod: &Pod, config: &ArbiterConfig) -> bool {
    let namespace = pod.namespace().unwrap_or_default();
    if !config.namespaces_include.is_empty() {
        return config.namespaces_include.contains(&namespace);
    }
    !config.namespaces_exclude.contains(&namespace)
}

fn label_selector_allows(pod: &Pod, selector: &BTreeMap<String, String>) -> bool {
    if selector.is_empty() {
        return true;
    }
    is_subset(selector, pod.labels())
}

/// `node_fit`'s narrow scope: a pod whose own `spec.nodeSelector` no longer
/// matches the node it's scheduled on doesn't "fit" where it is. Full
/// scheduler simulation against other candidate nodes is out of scope.
fn node_fit_allows(pod: &Pod, node_labels: &BTreeMap<String, String>) -> bool {
    let pod_node_selector = pod.spec.as_ref().and_then(|s| s.node_selector.as_ref());
    match pod_node_selector {
        Some(selector) => is_subset(selector, node_labels),
        None => true,
    }
}

fn is_subset(required: &BTreeMap<String, String>, actual: &BTreeMap<String, String>) -> bool {
    required.iter().all(|(k, v)| actual.get(k) == Some(v))
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{PersistentVolumeClaimVolumeSource, PodSpec, PodStatus, Volume};
    use kube::api::ObjectMeta;
    use maplit::btreemap;

    fn pod(priority_class: Option<&str>, phase: Option<&str>, has_owner: bool) -> Pod {
        Pod {
            metadata: ObjectMeta {
                owner_references: has_owner.then(|| {
                    vec![k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference {
                        controller: Some(true),
                        ..Default::default()
                    }]
                }),
                ..Default::default()
            },
            spec: Some(PodSpec {
                priority_class_name: priority_class.map(String::from),
                ..Default::default()
            }),
            status: Some(PodStatus {
                phase: phase.map(String::from),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn rejects_system_critical_pods_by_default() {
        let config = ArbiterConfig::default();
        let critical = pod(Some("system-cluster-critical"), None, true);
        assert!(!default_evictor_allows(&critical, &config, None));
    }

    #[test]
    fn allows_system_critical_pods_when_opted_in() {
        let mut config = ArbiterConfig::default();
        config.evict_system_critical_pods = true;
        let critical = pod(Some("system-cluster-critical"), None, true);
        assert!(default_evictor_allows(&critical, &config, None));
    }

    #[test]
    fn rejects_failed_bare_pods_by_default() {
        let config = ArbiterConfig::default();
        let bare_failed = pod(None, Some("Failed"), false);
        assert!(!default_evictor_allows(&bare_failed, &config, None));
    }

    #[test]
    fn local_storage_volume_triggers_rejection() {
        let config = ArbiterConfig::default();
        let mut with_local_storage = pod(None, None, true);
        with_local_storage.spec.as_mut().unwrap().volumes = Some(vec![Volume {
            name: "scratch".to_string(),
            empty_dir: Some(Default::default()),
            ..Default::default()
        }]);
        assert!(!default_evictor_allows(&with_local_storage, &config, None));
    }

    #[test]
    fn priority_above_threshold_is_rejected() {
        let mut config = ArbiterConfig::default();
        config.priority_threshold = Some(10);
        let mut high_priority = pod(None, None, true);
        high_priority.spec.as_mut().unwrap().priority = Some(20);
        assert!(!default_evictor_allows(&high_priority, &config, None));
    }

    #[test]
    fn pvc_pods_are_rejected_when_ignore_pvc_pods_is_set() {
        let config = ArbiterConfig::default();
        let mut with_pvc = pod(None, None, true);
        with_pvc.spec.as_mut().unwrap().volumes = Some(vec![Volume {
            name: "data".to_string(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: "data-claim".to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }]);
        assert!(!default_evictor_allows(&with_pvc, &config, None));

        let mut allowing = config.clone();
        allowing.ignore_pvc_pods = false;
        assert!(default_evictor_allows(&with_pvc, &allowing, None));
    }

    #[test]
    fn namespace_include_list_restricts_eligibility() {
        let mut config = ArbiterConfig::default();
        config.namespaces_include = std::collections::BTreeSet::from(["kube-system".to_string()]);

        let mut in_other_ns = pod(None, None, true);
        in_other_ns.metadata.namespace = Some("default".to_string());
        assert!(!default_evictor_allows(&in_other_ns, &config, None));

        let mut in_included_ns = pod(None, None, true);
        in_included_ns.metadata.namespace = Some("kube-system".to_string());
        assert!(default_evictor_allows(&in_included_ns, &config, None));
    }

    #[test]
    fn namespace_exclude_list_rejects_matching_namespace() {
        let mut config = ArbiterConfig::default();
        config.namespaces_exclude = std::collections::BTreeSet::from(["kube-system".to_string()]);

        let mut excluded = pod(None, None, true);
        excluded.metadata.namespace = Some("kube-system".to_string());
        assert!(!default_evictor_allows(&excluded, &config, None));
    }

    #[test]
    fn label_selector_requires_matching_labels() {
        let mut config = ArbiterConfig::default();
        config.label_selector = btreemap! { "app".to_string() => "web".to_string() };

        let mut unlabeled = pod(None, None, true);
        assert!(!default_evictor_allows(&unlabeled, &config, None));

        unlabeled.metadata.labels = Some(btreemap! { "app".to_string() => "web".to_string() });
        assert!(default_evictor_allows(&unlabeled, &config, None));
    }

    #[test]
    fn node_selector_requires_matching_node_labels() {
        let mut config = ArbiterConfig::default();
        config.node_selector = btreemap! { "zone".to_string() => "us-east".to_string() };
        let candidate = pod(None, None, true);

        let mismatched = btreemap! { "zone".to_string() => "us-west".to_string() };
        assert!(!default_evictor_allows(&candidate, &config, Some(&mismatched)));

        let matching = btreemap! { "zone".to_string() => "us-east".to_string() };
        assert!(default_evictor_allows(&candidate, &config, Some(&matching)));
    }

    #[test]
    fn node_fit_rejects_pod_whose_own_node_selector_no_longer_matches() {
        let mut config = ArbiterConfig::default();
        config.node_fit = true;

        let mut candidate = pod(None, None, true);
        candidate.spec.as_mut().unwrap().node_selector =
            Some(btreemap! { "disk".to_string() => "ssd".to_string() });

        let mismatched = btreemap! { "disk".to_string() => "hdd".to_string() };
        assert!(!default_evictor_allows(&candidate, &config, Some(&mismatched)));

        let matching = btreemap! { "disk".to_string() => "ssd".to_string() };
        assert!(default_evictor_allows(&candidate, &config, Some(&matching)));
    }
}
