//! Migration-job index queries (component C): counting and iterating jobs
//! currently active for a pod, node, namespace, or workload, against whichever
//! `PhaseAndAnnotation` predicate the caller needs.
use models::job::{MigrationJob, MigrationJobStore};
use models::pod::PodRef;

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use std::sync::Arc;

/// Which index a query runs against.
pub enum IndexScope<'a> {
    ByPodUid(&'a str),
    ByPodNamespacedName { namespace: &'a str, name: &'a str },
    ByPodNamespace(&'a str),
    ByPodNode(&'a str),
}

/// Selects which `MigrationJobPhase`/annotation combinations count as "active"
/// for a given query. See the `PhaseAndAnnotation` predicate in the data model:
/// admission counters use the stricter set; "does a job exist for this pod"
/// uses the looser one.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ActivePredicate {
    /// Running, or Pending with any annotations.
    RunningOrPending,
    /// Running, or Pending with `passed-arbitration=true`.
    RunningOrAdmittedPending,
}

impl ActivePredicate {
    fn matches(self, job: &MigrationJob) -> bool {
        use models::job::MigrationJobPhase::*;
        match (self, job.phase()) {
            (_, Running) => true,
            (ActivePredicate::RunningOrPending, Pending) => true,
            (ActivePredicate::RunningOrAdmittedPending, Pending) => job.has_passed_arbitration(),
            _ => false,
        }
    }
}

/// Iterates every job matching `scope` and `predicate`, invoking `visitor` until
/// it returns `false` or the matching set is exhausted.
pub fn for_each_active_job<S, V>(store: &S, scope: IndexScope<'_>, predicate: ActivePredicate, mut visitor: V)
where
    S: MigrationJobStore,
    V: FnMut(&Arc<MigrationJob>) -> bool,
{
    let candidates = match scope {
        IndexScope::ByPodUid(uid) => store.list_by_pod_uid(uid),
        IndexScope::ByPodNamespacedName { namespace, name } => {
            store.list_by_pod_namespaced_name(namespace, name)
        }
        IndexScope::ByPodNamespace(namespace) => store.list_by_pod_namespace(namespace),
        IndexScope::ByPodNode(node) => store.list_by_node(node),
    };

    for job in candidates.iter().filter(|job| predicate.matches(job)) {
        if !visitor(job) {
            break;
        }
    }
}

fn any_active<S: MigrationJobStore>(store: &S, scope: IndexScope<'_>, predicate: ActivePredicate) -> bool {
    let mut found = false;
    for_each_active_job(store, scope, predicate, |_| {
        found = true;
        false
    });
    found
}

/// Counts active jobs matching `scope`/`predicate`.
pub fn count_active<S: MigrationJobStore>(store: &S, scope: IndexScope<'_>, predicate: ActivePredicate) -> usize {
    let mut count = 0usize;
    for_each_active_job(store, scope, predicate, |_| {
        count += 1;
        true
    });
    count
}

/// As [`count_active`], but does not count a job whose `PodRef.uid` equals
/// `exclude_pod_uid` (the migration candidate itself).
pub fn count_active_excluding<S: MigrationJobStore>(
    store: &S,
    scope: IndexScope<'_>,
    predicate: ActivePredicate,
    exclude_pod_uid: &str,
) -> usize {
    let mut count = 0usize;
    for_each_active_job(store, scope, predicate, |job| {
        if job.spec.pod_ref.uid != exclude_pod_uid {
            count += 1;
        }
        true
    });
    count
}

/// Returns the set of pods, among `candidates`, with an active migration job
/// targeting them.
pub fn migrating_pod_refs<S: MigrationJobStore>(
    store: &S,
    namespace: &str,
    predicate: ActivePredicate,
) -> Vec<PodRef> {
    let mut refs = Vec::new();
    for_each_active_job(store, IndexScope::ByPodNamespace(namespace), predicate, |job| {
        refs.push(job.spec.pod_ref.clone());
        true
    });
    refs
}

/// True iff any job targets `pod`, preferring the UID index but falling back to
/// the namespaced-name index since `PodRef.uid` may be empty for a pod that has
/// since been deleted and recreated under the same name.
pub fn existing_pod_migration_job<S: MigrationJobStore>(store: &S, pod: &Pod) -> bool {
    let pod_ref = PodRef::from_pod(pod);

    if !pod_ref.uid.is_empty()
        && any_active(store, IndexScope::ByPodUid(&pod_ref.uid), ActivePredicate::RunningOrPending)
    {
        return true;
    }

    any_active(
        store,
        IndexScope::ByPodNamespacedName {
            namespace: &pod.namespace().unwrap_or_default(),
            name: &pod.name_any(),
        },
        ActivePredicate::RunningOrPending,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use models::job::MockMigrationJobStore;

    fn job(phase: models::job::MigrationJobPhase, passed: bool) -> Arc<MigrationJob> {
        use kube::api::ObjectMeta;
        use models::job::{MigrationJob, MigrationJobSpec, MigrationJobStatus};

        let mut metadata = ObjectMeta::default();
        if passed {
            metadata.annotations = Some(
                [(
                    models::constants::ANNOTATION_PASSED_ARBITRATION.to_string(),
                    "true".to_string(),
                )]
                .into_iter()
                .collect(),
            );
        }
        Arc::new(MigrationJob {
            metadata,
            spec: MigrationJobSpec::new(PodRef::default(), chrono::Utc::now()),
            status: Some(MigrationJobStatus {
                phase,
                reason: None,
            }),
        })
    }

    #[test]
    fn running_or_admitted_pending_excludes_unadmitted_pending() {
        use models::job::MigrationJobPhase;

        let mut store = MockMigrationJobStore::new();
        store
            .expect_list_by_pod_namespace()
            .returning(|_| vec![job(MigrationJobPhase::Pending, false)]);

        let count = count_active(
            &store,
            IndexScope::ByPodNamespace("default"),
            ActivePredicate::RunningOrAdmittedPending,
        );
        assert_eq!(count, 0);
    }

    #[test]
    fn running_or_pending_includes_unadmitted_pending() {
        use models::job::MigrationJobPhase;

        let mut store = MockMigrationJobStore::new();
        store
            .expect_list_by_pod_namespace()
            .returning(|_| vec![job(MigrationJobPhase::Pending, false)]);

        let count = count_active(
            &store,
            IndexScope::ByPodNamespace("default"),
            ActivePredicate::RunningOrPending,
        );
        assert_eq!(count, 1);
    }
}
