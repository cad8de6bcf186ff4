//! Pluggable, stably-composed comparators applied to the hydrated batch of
//! `(MigrationJob, Pod)` pairs before the filter-and-dispatch pass.
use models::job::MigrationJob;

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use std::cmp::Ordering;

pub type Candidate = (MigrationJob, Pod);
pub type SortFn = Box<dyn Fn(&Candidate, &Candidate) -> Ordering + Send + Sync>;

/// Applies each sorter in order via `Vec::sort_by`, which is a stable sort:
/// earlier sorters in the list act as tie-breakers for later ones, so the
/// *last* sorter applied dominates the final order. An empty list leaves the
/// input's insertion order untouched.
pub fn apply(candidates: &mut Vec<Candidate>, sorters: &[SortFn]) {
    for sorter in sorters {
        candidates.sort_by(|a, b| sorter(a, b));
    }
}

/// Orders candidates by their `MigrationJob` name, ascending.
pub fn by_name() -> SortFn {
    Box::new(|(a, _), (b, _)| a.name_any().cmp(&b.name_any()))
}

/// Orders candidates by the last character of the job name, ascending. Paired
/// with [`by_name`] in that order, this reproduces the sort-composition
/// scenario in the test suite: `byLastChar` dominates, with `byName` breaking
/// ties among jobs that share a last character.
pub fn by_last_char() -> SortFn {
    Box::new(|(a, _), (b, _)| {
        let last = |job: &MigrationJob| job.name_any().chars().last();
        last(a).cmp(&last(b))
    })
}

/// Orders candidates by pod creation timestamp, oldest first; a common
/// tie-breaker ensuring longest-waiting pods are considered first.
pub fn by_creation_timestamp() -> SortFn {
    Box::new(|(a, _), (b, _)| a.spec.creation_timestamp().cmp(&b.spec.creation_timestamp()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use kube::api::ObjectMeta;
    use models::job::MigrationJobSpec;
    use models::pod::PodRef;

    fn candidate(name: &str) -> Candidate {
        let job = MigrationJob {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec: MigrationJobSpec::new(PodRef::default(), Utc::now()),
            status: None,
        };
        (job, Pod::default())
    }

    #[test]
    fn s4_sort_composition_last_sorter_dominates() {
        let names: Vec<String> = (1..=20).map(|n| format!("test-job-{}", n)).collect();
        let mut candidates: Vec<Candidate> = names.iter().map(|n| candidate(n)).collect();

        apply(&mut candidates, &[by_name(), by_last_char()]);

        let sorted_names: Vec<String> = candidates
            .iter()
            .map(|(job, _)| job.name_any())
            .collect();

        let expected = vec![
            "test-job-10",
            "test-job-20",
            "test-job-1",
            "test-job-11",
            "test-job-12",
            "test-job-2",
            "test-job-13",
            "test-job-3",
            "test-job-14",
            "test-job-4",
            "test-job-15",
            "test-job-5",
            "test-job-16",
            "test-job-6",
            "test-job-17",
            "test-job-7",
            "test-job-18",
            "test-job-8",
            "test-job-19",
            "test-job-9",
        ];
        assert_eq!(sorted_names, expected);
    }

    #[test]
    fn empty_sorter_list_preserves_insertion_order() {
        let names = vec!["b", "a", "c"];
        let mut candidates: Vec<Candidate> = names.iter().map(|n| candidate(n)).collect();
        apply(&mut candidates, &[]);
        let sorted_names: Vec<String> = candidates.iter().map(|(job, _)| job.name_any()).collect();
        assert_eq!(sorted_names, vec!["b", "a", "c"]);
    }
}
