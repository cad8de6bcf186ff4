/// Helper macro to avoid retyping the base domain-like name of our system when creating further
/// string constants from it. When given no parameters, this returns the base domain-like name of
/// the system. When given a string literal parameter it adds `/parameter` to the end.
#[macro_export]
macro_rules! koordinator_domain {
    () => {
        "scheduling.koordinator.sh"
    };
    ($s:literal) => {
        concat!(koordinator_domain!(), "/", $s)
    };
}

pub const API_VERSION: &str = koordinator_domain!("v1alpha1");
pub const NAMESPACE: &str = "koordinator-system";
pub const ARBITER: &str = "descheduler-arbiter";
pub const KOORDINATOR_DOMAIN_LIKE_NAME: &str = koordinator_domain!();

// Annotation keys recognized on `MigrationJob` and `Pod` objects.
pub const ANNOTATION_PASSED_ARBITRATION: &str = koordinator_domain!("passed-arbitration");
pub const ANNOTATION_EVICTION_COST: &str = koordinator_domain!("eviction-cost");
pub const ANNOTATION_SKIP_EXPECTED_REPLICAS: &str =
    koordinator_domain!("skip-check-expected-replicas");
pub const ANNOTATION_EVICT_NOW: &str = koordinator_domain!("evict-pod-if-not-succeeded-after");

// Standard tags https://kubernetes.io/docs/concepts/overview/working-with-objects/common-labels/
pub const APP_NAME: &str = "app.kubernetes.io/name";
pub const APP_INSTANCE: &str = "app.kubernetes.io/instance";
pub const APP_COMPONENT: &str = "app.kubernetes.io/component";
pub const APP_PART_OF: &str = "app.kubernetes.io/part-of";
pub const APP_MANAGED_BY: &str = "app.kubernetes.io/managed-by";
