//! Typed configuration for the arbitration subsystem, loaded from environment
//! variables and validated with `validator`, following the teacher's
//! `BrupopCronScheduler::from_environment()` pattern.
use crate::filter::quantity::Quantity;

use std::collections::{BTreeMap, BTreeSet};
use std::env;
use std::str::FromStr;
use std::time::Duration;

use config_error::{InvalidQuantitySnafu, InvalidSchedulerNamesSnafu, UnableParseToU32Snafu};
use snafu::ResultExt;
use tokio::time::Duration as TokioDuration;
use validator::Validate;

const MAX_MIGRATING_PER_NODE_ENV_VAR: &str = "MAX_MIGRATING_PER_NODE";
const MAX_MIGRATING_PER_NAMESPACE_ENV_VAR: &str = "MAX_MIGRATING_PER_NAMESPACE";
const MAX_MIGRATING_PER_WORKLOAD_ENV_VAR: &str = "MAX_MIGRATING_PER_WORKLOAD";
const MAX_UNAVAILABLE_PER_WORKLOAD_ENV_VAR: &str = "MAX_UNAVAILABLE_PER_WORKLOAD";
const SKIP_CHECK_EXPECTED_REPLICAS_ENV_VAR: &str = "SKIP_CHECK_EXPECTED_REPLICAS";
const DEFAULT_JOB_MODE_ENV_VAR: &str = "DEFAULT_JOB_MODE";
const SCHEDULER_NAMES_ENV_VAR: &str = "SCHEDULER_NAMES";
const OBJECT_LIMITER_DURATION_SECS_ENV_VAR: &str = "OBJECT_LIMITER_DURATION_SECS";
const PRIORITY_THRESHOLD_ENV_VAR: &str = "PRIORITY_THRESHOLD";
const EVICT_LOCAL_STORAGE_PODS_ENV_VAR: &str = "EVICT_LOCAL_STORAGE_PODS";
const EVICT_SYSTEM_CRITICAL_PODS_ENV_VAR: &str = "EVICT_SYSTEM_CRITICAL_PODS";
const IGNORE_PVC_PODS_ENV_VAR: &str = "IGNORE_PVC_PODS";
const EVICT_FAILED_BARE_PODS_ENV_VAR: &str = "EVICT_FAILED_BARE_PODS";
const CYCLE_INTERVAL_SECS_ENV_VAR: &str = "CYCLE_INTERVAL_SECS";
const LABEL_SELECTOR_ENV_VAR: &str = "LABEL_SELECTOR";
const NODE_SELECTOR_ENV_VAR: &str = "NODE_SELECTOR";
const NAMESPACES_INCLUDE_ENV_VAR: &str = "NAMESPACES_INCLUDE";
const NAMESPACES_EXCLUDE_ENV_VAR: &str = "NAMESPACES_EXCLUDE";
const NODE_FIT_ENV_VAR: &str = "NODE_FIT";

const DEFAULT_OBJECT_LIMITER_DURATION_SECS: u64 = 60;
const DEFAULT_CYCLE_INTERVAL_SECS: u64 = 2;

/// The job admission mode this arbiter enforces.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub enum JobMode {
    #[default]
    EvictDirectly,
    /// Migration is only permitted for pods whose scheduler is in [`ArbiterConfig::scheduler_names`].
    ReservationFirst,
}

impl FromStr for JobMode {
    type Err = config_error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "EvictDirectly" => Ok(JobMode::EvictDirectly),
            "ReservationFirst" => Ok(JobMode::ReservationFirst),
            other => config_error::UnknownJobModeSnafu {
                value: other.to_string(),
            }
            .fail(),
        }
    }
}

/// Typed, validated configuration for the arbitration subsystem. Mirrors the
/// option table this core is specified against; everything here is passed
/// through to the admission filter chain or the arbitration cycle scheduler.
#[derive(Clone, Debug, Validate)]
#[validate(schema(function = "validate_durations_are_positive"))]
pub struct ArbiterConfig {
    pub max_migrating_per_node: Option<u32>,
    pub max_migrating_per_namespace: Option<u32>,
    pub max_migrating_per_workload: Quantity,
    pub max_unavailable_per_workload: Quantity,
    pub skip_check_expected_replicas: bool,
    pub default_job_mode: JobMode,
    pub scheduler_names: BTreeSet<String>,
    pub object_limiter_duration: Duration,
    pub priority_threshold: Option<i32>,
    pub evict_local_storage_pods: bool,
    pub evict_system_critical_pods: bool,
    pub ignore_pvc_pods: bool,
    pub evict_failed_bare_pods: bool,
    pub cycle_interval: TokioDuration,
    /// Only pods whose labels are a superset of this map are eligible for migration.
    pub label_selector: BTreeMap<String, String>,
    /// Only pods scheduled onto a node whose labels are a superset of this map are eligible.
    pub node_selector: BTreeMap<String, String>,
    /// When non-empty, only these namespaces are considered; takes precedence over `namespaces_exclude`.
    pub namespaces_include: BTreeSet<String>,
    pub namespaces_exclude: BTreeSet<String>,
    /// Narrow "does this pod still fit where it is" check: when a pod's own
    /// `nodeSelector` no longer matches the node it's currently scheduled on,
    /// it is excluded rather than migrated. This subsystem has no cluster-wide
    /// node inventory to simulate full scheduler fit against other nodes.
    pub node_fit: bool,
}

impl Default for ArbiterConfig {
    fn default() -> Self {
        ArbiterConfig {
            max_migrating_per_node: None,
            max_migrating_per_namespace: None,
            max_migrating_per_workload: Quantity::Absolute(1),
            max_unavailable_per_workload: Quantity::Percent(10),
            skip_check_expected_replicas: false,
            default_job_mode: JobMode::default(),
            scheduler_names: BTreeSet::new(),
            object_limiter_duration: Duration::from_secs(DEFAULT_OBJECT_LIMITER_DURATION_SECS),
            priority_threshold: None,
            evict_local_storage_pods: false,
            evict_system_critical_pods: false,
            ignore_pvc_pods: true,
            evict_failed_bare_pods: false,
            cycle_interval: TokioDuration::from_secs(DEFAULT_CYCLE_INTERVAL_SECS),
            label_selector: BTreeMap::new(),
            node_selector: BTreeMap::new(),
            namespaces_include: BTreeSet::new(),
            namespaces_exclude: BTreeSet::new(),
            node_fit: false,
        }
    }
}

impl ArbiterConfig {
    pub fn from_environment() -> config_error::Result<Self> {
        let mut config = ArbiterConfig {
            max_migrating_per_node: optional_u32_from_env(MAX_MIGRATING_PER_NODE_ENV_VAR)?,
            max_migrating_per_namespace: optional_u32_from_env(
                MAX_MIGRATING_PER_NAMESPACE_ENV_VAR,
            )?,
            ..ArbiterConfig::default()
        };

        if let Some(raw) = env::var(MAX_MIGRATING_PER_WORKLOAD_ENV_VAR).ok() {
            config.max_migrating_per_workload =
                Quantity::parse(&raw).context(InvalidQuantitySnafu { raw })?;
        }
        if let Some(raw) = env::var(MAX_UNAVAILABLE_PER_WORKLOAD_ENV_VAR).ok() {
            config.max_unavailable_per_workload =
                Quantity::parse(&raw).context(InvalidQuantitySnafu { raw })?;
        }
        if let Some(raw) = env::var(SKIP_CHECK_EXPECTED_REPLICAS_ENV_VAR).ok() {
            config.skip_check_expected_replicas = raw.eq_ignore_ascii_case("true");
        }
        if let Some(raw) = env::var(DEFAULT_JOB_MODE_ENV_VAR).ok() {
            config.default_job_mode = raw.parse()?;
        }
        if let Some(raw) = env::var(SCHEDULER_NAMES_ENV_VAR).ok() {
            config.scheduler_names = raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        if config.default_job_mode == JobMode::ReservationFirst && config.scheduler_names.is_empty()
        {
            return InvalidSchedulerNamesSnafu {
                message:
                    "DEFAULT_JOB_MODE=ReservationFirst requires at least one entry in SCHEDULER_NAMES"
                        .to_string(),
            }
            .fail();
        }
        if let Some(secs) = optional_u64_from_env(OBJECT_LIMITER_DURATION_SECS_ENV_VAR)? {
            config.object_limiter_duration = Duration::from_secs(secs);
        }
        config.priority_threshold = optional_i32_from_env(PRIORITY_THRESHOLD_ENV_VAR)?;
        if let Some(raw) = env::var(EVICT_LOCAL_STORAGE_PODS_ENV_VAR).ok() {
            config.evict_local_storage_pods = raw.eq_ignore_ascii_case("true");
        }
        if let Some(raw) = env::var(EVICT_SYSTEM_CRITICAL_PODS_ENV_VAR).ok() {
            config.evict_system_critical_pods = raw.eq_ignore_ascii_case("true");
        }
        if let Some(raw) = env::var(IGNORE_PVC_PODS_ENV_VAR).ok() {
            config.ignore_pvc_pods = raw.eq_ignore_ascii_case("true");
        }
        if let Some(raw) = env::var(EVICT_FAILED_BARE_PODS_ENV_VAR).ok() {
            config.evict_failed_bare_pods = raw.eq_ignore_ascii_case("true");
        }
        if let Some(secs) = optional_u64_from_env(CYCLE_INTERVAL_SECS_ENV_VAR)? {
            config.cycle_interval = TokioDuration::from_secs(secs);
        }
        if let Some(raw) = env::var(LABEL_SELECTOR_ENV_VAR).ok() {
            config.label_selector = parse_label_map(&raw);
        }
        if let Some(raw) = env::var(NODE_SELECTOR_ENV_VAR).ok() {
            config.node_selector = parse_label_map(&raw);
        }
        if let Some(raw) = env::var(NAMESPACES_INCLUDE_ENV_VAR).ok() {
            config.namespaces_include = parse_set(&raw);
        }
        if let Some(raw) = env::var(NAMESPACES_EXCLUDE_ENV_VAR).ok() {
            config.namespaces_exclude = parse_set(&raw);
        }
        if let Some(raw) = env::var(NODE_FIT_ENV_VAR).ok() {
            config.node_fit = raw.eq_ignore_ascii_case("true");
        }

        config.validate().context(config_error::ValidationSnafu)?;
        Ok(config)
    }
}

fn validate_durations_are_positive(config: &ArbiterConfig) -> Result<(), validator::ValidationError> {
    if config.object_limiter_duration.is_zero() || config.cycle_interval.is_zero() {
        return Err(validator::ValidationError::new(
            "object_limiter_duration and cycle_interval must both be non-zero",
        ));
    }
    Ok(())
}

fn parse_label_map(raw: &str) -> BTreeMap<String, String> {
    raw.split(',')
        .filter_map(|pair| pair.trim().split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect()
}

fn parse_set(raw: &str) -> BTreeSet<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn optional_u32_from_env(var: &str) -> config_error::Result<Option<u32>> {
    match env::var(var) {
        Ok(raw) => Ok(Some(raw.parse().context(UnableParseToU32Snafu {
            variable: var.to_string(),
        })?)),
        Err(_) => Ok(None),
    }
}

fn optional_u64_from_env(var: &str) -> config_error::Result<Option<u64>> {
    match env::var(var) {
        Ok(raw) => Ok(Some(raw.parse().map_err(|_| {
            config_error::Error::UnableParseToU32 {
                variable: var.to_string(),
            }
        })?)),
        Err(_) => Ok(None),
    }
}

fn optional_i32_from_env(var: &str) -> config_error::Result<Option<i32>> {
    match env::var(var) {
        Ok(raw) => Ok(Some(raw.parse().map_err(|_| {
            config_error::Error::UnableParseToU32 {
                variable: var.to_string(),
            }
        })?)),
        Err(_) => Ok(None),
    }
}

pub mod config_error {
    use snafu::Snafu;

    pub type Result<T> = std::result::Result<T, Error>;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub))]
    pub enum Error {
        #[snafu(display("Could not parse environment variable '{}' as a number: '{}'", variable, source))]
        UnableParseToU32 {
            source: std::num::ParseIntError,
            variable: String,
        },

        #[snafu(display("Invalid quantity '{}': '{}'", raw, source))]
        InvalidQuantity {
            source: super::super::filter::quantity::QuantityParseError,
            raw: String,
        },

        #[snafu(display("Unknown job mode '{}', expected one of EvictDirectly, ReservationFirst", value))]
        UnknownJobMode { value: String },

        #[snafu(display("Invalid scheduler name configuration: '{}'", message))]
        InvalidSchedulerNames { message: String },

        #[snafu(display("Configuration failed validation: '{}'", source))]
        Validation { source: validator::ValidationErrors },
    }
}
