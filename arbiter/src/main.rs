use arbiter::config::ArbiterConfig;
use arbiter::controller_finder::KubeControllerFinder;
use arbiter::error::{self, Result};
use arbiter::filter::AdmissionFilter;
use arbiter::metrics::ArbiterMetrics;
use arbiter::queue::InMemoryWorkQueue;
use arbiter::sort;
use arbiter::Arbitrator;
use models::constants::NAMESPACE;
use models::job::{KubeMigrationJobStore, MigrationJob};

use futures::stream::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams};
use kube::runtime::reflector;
use kube::runtime::watcher::{watcher, Event};
use kube::ResourceExt;
use opentelemetry::global;
use snafu::ResultExt;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::{event, Level};

/// Jobs are drained into this queue once they pass arbitration; an external
/// executor is expected to pop from it and carry out the actual eviction. This
/// binary only logs what it would hand off, since the executor is outside
/// this subsystem's scope.
async fn drain_queue(queue: Arc<InMemoryWorkQueue>) {
    loop {
        if let Some(job_ref) = queue.pop() {
            event!(Level::INFO, namespace = %job_ref.namespace, name = %job_ref.name, "Job ready for the eviction executor.");
        }
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    }
}

/// `kube`'s `watcher()` only distinguishes `Applied`/`Deleted`/`Restarted`, not
/// the four-way Create/Update/Delete/Generic split the Arbitrator exposes; this
/// tracks UIDs already observed so an `Applied` event can be routed to
/// `handle_create` the first time and `handle_update` afterward.
fn dispatch_job_event<S, C, Q>(
    arbitrator: &Arbitrator<S, C, Q>,
    seen: &Mutex<HashSet<String>>,
    event: Event<MigrationJob>,
) where
    S: models::job::MigrationJobStore,
    C: arbiter::filter::ControllerFinder,
    Q: arbiter::queue::WorkQueue,
{
    match event {
        Event::Applied(job) => {
            let job = Arc::new(job);
            let uid = job.uid().unwrap_or_default();
            let first_seen = seen.lock().unwrap().insert(uid);
            if first_seen {
                arbitrator.handle_create(job);
            } else {
                arbitrator.handle_update(job);
            }
        }
        Event::Deleted(job) => {
            seen.lock().unwrap().remove(&job.uid().unwrap_or_default());
            arbitrator.handle_delete(Arc::new(job));
        }
        Event::Restarted(jobs) => {
            for job in jobs {
                seen.lock().unwrap().insert(job.uid().unwrap_or_default());
                arbitrator.handle_generic(Arc::new(job));
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    models::telemetry::init_telemetry_from_env().context(error::TracingConfigurationSnafu)?;

    // A real deployment runs this process alongside the koordinator-descheduler's
    // `opentelemetry_prometheus` exporter, which installs the global meter
    // provider the way the teacher's `apiserver` crate does; this binary only
    // records against whatever provider (or no-op) is already installed.
    let k8s_client = kube::client::Client::try_default()
        .await
        .context(error::ClientCreateSnafu)?;

    let config = ArbiterConfig::from_environment().context(error::ConfigFromEnvironmentSnafu)?;

    let jobs_api = Api::<MigrationJob>::namespaced(k8s_client.clone(), NAMESPACE);
    let job_store_writer = reflector::store::Writer::<MigrationJob>::default();
    let job_reader = job_store_writer.as_reader();

    let pods_api = Api::<Pod>::namespaced(k8s_client.clone(), NAMESPACE);
    let pod_store_writer = reflector::store::Writer::<Pod>::default();
    let pod_reader = pod_store_writer.as_reader();

    let job_store = KubeMigrationJobStore::new(k8s_client.clone(), NAMESPACE, job_reader, pod_reader.clone());
    let controller_finder = KubeControllerFinder::new(k8s_client.clone());
    let admission_filter = AdmissionFilter::new(job_store, controller_finder, config.clone());

    let meter = global::meter("arbiter");
    let metrics = ArbiterMetrics::new(meter);

    let sorters = vec![sort::by_creation_timestamp(), sort::by_name()];
    let queue = Arc::new(InMemoryWorkQueue::new());
    let arbitrator = Arc::new(Arbitrator::new(admission_filter, Arc::clone(&queue), sorters, metrics));
    let seen_job_uids: Arc<Mutex<HashSet<String>>> = Arc::new(Mutex::new(HashSet::new()));

    let (stop_tx, stop_rx) = watch::channel(false);

    let job_reflector = reflector::reflector(job_store_writer, watcher(jobs_api, ListParams::default()));
    let job_drainer = job_reflector
        .filter_map(|event| async move { std::result::Result::ok(event) })
        .for_each({
            let arbitrator = Arc::clone(&arbitrator);
            let seen_job_uids = Arc::clone(&seen_job_uids);
            move |event| {
                dispatch_job_event(&arbitrator, &seen_job_uids, event);
                futures::future::ready(())
            }
        });

    let pod_reflector = reflector::reflector(pod_store_writer, watcher(pods_api, ListParams::default()));
    let pod_drainer = pod_reflector.for_each(|event| {
        if let Err(source) = event {
            event!(Level::WARN, %source, "Pod watch stream error.");
        }
        futures::future::ready(())
    });

    let cycle_interval = config.cycle_interval;
    let arbitrator_for_cycle = Arc::clone(&arbitrator);
    let cycle_loop = arbitrator_for_cycle.run(cycle_interval, stop_rx);

    let queue_drainer = drain_queue(queue);

    tokio::select! {
        _ = job_drainer => {
            event!(Level::ERROR, "MigrationJob reflector drained unexpectedly.");
        }
        _ = pod_drainer => {
            event!(Level::ERROR, "Pod reflector drained unexpectedly.");
        }
        _ = cycle_loop => {
            event!(Level::ERROR, "Arbitration cycle loop exited unexpectedly.");
        }
        _ = queue_drainer => {}
        _ = tokio::signal::ctrl_c() => {
            event!(Level::INFO, "Received shutdown signal.");
            let _ = stop_tx.send(true);
        }
    };

    Ok(())
}
