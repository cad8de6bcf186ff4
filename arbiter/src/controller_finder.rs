//! A `ControllerFinder` backed by the live Kubernetes API: resolves a pod's
//! owning `ReplicaSet`/`StatefulSet`/`Job` to its label selector and expected
//! replica count. No example in the retrieval pack implements this lookup
//! directly, so it is built from kube-rs's own `Api<K>::get`/`Api<K>::list`
//! idiom, the same one the teacher uses for the k8s API calls it does make.
use crate::filter::{ControllerFinderError, GetNodeSnafu, ListPodsSnafu, NoControllerSnafu};

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{ReplicaSet, StatefulSet};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Node, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, OwnerReference};
use kube::api::{Api, ListParams};
use snafu::{OptionExt, ResultExt};
use std::collections::BTreeMap;
use tracing::{event, instrument, Level};

#[derive(Clone)]
pub struct KubeControllerFinder {
    client: kube::client::Client,
}

impl KubeControllerFinder {
    pub fn new(client: kube::client::Client) -> Self {
        KubeControllerFinder { client }
    }

    async fn selector_for(
        &self,
        owner_ref: &OwnerReference,
        namespace: &str,
    ) -> Result<Option<LabelSelector>, ControllerFinderError> {
        match owner_ref.kind.as_str() {
            "ReplicaSet" => {
                let api: Api<ReplicaSet> = Api::namespaced(self.client.clone(), namespace);
                let rs = api.get(&owner_ref.name).await.context(ListPodsSnafu)?;
                Ok(rs.spec.map(|spec| spec.selector))
            }
            "StatefulSet" => {
                let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), namespace);
                let sts = api.get(&owner_ref.name).await.context(ListPodsSnafu)?;
                Ok(sts.spec.map(|spec| spec.selector))
            }
            "Job" => {
                let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
                let job = api.get(&owner_ref.name).await.context(ListPodsSnafu)?;
                Ok(job.spec.and_then(|spec| spec.selector))
            }
            other => {
                event!(Level::DEBUG, kind = other, "Unsupported controller kind; treating as no controller.");
                Ok(None)
            }
        }
    }

    async fn replicas_for(
        &self,
        owner_ref: &OwnerReference,
        namespace: &str,
    ) -> Result<u32, ControllerFinderError> {
        let replicas = match owner_ref.kind.as_str() {
            "ReplicaSet" => {
                let api: Api<ReplicaSet> = Api::namespaced(self.client.clone(), namespace);
                let rs = api.get(&owner_ref.name).await.context(ListPodsSnafu)?;
                rs.spec.and_then(|spec| spec.replicas).unwrap_or(1)
            }
            "StatefulSet" => {
                let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), namespace);
                let sts = api.get(&owner_ref.name).await.context(ListPodsSnafu)?;
                sts.spec.and_then(|spec| spec.replicas).unwrap_or(1)
            }
            "Job" => {
                let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
                let job = api.get(&owner_ref.name).await.context(ListPodsSnafu)?;
                job.spec.and_then(|spec| spec.completions).unwrap_or(1)
            }
            _ => 1,
        };
        Ok(replicas.max(0) as u32)
    }
}

#[async_trait]
impl crate::filter::ControllerFinder for KubeControllerFinder {
    #[instrument(skip(self))]
    async fn get_pods_for_ref(&self, owner_ref: &OwnerReference, namespace: &str) -> Result<Vec<Pod>, ControllerFinderError> {
        let selector = self
            .selector_for(owner_ref, namespace)
            .await?
            .context(NoControllerSnafu {
                namespace: namespace.to_string(),
                name: owner_ref.name.clone(),
            })?;

        let label_selector = match_labels_to_selector(&selector);
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let pods = api
            .list(&ListParams::default().labels(&label_selector))
            .await
            .context(ListPodsSnafu)?;
        Ok(pods.items)
    }

    #[instrument(skip(self))]
    async fn get_expected_scale_for_pod(&self, pod: &Pod) -> Result<u32, ControllerFinderError> {
        let owner_ref = models::pod::controller_owner_ref(pod).cloned().context(NoControllerSnafu {
            namespace: pod.metadata.namespace.clone().unwrap_or_default(),
            name: pod.metadata.name.clone().unwrap_or_default(),
        })?;
        let namespace = pod.metadata.namespace.clone().unwrap_or_default();
        self.replicas_for(&owner_ref, &namespace).await
    }

    #[instrument(skip(self))]
    async fn get_node_labels(&self, node_name: &str) -> Result<BTreeMap<String, String>, ControllerFinderError> {
        let api: Api<Node> = Api::all(self.client.clone());
        let node = api.get(node_name).await.context(GetNodeSnafu { name: node_name.to_string() })?;
        Ok(node.metadata.labels.unwrap_or_default())
    }
}

fn match_labels_to_selector(selector: &LabelSelector) -> String {
    selector
        .match_labels
        .as_ref()
        .map(|labels| {
            labels
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join(",")
        })
        .unwrap_or_default()
}
