// Cluster state module
// Point-in-time reads of Deployments and Pods, never cached between requests.

#[cfg(test)]
pub mod memory;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, DeleteParams, ListParams};
use kube::{Client, ResourceExt};

use crate::error::Result;
use crate::policy::NodeSelector;

/// Read access to the control plane, plus the pod deletion used by reconciliation.
#[async_trait]
pub trait ClusterState: Send + Sync {
    async fn deployment(&self, namespace: &str, name: &str) -> Result<Option<Deployment>>;

    async fn pods(&self, namespace: &str) -> Result<Vec<Pod>>;

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()>;
}

#[derive(Clone)]
pub struct KubeClusterState {
    client: Client,
}

impl KubeClusterState {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ClusterState for KubeClusterState {
    async fn deployment(&self, namespace: &str, name: &str) -> Result<Option<Deployment>> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn pods(&self, namespace: &str) -> Result<Vec<Pod>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        api.delete(name, &DeleteParams::default()).await?;
        Ok(())
    }
}

/// Live pods of a Deployment pinned to one node selector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedCount {
    pub selector: NodeSelector,
    /// Pod names, oldest first.
    pub pods: Vec<String>,
}

impl ObservedCount {
    pub fn current_count(&self) -> u32 {
        self.pods.len() as u32
    }
}

#[derive(Clone)]
pub struct StateQuery {
    cluster: Arc<dyn ClusterState>,
    settle_delay: Duration,
}

impl StateQuery {
    pub fn new(cluster: Arc<dyn ClusterState>, settle_delay: Duration) -> Self {
        Self {
            cluster,
            settle_delay,
        }
    }

    pub fn cluster(&self) -> &dyn ClusterState {
        self.cluster.as_ref()
    }

    /// Counts the live pods of `deployment` whose node selector holds `selector`.
    ///
    /// Waits for the settle delay first so that pods admitted by concurrent
    /// requests have a chance to show up in the listing. Pods with a deletion
    /// timestamp do not count.
    pub async fn observe(
        &self,
        namespace: &str,
        deployment: &str,
        selector: &NodeSelector,
    ) -> Result<ObservedCount> {
        if !self.settle_delay.is_zero() {
            tokio::time::sleep(self.settle_delay).await;
        }

        let pods = self.cluster.pods(namespace).await?;
        Ok(ObservedCount {
            selector: selector.clone(),
            pods: matching_pods(pods, deployment, selector),
        })
    }
}

fn matching_pods(pods: Vec<Pod>, deployment: &str, selector: &NodeSelector) -> Vec<String> {
    let mut matched: Vec<_> = pods
        .into_iter()
        .filter(|pod| pod.metadata.deletion_timestamp.is_none())
        .filter(|pod| pod.name_any().contains(deployment))
        .filter(|pod| {
            selector.matches(pod.spec.as_ref().and_then(|spec| spec.node_selector.as_ref()))
        })
        .map(|pod| {
            let created = pod.metadata.creation_timestamp.as_ref().map(|time| time.0);
            (created, pod.name_any())
        })
        .collect();

    matched.sort();
    matched.into_iter().map(|(_, name)| name).collect()
}

#[cfg(test)]
mod tests {
    use super::memory::{pod, MemoryClusterState};
    use super::*;

    #[test]
    fn test_matching_pods_filters_and_orders() {
        let spot = NodeSelector::new("nodeType", "spot");
        let ondemand = NodeSelector::new("nodeType", "ondemand");

        let mut terminating = pod("shop", "web-abc-1", Some(&spot), 5);
        terminating.metadata.deletion_timestamp = terminating.metadata.creation_timestamp.clone();

        let pods = vec![
            pod("shop", "web-abc-3", Some(&spot), 30),
            pod("shop", "web-abc-2", Some(&spot), 10),
            pod("shop", "web-abc-4", Some(&ondemand), 1),
            pod("shop", "web-abc-5", None, 1),
            pod("shop", "api-def-1", Some(&spot), 1),
            terminating,
        ];

        assert_eq!(
            matching_pods(pods, "web", &spot),
            vec!["web-abc-2".to_string(), "web-abc-3".to_string()]
        );
    }

    #[tokio::test]
    async fn test_observe_counts_live_pods() {
        let cluster = Arc::new(MemoryClusterState::default());
        let spot = NodeSelector::new("nodeType", "spot");
        cluster.insert_pod(pod("shop", "web-abc-1", Some(&spot), 1)).await;
        cluster.insert_pod(pod("shop", "web-abc-2", Some(&spot), 2)).await;
        cluster.insert_pod(pod("other", "web-abc-3", Some(&spot), 3)).await;

        let query = StateQuery::new(cluster, Duration::ZERO);
        let observed = query.observe("shop", "web", &spot).await.unwrap();
        assert_eq!(observed.current_count(), 2);
        assert_eq!(observed.selector, spot);
    }

    #[tokio::test]
    async fn test_observe_reports_list_failure() {
        let cluster = Arc::new(MemoryClusterState::default());
        cluster.set_pods_unavailable(true);

        let query = StateQuery::new(cluster, Duration::ZERO);
        let spot = NodeSelector::new("nodeType", "spot");
        assert!(query.observe("shop", "web", &spot).await.is_err());
    }

    #[test]
    #[should_panic(expected = "pod creation time out of range")]
    fn test_pod_fixture_rejects_unrepresentable_timestamp() {
        pod("shop", "web-abc-1", None, i64::MAX);
    }
}
