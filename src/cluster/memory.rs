use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{Pod, PodSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use kube::ResourceExt;
use tokio::sync::RwLock;

use super::ClusterState;
use crate::error::{Error, Result};
use crate::placement::DEFAULT_POLICY_ANNOTATION;
use crate::policy::NodeSelector;

type Key = (String, String);

/// In-memory stand-in for the API server.
#[derive(Default)]
pub struct MemoryClusterState {
    inner: RwLock<Inner>,
    deployments_unavailable: AtomicBool,
    pods_unavailable: AtomicBool,
}

#[derive(Default)]
struct Inner {
    deployments: BTreeMap<Key, Deployment>,
    pods: BTreeMap<Key, Pod>,
}

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

impl MemoryClusterState {
    pub async fn insert_deployment(&self, deployment: Deployment) {
        let key = key(&deployment.namespace().unwrap_or_default(), &deployment.name_any());
        self.inner.write().await.deployments.insert(key, deployment);
    }

    pub async fn insert_pod(&self, pod: Pod) {
        let key = key(&pod.namespace().unwrap_or_default(), &pod.name_any());
        self.inner.write().await.pods.insert(key, pod);
    }

    pub async fn pod_names(&self, namespace: &str) -> Vec<String> {
        self.inner
            .read()
            .await
            .pods
            .keys()
            .filter(|(ns, _)| ns == namespace)
            .map(|(_, name)| name.clone())
            .collect()
    }

    pub fn set_deployments_unavailable(&self, unavailable: bool) {
        self.deployments_unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn set_pods_unavailable(&self, unavailable: bool) {
        self.pods_unavailable.store(unavailable, Ordering::SeqCst);
    }
}

#[async_trait]
impl ClusterState for MemoryClusterState {
    async fn deployment(&self, namespace: &str, name: &str) -> Result<Option<Deployment>> {
        if self.deployments_unavailable.load(Ordering::SeqCst) {
            return Err(Error::ClusterUnavailable("deployments".to_string()));
        }
        Ok(self.inner.read().await.deployments.get(&key(namespace, name)).cloned())
    }

    async fn pods(&self, namespace: &str) -> Result<Vec<Pod>> {
        if self.pods_unavailable.load(Ordering::SeqCst) {
            return Err(Error::ClusterUnavailable("pods".to_string()));
        }
        Ok(self
            .inner
            .read()
            .await
            .pods
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|(_, pod)| pod.clone())
            .collect())
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()> {
        self.inner.write().await.pods.remove(&key(namespace, name));
        Ok(())
    }
}

pub fn deployment(namespace: &str, name: &str, replicas: i32, policy: Option<&str>) -> Deployment {
    let annotations = policy.map(|policy| {
        BTreeMap::from([(DEFAULT_POLICY_ANNOTATION.to_string(), policy.to_string())])
    });

    Deployment {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            annotations,
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(replicas),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Builds a pod created `created` seconds after the epoch.
pub fn pod(namespace: &str, name: &str, selector: Option<&NodeSelector>, created: i64) -> Pod {
    let node_selector = selector
        .map(|selector| BTreeMap::from([(selector.key.clone(), selector.value.clone())]));

    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            creation_timestamp: Some(Time(
                chrono::DateTime::<chrono::Utc>::from_timestamp(created, 0)
                    .expect("pod creation time out of range"),
            )),
            ..Default::default()
        },
        spec: Some(PodSpec {
            node_selector,
            ..Default::default()
        }),
        ..Default::default()
    }
}
