//! Pod operations used by the manager loops.
//!
//! Only three verbs are needed: list a pool's runner pods, delete a pod, and
//! write a pod back after its labels were edited. Deleting a pod that is
//! already gone is a success; reconciliation races with the ReplicaSet
//! controller and with other actors deleting pods.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::ResourceExt;
use thiserror::Error;

use crate::util;

#[derive(Debug, Error)]
pub enum PodClientError {
    #[error("kubernetes api error: {0}")]
    Kube(#[from] kube::Error),

    #[error("pod has no name")]
    UnnamedPod,
}

#[async_trait]
pub trait PodClient: Send + Sync {
    /// Pods in `namespace` carrying the pool's identifying labels.
    async fn list_runner_pods(
        &self,
        namespace: &str,
        pool_name: &str,
    ) -> Result<Vec<Pod>, PodClientError>;

    /// Delete a pod. Not-found is success.
    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), PodClientError>;

    /// Replace a pod object, persisting label edits.
    async fn update_pod(&self, pod: &Pod) -> Result<(), PodClientError>;
}

pub struct KubePodClient {
    client: kube::Client,
}

impl KubePodClient {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl PodClient for KubePodClient {
    async fn list_runner_pods(
        &self,
        namespace: &str,
        pool_name: &str,
    ) -> Result<Vec<Pod>, PodClientError> {
        let params = ListParams::default().labels(&util::pool_selector(pool_name));
        let list = self.pods(namespace).list(&params).await?;
        Ok(list.items)
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), PodClientError> {
        match self
            .pods(namespace)
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn update_pod(&self, pod: &Pod) -> Result<(), PodClientError> {
        let namespace = pod.namespace().ok_or(PodClientError::UnnamedPod)?;
        let name = pod
            .metadata
            .name
            .clone()
            .ok_or(PodClientError::UnnamedPod)?;
        self.pods(&namespace)
            .replace(&name, &PostParams::default(), pod)
            .await?;
        Ok(())
    }
}
