use crate::util::Error;
use async_trait::async_trait;
use k8s_openapi::{
    api::core::v1::{PersistentVolumeClaim, Pod},
    apimachinery::pkg::apis::meta::v1::OwnerReference,
};
use kube::{
    Api, Client,
    api::{DeleteParams, LogParams, Patch, PatchParams, PostParams},
};

/// Flattened view of a pod's status, all the reconciler ever looks at.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PodObservation {
    pub phase: String,
    pub ready: bool,
    pub container_states: Vec<String>,
}

/// Projects a pod object down to [`PodObservation`].
pub fn observe_pod(pod: &Pod) -> PodObservation {
    let status = pod.status.as_ref();
    let phase = status
        .and_then(|s| s.phase.clone())
        .unwrap_or_else(|| "Unknown".to_string());
    let ready = status
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conds| {
            conds
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        });
    let container_states = status
        .and_then(|s| s.container_statuses.as_ref())
        .map(|statuses| {
            statuses
                .iter()
                .map(|cs| {
                    let state = match cs.state.as_ref() {
                        Some(state) => state,
                        None => return format!("{}: Unknown", cs.name),
                    };
                    if state.running.is_some() {
                        format!("{}: Running", cs.name)
                    } else if let Some(waiting) = &state.waiting {
                        format!(
                            "{}: Waiting: {}",
                            cs.name,
                            waiting.reason.as_deref().unwrap_or("(no reason provided)")
                        )
                    } else if let Some(terminated) = &state.terminated {
                        format!(
                            "{}: Terminated: {}",
                            cs.name,
                            terminated.reason.as_deref().unwrap_or("(no reason provided)")
                        )
                    } else {
                        format!("{}: Unknown", cs.name)
                    }
                })
                .collect()
        })
        .unwrap_or_default();
    PodObservation {
        phase,
        ready,
        container_states,
    }
}

/// The cluster seam of the reconciler. Reads return `None` for not-found,
/// deletes treat not-found as success, creates treat an already-exists
/// conflict as present; every other API failure propagates as
/// [`Error::Kube`] and is retried by the runtime.
#[async_trait]
pub trait ClusterAccess: Send + Sync {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>, Error>;
    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<(), Error>;
    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), Error>;
    async fn pod_logs(
        &self,
        namespace: &str,
        name: &str,
        tail_lines: i64,
    ) -> Result<Option<String>, Error>;

    async fn get_pvc(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PersistentVolumeClaim>, Error>;
    async fn create_pvc(&self, namespace: &str, pvc: &PersistentVolumeClaim)
    -> Result<(), Error>;
    async fn patch_pvc_owner(
        &self,
        namespace: &str,
        name: &str,
        owner: &OwnerReference,
    ) -> Result<(), Error>;
    async fn delete_pvc(&self, namespace: &str, name: &str) -> Result<(), Error>;
}

/// [`ClusterAccess`] backed by the real API server.
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        KubeCluster { client }
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn pvcs(&self, namespace: &str) -> Api<PersistentVolumeClaim> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

// Children are reclaimed promptly: all deletes pass a zero grace period.
fn prompt_delete() -> DeleteParams {
    DeleteParams::default().grace_period(0)
}

#[async_trait]
impl ClusterAccess for KubeCluster {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>, Error> {
        match self.pods(namespace).get(name).await {
            Ok(pod) => Ok(Some(pod)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<(), Error> {
        match self.pods(namespace).create(&PostParams::default(), pod).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), Error> {
        match self.pods(namespace).delete(name, &prompt_delete()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn pod_logs(
        &self,
        namespace: &str,
        name: &str,
        tail_lines: i64,
    ) -> Result<Option<String>, Error> {
        let params = LogParams {
            tail_lines: Some(tail_lines),
            ..Default::default()
        };
        match self.pods(namespace).logs(name, &params).await {
            Ok(logs) => Ok(Some(logs)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_pvc(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PersistentVolumeClaim>, Error> {
        match self.pvcs(namespace).get(name).await {
            Ok(pvc) => Ok(Some(pvc)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn create_pvc(
        &self,
        namespace: &str,
        pvc: &PersistentVolumeClaim,
    ) -> Result<(), Error> {
        match self.pvcs(namespace).create(&PostParams::default(), pvc).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn patch_pvc_owner(
        &self,
        namespace: &str,
        name: &str,
        owner: &OwnerReference,
    ) -> Result<(), Error> {
        let patch = serde_json::json!({
            "metadata": {
                "ownerReferences": [owner],
            }
        });
        self.pvcs(namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn delete_pvc(&self, namespace: &str, name: &str) -> Result<(), Error> {
        match self.pvcs(namespace).delete(name, &prompt_delete()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
