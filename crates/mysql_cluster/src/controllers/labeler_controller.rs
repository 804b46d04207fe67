use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::reflector::{self, ObjectRef, Store};
use kube::runtime::watcher;
use kube::{Api, Client, ResourceExt};
use tokio::sync::RwLock;
use tracing::*;

use crate::controllers::control::{KubeControl, PodControl};
use crate::controllers::queue::WorkQueue;
use crate::controllers::runner::{list_namespaced, run_workers, watch_and_enqueue, ObjectKey, Reconciler};
use crate::controllers::state::{Diagnostics, State};
use crate::controllers::topology::TopologyStore;
use crate::util::errors::{Result, StdError};
use crate::util::labels::{
    cluster_selector, has_role, is_non_primary, is_primary, is_secondary, CLUSTER_LABEL, ROLE_LABEL, ROLE_PRIMARY,
    ROLE_SECONDARY,
};
use crate::util::metrics::Metrics;

pub const CONTROLLER_NAME: &str = "labeler";

/// Identity of the member the labeler runs next to.
#[derive(Clone, Debug)]
pub struct LocalInstance {
    pub namespace: String,
    pub cluster_name: String,
    pub pod_name: String,
    pub port: u16,
}

impl LocalInstance {
    /// Queue key the topology snapshots of this cluster are stored under.
    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(&self.namespace, &self.cluster_name)
    }
}

/// Keeps the role labels of member pods in line with the replication
/// topology. Only the local instance is ever labeled primary.
pub struct LabelerReconciler {
    pub local: LocalInstance,
    pub pods: Store<Pod>,
    pub control: Arc<dyn PodControl>,
    pub topologies: TopologyStore,
    pub metrics: Metrics,
    pub diagnostics: Arc<RwLock<Diagnostics>>,
}

#[async_trait]
impl Reconciler for LabelerReconciler {
    type Key = ObjectKey;

    fn name(&self) -> &'static str {
        CONTROLLER_NAME
    }

    fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    async fn sync(&self, key: &ObjectKey) -> Result<()> {
        self.diagnostics.write().await.touch(CONTROLLER_NAME);

        let Some(topology) = self.topologies.latest(key) else {
            warn!(%key, "no topology snapshot stored");
            return Ok(());
        };
        let local = &self.local;
        let cluster = key.name.as_str();

        let mut primary_labeled = false;
        for pod in list_namespaced(&self.pods, &key.namespace, |p| is_primary(p.metadata.labels.as_ref(), cluster)) {
            if pod.name_any() == local.pod_name {
                primary_labeled = true;
                continue;
            }
            if topology.is_member(&pod.name_any(), local.port) {
                info!(pod = %pod.name_any(), "labeling previously labeled primary as secondary");
                self.set_role(&pod, Some(ROLE_SECONDARY)).await?;
            } else {
                info!(pod = %pod.name_any(), "removing role label from previously labeled primary");
                self.set_role(&pod, None).await?;
            }
        }

        if !primary_labeled {
            let reference = ObjectRef::<Pod>::new(&local.pod_name).within(&key.namespace);
            let pod = self
                .pods
                .get(&reference)
                .ok_or_else(|| StdError::MetadataMissing(format!("local pod {reference} is not cached")))?;
            info!(pod = %local.pod_name, "labeling local instance as primary");
            self.set_role(&pod, Some(ROLE_PRIMARY)).await?;
        }

        for pod in list_namespaced(&self.pods, &key.namespace, |p| {
            is_non_primary(p.metadata.labels.as_ref(), cluster)
        }) {
            let name = pod.name_any();
            let labels = pod.metadata.labels.as_ref();
            if !topology.is_member(&name, local.port) {
                if has_role(labels, cluster) {
                    info!(pod = %name, "removing role label from non-member");
                    self.set_role(&pod, None).await?;
                }
                continue;
            }
            if name != local.pod_name && !is_secondary(labels, cluster) {
                info!(pod = %name, "labeling member as secondary");
                self.set_role(&pod, Some(ROLE_SECONDARY)).await?;
            }
        }
        Ok(())
    }
}

impl LabelerReconciler {
    async fn set_role(&self, pod: &Pod, role: Option<&str>) -> Result<()> {
        let mut updated = pod.clone();
        match role {
            Some(role) => {
                updated
                    .labels_mut()
                    .insert(ROLE_LABEL.to_string(), role.to_string());
            }
            None => {
                updated.labels_mut().remove(ROLE_LABEL);
            }
        }
        self.control.patch_pod(pod, &updated).await?;
        self.metrics.role_label_patched(role.unwrap_or_default());
        Ok(())
    }
}

/// Runs the labeler for `local` until `queue` shuts down. Snapshots reach it
/// through `topologies`, which must feed the same queue. Pod changes re-run
/// it against the latest snapshot.
pub async fn run(
    client: Client,
    local: LocalInstance,
    state: State,
    topologies: TopologyStore,
    queue: WorkQueue<ObjectKey>,
) -> Result<()> {
    let pods: Api<Pod> = Api::namespaced(client.clone(), &local.namespace);
    let (store, writer) = reflector::store::<Pod>();
    let watch = tokio::spawn(watch_and_enqueue(
        pods,
        watcher::Config::default().labels(&cluster_selector(&local.cluster_name)),
        writer,
        queue.clone(),
        |p: &Pod| Some(ObjectKey::new(p.namespace()?, p.labels().get(CLUSTER_LABEL)?.clone())),
    ));

    info!(cluster = %local.cluster_name, "waiting for pod cache to sync");
    if let Err(e) = store.wait_until_ready().await {
        watch.abort();
        return Err(StdError::InvalidArgument(format!("cache writer dropped before sync: {e}")).into());
    }

    let reconciler = LabelerReconciler {
        local,
        pods: store,
        control: Arc::new(KubeControl::new(client)),
        topologies,
        metrics: state.recorder(),
        diagnostics: state.diagnostics_handle(),
    };
    run_workers(Arc::new(reconciler), queue, 1).await;

    watch.abort();
    Ok(())
}
