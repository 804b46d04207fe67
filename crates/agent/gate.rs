//! Runs the topology labeler only while the local member is primary.

use std::future::Future;

use mysql_cluster::controllers::labeler_controller::{LocalInstance, CONTROLLER_NAME};
use mysql_cluster::controllers::queue::{ItemBackoff, WorkQueue};
use mysql_cluster::controllers::runner::ObjectKey;
use mysql_cluster::controllers::topology::{ClusterTopology, TopologyStore};
use tokio::task::JoinHandle;
use tracing::*;

struct Running {
    queue: WorkQueue<ObjectKey>,
    topologies: TopologyStore,
    task: JoinHandle<()>,
}

pub struct PrimaryGate<F> {
    local: LocalInstance,
    start: F,
    running: Option<Running>,
}

impl<F, Fut> PrimaryGate<F>
where
    F: Fn(TopologyStore, WorkQueue<ObjectKey>) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    /// `start` runs a labeler fed by the given store until the queue shuts down.
    pub fn new(local: LocalInstance, start: F) -> Self {
        Self {
            local,
            start,
            running: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.as_ref().is_some_and(|r| !r.task.is_finished())
    }

    /// Hands `topology` to the labeler, starting it if the local member has
    /// become primary and stopping it if it no longer is.
    pub async fn observe(&mut self, topology: ClusterTopology) {
        if !topology.is_primary(&self.local.pod_name) {
            self.stop().await;
            return;
        }
        if !self.is_running() {
            self.stop().await;
            info!(pod = %self.local.pod_name, "local instance is primary, starting labeler");
            let queue = WorkQueue::new(CONTROLLER_NAME, ItemBackoff::default());
            let topologies = TopologyStore::new(queue.clone());
            let task = tokio::spawn((self.start)(topologies.clone(), queue.clone()));
            self.running = Some(Running {
                queue,
                topologies,
                task,
            });
        }
        if let Some(running) = &self.running {
            running.topologies.offer(self.local.key(), topology);
        }
    }

    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        info!(pod = %self.local.pod_name, "stopping labeler");
        running.queue.shutdown();
        if let Err(e) = running.task.await {
            warn!("labeler task ended abnormally: {e}");
        }
    }
}
