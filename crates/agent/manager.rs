//! Keeps the local server an online member of the InnoDB cluster.

use mysql_cluster::controllers::labeler_controller::LocalInstance;
use mysql_cluster::controllers::topology::{ClusterTopology, InstanceStatus, MembershipAdmin};
use mysql_cluster::util::metrics::Metrics;
use tracing::*;

/// Peer member addresses from a `REPLICATION_GROUP_SEEDS` list
/// (`db-0.db:33061,db-1.db:33061`), pointed at the client port and without
/// the local pod.
pub fn peer_addresses(seeds: &str, pod_name: &str, port: u16) -> Vec<String> {
    seeds
        .split(',')
        .map(str::trim)
        .filter(|seed| !seed.is_empty())
        .filter_map(|seed| {
            let host = seed.rsplit_once(':').map_or(seed, |(host, _)| host);
            let pod = host.split('.').next()?;
            (pod != pod_name).then(|| format!("{host}:{port}"))
        })
        .collect()
}

fn ordinal(pod_name: &str) -> Option<u32> {
    pod_name.rsplit_once('-')?.1.parse().ok()
}

pub struct ClusterManager<S> {
    local: LocalInstance,
    peers: Vec<String>,
    multi_master: bool,
    shell: S,
    metrics: Metrics,
}

impl<S: MembershipAdmin> ClusterManager<S> {
    pub fn new(local: LocalInstance, seeds: &str, multi_master: bool, shell: S, metrics: Metrics) -> Self {
        let peers = peer_addresses(seeds, &local.pod_name, local.port);
        Self {
            local,
            peers,
            multi_master,
            shell,
            metrics,
        }
    }

    pub fn multi_master(&self) -> bool {
        self.multi_master
    }

    /// The first topology reported by the local server or one of its peers.
    async fn find_cluster(&self) -> Option<ClusterTopology> {
        if let Ok(topology) = self.shell.cluster_status().await {
            return Some(topology);
        }
        for peer in &self.peers {
            if let Some(topology) = self.shell.status_from(peer).await {
                return Some(topology);
            }
        }
        None
    }

    /// Bootstraps, joins or rejoins the cluster as needed. Returns the
    /// topology once the local server is online in it.
    pub async fn sync(&self) -> Option<ClusterTopology> {
        let pod = &self.local.pod_name;
        let topology = match self.find_cluster().await {
            Some(topology) => topology,
            None if ordinal(pod) == Some(0) => {
                info!(pod = %pod, multi_master = self.multi_master, "no cluster found, bootstrapping");
                let created = self.shell.create_cluster(self.multi_master).await;
                self.metrics.membership_action("bootstrap", created.is_ok());
                match created {
                    Ok(topology) => topology,
                    Err(e) => {
                        error!(error = %e, "bootstrapping cluster");
                        return None;
                    }
                }
            }
            None => {
                debug!(pod = %pod, "cluster not yet present, waiting");
                return None;
            }
        };

        match topology.instance_status(pod, self.local.port) {
            Some(InstanceStatus::Online) => Some(topology),
            Some(InstanceStatus::Recovering) => {
                debug!(pod = %pod, "instance is recovering");
                None
            }
            Some(InstanceStatus::Missing) => self.rejoin(&topology).await,
            None => self.join(&topology).await,
            Some(status) => {
                warn!(pod = %pod, ?status, "unexpected membership status");
                None
            }
        }
    }

    fn primary<'a>(&self, topology: &'a ClusterTopology) -> Option<&'a str> {
        let primary = topology.primary_address();
        if primary.is_none() {
            error!(cluster = %topology.cluster_name, "cluster reports no primary");
        }
        primary
    }

    async fn rejoin(&self, topology: &ClusterTopology) -> Option<ClusterTopology> {
        let primary = self.primary(topology)?;
        let state = match self.shell.check_instance_state(primary).await {
            Ok(state) => state,
            Err(e) => {
                error!(error = %e, "checking whether the instance can rejoin");
                return None;
            }
        };
        let (action, result) = if state.can_rejoin() {
            info!(pod = %self.local.pod_name, %primary, "rejoining cluster");
            ("rejoin", self.shell.rejoin_instance(primary).await)
        } else {
            info!(pod = %self.local.pod_name, %primary, ?state, "removing unrecoverable instance from cluster");
            ("remove", self.shell.remove_instance(primary).await)
        };
        self.metrics.membership_action(action, result.is_ok());
        if let Err(e) = result {
            error!(action, error = %e, "changing cluster membership");
            return None;
        }
        self.online_in(primary).await
    }

    async fn join(&self, topology: &ClusterTopology) -> Option<ClusterTopology> {
        let primary = self.primary(topology)?;
        info!(pod = %self.local.pod_name, %primary, "adding instance to cluster");
        let added = self.shell.add_instance(primary).await;
        self.metrics.membership_action("add", added.is_ok());
        if let Err(e) = added {
            error!(error = %e, "adding instance to cluster");
            return None;
        }
        self.online_in(primary).await
    }

    async fn online_in(&self, primary: &str) -> Option<ClusterTopology> {
        self.shell
            .status_from(primary)
            .await
            .filter(|t| t.is_member(&self.local.pod_name, self.local.port))
    }
}
