//! Replication topology snapshots as reported by the database, and the
//! keyed store the labeler reads them from.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, trace};

use crate::controllers::queue::WorkQueue;
use crate::controllers::runner::ObjectKey;
use crate::util::errors::{Result, StdError};

pub const MYSQL_PORT: u16 = 3306;

const PASSWORD_WARNING: &str = "mysqlx: [Warning] Using a password on the command line interface can be insecure.\n";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub enum InstanceStatus {
    #[serde(rename = "ONLINE")]
    Online,
    #[serde(rename = "(MISSING)")]
    Missing,
    #[serde(rename = "RECOVERING")]
    Recovering,
    #[serde(rename = "UNREACHABLE")]
    Unreachable,
    #[serde(rename = "UNKNOWN", other)]
    Unknown,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub enum InstanceMode {
    #[serde(rename = "R/W")]
    ReadWrite,
    #[serde(rename = "R/O", other)]
    ReadOnly,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Instance {
    pub address: String,
    pub mode: InstanceMode,
    #[serde(default)]
    pub role: String,
    pub status: InstanceStatus,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ReplicaSet {
    pub name: String,
    /// Empty in multi-primary mode
    pub primary: String,
    pub status: String,
    pub status_text: String,
    pub topology: BTreeMap<String, Instance>,
}

/// Output of `dba.get_cluster().status()`.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ClusterTopology {
    pub cluster_name: String,
    pub default_replica_set: ReplicaSet,
}

/// Address a member pod is known by in the topology:
/// `{pod}.{statefulset}:{port}`, the statefulset name being the pod name
/// without its ordinal.
pub fn member_address(pod_name: &str, port: u16) -> String {
    let statefulset = pod_name.rsplit_once('-').map_or(pod_name, |(name, _)| name);
    format!("{pod_name}.{statefulset}:{port}")
}

impl ClusterTopology {
    /// Parses mysqlsh output, ignoring the password warning it prints when
    /// the password is part of the URI.
    pub fn parse(output: &str) -> Result<Self> {
        let json = output.replacen(PASSWORD_WARNING, "", 1);
        serde_json::from_str(json.trim())
            .map_err(|e| StdError::TopologyError(format!("decoding cluster status {json:?}: {e}")).into())
    }

    /// The primary's address. Falls back to the first read/write instance
    /// when the replica set reports none.
    pub fn primary_address(&self) -> Option<&str> {
        let rs = &self.default_replica_set;
        if !rs.primary.is_empty() {
            return Some(&rs.primary);
        }
        rs.topology
            .values()
            .find(|i| i.mode == InstanceMode::ReadWrite)
            .map(|i| i.address.as_str())
    }

    pub fn instance_status(&self, pod_name: &str, port: u16) -> Option<InstanceStatus> {
        self.default_replica_set
            .topology
            .get(&member_address(pod_name, port))
            .map(|i| i.status)
    }

    /// Whether the pod is an online member of the replica set.
    pub fn is_member(&self, pod_name: &str, port: u16) -> bool {
        self.instance_status(pod_name, port) == Some(InstanceStatus::Online)
    }

    /// Whether the primary's address names `pod_name`.
    pub fn is_primary(&self, pod_name: &str) -> bool {
        self.primary_address().is_some_and(|addr| {
            let host = addr.split(':').next().unwrap_or(addr);
            host == pod_name || host.starts_with(&format!("{pod_name}."))
        })
    }
}

/// Produces the current replication topology.
#[async_trait]
pub trait TopologySource: Send + Sync {
    async fn cluster_status(&self) -> Result<ClusterTopology>;
}

/// `check_instance_state` output for an instance, as judged by a member.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct InstanceState {
    pub state: String,
    pub reason: String,
}

impl InstanceState {
    pub fn can_rejoin(&self) -> bool {
        self.state == "ok" && self.reason == "recoverable"
    }
}

/// Membership changes for the local server, each run through the member at
/// `address`.
#[async_trait]
pub trait MembershipAdmin: TopologySource {
    /// Topology as seen by the member at `address`, `None` when it is
    /// unreachable or not part of a cluster.
    async fn status_from(&self, address: &str) -> Option<ClusterTopology>;

    /// Creates the cluster with the local server as its only member.
    async fn create_cluster(&self, multi_master: bool) -> Result<ClusterTopology>;

    async fn check_instance_state(&self, address: &str) -> Result<InstanceState>;

    async fn add_instance(&self, address: &str) -> Result<()>;

    async fn rejoin_instance(&self, address: &str) -> Result<()>;

    async fn remove_instance(&self, address: &str) -> Result<()>;
}

/// Name every cluster is created under.
pub const INNODB_CLUSTER_NAME: &str = "Cluster";

pub const DEFAULT_SHELL_TIMEOUT: Duration = Duration::from_secs(10);

/// Runs `mysqlsh` against the local server, or against another member for
/// membership changes.
pub struct MysqlShell {
    pub binary: String,
    password: String,
    port: u16,
    /// Address the other members reach the local server at
    pub instance_address: String,
    pub timeout: Duration,
}

impl MysqlShell {
    pub fn new(binary: impl Into<String>, password: &str, pod_name: &str, port: u16) -> Self {
        Self {
            binary: binary.into(),
            password: password.to_string(),
            port,
            instance_address: member_address(pod_name, port),
            timeout: DEFAULT_SHELL_TIMEOUT,
        }
    }

    fn uri(&self, address: &str) -> String {
        format!("root:{}@{address}", self.password)
    }

    fn local_address(&self) -> String {
        format!("localhost:{}", self.port)
    }

    fn args(&self, address: &str, python: &str) -> Vec<String> {
        vec![
            "--uri".to_string(),
            self.uri(address),
            "--py".to_string(),
            "-e".to_string(),
            python.to_string(),
        ]
    }

    async fn run(&self, address: &str, python: &str) -> Result<String> {
        let mut command = Command::new(&self.binary);
        command.args(self.args(address, python));
        let stdout = run_with_timeout(command, self.timeout).await?;
        Ok(stdout.replacen(PASSWORD_WARNING, "", 1))
    }

    async fn status_at(&self, address: &str) -> Result<ClusterTopology> {
        let python = format!("print({})", Self::cluster(".status()"));
        ClusterTopology::parse(&self.run(address, &python).await?)
    }

    fn cluster(python: &str) -> String {
        format!("dba.get_cluster('{INNODB_CLUSTER_NAME}'){python}")
    }
}

/// Runs `command` to completion and returns its stdout. The child is killed
/// when it outlives `timeout`.
pub async fn run_with_timeout(mut command: Command, timeout: Duration) -> Result<String> {
    let program = command.as_std().get_program().to_string_lossy().into_owned();
    command.kill_on_drop(true);
    let output = tokio::time::timeout(timeout, command.output())
        .await
        .map_err(|_| StdError::TopologyError(format!("{program} timed out after {timeout:?}")))?
        .map_err(|e| StdError::TopologyError(format!("running {program}: {e}")))?;
    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    trace!(status = ?output.status, %stdout, "{program} finished");
    if !output.status.success() {
        return Err(StdError::TopologyError(format!(
            "{program} exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        ))
        .into());
    }
    Ok(stdout)
}

#[async_trait]
impl TopologySource for MysqlShell {
    async fn cluster_status(&self) -> Result<ClusterTopology> {
        self.status_at(&self.local_address()).await
    }
}

#[async_trait]
impl MembershipAdmin for MysqlShell {
    async fn status_from(&self, address: &str) -> Option<ClusterTopology> {
        match self.status_at(address).await {
            Ok(topology) => Some(topology),
            Err(e) => {
                debug!(address, error = %e, "no cluster status");
                None
            }
        }
    }

    async fn create_cluster(&self, multi_master: bool) -> Result<ClusterTopology> {
        let options = if multi_master {
            ", {'force': True, 'multiMaster': True}"
        } else {
            ""
        };
        let python = format!("dba.create_cluster('{INNODB_CLUSTER_NAME}'{options})");
        self.run(&self.local_address(), &python).await?;
        self.cluster_status().await
    }

    async fn check_instance_state(&self, address: &str) -> Result<InstanceState> {
        let python = format!(
            "print({})",
            Self::cluster(&format!(".check_instance_state('{}')", self.uri(&self.instance_address)))
        );
        let stdout = self.run(address, &python).await?;
        serde_json::from_str(stdout.trim())
            .map_err(|e| StdError::TopologyError(format!("decoding instance state {stdout:?}: {e}")).into())
    }

    async fn add_instance(&self, address: &str) -> Result<()> {
        let python = Self::cluster(&format!(".add_instance('{}')", self.uri(&self.instance_address)));
        self.run(address, &python).await.map(|_| ())
    }

    async fn rejoin_instance(&self, address: &str) -> Result<()> {
        let python = Self::cluster(&format!(".rejoin_instance('{}')", self.uri(&self.instance_address)));
        self.run(address, &python).await.map(|_| ())
    }

    async fn remove_instance(&self, address: &str) -> Result<()> {
        let python = Self::cluster(&format!(
            ".remove_instance('{}', {{'force': True}})",
            self.uri(&self.instance_address)
        ));
        self.run(address, &python).await.map(|_| ())
    }
}

/// Latest snapshot per cluster. Offering a snapshot replaces the previous
/// one and enqueues its key, so a burst of snapshots is processed once
/// against the newest.
#[derive(Clone)]
pub struct TopologyStore {
    snapshots: Arc<Mutex<HashMap<ObjectKey, ClusterTopology>>>,
    queue: WorkQueue<ObjectKey>,
}

impl TopologyStore {
    pub fn new(queue: WorkQueue<ObjectKey>) -> Self {
        Self {
            snapshots: Arc::default(),
            queue,
        }
    }

    pub fn offer(&self, key: ObjectKey, topology: ClusterTopology) {
        debug!(%key, primary = ?topology.primary_address(), "storing topology snapshot");
        self.snapshots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.clone(), topology);
        self.queue.add(key);
    }

    pub fn latest(&self, key: &ObjectKey) -> Option<ClusterTopology> {
        self.snapshots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }
}

#[cfg(test)]
pub(crate) fn topology(primary: &str, members: &[(&str, &str)]) -> ClusterTopology {
    let topology = members
        .iter()
        .map(|(pod, status)| {
            let address = member_address(pod, MYSQL_PORT);
            let instance = Instance {
                address: address.clone(),
                mode: if *pod == primary {
                    InstanceMode::ReadWrite
                } else {
                    InstanceMode::ReadOnly
                },
                role: "HA".to_string(),
                status: serde_json::from_value(serde_json::Value::String(status.to_string()))
                    .unwrap(),
            };
            (address, instance)
        })
        .collect();
    ClusterTopology {
        cluster_name: "Cluster".to_string(),
        default_replica_set: ReplicaSet {
            name: "default".to_string(),
            primary: member_address(primary, MYSQL_PORT),
            status: "OK".to_string(),
            status_text: "Cluster is ONLINE and can tolerate up to ONE failure.".to_string(),
            topology,
        },
    }
}
