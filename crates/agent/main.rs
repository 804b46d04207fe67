use std::time::Duration;

use clap::Parser;
use kube::runtime::events::Reporter;
use kube::Client;
use tokio::time::{interval, MissedTickBehavior};
use tracing::*;

use mysql_cluster::config::parse_duration;
use mysql_cluster::controllers::labeler_controller::{self, LocalInstance};
use mysql_cluster::controllers::queue::WorkQueue;
use mysql_cluster::controllers::runner::ObjectKey;
use mysql_cluster::controllers::state::State;
use mysql_cluster::controllers::topology::{MysqlShell, TopologyStore, MYSQL_PORT};
use mysql_cluster::util::telemetry::{self, LogFormat};

use crate::gate::PrimaryGate;
use crate::handlers::health::Health;
use crate::manager::ClusterManager;

mod gate;
mod handlers;
mod manager;
mod server;

/// Sidecar keeping member role labels in line with the replication topology
#[derive(Parser, Debug, Clone)]
#[command(name = "mysql-agent", version)]
struct AgentConfig {
    #[arg(long, env = "MYSQL_CLUSTER_NAME")]
    cluster_name: String,

    #[arg(long, env = "POD_NAMESPACE")]
    namespace: String,

    /// Name of the pod this agent runs in
    #[arg(long, env = "HOSTNAME")]
    pod_name: String,

    #[arg(long, env = "MYSQL_PORT", default_value_t = MYSQL_PORT)]
    mysql_port: u16,

    #[arg(long, env = "MYSQL_ROOT_PASSWORD", hide_env_values = true)]
    root_password: String,

    /// How often the topology is read from the local server
    #[arg(long, env = "TOPOLOGY_POLL_INTERVAL", default_value = "10s", value_parser = parse_duration)]
    poll_interval: Duration,

    #[arg(long, env = "MYSQLSH", default_value = "mysqlsh")]
    mysqlsh: String,

    /// Upper bound on a single mysqlsh invocation
    #[arg(long, env = "MYSQLSH_TIMEOUT", default_value = "10s", value_parser = parse_duration)]
    shell_timeout: Duration,

    /// Group replication addresses of every member, `host:port` separated by commas
    #[arg(long, env = "REPLICATION_GROUP_SEEDS", default_value = "")]
    replication_group_seeds: String,

    #[arg(long, env = "MYSQL_CLUSTER_MULTI_MASTER", default_value_t = false, action = clap::ArgAction::Set)]
    multi_master: bool,

    #[arg(long, env = "AGENT_LISTEN_ADDRESS", default_value = "0.0.0.0:10512")]
    listen_address: String,

    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[arg(long, env = "LOG_FORMAT", default_value = "compact")]
    log_format: LogFormat,
}

impl AgentConfig {
    fn local_instance(&self) -> LocalInstance {
        LocalInstance {
            namespace: self.namespace.clone(),
            cluster_name: self.cluster_name.clone(),
            pod_name: self.pod_name.clone(),
            port: self.mysql_port,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AgentConfig::parse();
    telemetry::init(&config.log_level, config.log_format)?;
    info!(cluster = %config.cluster_name, pod = %config.pod_name, "starting mysql-agent");

    let client = Client::try_default().await?;
    let state = State::new(Reporter {
        controller: "mysql-agent".into(),
        instance: Some(config.pod_name.clone()),
    })?;
    let health = Health::default();

    let server = server::start_server(state.clone(), health.clone(), &config.listen_address)?;
    let handle = server.handle();
    let server = tokio::spawn(server);

    let local = config.local_instance();
    let mut gate = PrimaryGate::new(local.clone(), |topologies: TopologyStore, queue: WorkQueue<ObjectKey>| {
        let (client, local, state) = (client.clone(), local.clone(), state.clone());
        async move {
            if let Err(e) = labeler_controller::run(client, local, state, topologies, queue).await {
                error!("labeler stopped: {e}");
            }
        }
    });

    let mut shell = MysqlShell::new(&config.mysqlsh, &config.root_password, &local.pod_name, config.mysql_port);
    shell.timeout = config.shell_timeout;
    let manager = ClusterManager::new(
        local.clone(),
        &config.replication_group_seeds,
        config.multi_master,
        shell,
        state.recorder(),
    );
    let mut ticker = interval(config.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = &mut shutdown => {
                info!("shutting down");
                break;
            }
        }
        let online = tokio::select! {
            online = manager.sync() => online,
            _ = &mut shutdown => {
                info!("shutting down");
                break;
            }
        };
        health.observe(online.as_ref(), &local.pod_name, local.port);
        match online {
            // role labels are only kept in single-primary mode
            Some(topology) if !manager.multi_master() => gate.observe(topology).await,
            Some(_) => {}
            None => debug!(pod = %local.pod_name, "local instance is not online"),
        }
    }

    gate.stop().await;
    handle.stop(true).await;
    server.await??;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_sidecar_ports() {
        let config = AgentConfig::parse_from([
            "mysql-agent",
            "--cluster-name",
            "db",
            "--namespace",
            "default",
            "--pod-name",
            "db-1",
            "--root-password",
            "secret",
            "--poll-interval",
            "30s",
            "--replication-group-seeds",
            "db-0.db:33061,db-1.db:33061",
        ]);
        assert_eq!(config.mysql_port, 3306);
        assert_eq!(config.poll_interval, Duration::from_secs(30));
        assert!(config.listen_address.ends_with(":10512"));
        assert_eq!(config.shell_timeout, Duration::from_secs(10));
        assert!(!config.multi_master);
        assert_eq!(
            manager::peer_addresses(&config.replication_group_seeds, "db-1", config.mysql_port),
            vec!["db-0.db:3306"]
        );

        let local = config.local_instance();
        assert_eq!(local.key().to_string(), "default/db");
        assert_eq!(local.pod_name, "db-1");
    }
}
