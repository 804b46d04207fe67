use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use kube::runtime::events::Reporter;
use kube::Client;
use tracing::*;

use mysql_cluster::config::{parse_duration, OperatorConfig};
use mysql_cluster::controllers::queue::{ItemBackoff, WorkQueue};
use mysql_cluster::controllers::state::State;
use mysql_cluster::controllers::{backup_controller, backupschedule_controller, cluster_controller, restore_controller};
use mysql_cluster::util::telemetry::{self, LogFormat};

mod handlers;
mod server;

/// Kubernetes operator managing MySQL InnoDB clusters and their backups
#[derive(Parser, Debug)]
#[command(name = "mysql-operator", version)]
struct Args {
    /// YAML file with operator settings; flags override its values
    #[arg(long, env = "MYSQL_OPERATOR_CONFIG")]
    config: Option<PathBuf>,

    /// Namespace to watch, all namespaces when unset
    #[arg(long, env = "MYSQL_OPERATOR_NAMESPACE")]
    namespace: Option<String>,

    #[arg(long, env = "MYSQL_SERVER_IMAGE")]
    mysql_server_image: Option<String>,

    #[arg(long, env = "MYSQL_AGENT_IMAGE")]
    mysql_agent_image: Option<String>,

    #[arg(long, value_parser = parse_duration)]
    cluster_resync_period: Option<Duration>,

    #[arg(long, value_parser = parse_duration)]
    schedule_resync_period: Option<Duration>,

    #[arg(long)]
    cluster_workers: Option<usize>,

    #[arg(long)]
    schedule_workers: Option<usize>,

    /// Workers for each of the Backup and Restore schedulers
    #[arg(long)]
    backup_workers: Option<usize>,

    #[arg(long, env = "LOG_LEVEL")]
    log_level: Option<String>,

    /// compact or json
    #[arg(long, env = "LOG_FORMAT")]
    log_format: Option<LogFormat>,

    /// Address serving /health, /metrics and diagnostics
    #[arg(long, env = "LISTEN_ADDRESS")]
    listen_address: Option<String>,
}

impl Args {
    /// Defaults, then the config file, then flags.
    fn into_config(self) -> anyhow::Result<OperatorConfig> {
        let mut config = match &self.config {
            Some(path) => OperatorConfig::load(path)?,
            None => OperatorConfig::default(),
        };
        if self.namespace.is_some() {
            config.namespace = self.namespace;
        }
        if let Some(image) = self.mysql_server_image {
            config.images.mysql_server_image = image;
        }
        if let Some(image) = self.mysql_agent_image {
            config.images.mysql_agent_image = image;
        }
        if let Some(period) = self.cluster_resync_period {
            config.cluster_resync_period = period;
        }
        if let Some(period) = self.schedule_resync_period {
            config.schedule_resync_period = period;
        }
        if let Some(workers) = self.cluster_workers {
            config.cluster_workers = workers;
        }
        if let Some(workers) = self.schedule_workers {
            config.schedule_workers = workers;
        }
        if let Some(workers) = self.backup_workers {
            config.backup_workers = workers;
        }
        if let Some(level) = self.log_level {
            config.log_level = level;
        }
        if let Some(format) = self.log_format {
            config.log_format = format;
        }
        if let Some(address) = self.listen_address {
            config.listen_address = address;
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Args::parse().into_config()?;
    telemetry::init(&config.log_level, config.log_format)?;
    info!(
        version = %config.operator_version,
        namespace = config.namespace.as_deref().unwrap_or("*"),
        "starting mysql-operator"
    );

    let client = Client::try_default().await?;
    let reporter = Reporter {
        controller: "mysql-operator".into(),
        instance: std::env::var("HOSTNAME").ok(),
    };
    let state = State::new(reporter)?;

    let cluster_queue = WorkQueue::new(cluster_controller::CONTROLLER_NAME, ItemBackoff::default());
    let schedule_queue = WorkQueue::new(backupschedule_controller::CONTROLLER_NAME, ItemBackoff::default());
    let backup_queue = WorkQueue::new(backup_controller::CONTROLLER_NAME, ItemBackoff::default());
    let restore_queue = WorkQueue::new(restore_controller::CONTROLLER_NAME, ItemBackoff::default());

    let clusters = cluster_controller::run(client.clone(), config.clone(), state.clone(), cluster_queue.clone());
    let schedules = backupschedule_controller::run(client.clone(), config.clone(), state.clone(), schedule_queue.clone());
    let backups = backup_controller::run(client.clone(), config.clone(), state.clone(), backup_queue.clone());
    let restores = restore_controller::run(client, config.clone(), state.clone(), restore_queue.clone());

    let server = server::start_server(state, &config.listen_address)?;
    let handle = server.handle();

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("unable to listen for shutdown signal: {e}");
        }
        info!("shutting down");
        cluster_queue.shutdown();
        schedule_queue.shutdown();
        backup_queue.shutdown();
        restore_queue.shutdown();
        handle.stop(true).await;
    });

    // Controllers drain their queues and the server stops on shutdown
    tokio::try_join!(
        async { clusters.await.map_err(anyhow::Error::from) },
        async { schedules.await.map_err(anyhow::Error::from) },
        async { backups.await.map_err(anyhow::Error::from) },
        async { restores.await.map_err(anyhow::Error::from) },
        async { server.await.map_err(anyhow::Error::from) },
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_defaults() {
        let args = Args::parse_from([
            "mysql-operator",
            "--namespace",
            "mysql",
            "--cluster-resync-period",
            "1h",
            "--schedule-workers",
            "6",
            "--backup-workers",
            "3",
            "--log-format",
            "json",
        ]);
        let config = args.into_config().unwrap();
        assert_eq!(config.namespace.as_deref(), Some("mysql"));
        assert_eq!(config.cluster_resync_period, Duration::from_secs(3600));
        assert_eq!(config.schedule_workers, 6);
        assert_eq!(config.backup_workers, 3);
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.cluster_workers, OperatorConfig::default().cluster_workers);
    }
}
