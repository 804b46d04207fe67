use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::ListParams;
use kube::runtime::events::EventType;
use kube::runtime::reflector::{self, ObjectRef, Store};
use kube::runtime::watcher;
use kube::{Client, Resource, ResourceExt};
use tokio::sync::RwLock;
use tracing::*;

use crate::api::v1alpha1::backup::{Backup, BackupPhase};
use crate::api::v1alpha1::cluster::Cluster;
use crate::api::v1alpha1::restore::{Restore, RestoreStatus};
use crate::api::v1alpha1::LocalReference;
use crate::config::OperatorConfig;
use crate::controllers::backup_controller::choose_member;
use crate::controllers::control::{KubeControl, RestoreControl};
use crate::controllers::queue::WorkQueue;
use crate::controllers::runner::{resync_periodically, run_workers, scoped, watch_and_enqueue, ObjectKey, Reconciler};
use crate::controllers::state::{Diagnostics, State};
use crate::util::errors::{Result, StdError};
use crate::util::events::{reasons, EventPublisher, KubeEventPublisher};
use crate::util::labels::CLUSTER_LABEL;
use crate::util::metrics::Metrics;

pub const CONTROLLER_NAME: &str = "restore";

fn is_unscheduled(restore: &Restore) -> bool {
    restore.phase() == BackupPhase::New
}

/// Validates new Restores and assigns each to its Cluster's primary.
pub struct RestoreReconciler {
    pub restores: Store<Restore>,
    pub clusters: Store<Cluster>,
    pub backups: Store<Backup>,
    pub pods: Store<Pod>,
    pub control: Arc<dyn RestoreControl>,
    pub events: Arc<dyn EventPublisher>,
    pub metrics: Metrics,
    pub diagnostics: Arc<RwLock<Diagnostics>>,
}

#[async_trait]
impl Reconciler for RestoreReconciler {
    type Key = ObjectKey;

    fn name(&self) -> &'static str {
        CONTROLLER_NAME
    }

    fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    async fn sync(&self, key: &ObjectKey) -> Result<()> {
        self.diagnostics.write().await.touch(CONTROLLER_NAME);

        let Some(cached) = self.restores.get(&key.object_ref()) else {
            debug!(%key, "restore no longer exists");
            return Ok(());
        };
        if !is_unscheduled(&cached) {
            return Ok(());
        }
        let mut restore = (*cached).clone();

        if let Err(e) = self.validate(&key.namespace, &restore) {
            warn!(%key, error = %e, "restore failed validation");
            restore.status.get_or_insert_with(RestoreStatus::default).phase = Some(BackupPhase::Failed);
            let restore = self.control.update_restore(&restore).await?;
            self.events
                .publish(
                    &restore.object_ref(&()),
                    EventType::Warning,
                    reasons::FAILED_VALIDATION,
                    "Validating",
                    e.to_string(),
                )
                .await;
            return Ok(());
        }

        let cluster_name = restore.spec.cluster.as_ref().map(|c| c.name.clone()).unwrap_or_default();
        let Some((member, role)) = choose_member(&self.pods, &key.namespace, &cluster_name, false) else {
            return Err(StdError::NoMemberAvailable(format!("cluster {cluster_name} has no primary")).into());
        };

        info!(%key, %member, "scheduling restore");
        restore.spec.scheduled_member = Some(member.clone());
        restore.status.get_or_insert_with(RestoreStatus::default).phase = Some(BackupPhase::Scheduled);
        let restore = self.control.update_restore(&restore).await?;

        self.metrics.members_scheduled.with_label_values(&["restore", role]).inc();
        self.events
            .publish(
                &restore.object_ref(&()),
                EventType::Normal,
                reasons::SUCCESS_SCHEDULED,
                "Scheduling",
                format!("Scheduled on Pod {member:?}"),
            )
            .await;
        Ok(())
    }
}

impl RestoreReconciler {
    /// Spec validation plus the referenced Cluster and Backup existing.
    fn validate(&self, namespace: &str, restore: &Restore) -> std::result::Result<(), StdError> {
        restore.spec.validate()?;
        let name = |r: &Option<LocalReference>| r.as_ref().map(|r| r.name.clone()).unwrap_or_default();
        let cluster_name = name(&restore.spec.cluster);
        let mut errors = Vec::new();
        if self.clusters.get(&ObjectRef::new(&cluster_name).within(namespace)).is_none() {
            errors.push(format!("spec.cluster.name: Not found: {cluster_name:?}"));
        }
        let backup_name = name(&restore.spec.backup);
        if self.backups.get(&ObjectRef::new(&backup_name).within(namespace)).is_none() {
            errors.push(format!("spec.backup.name: Not found: {backup_name:?}"));
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(StdError::ValidationError(errors.join(", ")))
        }
    }
}

/// Initialize the restore scheduler (given the crd is installed)
pub async fn run(client: Client, config: OperatorConfig, state: State, queue: WorkQueue<ObjectKey>) -> Result<()> {
    let namespace = config.namespace.as_deref();
    let restores = scoped::<Restore>(&client, namespace);
    if let Err(e) = restores.list(&ListParams::default().limit(1)).await {
        error!("Restore CRD is not queryable; {e:?}. Is the CRD installed?");
        return Err(e.into());
    }

    let (restore_store, restore_writer) = reflector::store::<Restore>();
    let (cluster_store, cluster_writer) = reflector::store::<Cluster>();
    let (backup_store, backup_writer) = reflector::store::<Backup>();
    let (pod_store, pod_writer) = reflector::store::<Pod>();
    let watchers = vec![
        tokio::spawn(watch_and_enqueue(
            restores,
            watcher::Config::default(),
            restore_writer,
            queue.clone(),
            |r: &Restore| is_unscheduled(r).then(|| ObjectKey::of(r)).flatten(),
        )),
        tokio::spawn(watch_and_enqueue(
            scoped::<Cluster>(&client, namespace),
            watcher::Config::default(),
            cluster_writer,
            queue.clone(),
            |_: &Cluster| None,
        )),
        tokio::spawn(watch_and_enqueue(
            scoped::<Backup>(&client, namespace),
            watcher::Config::default(),
            backup_writer,
            queue.clone(),
            |_: &Backup| None,
        )),
        tokio::spawn(watch_and_enqueue(
            scoped::<Pod>(&client, namespace),
            watcher::Config::default().labels(CLUSTER_LABEL),
            pod_writer,
            queue.clone(),
            |_: &Pod| None,
        )),
    ];

    info!("waiting for restore caches to sync");
    let synced = tokio::try_join!(
        restore_store.wait_until_ready(),
        cluster_store.wait_until_ready(),
        backup_store.wait_until_ready(),
        pod_store.wait_until_ready(),
    );
    if let Err(e) = synced {
        return Err(StdError::InvalidArgument(format!("cache writer dropped before sync: {e}")).into());
    }

    let resync = tokio::spawn(resync_periodically(
        restore_store.clone(),
        queue.clone(),
        config.schedule_resync_period,
        is_unscheduled,
    ));

    let reporter = state.diagnostics().await.reporter;
    let reconciler = RestoreReconciler {
        restores: restore_store,
        clusters: cluster_store,
        backups: backup_store,
        pods: pod_store,
        control: Arc::new(KubeControl::new(client.clone())),
        events: Arc::new(KubeEventPublisher::new(client, reporter)),
        metrics: state.recorder(),
        diagnostics: state.diagnostics_handle(),
    };

    run_workers(Arc::new(reconciler), queue, config.backup_workers).await;

    resync.abort();
    for watcher in watchers {
        watcher.abort();
    }
    Ok(())
}
