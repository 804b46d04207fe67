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

use crate::api::v1alpha1::backup::{Backup, BackupPhase, BackupStatus};
use crate::api::v1alpha1::cluster::Cluster;
use crate::config::OperatorConfig;
use crate::controllers::control::{BackupControl, KubeControl};
use crate::controllers::queue::WorkQueue;
use crate::controllers::runner::{
    list_namespaced, resync_periodically, run_workers, scoped, watch_and_enqueue, ObjectKey, Reconciler,
};
use crate::controllers::state::{Diagnostics, State};
use crate::util::errors::{Result, StdError};
use crate::util::events::{reasons, EventPublisher, KubeEventPublisher};
use crate::util::labels::{is_primary, is_secondary, Labels, CLUSTER_LABEL, ROLE_PRIMARY, ROLE_SECONDARY};
use crate::util::metrics::Metrics;

pub const CONTROLLER_NAME: &str = "backup";

/// A member of `cluster_name` to run work on, with its role. Secondaries are
/// preferred when `prefer_secondary` is set, primaries are the fallback.
pub fn choose_member(
    pods: &Store<Pod>,
    namespace: &str,
    cluster_name: &str,
    prefer_secondary: bool,
) -> Option<(String, &'static str)> {
    let first = |has_role: fn(Option<&Labels>, &str) -> bool, role: &'static str| {
        list_namespaced(pods, namespace, |p| has_role(p.metadata.labels.as_ref(), cluster_name))
            .first()
            .map(|p| (p.name_any(), role))
    };
    let secondary = if prefer_secondary {
        first(is_secondary, ROLE_SECONDARY)
    } else {
        None
    };
    secondary.or_else(|| first(is_primary, ROLE_PRIMARY))
}

/// Only Backups nobody has looked at yet are scheduled.
fn is_unscheduled(backup: &Backup) -> bool {
    backup.phase() == BackupPhase::New
}

/// Validates new Backups and assigns each to a member of its Cluster,
/// preferring a secondary.
pub struct BackupReconciler {
    pub backups: Store<Backup>,
    pub clusters: Store<Cluster>,
    pub pods: Store<Pod>,
    pub control: Arc<dyn BackupControl>,
    pub events: Arc<dyn EventPublisher>,
    pub metrics: Metrics,
    pub diagnostics: Arc<RwLock<Diagnostics>>,
}

#[async_trait]
impl Reconciler for BackupReconciler {
    type Key = ObjectKey;

    fn name(&self) -> &'static str {
        CONTROLLER_NAME
    }

    fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    async fn sync(&self, key: &ObjectKey) -> Result<()> {
        self.diagnostics.write().await.touch(CONTROLLER_NAME);

        let Some(cached) = self.backups.get(&key.object_ref()) else {
            debug!(%key, "backup no longer exists");
            return Ok(());
        };
        if !is_unscheduled(&cached) {
            debug!(%key, phase = ?cached.phase(), "backup already scheduled");
            return Ok(());
        }
        let mut backup = (*cached).clone();

        if let Err(e) = self.validate(&backup) {
            warn!(%key, error = %e, "backup failed validation");
            backup.status.get_or_insert_with(BackupStatus::default).phase = Some(BackupPhase::Failed);
            let backup = self.control.update_backup(&backup).await?;
            self.events
                .publish(
                    &backup.object_ref(&()),
                    EventType::Warning,
                    reasons::FAILED_VALIDATION,
                    "Validating",
                    e.to_string(),
                )
                .await;
            return Ok(());
        }

        let cluster_name = backup.spec.cluster.as_ref().map(|c| c.name.clone()).unwrap_or_default();
        let Some((member, role)) = choose_member(&self.pods, &key.namespace, &cluster_name, true) else {
            return Err(StdError::NoMemberAvailable(format!("cluster {cluster_name} has no labeled members")).into());
        };

        info!(%key, %member, role, "scheduling backup");
        backup.spec.scheduled_member = Some(member.clone());
        backup.status.get_or_insert_with(BackupStatus::default).phase = Some(BackupPhase::Scheduled);
        let backup = self.control.update_backup(&backup).await?;

        self.metrics.members_scheduled.with_label_values(&["backup", role]).inc();
        self.events
            .publish(
                &backup.object_ref(&()),
                EventType::Normal,
                reasons::SUCCESS_SCHEDULED,
                "Scheduling",
                format!("Scheduled on Pod {member:?}"),
            )
            .await;
        Ok(())
    }
}

impl BackupReconciler {
    /// Spec validation plus the referenced Cluster existing.
    fn validate(&self, backup: &Backup) -> std::result::Result<(), StdError> {
        backup.spec.validate()?;
        let namespace = backup.namespace().unwrap_or_default();
        let cluster_name = backup.spec.cluster.as_ref().map(|c| c.name.as_str()).unwrap_or_default();
        if self
            .clusters
            .get(&ObjectRef::new(cluster_name).within(&namespace))
            .is_none()
        {
            return Err(StdError::ValidationError(format!(
                "spec.cluster.name: Not found: {cluster_name:?}"
            )));
        }
        Ok(())
    }
}

/// Initialize the backup scheduler (given the crd is installed)
pub async fn run(client: Client, config: OperatorConfig, state: State, queue: WorkQueue<ObjectKey>) -> Result<()> {
    let namespace = config.namespace.as_deref();
    let backups = scoped::<Backup>(&client, namespace);
    if let Err(e) = backups.list(&ListParams::default().limit(1)).await {
        error!("Backup CRD is not queryable; {e:?}. Is the CRD installed?");
        return Err(e.into());
    }

    let (backup_store, backup_writer) = reflector::store::<Backup>();
    let (cluster_store, cluster_writer) = reflector::store::<Cluster>();
    let (pod_store, pod_writer) = reflector::store::<Pod>();
    let watchers = vec![
        tokio::spawn(watch_and_enqueue(
            backups,
            watcher::Config::default(),
            backup_writer,
            queue.clone(),
            |b: &Backup| is_unscheduled(b).then(|| ObjectKey::of(b)).flatten(),
        )),
        tokio::spawn(watch_and_enqueue(
            scoped::<Cluster>(&client, namespace),
            watcher::Config::default(),
            cluster_writer,
            queue.clone(),
            |_: &Cluster| None,
        )),
        tokio::spawn(watch_and_enqueue(
            scoped::<Pod>(&client, namespace),
            watcher::Config::default().labels(CLUSTER_LABEL),
            pod_writer,
            queue.clone(),
            |_: &Pod| None,
        )),
    ];

    info!("waiting for backup caches to sync");
    let synced = tokio::try_join!(
        backup_store.wait_until_ready(),
        cluster_store.wait_until_ready(),
        pod_store.wait_until_ready(),
    );
    if let Err(e) = synced {
        return Err(StdError::InvalidArgument(format!("cache writer dropped before sync: {e}")).into());
    }

    let resync = tokio::spawn(resync_periodically(
        backup_store.clone(),
        queue.clone(),
        config.schedule_resync_period,
        is_unscheduled,
    ));

    let reporter = state.diagnostics().await.reporter;
    let reconciler = BackupReconciler {
        backups: backup_store,
        clusters: cluster_store,
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::v1alpha1::backup::BackupSpec;
    use crate::fixtures::{self, FakeControl, FakeEventPublisher};

    struct Harness {
        fake: Arc<FakeControl>,
        events: Arc<FakeEventPublisher>,
        reconciler: BackupReconciler,
    }

    fn harness() -> Harness {
        let fake = Arc::new(FakeControl::default());
        let events = Arc::new(FakeEventPublisher::default());
        fake.clusters.apply(fixtures::cluster("db", 3));
        let reconciler = BackupReconciler {
            backups: fake.backups.store.clone(),
            clusters: fake.clusters.store.clone(),
            pods: fake.pods.store.clone(),
            control: fake.clone(),
            events: events.clone(),
            metrics: Metrics::default(),
            diagnostics: Default::default(),
        };
        Harness {
            fake,
            events,
            reconciler,
        }
    }

    fn key() -> ObjectKey {
        ObjectKey::new(fixtures::NAMESPACE, "nightly")
    }

    #[tokio::test]
    async fn backups_prefer_a_secondary() {
        let h = harness();
        h.fake.pods.apply(fixtures::pod("db-0", "db", Some(ROLE_PRIMARY)));
        h.fake.pods.apply(fixtures::pod("db-1", "db", Some(ROLE_SECONDARY)));
        h.fake.pods.apply(fixtures::pod("db-2", "db", Some(ROLE_SECONDARY)));
        h.fake.backups.apply(fixtures::backup("nightly", "db"));

        h.reconciler.sync(&key()).await.unwrap();

        let stored = h.fake.backups.get("nightly").unwrap();
        assert_eq!(stored.spec.scheduled_member.as_deref(), Some("db-1"));
        assert_eq!(stored.phase(), BackupPhase::Scheduled);
        assert_eq!(h.events.reasons(), vec![reasons::SUCCESS_SCHEDULED.to_string()]);
        assert_eq!(h.events.events()[0].note, "Scheduled on Pod \"db-1\"");
        assert_eq!(
            h.reconciler
                .metrics
                .members_scheduled
                .with_label_values(&["backup", ROLE_SECONDARY])
                .get(),
            1
        );

        h.fake.clear_actions();
        h.reconciler.sync(&key()).await.unwrap();
        assert!(h.fake.actions().is_empty());
    }

    #[tokio::test]
    async fn single_member_clusters_back_up_the_primary() {
        let h = harness();
        h.fake.pods.apply(fixtures::pod("db-0", "db", Some(ROLE_PRIMARY)));
        h.fake.pods.apply(fixtures::pod("other-1", "other", Some(ROLE_SECONDARY)));
        h.fake.backups.apply(fixtures::backup("nightly", "db"));

        h.reconciler.sync(&key()).await.unwrap();

        let stored = h.fake.backups.get("nightly").unwrap();
        assert_eq!(stored.spec.scheduled_member.as_deref(), Some("db-0"));
        assert_eq!(stored.phase(), BackupPhase::Scheduled);
    }

    #[tokio::test]
    async fn missing_cluster_fails_the_backup() {
        let h = harness();
        h.fake.pods.apply(fixtures::pod("db-0", "db", Some(ROLE_PRIMARY)));
        h.fake.backups.apply(fixtures::backup("nightly", "gone"));

        h.reconciler.sync(&key()).await.unwrap();

        let stored = h.fake.backups.get("nightly").unwrap();
        assert_eq!(stored.phase(), BackupPhase::Failed);
        assert_eq!(stored.spec.scheduled_member, None);
        let events = h.events.events();
        assert_eq!(events.len(), 1);
        assert!(events[0].warning);
        assert_eq!(events[0].reason, reasons::FAILED_VALIDATION);
        assert!(events[0].note.contains("gone"), "{}", events[0].note);
    }

    #[tokio::test]
    async fn invalid_spec_fails_the_backup() {
        let h = harness();
        let mut backup = fixtures::backup("nightly", "db");
        backup.spec = BackupSpec {
            cluster: backup.spec.cluster.clone(),
            ..Default::default()
        };
        h.fake.backups.apply(backup);

        h.reconciler.sync(&key()).await.unwrap();
        assert_eq!(h.fake.backups.get("nightly").unwrap().phase(), BackupPhase::Failed);
        assert_eq!(h.events.reasons(), vec![reasons::FAILED_VALIDATION.to_string()]);
    }

    #[tokio::test]
    async fn unlabeled_cluster_is_retried() {
        let h = harness();
        h.fake.pods.apply(fixtures::pod("db-0", "db", None));
        h.fake.backups.apply(fixtures::backup("nightly", "db"));

        let err = h.reconciler.sync(&key()).await.unwrap_err();
        assert_eq!(err.metric_label(), "no_member");
        assert_eq!(h.fake.backups.get("nightly").unwrap().phase(), BackupPhase::New);
        assert!(h.events.events().is_empty());
    }
}
