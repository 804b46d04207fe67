use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{Pod, Secret, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, ObjectMeta, Time};
use kube::api::ListParams;
use kube::runtime::events::EventType;
use kube::runtime::reflector::{self, ObjectRef, Store};
use kube::runtime::watcher;
use kube::{Client, Resource, ResourceExt};
use tokio::sync::RwLock;
use tracing::*;

use crate::api::v1alpha1::backup::Backup;
use crate::api::v1alpha1::cluster::{Cluster, CONDITION_READY};
use crate::api::v1alpha1::restore::Restore;
use crate::config::{Images, OperatorConfig};
use crate::controllers::control::{
    ClusterControl, KubeControl, PodControl, SecretControl, ServiceControl, StatefulSetControl,
};
use crate::controllers::queue::WorkQueue;
use crate::controllers::runner::{
    controller_owner_key, list_namespaced, resync_periodically, run_workers, scoped, watch_and_enqueue, ObjectKey,
    Reconciler,
};
use crate::controllers::state::{Diagnostics, State};
use crate::controllers::upgrade::{
    mysql_version, requires_agent_pod_upgrade, requires_agent_statefulset_upgrade, update_pod_to_operator_version,
    update_statefulset_to_mysql_version, update_statefulset_to_operator_version, BackupAwareGate, UpgradeGate,
};
use crate::resources::statefulset::server_image;
use crate::resources::{is_controlled_by, secret, service, statefulset};
use crate::util::errors::{Error, Result, StdError};
use crate::util::events::{reasons, EventPublisher, KubeEventPublisher};
use crate::util::labels::{has_operator_version, in_cluster, CLUSTER_LABEL, OPERATOR_VERSION_LABEL};
use crate::util::metrics::Metrics;
use crate::util::retry::{retry_on_conflict, ConflictRetry};
use crate::util::status::{set_status_condition, CONDITION_FALSE, CONDITION_TRUE};
use crate::util::version::MysqlVersion;

pub const CONTROLLER_NAME: &str = "cluster";

/// Read side of the Cluster reconciler.
#[derive(Clone)]
pub struct ClusterStores {
    pub clusters: Store<Cluster>,
    pub secrets: Store<Secret>,
    pub services: Store<Service>,
    pub statefulsets: Store<StatefulSet>,
    pub pods: Store<Pod>,
}

/// Write side of the Cluster reconciler.
#[derive(Clone)]
pub struct ClusterControls {
    pub clusters: Arc<dyn ClusterControl>,
    pub secrets: Arc<dyn SecretControl>,
    pub services: Arc<dyn ServiceControl>,
    pub statefulsets: Arc<dyn StatefulSetControl>,
    pub pods: Arc<dyn PodControl>,
}

impl ClusterControls {
    pub fn from_control<C>(control: Arc<C>) -> Self
    where
        C: ClusterControl + SecretControl + ServiceControl + StatefulSetControl + PodControl + 'static,
    {
        Self {
            clusters: control.clone(),
            secrets: control.clone(),
            services: control.clone(),
            statefulsets: control.clone(),
            pods: control,
        }
    }
}

/// Converges a Cluster's Secret, Service and StatefulSet, keeps every
/// member on the running operator version and reports readiness.
pub struct ClusterReconciler {
    pub stores: ClusterStores,
    pub controls: ClusterControls,
    pub events: Arc<dyn EventPublisher>,
    pub gate: Arc<dyn UpgradeGate>,
    pub images: Images,
    pub operator_version: String,
    pub retry: ConflictRetry,
    pub metrics: Metrics,
    pub diagnostics: Arc<RwLock<Diagnostics>>,
}

#[async_trait]
impl Reconciler for ClusterReconciler {
    type Key = ObjectKey;

    fn name(&self) -> &'static str {
        CONTROLLER_NAME
    }

    fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    async fn sync(&self, key: &ObjectKey) -> Result<()> {
        self.diagnostics.write().await.touch(CONTROLLER_NAME);

        let Some(cached) = self.stores.clusters.get(&key.object_ref()) else {
            debug!(%key, "cluster no longer exists");
            return Ok(());
        };
        let mut cluster = (*cached).clone();
        cluster.ensure_defaults();
        if let Err(e) = cluster.validate() {
            self.publish(&cluster, EventType::Warning, reasons::FAILED_VALIDATION, e.to_string())
                .await;
            return Err(e.into());
        }

        let name = cluster.name_any();
        let labels = cluster.metadata.labels.as_ref();
        if !in_cluster(labels, &name) || !labels.is_some_and(|l| l.contains_key(OPERATOR_VERSION_LABEL)) {
            info!(%key, "setting cluster labels");
            self.update_labels(key, &cluster).await?;
            return Ok(());
        }

        if cluster.requires_secret() {
            self.ensure_secret(key, &cluster).await?;
        }
        let Some(service) = self.ensure_service(key, &cluster).await? else {
            return Ok(());
        };
        let service_name = service.name_any();
        let Some(ss) = self.ensure_statefulset(key, &cluster, &service_name).await? else {
            return Ok(());
        };

        let ss = self.ensure_operator_version(key, &mut cluster, ss).await?;
        let ss = self.ensure_mysql_version(key, &cluster, ss).await?;
        let ss = self.ensure_replicas(key, &cluster, ss, &service_name).await?;

        self.update_status(key, &cluster, &ss).await
    }
}

impl ClusterReconciler {
    async fn publish(&self, cluster: &Cluster, type_: EventType, reason: &str, note: String) {
        self.events
            .publish(&cluster.object_ref(&()), type_, reason, "Reconciling", note)
            .await;
    }

    /// The cluster to write on `attempt`: the one being reconciled first,
    /// then whatever the cache holds after a conflict.
    fn fresh(&self, key: &ObjectKey, cluster: &Cluster, attempt: u32) -> Result<Cluster> {
        if attempt == 1 {
            return Ok(cluster.clone());
        }
        self.stores
            .clusters
            .get(&key.object_ref())
            .map(|c| (*c).clone())
            .ok_or_else(|| StdError::MetadataMissing(format!("cluster {key} is no longer cached")).into())
    }

    async fn update_labels(&self, key: &ObjectKey, cluster: &Cluster) -> Result<Cluster> {
        let control = self.controls.clusters.clone();
        let name = cluster.name_any();
        retry_on_conflict(&self.retry, "update cluster labels", |attempt| {
            let latest = self.fresh(key, cluster, attempt);
            let control = control.clone();
            let name = name.clone();
            let version = self.operator_version.clone();
            async move {
                let mut updated = latest?;
                let labels = updated.labels_mut();
                labels.insert(CLUSTER_LABEL.to_string(), name);
                labels.insert(OPERATOR_VERSION_LABEL.to_string(), version);
                control.update_cluster_labels(&updated).await
            }
        })
        .await
    }

    async fn ensure_secret(&self, key: &ObjectKey, cluster: &Cluster) -> Result<()> {
        let secret_ref = ObjectRef::<Secret>::new(&cluster.root_password_secret_name()).within(&key.namespace);
        if self.stores.secrets.get(&secret_ref).is_some() {
            return Ok(());
        }
        info!(%key, secret = %secret_ref.name, "creating root password secret");
        match self.controls.secrets.create_secret(&secret::new_root_password(cluster)?).await {
            Err(e) if e.is_already_exists() => Ok(()),
            other => other.map(|_| ()),
        }
    }

    async fn ownership_conflict(&self, cluster: &Cluster, kind: &str, meta: &ObjectMeta) -> Error {
        let e = StdError::OwnershipConflict {
            kind: kind.to_string(),
            namespace: meta.namespace.clone().unwrap_or_default(),
            name: meta.name.clone().unwrap_or_default(),
        };
        self.publish(cluster, EventType::Warning, reasons::RESOURCE_EXISTS, e.to_string())
            .await;
        e.into()
    }

    /// The cluster's Service, created when missing. `None` when a create
    /// raced an object the cache has not seen yet.
    async fn ensure_service(&self, key: &ObjectKey, cluster: &Cluster) -> Result<Option<Service>> {
        let service = match self.stores.services.get(&key.object_ref()) {
            Some(existing) => (*existing).clone(),
            None => {
                info!(%key, "creating service");
                match self.controls.services.create_service(&service::new_for_cluster(cluster)?).await {
                    Ok(created) => created,
                    Err(e) if e.is_already_exists() => {
                        debug!(%key, "service exists but is not cached yet");
                        return Ok(None);
                    }
                    Err(e) => return Err(e),
                }
            }
        };
        if !is_controlled_by(&service.metadata, cluster) {
            return Err(self.ownership_conflict(cluster, "Service", &service.metadata).await);
        }
        Ok(Some(service))
    }

    async fn ensure_statefulset(
        &self,
        key: &ObjectKey,
        cluster: &Cluster,
        service_name: &str,
    ) -> Result<Option<StatefulSet>> {
        let ss = match self.stores.statefulsets.get(&key.object_ref()) {
            Some(existing) => (*existing).clone(),
            None => {
                info!(%key, "creating statefulset");
                let desired =
                    statefulset::new_for_cluster(cluster, &self.images, &self.operator_version, service_name)?;
                match self.controls.statefulsets.create_statefulset(&desired).await {
                    Ok(created) => {
                        self.metrics.clusters_created.inc();
                        created
                    }
                    Err(e) if e.is_already_exists() => {
                        debug!(%key, "statefulset exists but is not cached yet");
                        return Ok(None);
                    }
                    Err(e) => return Err(e),
                }
            }
        };
        if !is_controlled_by(&ss.metadata, cluster) {
            return Err(self.ownership_conflict(cluster, "StatefulSet", &ss.metadata).await);
        }
        Ok(Some(ss))
    }

    /// Moves member pods, the StatefulSet and the Cluster itself to the
    /// running operator version.
    async fn ensure_operator_version(
        &self,
        key: &ObjectKey,
        cluster: &mut Cluster,
        ss: StatefulSet,
    ) -> Result<StatefulSet> {
        let agent_repository = &self.images.mysql_agent_image;
        let version = &self.operator_version;
        let name = cluster.name_any();

        let pods = list_namespaced(&self.stores.pods, &key.namespace, |p| {
            in_cluster(p.metadata.labels.as_ref(), &name)
        });
        for pod in pods {
            if !requires_agent_pod_upgrade(&pod, agent_repository, version) {
                continue;
            }
            if !self.gate.can_upgrade(&pod) {
                info!(%key, pod = %pod.name_any(), "pod is busy, postponing agent upgrade");
                continue;
            }
            info!(%key, pod = %pod.name_any(), %version, "upgrading pod to operator version");
            let updated = update_pod_to_operator_version(&pod, agent_repository, version);
            self.controls.pods.patch_pod(&pod, &updated).await?;
        }

        let ss = if requires_agent_statefulset_upgrade(&ss, agent_repository, version) {
            info!(%key, %version, "upgrading statefulset to operator version");
            let updated = update_statefulset_to_operator_version(&ss, agent_repository, version);
            self.controls.statefulsets.patch_statefulset(&ss, &updated).await?
        } else {
            ss
        };

        if !has_operator_version(cluster.metadata.labels.as_ref(), version) {
            info!(%key, %version, "upgrading cluster to operator version");
            let updated = self.update_labels(key, cluster).await?;
            cluster.metadata = updated.metadata;
        }
        Ok(ss)
    }

    /// Rolls the server image forward to the requested version. Downgrades
    /// are refused without touching anything.
    async fn ensure_mysql_version(&self, key: &ObjectKey, cluster: &Cluster, ss: StatefulSet) -> Result<StatefulSet> {
        let repository = server_image(cluster, &self.images);
        let desired: MysqlVersion = cluster.spec.version.parse()?;
        match mysql_version(&ss, &repository) {
            Some(current) if current == desired => return Ok(ss),
            Some(current) if current > desired => {
                let e = StdError::UnsupportedDowngrade {
                    current: current.to_string(),
                    desired: desired.to_string(),
                };
                self.publish(cluster, EventType::Warning, reasons::UNSUPPORTED_DOWNGRADE, e.to_string())
                    .await;
                return Err(e.into());
            }
            current => {
                info!(%key, ?current, %desired, "rolling mysql version");
            }
        }
        let updated = update_statefulset_to_mysql_version(&ss, &repository, &cluster.spec.version);
        self.controls.statefulsets.patch_statefulset(&ss, &updated).await
    }

    async fn ensure_replicas(
        &self,
        key: &ObjectKey,
        cluster: &Cluster,
        ss: StatefulSet,
        service_name: &str,
    ) -> Result<StatefulSet> {
        let current = ss.spec.as_ref().and_then(|s| s.replicas);
        if current == Some(cluster.spec.members) {
            return Ok(ss);
        }
        info!(%key, ?current, desired = cluster.spec.members, "scaling statefulset");
        let desired = statefulset::new_for_cluster(cluster, &self.images, &self.operator_version, service_name)?;
        let mut updated = ss.clone();
        if let (Some(spec), Some(desired)) = (updated.spec.as_mut(), desired.spec) {
            spec.replicas = desired.replicas;
            spec.template = desired.template;
        }
        self.controls.statefulsets.patch_statefulset(&ss, &updated).await
    }

    /// Upserts the Ready condition. No write happens when it is unchanged.
    async fn update_status(&self, key: &ObjectKey, cluster: &Cluster, ss: &StatefulSet) -> Result<()> {
        let desired = ss.spec.as_ref().and_then(|s| s.replicas).unwrap_or(0);
        let replicas = ss.status.as_ref().map_or(0, |s| s.replicas);
        let ready = ss.status.as_ref().and_then(|s| s.ready_replicas).unwrap_or(0);
        let is_ready = desired > 0 && replicas == desired && ready == desired;

        let condition = Condition {
            type_: CONDITION_READY.to_string(),
            status: if is_ready { CONDITION_TRUE } else { CONDITION_FALSE }.to_string(),
            reason: if is_ready { "MembersReady" } else { "MembersNotReady" }.to_string(),
            message: format!("{ready}/{desired} members ready"),
            observed_generation: cluster.metadata.generation,
            last_transition_time: Time(Utc::now()),
        };
        let (_, changed) = set_status_condition(cluster.conditions(), condition.clone());
        if !changed {
            return Ok(());
        }

        debug!(%key, ready, desired, "updating cluster status");
        let control = self.controls.clusters.clone();
        retry_on_conflict(&self.retry, "update cluster status", |attempt| {
            let latest = self.fresh(key, cluster, attempt);
            let control = control.clone();
            let condition = condition.clone();
            async move {
                let mut updated = latest?;
                let (conditions, _) = set_status_condition(updated.conditions(), condition);
                updated.status.get_or_insert_with(Default::default).conditions = conditions;
                control.update_cluster_status(&updated).await
            }
        })
        .await?;
        Ok(())
    }
}


/// Initialize the cluster controller and shared state (given the crd is installed)
pub async fn run(client: Client, config: OperatorConfig, state: State, queue: WorkQueue<ObjectKey>) -> Result<()> {
    let namespace = config.namespace.as_deref();
    let clusters = scoped::<Cluster>(&client, namespace);
    if let Err(e) = clusters.list(&ListParams::default().limit(1)).await {
        error!("Cluster CRD is not queryable; {e:?}. Is the CRD installed?");
        info!("Installation: cargo run --bin crdgen | kubectl apply -f -");
        return Err(e.into());
    }

    let (cluster_store, cluster_writer) = reflector::store::<Cluster>();
    let (secret_store, secret_writer) = reflector::store::<Secret>();
    let (service_store, service_writer) = reflector::store::<Service>();
    let (statefulset_store, statefulset_writer) = reflector::store::<StatefulSet>();
    let (pod_store, pod_writer) = reflector::store::<Pod>();
    let (backup_store, backup_writer) = reflector::store::<Backup>();
    let (restore_store, restore_writer) = reflector::store::<Restore>();

    let members = watcher::Config::default().labels(CLUSTER_LABEL);
    let watchers = vec![
        tokio::spawn(watch_and_enqueue(
            clusters,
            watcher::Config::default(),
            cluster_writer,
            queue.clone(),
            |c: &Cluster| ObjectKey::of(c),
        )),
        tokio::spawn(watch_and_enqueue(
            scoped::<Secret>(&client, namespace),
            members.clone(),
            secret_writer,
            queue.clone(),
            |s: &Secret| controller_owner_key(s, "Cluster"),
        )),
        tokio::spawn(watch_and_enqueue(
            scoped::<Service>(&client, namespace),
            watcher::Config::default(),
            service_writer,
            queue.clone(),
            |s: &Service| controller_owner_key(s, "Cluster"),
        )),
        tokio::spawn(watch_and_enqueue(
            scoped::<StatefulSet>(&client, namespace),
            watcher::Config::default(),
            statefulset_writer,
            queue.clone(),
            |s: &StatefulSet| controller_owner_key(s, "Cluster"),
        )),
        tokio::spawn(watch_and_enqueue(
            scoped::<Pod>(&client, namespace),
            members,
            pod_writer,
            queue.clone(),
            |p: &Pod| Some(ObjectKey::new(p.namespace()?, p.labels().get(CLUSTER_LABEL)?.clone())),
        )),
        tokio::spawn(watch_and_enqueue(
            scoped::<Backup>(&client, namespace),
            watcher::Config::default(),
            backup_writer,
            queue.clone(),
            |_: &Backup| None,
        )),
        tokio::spawn(watch_and_enqueue(
            scoped::<Restore>(&client, namespace),
            watcher::Config::default(),
            restore_writer,
            queue.clone(),
            |_: &Restore| None,
        )),
    ];

    info!("waiting for cluster caches to sync");
    let synced = tokio::try_join!(
        cluster_store.wait_until_ready(),
        secret_store.wait_until_ready(),
        service_store.wait_until_ready(),
        statefulset_store.wait_until_ready(),
        pod_store.wait_until_ready(),
        backup_store.wait_until_ready(),
        restore_store.wait_until_ready(),
    );
    if let Err(e) = synced {
        return Err(StdError::InvalidArgument(format!("cache writer dropped before sync: {e}")).into());
    }

    let resync = tokio::spawn(resync_periodically(
        cluster_store.clone(),
        queue.clone(),
        config.cluster_resync_period,
        |_| true,
    ));

    let reporter = state.diagnostics().await.reporter;
    let reconciler = ClusterReconciler {
        stores: ClusterStores {
            clusters: cluster_store,
            secrets: secret_store,
            services: service_store,
            statefulsets: statefulset_store,
            pods: pod_store,
        },
        controls: ClusterControls::from_control(Arc::new(KubeControl::new(client.clone()))),
        events: Arc::new(KubeEventPublisher::new(client, reporter)),
        gate: Arc::new(BackupAwareGate::new(backup_store, restore_store)),
        images: config.images.clone(),
        operator_version: config.operator_version.clone(),
        retry: ConflictRetry::default(),
        metrics: state.recorder(),
        diagnostics: state.diagnostics_handle(),
    };

    run_workers(Arc::new(reconciler), queue, config.cluster_workers).await;

    resync.abort();
    for watcher in watchers {
        watcher.abort();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{self, FakeControl, FakeEventPublisher};
    use crate::resources::statefulset::{container, AGENT_CONTAINER, MYSQL_CONTAINER};
    use crate::util::errors::api_error;
    use crate::util::status::is_status_condition_true;
    use kube::runtime::reflector::store::Writer;

    const OPERATOR: &str = "1.1.0";

    struct Harness {
        fake: Arc<FakeControl>,
        events: Arc<FakeEventPublisher>,
        reconciler: ClusterReconciler,
    }

    fn harness() -> Harness {
        let fake = Arc::new(FakeControl::default());
        let events = Arc::new(FakeEventPublisher::default());
        let reconciler = ClusterReconciler {
            stores: ClusterStores {
                clusters: fake.clusters.store.clone(),
                secrets: fake.secrets.store.clone(),
                services: fake.services.store.clone(),
                statefulsets: fake.statefulsets.store.clone(),
                pods: fake.pods.store.clone(),
            },
            controls: ClusterControls::from_control(fake.clone()),
            events: events.clone(),
            gate: Arc::new(BackupAwareGate::new(
                fake.backups.store.clone(),
                Writer::<Restore>::default().as_reader(),
            )),
            images: Images::default(),
            operator_version: OPERATOR.to_string(),
            retry: ConflictRetry::default(),
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
        ObjectKey::new(fixtures::NAMESPACE, "db")
    }

    /// Cluster with an owned Secret, Service and a ready StatefulSet
    /// templated at `agent_version`.
    fn existing(h: &Harness, agent_version: &str) -> Cluster {
        let mut cluster = fixtures::labeled_cluster("db", 3, OPERATOR);
        cluster.ensure_defaults();
        h.fake.clusters.apply(cluster.clone());
        h.fake.secrets.apply(secret::new_root_password(&cluster).unwrap());
        h.fake.services.apply(service::new_for_cluster(&cluster).unwrap());
        let ss = statefulset::new_for_cluster(&cluster, &Images::default(), agent_version, "db").unwrap();
        h.fake.statefulsets.apply(fixtures::ready(ss));
        cluster
    }

    #[tokio::test]
    async fn new_cluster_converges_to_ready() {
        let h = harness();
        h.fake.clusters.apply(fixtures::cluster("db", 3));

        h.reconciler.sync(&key()).await.unwrap();
        assert_eq!(h.fake.actions().len(), 1);
        assert_eq!(h.fake.count("update_labels", "Cluster"), 1);
        let labels = h.fake.clusters.get("db").unwrap().metadata.labels.unwrap();
        assert_eq!(labels[CLUSTER_LABEL], "db");
        assert_eq!(labels[OPERATOR_VERSION_LABEL], OPERATOR);

        h.reconciler.sync(&key()).await.unwrap();
        assert_eq!(h.fake.count("create", "Secret"), 1);
        assert_eq!(h.fake.count("create", "Service"), 1);
        assert_eq!(h.fake.count("create", "StatefulSet"), 1);
        let cluster = h.fake.clusters.get("db").unwrap();
        assert!(!is_status_condition_true(cluster.conditions(), CONDITION_READY));

        let ss = h.fake.statefulsets.get("db").unwrap();
        assert_eq!(ss.spec.as_ref().unwrap().replicas, Some(3));
        h.fake.statefulsets.apply(fixtures::ready(ss));

        h.reconciler.sync(&key()).await.unwrap();
        let cluster = h.fake.clusters.get("db").unwrap();
        assert!(is_status_condition_true(cluster.conditions(), CONDITION_READY));
        assert_eq!(h.fake.count("create", "Secret"), 1);
        assert_eq!(h.fake.count("create", "Service"), 1);
        assert_eq!(h.fake.count("create", "StatefulSet"), 1);
        assert_eq!(h.reconciler.metrics.clusters_created.get(), 1);
    }

    #[tokio::test]
    async fn converged_cluster_needs_no_writes() {
        let h = harness();
        h.fake.clusters.apply(fixtures::cluster("db", 3));
        h.reconciler.sync(&key()).await.unwrap();
        h.reconciler.sync(&key()).await.unwrap();
        let ss = h.fake.statefulsets.get("db").unwrap();
        h.fake.statefulsets.apply(fixtures::ready(ss));
        h.reconciler.sync(&key()).await.unwrap();

        h.fake.clear_actions();
        h.reconciler.sync(&key()).await.unwrap();
        assert_eq!(h.fake.actions(), vec![]);
    }

    #[tokio::test]
    async fn user_supplied_password_is_not_generated() {
        let h = harness();
        let mut cluster = fixtures::labeled_cluster("db", 3, OPERATOR);
        cluster.spec.root_password_secret = Some(crate::api::v1alpha1::LocalReference::new("mine"));
        h.fake.clusters.apply(cluster);

        h.reconciler.sync(&key()).await.unwrap();
        assert_eq!(h.fake.count("create", "Secret"), 0);
        assert_eq!(h.fake.count("create", "StatefulSet"), 1);
    }

    #[tokio::test]
    async fn foreign_service_is_left_alone() {
        let h = harness();
        h.fake.clusters.apply(fixtures::labeled_cluster("db", 3, OPERATOR));
        let mut foreign = Service::default();
        foreign.metadata.name = Some("db".into());
        foreign.metadata.namespace = Some(fixtures::NAMESPACE.into());
        foreign.metadata.resource_version = Some("7".into());
        h.fake.services.apply(foreign.clone());

        let err = h.reconciler.sync(&key()).await.unwrap_err();
        assert!(matches!(err, Error::StdError(StdError::OwnershipConflict { ref kind, .. }) if kind == "Service"));
        assert_eq!(h.events.reasons(), vec![reasons::RESOURCE_EXISTS.to_string()]);
        assert!(h.events.events()[0].warning);
        assert_eq!(h.fake.count("create", "Service"), 0);
        assert_eq!(h.fake.count("patch", "Service"), 0);
        assert_eq!(h.fake.count("create", "StatefulSet"), 0);
        assert_eq!(h.fake.services.get("db"), Some(foreign));
    }

    #[tokio::test]
    async fn invalid_cluster_is_reported_and_untouched() {
        let h = harness();
        h.fake.clusters.apply(fixtures::cluster("db", 12));

        let err = h.reconciler.sync(&key()).await.unwrap_err();
        assert_eq!(err.metric_label(), "validation");
        assert_eq!(h.events.reasons(), vec![reasons::FAILED_VALIDATION.to_string()]);
        assert!(h.fake.actions().is_empty());
    }

    #[tokio::test]
    async fn deleted_cluster_is_a_noop() {
        let h = harness();
        h.reconciler.sync(&key()).await.unwrap();
        assert!(h.fake.actions().is_empty());
    }

    #[tokio::test]
    async fn agent_skew_is_patched_once() {
        let h = harness();
        existing(&h, "1.0.0");

        h.reconciler.sync(&key()).await.unwrap();
        assert_eq!(h.fake.count("patch", "StatefulSet"), 1);
        let ss = h.fake.statefulsets.get("db").unwrap();
        assert_eq!(
            container(&ss, AGENT_CONTAINER).and_then(|c| c.image.clone()),
            Some(format!("ghcr.io/molnett/mysql-agent:{OPERATOR}"))
        );
        assert_eq!(ss.labels()[OPERATOR_VERSION_LABEL], OPERATOR);

        h.reconciler.sync(&key()).await.unwrap();
        assert_eq!(h.fake.count("patch", "StatefulSet"), 1);
    }

    #[tokio::test]
    async fn busy_pods_keep_their_agent() {
        let h = harness();
        existing(&h, OPERATOR);
        h.fake.pods.apply(fixtures::pod("db-0", "db", None));
        h.fake.pods.apply(fixtures::pod("db-1", "db", None));
        let mut backup = crate::api::v1alpha1::backup::Backup::new(
            "nightly",
            crate::api::v1alpha1::backup::BackupSpec {
                scheduled_member: Some("db-1".into()),
                ..Default::default()
            },
        );
        backup.metadata.namespace = Some(fixtures::NAMESPACE.into());
        backup.status = Some(crate::api::v1alpha1::backup::BackupStatus {
            phase: Some(crate::api::v1alpha1::backup::BackupPhase::Scheduled),
            ..Default::default()
        });
        h.fake.backups.apply(backup);

        h.reconciler.sync(&key()).await.unwrap();
        let patched: Vec<_> = h
            .fake
            .actions()
            .into_iter()
            .filter(|a| a.verb == "patch" && a.kind == "Pod")
            .map(|a| a.name)
            .collect();
        assert_eq!(patched, vec!["db-0".to_string()]);
    }

    #[tokio::test]
    async fn version_bump_rolls_the_server_image() {
        let h = harness();
        let mut cluster = existing(&h, OPERATOR);
        cluster.spec.version = "8.0.13".into();
        h.fake.clusters.apply(cluster);

        h.reconciler.sync(&key()).await.unwrap();
        assert_eq!(h.fake.count("patch", "StatefulSet"), 1);
        let ss = h.fake.statefulsets.get("db").unwrap();
        assert_eq!(
            container(&ss, MYSQL_CONTAINER).and_then(|c| c.image.clone()).as_deref(),
            Some("mysql/mysql-server:8.0.13")
        );
        let strategy = ss.spec.unwrap().update_strategy.unwrap();
        assert_eq!(strategy.type_.as_deref(), Some("RollingUpdate"));
    }

    #[tokio::test]
    async fn downgrades_are_refused() {
        let h = harness();
        let mut cluster = existing(&h, OPERATOR);
        cluster.spec.version = "8.0.11".into();
        h.fake.clusters.apply(cluster);

        let err = h.reconciler.sync(&key()).await.unwrap_err();
        assert_eq!(err.metric_label(), "unsupported_downgrade");
        assert_eq!(h.fake.count("patch", "StatefulSet"), 0);
        assert_eq!(h.events.reasons(), vec![reasons::UNSUPPORTED_DOWNGRADE.to_string()]);
    }

    #[tokio::test]
    async fn member_count_change_scales_the_statefulset() {
        let h = harness();
        let mut cluster = existing(&h, OPERATOR);
        cluster.spec.members = 5;
        h.fake.clusters.apply(cluster);

        h.reconciler.sync(&key()).await.unwrap();
        assert_eq!(h.fake.count("patch", "StatefulSet"), 1);
        let ss = h.fake.statefulsets.get("db").unwrap();
        assert_eq!(ss.spec.unwrap().replicas, Some(5));
    }

    #[tokio::test]
    async fn status_write_retries_on_conflict() {
        let h = harness();
        existing(&h, OPERATOR);
        h.fake.fail_next("update_status", "Cluster", api_error(409, "Conflict"));

        h.reconciler.sync(&key()).await.unwrap();
        assert_eq!(h.fake.count("update_status", "Cluster"), 1);
        let cluster = h.fake.clusters.get("db").unwrap();
        assert!(is_status_condition_true(cluster.conditions(), CONDITION_READY));
    }
}
