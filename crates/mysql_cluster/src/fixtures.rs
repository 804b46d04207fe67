//! In-memory capabilities and object builders for reconciler tests.
//!
//! `FakeControl` writes into reflector stores the reconcilers also read
//! from, so a second pass observes the first pass' writes the same way it
//! would once the watch caught up.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt::Debug;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetStatus};
use k8s_openapi::api::core::v1::{ObjectReference, Pod, PodSpec, Secret, Service};
use kube::runtime::events::EventType;
use kube::runtime::reflector::{store::Writer, ObjectRef, Store};
use kube::runtime::watcher;
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::api::v1alpha1::backup::{
    Backup, BackupExecutor, BackupSpec, Database, MysqldumpExecutor, S3StorageProvider, StorageProvider,
};
use crate::api::v1alpha1::backupschedule::{BackupSchedule, BackupScheduleSpec, BackupScheduleStatus};
use crate::api::v1alpha1::cluster::{Cluster, ClusterSpec};
use crate::api::v1alpha1::restore::{Restore, RestoreSpec};
use crate::api::v1alpha1::LocalReference;
use crate::controllers::control::{
    merge_patch, BackupControl, BackupScheduleControl, ClusterControl, PodControl, RestoreControl, SecretControl,
    ServiceControl, StatefulSetControl,
};
use crate::util::errors::{api_error, Error, Result};
use crate::util::events::EventPublisher;
use crate::util::labels::{cluster_labels, Labels, CLUSTER_LABEL, OPERATOR_VERSION_LABEL, ROLE_LABEL};

pub const NAMESPACE: &str = "default";

/// A reflector store with its writer, filled directly by tests.
pub struct FakeStore<K>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    writer: Mutex<Writer<K>>,
    pub store: Store<K>,
}

impl<K> Default for FakeStore<K>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    fn default() -> Self {
        let writer = Writer::default();
        let store = writer.as_reader();
        Self {
            writer: Mutex::new(writer),
            store,
        }
    }
}

impl<K> FakeStore<K>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    pub fn apply(&self, obj: K) {
        self.writer
            .lock()
            .unwrap()
            .apply_watcher_event(&watcher::Event::Apply(obj));
    }

    pub fn get(&self, name: &str) -> Option<K> {
        self.store
            .get(&ObjectRef::new(name).within(NAMESPACE))
            .map(|o| (*o).clone())
    }

    fn find(&self, obj: &K) -> Option<K> {
        self.store.get(&ObjectRef::from_obj(obj)).map(|o| (*o).clone())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Action {
    pub verb: &'static str,
    pub kind: String,
    pub name: String,
    pub body: Value,
}

/// Every control capability over in-memory stores. Records each write that
/// would reach the API server.
#[derive(Default)]
pub struct FakeControl {
    pub clusters: FakeStore<Cluster>,
    pub secrets: FakeStore<Secret>,
    pub services: FakeStore<Service>,
    pub statefulsets: FakeStore<StatefulSet>,
    pub pods: FakeStore<Pod>,
    pub backups: FakeStore<Backup>,
    pub restores: FakeStore<Restore>,
    pub schedules: FakeStore<BackupSchedule>,
    actions: Mutex<Vec<Action>>,
    injected: Mutex<HashMap<(String, String), VecDeque<Error>>>,
}

impl FakeControl {
    pub fn actions(&self) -> Vec<Action> {
        self.actions.lock().unwrap().clone()
    }

    pub fn count(&self, verb: &str, kind: &str) -> usize {
        self.actions()
            .iter()
            .filter(|a| a.verb == verb && a.kind == kind)
            .count()
    }

    pub fn clear_actions(&self) {
        self.actions.lock().unwrap().clear();
    }

    /// Makes the next `verb` on `kind` fail with `error`.
    pub fn fail_next(&self, verb: &str, kind: &str, error: Error) {
        self.injected
            .lock()
            .unwrap()
            .entry((verb.to_string(), kind.to_string()))
            .or_default()
            .push_back(error);
    }

    fn injected_failure(&self, verb: &str, kind: &str) -> Result<()> {
        let failure = self
            .injected
            .lock()
            .unwrap()
            .get_mut(&(verb.to_string(), kind.to_string()))
            .and_then(VecDeque::pop_front);
        failure.map_or(Ok(()), Err)
    }

    fn record(&self, verb: &'static str, kind: String, name: String, body: Value) {
        self.actions.lock().unwrap().push(Action { verb, kind, name, body });
    }

    fn create<K>(&self, store: &FakeStore<K>, obj: &K) -> Result<K>
    where
        K: Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned + 'static,
    {
        let kind = K::kind(&()).to_string();
        self.injected_failure("create", &kind)?;
        if store.find(obj).is_some() {
            return Err(api_error(409, "AlreadyExists"));
        }
        let mut created = obj.clone();
        created.meta_mut().uid = Some(format!("uid-{}", obj.name_any()));
        created.meta_mut().resource_version = Some("1".to_string());
        store.apply(created.clone());
        self.record("create", kind, obj.name_any(), serde_json::to_value(obj)?);
        Ok(created)
    }

    fn patch<K>(&self, store: &FakeStore<K>, old: &K, new: &K) -> Result<K>
    where
        K: Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned + 'static,
    {
        let Some(patch) = merge_patch(&serde_json::to_value(old)?, &serde_json::to_value(new)?) else {
            return Ok(new.clone());
        };
        let kind = K::kind(&()).to_string();
        self.injected_failure("patch", &kind)?;
        self.write(store, old, &patch, "patch")
    }

    fn patch_versioned<K>(&self, store: &FakeStore<K>, obj: &K, body: Value, verb: &'static str) -> Result<K>
    where
        K: Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned + 'static,
    {
        let kind = K::kind(&()).to_string();
        self.injected_failure(verb, &kind)?;
        let current = store.find(obj).ok_or_else(|| api_error(404, "NotFound"))?;
        if current.resource_version() != obj.resource_version() {
            return Err(api_error(409, "Conflict"));
        }
        self.write(store, obj, &body, verb)
    }

    fn write<K>(&self, store: &FakeStore<K>, obj: &K, patch: &Value, verb: &'static str) -> Result<K>
    where
        K: Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned + 'static,
    {
        let current = store.find(obj).ok_or_else(|| api_error(404, "NotFound"))?;
        let mut doc = serde_json::to_value(&current)?;
        apply_merge_patch(&mut doc, patch);
        let version = current
            .resource_version()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);
        doc["metadata"]["resourceVersion"] = json!((version + 1).to_string());
        let updated: K = serde_json::from_value(doc)?;
        store.apply(updated.clone());
        self.record(verb, K::kind(&()).to_string(), obj.name_any(), patch.clone());
        Ok(updated)
    }
}

/// RFC 7386 application of `patch` onto `target`.
pub fn apply_merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    let map = target.as_object_mut().unwrap();
    for (key, value) in patch {
        if value.is_null() {
            map.remove(key);
        } else {
            apply_merge_patch(map.entry(key.clone()).or_insert(Value::Null), value);
        }
    }
}

#[async_trait]
impl ClusterControl for FakeControl {
    async fn update_cluster_labels(&self, cluster: &Cluster) -> Result<Cluster> {
        let body = json!({ "metadata": { "labels": cluster.labels() } });
        self.patch_versioned(&self.clusters, cluster, body, "update_labels")
    }

    async fn update_cluster_status(&self, cluster: &Cluster) -> Result<Cluster> {
        let body = json!({ "status": cluster.status });
        self.patch_versioned(&self.clusters, cluster, body, "update_status")
    }
}

#[async_trait]
impl SecretControl for FakeControl {
    async fn create_secret(&self, secret: &Secret) -> Result<Secret> {
        self.create(&self.secrets, secret)
    }
}

#[async_trait]
impl ServiceControl for FakeControl {
    async fn create_service(&self, service: &Service) -> Result<Service> {
        self.create(&self.services, service)
    }
}

#[async_trait]
impl StatefulSetControl for FakeControl {
    async fn create_statefulset(&self, statefulset: &StatefulSet) -> Result<StatefulSet> {
        self.create(&self.statefulsets, statefulset)
    }

    async fn patch_statefulset(&self, old: &StatefulSet, new: &StatefulSet) -> Result<StatefulSet> {
        self.patch(&self.statefulsets, old, new)
    }
}

#[async_trait]
impl PodControl for FakeControl {
    async fn patch_pod(&self, old: &Pod, new: &Pod) -> Result<Pod> {
        self.patch(&self.pods, old, new)
    }
}

#[async_trait]
impl BackupControl for FakeControl {
    async fn create_backup(&self, backup: &Backup) -> Result<Backup> {
        self.create(&self.backups, backup)
    }

    async fn update_backup(&self, backup: &Backup) -> Result<Backup> {
        let body = json!({
            "spec": { "scheduledMember": backup.spec.scheduled_member },
            "status": backup.status,
        });
        self.patch_versioned(&self.backups, backup, body, "update")
    }
}

#[async_trait]
impl RestoreControl for FakeControl {
    async fn update_restore(&self, restore: &Restore) -> Result<Restore> {
        let body = json!({
            "spec": { "scheduledMember": restore.spec.scheduled_member },
            "status": restore.status,
        });
        self.patch_versioned(&self.restores, restore, body, "update")
    }
}

#[async_trait]
impl BackupScheduleControl for FakeControl {
    async fn update_schedule_status(&self, schedule: &BackupSchedule) -> Result<BackupSchedule> {
        let body = json!({ "status": schedule.status });
        self.patch_versioned(&self.schedules, schedule, body, "update_status")
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RecordedEvent {
    pub warning: bool,
    pub reason: String,
    pub object: String,
    pub note: String,
}

#[derive(Default)]
pub struct FakeEventPublisher {
    events: Mutex<Vec<RecordedEvent>>,
}

impl FakeEventPublisher {
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn reasons(&self) -> Vec<String> {
        self.events().into_iter().map(|e| e.reason).collect()
    }
}

#[async_trait]
impl EventPublisher for FakeEventPublisher {
    async fn publish(&self, object: &ObjectReference, type_: EventType, reason: &str, _action: &str, note: String) {
        self.events.lock().unwrap().push(RecordedEvent {
            warning: matches!(type_, EventType::Warning),
            reason: reason.to_string(),
            object: object.name.clone().unwrap_or_default(),
            note,
        });
    }
}

pub fn cluster(name: &str, members: i32) -> Cluster {
    let mut cluster = Cluster::new(
        name,
        ClusterSpec {
            members,
            ..Default::default()
        },
    );
    cluster.metadata.namespace = Some(NAMESPACE.to_string());
    cluster.metadata.uid = Some(format!("uid-{name}"));
    cluster.metadata.resource_version = Some("1".to_string());
    cluster.metadata.generation = Some(1);
    cluster
}

/// A cluster already carrying the identity and operator version labels.
pub fn labeled_cluster(name: &str, members: i32, operator_version: &str) -> Cluster {
    let mut c = cluster(name, members);
    let mut labels = cluster_labels(name);
    labels.insert(OPERATOR_VERSION_LABEL.to_string(), operator_version.to_string());
    c.metadata.labels = Some(labels);
    c
}

pub fn pod(name: &str, cluster_name: &str, role: Option<&str>) -> Pod {
    let mut labels: Labels = BTreeMap::from([(CLUSTER_LABEL.to_string(), cluster_name.to_string())]);
    if let Some(role) = role {
        labels.insert(ROLE_LABEL.to_string(), role.to_string());
    }
    let mut pod = Pod {
        spec: Some(PodSpec::default()),
        ..Default::default()
    };
    pod.metadata.name = Some(name.to_string());
    pod.metadata.namespace = Some(NAMESPACE.to_string());
    pod.metadata.labels = Some(labels);
    pod.metadata.resource_version = Some("1".to_string());
    pod
}

pub fn ready(mut statefulset: StatefulSet) -> StatefulSet {
    let replicas = statefulset.spec.as_ref().and_then(|s| s.replicas).unwrap_or(0);
    statefulset.status = Some(StatefulSetStatus {
        replicas,
        ready_replicas: Some(replicas),
        ..Default::default()
    });
    statefulset
}

pub fn backup_template(cluster_name: &str) -> BackupSpec {
    BackupSpec {
        executor: Some(BackupExecutor {
            mysqldump: Some(MysqldumpExecutor {
                databases: vec![Database { name: "test".into() }],
            }),
        }),
        storage_provider: Some(StorageProvider {
            s3: Some(S3StorageProvider {
                region: "eu-north-1".into(),
                endpoint: "https://s3.eu-north-1.amazonaws.com".into(),
                bucket: "backups".into(),
                force_path_style: false,
                credentials_secret: Some(LocalReference::new("s3-credentials")),
            }),
        }),
        cluster: Some(LocalReference::new(cluster_name)),
        scheduled_member: None,
    }
}

pub fn schedule(name: &str, cron: &str, last_backup: Option<DateTime<Utc>>) -> BackupSchedule {
    let mut schedule = BackupSchedule::new(
        name,
        BackupScheduleSpec {
            schedule: cron.to_string(),
            backup_template: backup_template("db"),
        },
    );
    schedule.metadata.namespace = Some(NAMESPACE.to_string());
    schedule.metadata.uid = Some(format!("uid-{name}"));
    schedule.metadata.resource_version = Some("1".to_string());
    schedule.status = last_backup.map(|t| BackupScheduleStatus {
        phase: None,
        last_backup: Some(t),
    });
    schedule
}

pub fn backup(name: &str, cluster_name: &str) -> Backup {
    let mut backup = Backup::new(name, backup_template(cluster_name));
    backup.metadata.namespace = Some(NAMESPACE.to_string());
    backup.metadata.uid = Some(format!("uid-{name}"));
    backup.metadata.resource_version = Some("1".to_string());
    backup
}

pub fn restore(name: &str, cluster_name: &str, backup_name: &str) -> Restore {
    let mut restore = Restore::new(
        name,
        RestoreSpec {
            cluster: Some(LocalReference::new(cluster_name)),
            backup: Some(LocalReference::new(backup_name)),
            scheduled_member: None,
        },
    );
    restore.metadata.namespace = Some(NAMESPACE.to_string());
    restore.metadata.uid = Some(format!("uid-{name}"));
    restore.metadata.resource_version = Some("1".to_string());
    restore
}
