//! Write capabilities used by the reconcilers. Reads always come from the
//! reflector stores; every mutation goes through one of these traits so
//! tests can swap in the in-memory implementation from `fixtures`.

use std::fmt::Debug;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{Pod, Secret, Service};
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Patch, PatchParams, PostParams};
use kube::{Api, Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::api::v1alpha1::backup::Backup;
use crate::api::v1alpha1::backupschedule::BackupSchedule;
use crate::api::v1alpha1::cluster::Cluster;
use crate::api::v1alpha1::restore::Restore;
use crate::util::errors::{Result, StdError};

pub const FIELD_MANAGER: &str = "mysql-operator";

#[async_trait]
pub trait ClusterControl: Send + Sync {
    /// Writes the labels of `cluster`, failing with a conflict when the
    /// stored object moved past `cluster`'s resourceVersion.
    async fn update_cluster_labels(&self, cluster: &Cluster) -> Result<Cluster>;

    /// Writes the status of `cluster` under the same version check.
    async fn update_cluster_status(&self, cluster: &Cluster) -> Result<Cluster>;
}

#[async_trait]
pub trait SecretControl: Send + Sync {
    async fn create_secret(&self, secret: &Secret) -> Result<Secret>;
}

#[async_trait]
pub trait ServiceControl: Send + Sync {
    async fn create_service(&self, service: &Service) -> Result<Service>;
}

#[async_trait]
pub trait StatefulSetControl: Send + Sync {
    async fn create_statefulset(&self, statefulset: &StatefulSet) -> Result<StatefulSet>;

    /// Sends the difference between `old` and `new` as a merge patch.
    async fn patch_statefulset(&self, old: &StatefulSet, new: &StatefulSet) -> Result<StatefulSet>;
}

#[async_trait]
pub trait PodControl: Send + Sync {
    async fn patch_pod(&self, old: &Pod, new: &Pod) -> Result<Pod>;
}

#[async_trait]
pub trait BackupControl: Send + Sync {
    async fn create_backup(&self, backup: &Backup) -> Result<Backup>;

    /// Writes the scheduled member and the status of `backup` under a
    /// resourceVersion check.
    async fn update_backup(&self, backup: &Backup) -> Result<Backup>;
}

#[async_trait]
pub trait RestoreControl: Send + Sync {
    /// Writes the scheduled member and the status of `restore` under a
    /// resourceVersion check.
    async fn update_restore(&self, restore: &Restore) -> Result<Restore>;
}

#[async_trait]
pub trait BackupScheduleControl: Send + Sync {
    async fn update_schedule_status(&self, schedule: &BackupSchedule) -> Result<BackupSchedule>;
}

/// RFC 7386 merge patch turning `old` into `new`. Arrays are replaced
/// wholesale and removed keys become `null`. Returns `None` when the two
/// documents are equal.
pub fn merge_patch(old: &Value, new: &Value) -> Option<Value> {
    match (old, new) {
        (Value::Object(old), Value::Object(new)) => {
            let mut patch = Map::new();
            for (key, new_value) in new {
                match old.get(key) {
                    Some(old_value) => {
                        if let Some(diff) = merge_patch(old_value, new_value) {
                            patch.insert(key.clone(), diff);
                        }
                    }
                    None => {
                        patch.insert(key.clone(), new_value.clone());
                    }
                }
            }
            for key in old.keys() {
                if !new.contains_key(key) {
                    patch.insert(key.clone(), Value::Null);
                }
            }
            (!patch.is_empty()).then_some(Value::Object(patch))
        }
        (old, new) if old == new => None,
        (_, new) => Some(new.clone()),
    }
}

/// Capabilities backed by the API server.
#[derive(Clone)]
pub struct KubeControl {
    client: Client,
}

impl KubeControl {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api<K>(&self, obj: &K) -> Result<Api<K>>
    where
        K: Resource<Scope = NamespaceResourceScope>,
        K::DynamicType: Default,
    {
        let namespace = obj
            .meta()
            .namespace
            .as_deref()
            .ok_or_else(|| StdError::MetadataMissing(format!("namespace of {}", obj.name_any())))?;
        Ok(Api::namespaced(self.client.clone(), namespace))
    }

    async fn create<K>(&self, obj: &K) -> Result<K>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + Debug + Serialize + DeserializeOwned,
        K::DynamicType: Default,
    {
        let params = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        Ok(self.api(obj)?.create(&params, obj).await?)
    }

    async fn patch<K>(&self, old: &K, new: &K) -> Result<K>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + Debug + Serialize + DeserializeOwned,
        K::DynamicType: Default,
    {
        let Some(patch) = merge_patch(&serde_json::to_value(old)?, &serde_json::to_value(new)?) else {
            return Ok(new.clone());
        };
        let params = PatchParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        Ok(self.api(old)?.patch(&old.name_any(), &params, &Patch::Merge(&patch)).await?)
    }

    /// Merge patch carrying `resourceVersion`, so the API server rejects it
    /// with a conflict when the object changed since it was read.
    async fn patch_versioned<K>(&self, obj: &K, body: Value, status: bool) -> Result<K>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + Debug + Serialize + DeserializeOwned,
        K::DynamicType: Default,
    {
        let mut body = body;
        body["metadata"]["resourceVersion"] = json!(obj.resource_version());
        let params = PatchParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        let api = self.api(obj)?;
        let patch = Patch::Merge(&body);
        let updated = if status {
            api.patch_status(&obj.name_any(), &params, &patch).await?
        } else {
            api.patch(&obj.name_any(), &params, &patch).await?
        };
        Ok(updated)
    }
}

#[async_trait]
impl ClusterControl for KubeControl {
    async fn update_cluster_labels(&self, cluster: &Cluster) -> Result<Cluster> {
        self.patch_versioned(cluster, json!({ "metadata": { "labels": cluster.labels() } }), false)
            .await
    }

    async fn update_cluster_status(&self, cluster: &Cluster) -> Result<Cluster> {
        self.patch_versioned(cluster, json!({ "status": cluster.status }), true).await
    }
}

#[async_trait]
impl SecretControl for KubeControl {
    async fn create_secret(&self, secret: &Secret) -> Result<Secret> {
        self.create(secret).await
    }
}

#[async_trait]
impl ServiceControl for KubeControl {
    async fn create_service(&self, service: &Service) -> Result<Service> {
        self.create(service).await
    }
}

#[async_trait]
impl StatefulSetControl for KubeControl {
    async fn create_statefulset(&self, statefulset: &StatefulSet) -> Result<StatefulSet> {
        self.create(statefulset).await
    }

    async fn patch_statefulset(&self, old: &StatefulSet, new: &StatefulSet) -> Result<StatefulSet> {
        self.patch(old, new).await
    }
}

#[async_trait]
impl PodControl for KubeControl {
    async fn patch_pod(&self, old: &Pod, new: &Pod) -> Result<Pod> {
        self.patch(old, new).await
    }
}

#[async_trait]
impl BackupControl for KubeControl {
    async fn create_backup(&self, backup: &Backup) -> Result<Backup> {
        self.create(backup).await
    }

    async fn update_backup(&self, backup: &Backup) -> Result<Backup> {
        let spec = json!({ "spec": { "scheduledMember": backup.spec.scheduled_member } });
        let mut updated = self.patch_versioned(backup, spec, false).await?;
        updated.status = backup.status.clone();
        self.patch_versioned(&updated, json!({ "status": backup.status }), true)
            .await
    }
}

#[async_trait]
impl RestoreControl for KubeControl {
    async fn update_restore(&self, restore: &Restore) -> Result<Restore> {
        let spec = json!({ "spec": { "scheduledMember": restore.spec.scheduled_member } });
        let mut updated = self.patch_versioned(restore, spec, false).await?;
        updated.status = restore.status.clone();
        self.patch_versioned(&updated, json!({ "status": restore.status }), true)
            .await
    }
}

#[async_trait]
impl BackupScheduleControl for KubeControl {
    async fn update_schedule_status(&self, schedule: &BackupSchedule) -> Result<BackupSchedule> {
        self.patch_versioned(schedule, json!({ "status": schedule.status }), true)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_json_diff::assert_json_eq;

    #[test]
    fn merge_patch_carries_only_changes() {
        let old = json!({
            "metadata": { "name": "db-0", "labels": { "app": "mysql", "role": "primary" } },
            "spec": { "containers": [{ "name": "agent", "image": "agent:1" }] }
        });
        let new = json!({
            "metadata": { "name": "db-0", "labels": { "app": "mysql" } },
            "spec": { "containers": [{ "name": "agent", "image": "agent:2" }] }
        });

        let patch = merge_patch(&old, &new).unwrap();
        assert_json_eq!(
            patch,
            json!({
                "metadata": { "labels": { "role": null } },
                "spec": { "containers": [{ "name": "agent", "image": "agent:2" }] }
            })
        );
    }

    #[test]
    fn equal_documents_need_no_patch() {
        let doc = json!({ "metadata": { "labels": { "a": "b" } } });
        assert_eq!(merge_patch(&doc, &doc), None);
    }
}
