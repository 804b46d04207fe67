use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::api::v1alpha1::backup::BackupPhase;
use crate::api::v1alpha1::{conditions_schema, LocalReference};
use crate::util::errors::StdError;

/// Restores a completed Backup into a Cluster. The operator assigns it to
/// the cluster's primary, where the agent executes it.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(kind = "Restore", group = "mysql.molnett.org", version = "v1alpha1", namespaced)]
#[kube(status = "RestoreStatus", shortname = "mysqlrestore")]
#[serde(rename_all = "camelCase")]
pub struct RestoreSpec {
    pub cluster: Option<LocalReference>,
    pub backup: Option<LocalReference>,
    pub scheduled_member: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RestoreStatus {
    pub phase: Option<BackupPhase>,
    pub time_started: Option<DateTime<Utc>>,
    pub time_completed: Option<DateTime<Utc>>,
    #[serde(default)]
    #[schemars(schema_with = "conditions_schema")]
    pub conditions: Vec<Condition>,
}

impl Restore {
    pub fn phase(&self) -> BackupPhase {
        self.status.as_ref().and_then(|s| s.phase).unwrap_or(BackupPhase::New)
    }
}

impl RestoreSpec {
    pub fn validate(&self) -> Result<(), StdError> {
        let mut errors = Vec::new();
        if self.cluster.as_ref().map_or(true, |c| c.name.is_empty()) {
            errors.push("cluster: required");
        }
        if self.backup.as_ref().map_or(true, |b| b.name.is_empty()) {
            errors.push("backup: required");
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(StdError::ValidationError(errors.join(", ")))
        }
    }
}
