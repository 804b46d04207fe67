use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::api::v1alpha1::{conditions_schema, LocalReference};
use crate::util::errors::StdError;

/// A one-shot backup of a Cluster. The operator validates new Backups and
/// assigns them to a member; the agent next to that member executes them.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(kind = "Backup", group = "mysql.molnett.org", version = "v1alpha1", namespaced)]
#[kube(status = "BackupStatus", shortname = "mysqlbackup")]
#[serde(rename_all = "camelCase")]
pub struct BackupSpec {
    pub executor: Option<BackupExecutor>,
    pub storage_provider: Option<StorageProvider>,
    pub cluster: Option<LocalReference>,
    /// Pod the backup runs on, assigned when the Backup is scheduled
    pub scheduled_member: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct BackupExecutor {
    pub mysqldump: Option<MysqldumpExecutor>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct MysqldumpExecutor {
    #[serde(default)]
    pub databases: Vec<Database>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct Database {
    pub name: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct StorageProvider {
    pub s3: Option<S3StorageProvider>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct S3StorageProvider {
    pub region: String,
    pub endpoint: String,
    pub bucket: String,
    #[serde(default)]
    pub force_path_style: bool,
    pub credentials_secret: Option<LocalReference>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum BackupPhase {
    New,
    Scheduled,
    Started,
    Complete,
    Failed,
}

impl BackupPhase {
    /// Scheduled or started on a member and not finished yet.
    pub fn is_active(self) -> bool {
        matches!(self, BackupPhase::Scheduled | BackupPhase::Started)
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct BackupOutcome {
    pub location: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BackupStatus {
    pub phase: Option<BackupPhase>,
    pub outcome: Option<BackupOutcome>,
    pub time_started: Option<DateTime<Utc>>,
    pub time_completed: Option<DateTime<Utc>>,
    #[serde(default)]
    #[schemars(schema_with = "conditions_schema")]
    pub conditions: Vec<Condition>,
}

impl Backup {
    /// `New` until the operator first looks at it.
    pub fn phase(&self) -> BackupPhase {
        self.status.as_ref().and_then(|s| s.phase).unwrap_or(BackupPhase::New)
    }
}

impl BackupSpec {
    pub fn validate(&self) -> Result<(), StdError> {
        let mut errors = Vec::new();

        match self.executor.as_ref().and_then(|e| e.mysqldump.as_ref()) {
            None => errors.push("executor: a mysqldump executor is required".to_string()),
            Some(dump) if dump.databases.iter().any(|d| d.name.is_empty()) => {
                errors.push("executor.mysqldump.databases: names must not be empty".to_string())
            }
            Some(_) => {}
        }

        match self.storage_provider.as_ref().and_then(|s| s.s3.as_ref()) {
            None => errors.push("storageProvider: an s3 provider is required".to_string()),
            Some(s3) => {
                for (field, value) in [("endpoint", &s3.endpoint), ("region", &s3.region), ("bucket", &s3.bucket)] {
                    if value.is_empty() {
                        errors.push(format!("storageProvider.s3.{field}: required"));
                    }
                }
                if s3.credentials_secret.as_ref().map_or(true, |s| s.name.is_empty()) {
                    errors.push("storageProvider.s3.credentialsSecret: required".to_string());
                }
            }
        }

        if self.cluster.as_ref().map_or(true, |c| c.name.is_empty()) {
            errors.push("cluster: required".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(StdError::ValidationError(errors.join(", ")))
        }
    }
}
