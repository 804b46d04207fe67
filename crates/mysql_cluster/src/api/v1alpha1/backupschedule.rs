use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::api::v1alpha1::backup::BackupSpec;

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(kind = "BackupSchedule", group = "mysql.molnett.org", version = "v1alpha1", namespaced)]
#[kube(status = "BackupScheduleStatus", shortname = "mysqlbackupschedule")]
#[serde(rename_all = "camelCase")]
pub struct BackupScheduleSpec {
    /// Cron expression. Five-field standard syntax, six or seven fields
    /// with seconds and years, `@hourly` style macros, or `@every <duration>`.
    #[serde(default)]
    pub schedule: String,
    /// Spec copied verbatim into every Backup this schedule creates
    pub backup_template: BackupSpec,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum SchedulePhase {
    New,
    Enabled,
    FailedValidation,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BackupScheduleStatus {
    pub phase: Option<SchedulePhase>,
    /// When this schedule last created a Backup
    pub last_backup: Option<DateTime<Utc>>,
}

impl BackupSchedule {
    pub fn phase(&self) -> SchedulePhase {
        self.status
            .as_ref()
            .and_then(|s| s.phase)
            .unwrap_or(SchedulePhase::New)
    }

    pub fn last_backup(&self) -> Option<DateTime<Utc>> {
        self.status.as_ref().and_then(|s| s.last_backup)
    }
}
