use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::api::v1alpha1::{conditions_schema, embedded_object_schema, LocalReference};
use crate::util::errors::StdError;
use crate::util::version::MysqlVersion;

pub const DEFAULT_VERSION: &str = "8.0.12";
pub const MINIMUM_VERSION: MysqlVersion = MysqlVersion::new(8, 0, 11);
pub const DEFAULT_MEMBERS: i32 = 3;
pub const MAX_MEMBERS: i32 = 9;
pub const DEFAULT_BASE_SERVER_ID: u32 = 1000;
/// Pod names are `{cluster}-{ordinal}` and must fit the host name limits
/// used by group replication.
pub const MAX_NAME_LEN: usize = 28;
pub const MYSQL_PORT: i32 = 3306;
pub const ROOT_PASSWORD_KEY: &str = "password";

pub const CONDITION_READY: &str = "Ready";

/// Generate the Kubernetes wrapper struct `Cluster` from our Spec and Status struct
///
/// This provides a hook for generating the CRD yaml (in crdgen)
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(kind = "Cluster", group = "mysql.molnett.org", version = "v1alpha1", namespaced)]
#[kube(status = "ClusterStatus", shortname = "mysqlcluster")]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// MySQL server version, defaults to 8.0.12
    #[serde(default)]
    pub version: String,
    /// Number of group replication members, 1 to 9
    #[serde(default)]
    pub members: i32,
    /// Server ids are `base_server_id + ordinal`
    #[serde(default)]
    pub base_server_id: u32,
    #[serde(default)]
    pub multi_master: bool,
    /// Server image repository, the operator's default when unset
    pub image: Option<String>,
    pub node_selector: Option<BTreeMap<String, String>>,
    #[schemars(schema_with = "embedded_object_schema")]
    pub volume_claim_template: Option<PersistentVolumeClaim>,
    #[schemars(schema_with = "embedded_object_schema")]
    pub backup_volume_claim_template: Option<PersistentVolumeClaim>,
    /// Secret holding the root password under `password`. Generated when unset.
    pub root_password_secret: Option<LocalReference>,
    /// ConfigMap with a `my.cnf` key
    pub config: Option<LocalReference>,
    /// Secret with `ca.crt`, `tls.crt` and `tls.key`
    pub ssl_secret: Option<LocalReference>,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq, JsonSchema)]
pub struct ClusterStatus {
    #[serde(default)]
    #[schemars(schema_with = "conditions_schema")]
    pub conditions: Vec<Condition>,
}

impl Cluster {
    pub fn ensure_defaults(&mut self) {
        if self.spec.version.is_empty() {
            self.spec.version = DEFAULT_VERSION.to_string();
        }
        if self.spec.members == 0 {
            self.spec.members = DEFAULT_MEMBERS;
        }
        if self.spec.base_server_id == 0 {
            self.spec.base_server_id = DEFAULT_BASE_SERVER_ID;
        }
    }

    pub fn validate(&self) -> Result<(), StdError> {
        let mut errors = Vec::new();

        let name = self.name_any();
        if name.len() > MAX_NAME_LEN {
            errors.push(format!("metadata.name: longer than {MAX_NAME_LEN} characters"));
        }
        if !(1..=MAX_MEMBERS).contains(&self.spec.members) {
            errors.push(format!("spec.members: must be between 1 and {MAX_MEMBERS}"));
        }
        let max_base = u32::MAX - MAX_MEMBERS as u32;
        if !(1..=max_base).contains(&self.spec.base_server_id) {
            errors.push(format!("spec.baseServerId: must be between 1 and {max_base}"));
        }
        match self.spec.version.parse::<MysqlVersion>() {
            Ok(v) if v < MINIMUM_VERSION => {
                errors.push(format!("spec.version: {v} is below the minimum supported {MINIMUM_VERSION}"))
            }
            Ok(_) => {}
            Err(e) => errors.push(format!("spec.version: {e}")),
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(StdError::ValidationError(errors.join(", ")))
        }
    }

    pub fn requires_secret(&self) -> bool {
        self.spec.root_password_secret.is_none()
    }

    pub fn root_password_secret_name(&self) -> String {
        match &self.spec.root_password_secret {
            Some(secret) => secret.name.clone(),
            None => format!("{}-root-password", self.name_any()),
        }
    }

    pub fn requires_config_mount(&self) -> bool {
        self.spec.config.is_some()
    }

    pub fn requires_custom_ssl(&self) -> bool {
        self.spec.ssl_secret.is_some()
    }

    pub fn conditions(&self) -> &[Condition] {
        self.status.as_ref().map(|s| s.conditions.as_slice()).unwrap_or_default()
    }
}
