use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::util::errors::{Result, StdError};
use crate::util::labels::OPERATOR_VERSION;
use crate::util::telemetry::LogFormat;

pub const DEFAULT_MYSQL_SERVER_IMAGE: &str = "mysql/mysql-server";
pub const DEFAULT_MYSQL_AGENT_IMAGE: &str = "ghcr.io/molnett/mysql-agent";

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Images {
    /// Repository of the MySQL server image, tagged with the cluster version
    pub mysql_server_image: String,
    /// Repository of the agent sidecar image, tagged with the operator version
    pub mysql_agent_image: String,
}

impl Default for Images {
    fn default() -> Self {
        Self {
            mysql_server_image: DEFAULT_MYSQL_SERVER_IMAGE.to_string(),
            mysql_agent_image: DEFAULT_MYSQL_AGENT_IMAGE.to_string(),
        }
    }
}

/// Operator settings. Loaded from an optional YAML file, then overridden by
/// command line flags in the binary.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct OperatorConfig {
    /// Namespace to watch, all namespaces when unset
    pub namespace: Option<String>,
    pub images: Images,
    /// Stamped on managed objects and used as the agent image tag
    pub operator_version: String,
    #[serde(with = "humantime_secs")]
    pub cluster_resync_period: Duration,
    #[serde(with = "humantime_secs")]
    pub schedule_resync_period: Duration,
    pub cluster_workers: usize,
    pub schedule_workers: usize,
    /// Workers assigning Backups and Restores to members
    pub backup_workers: usize,
    pub log_level: String,
    pub log_format: LogFormat,
    pub listen_address: String,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            images: Images::default(),
            operator_version: OPERATOR_VERSION.to_string(),
            cluster_resync_period: Duration::from_secs(12 * 60 * 60),
            schedule_resync_period: Duration::from_secs(30),
            cluster_workers: 4,
            schedule_workers: 2,
            backup_workers: 2,
            log_level: "info".to_string(),
            log_format: LogFormat::Compact,
            listen_address: "0.0.0.0:8080".to_string(),
        }
    }
}

impl OperatorConfig {
    pub fn from_yaml(contents: &str) -> Result<Self> {
        serde_yaml::from_str(contents)
            .map_err(|e| StdError::InvalidArgument(format!("invalid operator config: {e}")).into())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| StdError::InvalidArgument(format!("reading {}: {e}", path.display())))?;
        Self::from_yaml(&contents)
    }
}

/// Durations in config files are whole seconds, or a number followed by
/// `s`, `m` or `h`.
mod humantime_secs {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format!("{}s", d.as_secs()))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Secs(u64),
            Text(String),
        }
        match Raw::deserialize(d)? {
            Raw::Secs(secs) => Ok(Duration::from_secs(secs)),
            Raw::Text(text) => super::parse_duration(&text).map_err(D::Error::custom),
        }
    }
}

/// Parses `90`, `90s`, `5m` or `12h`.
pub fn parse_duration(text: &str) -> std::result::Result<Duration, String> {
    let text = text.trim();
    let split = text.find(|c: char| !c.is_ascii_digit()).unwrap_or(text.len());
    let (number, unit) = text.split_at(split);
    let value: u64 = number
        .parse()
        .map_err(|_| format!("invalid duration {text:?}"))?;
    let factor = match unit {
        "" | "s" => 1,
        "m" => 60,
        "h" => 60 * 60,
        _ => return Err(format!("invalid duration unit in {text:?}")),
    };
    let secs = value
        .checked_mul(factor)
        .ok_or_else(|| format!("invalid duration {text:?}"))?;
    Ok(Duration::from_secs(secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let config = OperatorConfig::from_yaml("namespace: mysql\nclusterWorkers: 8\nbackupWorkers: 1\n").unwrap();
        assert_eq!(config.namespace.as_deref(), Some("mysql"));
        assert_eq!(config.cluster_workers, 8);
        assert_eq!(config.backup_workers, 1);
        assert_eq!(config.images, Images::default());
        assert_eq!(config.cluster_resync_period, Duration::from_secs(43200));
    }

    #[test]
    fn durations_accept_units() {
        let config = OperatorConfig::from_yaml(
            "clusterResyncPeriod: 1h\nscheduleResyncPeriod: 45\nimages:\n  mysqlAgentImage: registry.local/agent\n",
        )
        .unwrap();
        assert_eq!(config.cluster_resync_period, Duration::from_secs(3600));
        assert_eq!(config.schedule_resync_period, Duration::from_secs(45));
        assert_eq!(config.images.mysql_agent_image, "registry.local/agent");
        assert_eq!(config.images.mysql_server_image, DEFAULT_MYSQL_SERVER_IMAGE);
    }

    #[test]
    fn rejects_garbage() {
        assert!(OperatorConfig::from_yaml("clusterResyncPeriod: soon").is_err());
        assert!(parse_duration("5d").is_err());
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
    }

    #[test]
    fn overflowing_durations_are_rejected() {
        let hours = format!("{}h", u64::MAX / 60);
        assert_eq!(parse_duration(&hours).unwrap_err(), format!("invalid duration {hours:?}"));
        assert!(parse_duration(&format!("{}m", u64::MAX)).is_err());
        assert!(OperatorConfig::from_yaml(&format!("clusterResyncPeriod: {hours}")).is_err());
        assert_eq!(
            parse_duration(&format!("{}s", u64::MAX)).unwrap(),
            Duration::from_secs(u64::MAX)
        );
    }
}
