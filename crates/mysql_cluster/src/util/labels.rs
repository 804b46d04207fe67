//! Label keys shared by the operator and the agent, and the selectors built
//! from them.

use std::collections::BTreeMap;

pub const CLUSTER_LABEL: &str = "mysql.molnett.org/cluster";
pub const OPERATOR_VERSION_LABEL: &str = "mysql.molnett.org/operator-version";
pub const ROLE_LABEL: &str = "mysql.molnett.org/role";
pub const BACKUP_SCHEDULE_LABEL: &str = "mysql.molnett.org/backup-schedule";

pub const ROLE_PRIMARY: &str = "primary";
pub const ROLE_SECONDARY: &str = "secondary";

pub type Labels = BTreeMap<String, String>;

/// Version of this build. Stamped on every object the operator touches.
pub const OPERATOR_VERSION: &str = env!("CARGO_PKG_VERSION");

pub fn cluster_labels(cluster_name: &str) -> Labels {
    BTreeMap::from([(CLUSTER_LABEL.to_string(), cluster_name.to_string())])
}

/// Label selector string matching everything belonging to `cluster_name`.
pub fn cluster_selector(cluster_name: &str) -> String {
    format!("{CLUSTER_LABEL}={cluster_name}")
}

fn label<'a>(labels: Option<&'a Labels>, key: &str) -> Option<&'a str> {
    labels.and_then(|l| l.get(key)).map(String::as_str)
}

pub fn in_cluster(labels: Option<&Labels>, cluster_name: &str) -> bool {
    label(labels, CLUSTER_LABEL) == Some(cluster_name)
}

pub fn has_operator_version(labels: Option<&Labels>, version: &str) -> bool {
    label(labels, OPERATOR_VERSION_LABEL) == Some(version)
}

pub fn is_primary(labels: Option<&Labels>, cluster_name: &str) -> bool {
    in_cluster(labels, cluster_name) && label(labels, ROLE_LABEL) == Some(ROLE_PRIMARY)
}

pub fn is_secondary(labels: Option<&Labels>, cluster_name: &str) -> bool {
    in_cluster(labels, cluster_name) && label(labels, ROLE_LABEL) == Some(ROLE_SECONDARY)
}

/// Member of the cluster whose role label is anything but primary,
/// including absent.
pub fn is_non_primary(labels: Option<&Labels>, cluster_name: &str) -> bool {
    in_cluster(labels, cluster_name) && label(labels, ROLE_LABEL) != Some(ROLE_PRIMARY)
}

pub fn has_role(labels: Option<&Labels>, cluster_name: &str) -> bool {
    in_cluster(labels, cluster_name) && label(labels, ROLE_LABEL).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> Labels {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn role_selectors_are_scoped_to_the_cluster() {
        let primary = labels(&[(CLUSTER_LABEL, "db"), (ROLE_LABEL, ROLE_PRIMARY)]);
        let secondary = labels(&[(CLUSTER_LABEL, "db"), (ROLE_LABEL, ROLE_SECONDARY)]);
        let unlabeled = labels(&[(CLUSTER_LABEL, "db")]);
        let foreign = labels(&[(CLUSTER_LABEL, "other"), (ROLE_LABEL, ROLE_PRIMARY)]);

        assert!(is_primary(Some(&primary), "db"));
        assert!(!is_primary(Some(&foreign), "db"));
        assert!(is_secondary(Some(&secondary), "db"));
        assert!(is_non_primary(Some(&secondary), "db"));
        assert!(is_non_primary(Some(&unlabeled), "db"));
        assert!(!is_non_primary(Some(&primary), "db"));
        assert!(has_role(Some(&secondary), "db"));
        assert!(!has_role(Some(&unlabeled), "db"));
        assert!(!in_cluster(None, "db"));
    }

    #[test]
    fn selector_string() {
        assert_eq!(cluster_selector("db"), "mysql.molnett.org/cluster=db");
    }
}
