use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec, StatefulSetUpdateStrategy};
use k8s_openapi::api::core::v1::{
    ConfigMapVolumeSource, Container, ContainerPort, EmptyDirVolumeSource, EnvVar, EnvVarSource, HTTPGetAction,
    KeyToPath, ObjectFieldSelector, PodSpec, PodTemplateSpec, Probe, ProjectedVolumeSource, SecretKeySelector,
    SecretProjection, Volume, VolumeMount, VolumeProjection,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;

use crate::api::v1alpha1::cluster::{Cluster, MYSQL_PORT, ROOT_PASSWORD_KEY};
use crate::config::Images;
use crate::resources::owner_reference;
use crate::util::errors::Result;
use crate::util::labels::{cluster_labels, OPERATOR_VERSION_LABEL, ROLE_LABEL, ROLE_PRIMARY};

pub const MYSQL_CONTAINER: &str = "mysql";
pub const AGENT_CONTAINER: &str = "mysql-agent";
pub const AGENT_HEALTH_PORT: i32 = 10512;
pub const AGENT_BASE_PATH: &str = "/var/lib/mysql-agent";
pub const REPLICATION_GROUP_PORT: i32 = 13306;

const DATA_VOLUME: &str = "mysqlvolume";
const BACKUP_VOLUME: &str = "mysqlbackupvolume";
const SSL_VOLUME: &str = "mysqlsslvolume";
const CONFIG_VOLUME: &str = "mysqlconfig";

pub fn container<'a>(ss: &'a StatefulSet, name: &str) -> Option<&'a Container> {
    ss.spec
        .as_ref()?
        .template
        .spec
        .as_ref()?
        .containers
        .iter()
        .find(|c| c.name == name)
}

pub fn container_mut<'a>(ss: &'a mut StatefulSet, name: &str) -> Option<&'a mut Container> {
    ss.spec
        .as_mut()?
        .template
        .spec
        .as_mut()?
        .containers
        .iter_mut()
        .find(|c| c.name == name)
}

/// `{cluster}-{n}.{cluster}:{port}` for every member, the group
/// replication seed list handed to the agent.
pub fn replication_group_seeds(name: &str, members: i32) -> String {
    (0..members)
        .map(|i| format!("{name}-{i}.{name}:{REPLICATION_GROUP_PORT}"))
        .collect::<Vec<_>>()
        .join(",")
}

fn data_volume_name(cluster: &Cluster) -> String {
    cluster
        .spec
        .volume_claim_template
        .as_ref()
        .and_then(|t| t.metadata.name.clone())
        .unwrap_or_else(|| DATA_VOLUME.to_string())
}

fn backup_volume_name(cluster: &Cluster) -> String {
    cluster
        .spec
        .backup_volume_claim_template
        .as_ref()
        .and_then(|t| t.metadata.name.clone())
        .unwrap_or_else(|| BACKUP_VOLUME.to_string())
}

fn volume_mounts(cluster: &Cluster) -> Vec<VolumeMount> {
    let mut mounts = vec![
        VolumeMount {
            name: data_volume_name(cluster),
            mount_path: "/var/lib/mysql".to_string(),
            sub_path: Some("mysql".to_string()),
            ..Default::default()
        },
        VolumeMount {
            name: backup_volume_name(cluster),
            mount_path: AGENT_BASE_PATH.to_string(),
            sub_path: Some("mysql".to_string()),
            ..Default::default()
        },
    ];
    if cluster.requires_config_mount() {
        mounts.push(VolumeMount {
            name: CONFIG_VOLUME.to_string(),
            mount_path: "/etc/my.cnf".to_string(),
            sub_path: Some("my.cnf".to_string()),
            ..Default::default()
        });
    }
    if cluster.requires_custom_ssl() {
        mounts.push(VolumeMount {
            name: SSL_VOLUME.to_string(),
            mount_path: "/etc/ssl/mysql".to_string(),
            ..Default::default()
        });
    }
    mounts
}

fn volumes(cluster: &Cluster) -> Vec<Volume> {
    let empty_dir = |name: &str| Volume {
        name: name.to_string(),
        empty_dir: Some(EmptyDirVolumeSource::default()),
        ..Default::default()
    };

    let mut volumes = Vec::new();
    if cluster.spec.volume_claim_template.is_none() {
        volumes.push(empty_dir(DATA_VOLUME));
    }
    if cluster.spec.backup_volume_claim_template.is_none() {
        volumes.push(empty_dir(BACKUP_VOLUME));
    }
    if let Some(config) = &cluster.spec.config {
        volumes.push(Volume {
            name: CONFIG_VOLUME.to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: config.name.clone(),
                ..Default::default()
            }),
            ..Default::default()
        });
    }
    if let Some(ssl) = &cluster.spec.ssl_secret {
        let items = ["ca.crt", "tls.crt", "tls.key"]
            .into_iter()
            .map(|key| KeyToPath {
                key: key.to_string(),
                path: key.to_string(),
                ..Default::default()
            })
            .collect();
        volumes.push(Volume {
            name: SSL_VOLUME.to_string(),
            projected: Some(ProjectedVolumeSource {
                sources: Some(vec![VolumeProjection {
                    secret: Some(SecretProjection {
                        name: ssl.name.clone(),
                        items: Some(items),
                        ..Default::default()
                    }),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        });
    }
    volumes
}

fn env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        ..Default::default()
    }
}

fn field_env(name: &str, field_path: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: field_path.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn root_password_env(cluster: &Cluster) -> EnvVar {
    EnvVar {
        name: "MYSQL_ROOT_PASSWORD".to_string(),
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: cluster.root_password_secret_name(),
                key: ROOT_PASSWORD_KEY.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn server_image(cluster: &Cluster, images: &Images) -> String {
    cluster
        .spec
        .image
        .clone()
        .unwrap_or_else(|| images.mysql_server_image.clone())
}

fn mysql_server_container(cluster: &Cluster, images: &Images) -> Container {
    let name = cluster.name_any();
    let mut args = vec![
        "--server_id=$(expr $base + $index)".to_string(),
        "--datadir=/var/lib/mysql".to_string(),
        "--user=mysql".to_string(),
        "--gtid_mode=ON".to_string(),
        "--log-bin".to_string(),
        "--binlog_checksum=NONE".to_string(),
        "--enforce_gtid_consistency=ON".to_string(),
        "--log-slave-updates=ON".to_string(),
        "--binlog-format=ROW".to_string(),
        "--master-info-repository=TABLE".to_string(),
        "--relay-log-info-repository=TABLE".to_string(),
        "--transaction-write-set-extraction=XXHASH64".to_string(),
        format!("--relay-log={name}-${{index}}-relay-bin"),
        format!("--report-host=\"{name}-${{index}}.{name}\""),
        "--log-error-verbosity=3".to_string(),
        "--loose-group-replication-exit-state-action=READ_ONLY".to_string(),
    ];
    if cluster.requires_custom_ssl() {
        args.extend([
            "--ssl-ca=/etc/ssl/mysql/ca.crt".to_string(),
            "--ssl-cert=/etc/ssl/mysql/tls.crt".to_string(),
            "--ssl-key=/etc/ssl/mysql/tls.key".to_string(),
        ]);
    }

    let script = format!(
        "base={}\nindex=$(cat /etc/hostname | grep -o '[^-]*$')\n/entrypoint.sh {}",
        cluster.spec.base_server_id,
        args.join(" ")
    );

    Container {
        name: MYSQL_CONTAINER.to_string(),
        image: Some(format!("{}:{}", server_image(cluster, images), cluster.spec.version)),
        command: Some(vec!["/bin/bash".to_string(), "-ecx".to_string(), script]),
        ports: Some(vec![ContainerPort {
            container_port: MYSQL_PORT,
            name: Some("mysql".to_string()),
            ..Default::default()
        }]),
        env: Some(vec![
            root_password_env(cluster),
            env("MYSQL_ROOT_HOST", "%"),
            env("MYSQL_LOG_CONSOLE", "true"),
        ]),
        volume_mounts: Some(volume_mounts(cluster)),
        ..Default::default()
    }
}

fn agent_probe(path: &str) -> Probe {
    Probe {
        http_get: Some(HTTPGetAction {
            path: Some(path.to_string()),
            port: IntOrString::Int(AGENT_HEALTH_PORT),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn mysql_agent_container(cluster: &Cluster, images: &Images, operator_version: &str) -> Container {
    let name = cluster.name_any();
    Container {
        name: AGENT_CONTAINER.to_string(),
        image: Some(format!("{}:{}", images.mysql_agent_image, operator_version)),
        env: Some(vec![
            env("MYSQL_CLUSTER_NAME", name.clone()),
            field_env("POD_NAMESPACE", "metadata.namespace"),
            env(
                "REPLICATION_GROUP_SEEDS",
                replication_group_seeds(&name, cluster.spec.members),
            ),
            env("MYSQL_CLUSTER_MULTI_MASTER", cluster.spec.multi_master.to_string()),
            root_password_env(cluster),
            field_env("MY_POD_IP", "status.podIP"),
        ]),
        volume_mounts: Some(volume_mounts(cluster)),
        liveness_probe: Some(agent_probe("/live")),
        readiness_probe: Some(agent_probe("/ready")),
        ..Default::default()
    }
}

/// The StatefulSet running the cluster's members: a MySQL server and an
/// agent sidecar per pod.
pub fn new_for_cluster(
    cluster: &Cluster,
    images: &Images,
    operator_version: &str,
    service_name: &str,
) -> Result<StatefulSet> {
    let name = cluster.name_any();

    let mut selector_labels = cluster_labels(&name);
    if cluster.spec.multi_master {
        selector_labels.insert(ROLE_LABEL.to_string(), ROLE_PRIMARY.to_string());
    }
    let mut pod_labels = selector_labels.clone();
    pod_labels.insert(OPERATOR_VERSION_LABEL.to_string(), operator_version.to_string());

    let mut labels = cluster_labels(&name);
    labels.insert(OPERATOR_VERSION_LABEL.to_string(), operator_version.to_string());

    let claim_templates: Vec<_> = [
        &cluster.spec.volume_claim_template,
        &cluster.spec.backup_volume_claim_template,
    ]
    .into_iter()
    .flatten()
    .cloned()
    .collect();

    Ok(StatefulSet {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: cluster.namespace(),
            labels: Some(labels),
            owner_references: Some(vec![owner_reference(cluster)?]),
            ..Default::default()
        },
        spec: Some(StatefulSetSpec {
            replicas: Some(cluster.spec.members),
            service_name: Some(service_name.to_string()),
            selector: LabelSelector {
                match_labels: Some(selector_labels),
                ..Default::default()
            },
            update_strategy: Some(StatefulSetUpdateStrategy {
                type_: Some("RollingUpdate".to_string()),
                ..Default::default()
            }),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(pod_labels),
                    annotations: Some(BTreeMap::from([
                        ("prometheus.io/scrape".to_string(), "true".to_string()),
                        ("prometheus.io/port".to_string(), AGENT_HEALTH_PORT.to_string()),
                    ])),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    service_account_name: Some("mysql-agent".to_string()),
                    node_selector: cluster.spec.node_selector.clone(),
                    containers: vec![
                        mysql_server_container(cluster, images),
                        mysql_agent_container(cluster, images, operator_version),
                    ],
                    volumes: Some(volumes(cluster)),
                    ..Default::default()
                }),
            },
            volume_claim_templates: (!claim_templates.is_empty()).then_some(claim_templates),
            ..Default::default()
        }),
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::v1alpha1::cluster::ClusterSpec;
    use crate::api::v1alpha1::LocalReference;
    use assert_json_diff::assert_json_include;
    use k8s_openapi::api::core::v1::PersistentVolumeClaim;
    use serde_json::json;

    fn cluster(spec: ClusterSpec) -> Cluster {
        let mut c = Cluster::new("db", spec);
        c.metadata.namespace = Some("default".into());
        c.metadata.uid = Some("uid-1".into());
        c.ensure_defaults();
        c
    }

    #[test]
    fn builds_members_with_server_and_agent() {
        let ss = new_for_cluster(&cluster(ClusterSpec::default()), &Images::default(), "1.2.3", "db").unwrap();

        assert_json_include!(
            actual: serde_json::to_value(&ss).unwrap(),
            expected: json!({
                "metadata": {
                    "name": "db",
                    "labels": {
                        "mysql.molnett.org/cluster": "db",
                        "mysql.molnett.org/operator-version": "1.2.3"
                    }
                },
                "spec": {
                    "replicas": 3,
                    "serviceName": "db",
                    "selector": { "matchLabels": { "mysql.molnett.org/cluster": "db" } },
                    "updateStrategy": { "type": "RollingUpdate" }
                }
            })
        );
        assert_eq!(
            container(&ss, MYSQL_CONTAINER).and_then(|c| c.image.as_deref()),
            Some("mysql/mysql-server:8.0.12")
        );
        assert_eq!(
            container(&ss, AGENT_CONTAINER).and_then(|c| c.image.as_deref()),
            Some("ghcr.io/molnett/mysql-agent:1.2.3")
        );
        assert!(ss.spec.as_ref().unwrap().volume_claim_templates.is_none());
    }

    #[test]
    fn multi_master_pods_are_all_primary() {
        let ss = new_for_cluster(
            &cluster(ClusterSpec {
                multi_master: true,
                ..Default::default()
            }),
            &Images::default(),
            "1.2.3",
            "db",
        )
        .unwrap();
        let selector = ss.spec.unwrap().selector.match_labels.unwrap();
        assert_eq!(selector.get(ROLE_LABEL).map(String::as_str), Some(ROLE_PRIMARY));
    }

    #[test]
    fn claim_templates_replace_empty_dirs() {
        let claim = PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some("data".into()),
                ..Default::default()
            },
            ..Default::default()
        };
        let ss = new_for_cluster(
            &cluster(ClusterSpec {
                volume_claim_template: Some(claim),
                ssl_secret: Some(LocalReference::new("tls")),
                ..Default::default()
            }),
            &Images::default(),
            "1.2.3",
            "db",
        )
        .unwrap();

        let spec = ss.spec.as_ref().unwrap();
        assert_eq!(spec.volume_claim_templates.as_ref().map(Vec::len), Some(1));
        let pod = spec.template.spec.as_ref().unwrap();
        let volume_names: Vec<_> = pod.volumes.iter().flatten().map(|v| v.name.as_str()).collect();
        assert_eq!(volume_names, vec![BACKUP_VOLUME, SSL_VOLUME]);
        let mounts = container(&ss, MYSQL_CONTAINER).unwrap().volume_mounts.as_ref().unwrap();
        assert_eq!(mounts[0].name, "data");
    }

    #[test]
    fn seeds_cover_every_member() {
        assert_eq!(
            replication_group_seeds("db", 2),
            "db-0.db:13306,db-1.db:13306"
        );
    }
}
