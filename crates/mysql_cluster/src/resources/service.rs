use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;

use crate::api::v1alpha1::cluster::{Cluster, MYSQL_PORT};
use crate::resources::owner_reference;
use crate::util::errors::Result;
use crate::util::labels::cluster_labels;

/// Headless Service named after the cluster. Gives every member a stable
/// `{pod}.{cluster}` DNS name, published before the pod is ready so group
/// replication can bootstrap.
pub fn new_for_cluster(cluster: &Cluster) -> Result<Service> {
    let name = cluster.name_any();
    Ok(Service {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: cluster.namespace(),
            labels: Some(cluster_labels(&name)),
            owner_references: Some(vec![owner_reference(cluster)?]),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            cluster_ip: Some("None".to_string()),
            publish_not_ready_addresses: Some(true),
            ports: Some(vec![ServicePort {
                name: Some("mysql".to_string()),
                port: MYSQL_PORT,
                ..Default::default()
            }]),
            selector: Some(cluster_labels(&name)),
            ..Default::default()
        }),
        ..Default::default()
    })
}
