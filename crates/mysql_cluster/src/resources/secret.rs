use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::ResourceExt;
use rand::distributions::Alphanumeric;
use rand::Rng;

use crate::api::v1alpha1::cluster::{Cluster, ROOT_PASSWORD_KEY};
use crate::resources::owner_reference;
use crate::util::errors::Result;
use crate::util::labels::cluster_labels;

const PASSWORD_LENGTH: usize = 16;

pub fn random_password(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Root password Secret for a cluster that did not bring its own.
pub fn new_root_password(cluster: &Cluster) -> Result<Secret> {
    Ok(Secret {
        metadata: ObjectMeta {
            name: Some(cluster.root_password_secret_name()),
            namespace: cluster.namespace(),
            labels: Some(cluster_labels(&cluster.name_any())),
            owner_references: Some(vec![owner_reference(cluster)?]),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(
            ROOT_PASSWORD_KEY.to_string(),
            ByteString(random_password(PASSWORD_LENGTH).into_bytes()),
        )])),
        ..Default::default()
    })
}
