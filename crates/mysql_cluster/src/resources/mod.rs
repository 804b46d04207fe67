//! Desired-state builders for the objects a Cluster owns.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::{Resource, ResourceExt};

use crate::api::v1alpha1::cluster::Cluster;
use crate::util::errors::{Result, StdError};

pub mod secret;
pub mod service;
pub mod statefulset;

/// Controller reference pointing back at `cluster`, used for cascade delete
/// and the adoption check.
pub fn owner_reference(cluster: &Cluster) -> Result<OwnerReference> {
    cluster.controller_owner_ref(&()).ok_or_else(|| {
        StdError::MetadataMissing(format!("uid of cluster {}", cluster.name_any())).into()
    })
}

/// True when `meta` names `cluster` as its controlling owner.
pub fn is_controlled_by(meta: &ObjectMeta, cluster: &Cluster) -> bool {
    let Some(uid) = cluster.uid() else {
        return false;
    };
    meta.owner_references
        .iter()
        .flatten()
        .any(|o| o.controller == Some(true) && o.uid == uid)
}
