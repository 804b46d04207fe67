//! Operator and MySQL version skew between a Cluster and the objects it owns.

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::reflector::Store;
use kube::ResourceExt;

use crate::api::v1alpha1::backup::{Backup, BackupPhase};
use crate::api::v1alpha1::restore::Restore;
use crate::resources::statefulset::{container, container_mut, AGENT_CONTAINER, MYSQL_CONTAINER};
use crate::util::labels::{has_operator_version, OPERATOR_VERSION_LABEL};
use crate::util::version::{image_tag, MysqlVersion};

/// Decides whether a member pod may have its agent replaced right now.
pub trait UpgradeGate: Send + Sync {
    fn can_upgrade(&self, pod: &Pod) -> bool;
}

/// Holds back pods that are running a Backup or a Restore.
pub struct BackupAwareGate {
    backups: Store<Backup>,
    restores: Store<Restore>,
}

impl BackupAwareGate {
    pub fn new(backups: Store<Backup>, restores: Store<Restore>) -> Self {
        Self { backups, restores }
    }
}

fn busy(namespace: Option<&str>, member: Option<&str>, phase: Option<BackupPhase>, pod: &Pod) -> bool {
    namespace == pod.metadata.namespace.as_deref()
        && member.is_some_and(|m| Some(m) == pod.metadata.name.as_deref())
        && phase.is_some_and(BackupPhase::is_active)
}

impl UpgradeGate for BackupAwareGate {
    fn can_upgrade(&self, pod: &Pod) -> bool {
        let backing_up = self.backups.state().iter().any(|b| {
            busy(
                b.metadata.namespace.as_deref(),
                b.spec.scheduled_member.as_deref(),
                b.status.as_ref().and_then(|s| s.phase),
                pod,
            )
        });
        let restoring = self.restores.state().iter().any(|r| {
            busy(
                r.metadata.namespace.as_deref(),
                r.spec.scheduled_member.as_deref(),
                r.status.as_ref().and_then(|s| s.phase),
                pod,
            )
        });
        !(backing_up || restoring)
    }
}

fn agent_image(repository: &str, operator_version: &str) -> String {
    format!("{repository}:{operator_version}")
}

/// The StatefulSet is not labeled with `operator_version` or its agent
/// template runs a different tag.
pub fn requires_agent_statefulset_upgrade(ss: &StatefulSet, agent_repository: &str, operator_version: &str) -> bool {
    if !has_operator_version(ss.metadata.labels.as_ref(), operator_version) {
        return true;
    }
    container(ss, AGENT_CONTAINER)
        .and_then(|c| c.image.as_deref())
        .is_some_and(|image| image_tag(image, agent_repository) != Some(operator_version))
}

pub fn requires_agent_pod_upgrade(pod: &Pod, agent_repository: &str, operator_version: &str) -> bool {
    if !has_operator_version(pod.metadata.labels.as_ref(), operator_version) {
        return true;
    }
    pod.spec
        .iter()
        .flat_map(|s| s.containers.iter())
        .find(|c| c.name == AGENT_CONTAINER)
        .and_then(|c| c.image.as_deref())
        .is_some_and(|image| image_tag(image, agent_repository) != Some(operator_version))
}

/// Copy of `ss` labeled with, and templating the agent at, `operator_version`.
pub fn update_statefulset_to_operator_version(
    ss: &StatefulSet,
    agent_repository: &str,
    operator_version: &str,
) -> StatefulSet {
    let mut updated = ss.clone();
    updated
        .labels_mut()
        .insert(OPERATOR_VERSION_LABEL.to_string(), operator_version.to_string());
    if let Some(template_labels) = updated
        .spec
        .as_mut()
        .and_then(|s| s.template.metadata.as_mut())
        .and_then(|m| m.labels.as_mut())
    {
        template_labels.insert(OPERATOR_VERSION_LABEL.to_string(), operator_version.to_string());
    }
    if let Some(agent) = container_mut(&mut updated, AGENT_CONTAINER) {
        agent.image = Some(agent_image(agent_repository, operator_version));
    }
    updated
}

pub fn update_pod_to_operator_version(pod: &Pod, agent_repository: &str, operator_version: &str) -> Pod {
    let mut updated = pod.clone();
    updated
        .labels_mut()
        .insert(OPERATOR_VERSION_LABEL.to_string(), operator_version.to_string());
    if let Some(agent) = updated
        .spec
        .as_mut()
        .and_then(|s| s.containers.iter_mut().find(|c| c.name == AGENT_CONTAINER))
    {
        agent.image = Some(agent_image(agent_repository, operator_version));
    }
    updated
}

/// Version the StatefulSet currently templates the server at. `None` when
/// the image is not `{server_repository}:{major.minor.patch}`.
pub fn mysql_version(ss: &StatefulSet, server_repository: &str) -> Option<MysqlVersion> {
    let image = container(ss, MYSQL_CONTAINER)?.image.as_deref()?;
    image_tag(image, server_repository)?.parse().ok()
}

/// Copy of `ss` running the server at `version` with a rolling update.
pub fn update_statefulset_to_mysql_version(ss: &StatefulSet, server_repository: &str, version: &str) -> StatefulSet {
    let mut updated = ss.clone();
    if let Some(spec) = updated.spec.as_mut() {
        let strategy = spec.update_strategy.get_or_insert_with(Default::default);
        strategy.type_ = Some("RollingUpdate".to_string());
    }
    if let Some(server) = container_mut(&mut updated, MYSQL_CONTAINER) {
        server.image = Some(format!("{server_repository}:{version}"));
    }
    updated
}
