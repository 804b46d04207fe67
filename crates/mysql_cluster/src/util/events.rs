use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

pub mod reasons {
    pub const FAILED_VALIDATION: &str = "FailedValidation";
    pub const RESOURCE_EXISTS: &str = "ErrResourceExists";
    pub const CRON_VALIDATION: &str = "CronScheduleValidationError";
    pub const UNSUPPORTED_DOWNGRADE: &str = "UnsupportedDowngrade";
    pub const BACKUP_SCHEDULED: &str = "BackupScheduled";
    pub const SUCCESS_SCHEDULED: &str = "SuccessScheduled";
}

/// Attaches diagnostic events to reconciled objects.
///
/// Publishing never fails the caller; a lost event is only logged.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, object: &ObjectReference, type_: EventType, reason: &str, action: &str, note: String);
}

pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    pub fn new(client: Client, reporter: Reporter) -> Self {
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(&self, object: &ObjectReference, type_: EventType, reason: &str, action: &str, note: String) {
        let event = Event {
            type_,
            reason: reason.to_string(),
            note: Some(note),
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, object).await {
            warn!(reason, action, error = %e, "failed to publish event");
        }
    }
}
