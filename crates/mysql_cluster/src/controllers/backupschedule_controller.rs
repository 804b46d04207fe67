use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, DurationRound, Utc};
use kube::api::ListParams;
use kube::runtime::events::EventType;
use kube::runtime::reflector::{self, Store};
use kube::runtime::watcher;
use kube::{Client, Resource, ResourceExt};
use tokio::sync::RwLock;
use tracing::*;

use crate::api::v1alpha1::backup::Backup;
use crate::api::v1alpha1::backupschedule::{BackupSchedule, BackupScheduleStatus, SchedulePhase};
use crate::config::OperatorConfig;
use crate::controllers::control::{BackupControl, BackupScheduleControl, KubeControl};
use crate::controllers::queue::WorkQueue;
use crate::controllers::runner::{resync_periodically, run_workers, scoped, watch_and_enqueue, ObjectKey, Reconciler};
use crate::controllers::state::{Diagnostics, State};
use crate::util::errors::{Result, StdError};
use crate::util::events::{reasons, EventPublisher, KubeEventPublisher};
use crate::util::labels::BACKUP_SCHEDULE_LABEL;
use crate::util::metrics::Metrics;
use crate::util::retry::{retry_on_conflict, ConflictRetry};

pub const CONTROLLER_NAME: &str = "backupschedule";

/// A parsed schedule expression.
#[derive(Clone, Debug)]
pub enum CronSchedule {
    /// `@every <duration>`: a fixed delay after the previous run.
    Every(Duration),
    Calendar(Box<cron::Schedule>),
}

impl CronSchedule {
    /// First run time strictly after `after`.
    pub fn next(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            CronSchedule::Every(interval) => {
                let whole_seconds = after.duration_trunc(Duration::seconds(1)).unwrap_or(after);
                whole_seconds.checked_add_signed(*interval)
            }
            CronSchedule::Calendar(schedule) => schedule.after(&after).next(),
        }
    }
}

/// Parses `90s`, `5m`, `1h30m` and similar. Intervals too large to be added
/// to the current time are rejected.
fn parse_every(text: &str) -> std::result::Result<Duration, String> {
    let out_of_range = || format!("duration {:?} is out of range", text.trim());
    let mut total = Duration::zero();
    let mut number = String::new();
    for c in text.trim().chars() {
        if c.is_ascii_digit() {
            number.push(c);
            continue;
        }
        let value: i64 = number
            .parse()
            .map_err(|_| format!("invalid duration {text:?}"))?;
        let part = match c {
            'h' => Duration::try_hours(value),
            'm' => Duration::try_minutes(value),
            's' => Duration::try_seconds(value),
            _ => return Err(format!("invalid duration unit {c:?} in {text:?}")),
        }
        .ok_or_else(out_of_range)?;
        total = total.checked_add(&part).ok_or_else(out_of_range)?;
        number.clear();
    }
    if !number.is_empty() || total <= Duration::zero() {
        return Err(format!("invalid duration {text:?}"));
    }
    if Utc::now().checked_add_signed(total).is_none() {
        return Err(out_of_range());
    }
    Ok(total)
}

/// Parses a schedule expression into something that can compute run times.
///
/// Any failure inside the cron parser, including a panic, comes back as a
/// validation error.
pub fn parse_schedule(expression: &str) -> std::result::Result<CronSchedule, StdError> {
    let expression = expression.trim();
    if expression.is_empty() {
        return Err(StdError::ValidationError(
            "Schedule must be a non-empty valid Cron expression".to_string(),
        ));
    }
    if let Some(every) = expression.strip_prefix("@every") {
        return parse_every(every)
            .map(CronSchedule::Every)
            .map_err(|e| StdError::ValidationError(format!("invalid schedule: {e}")));
    }

    // the cron crate wants a seconds field
    let normalized = if !expression.starts_with('@') && expression.split_whitespace().count() == 5 {
        format!("0 {expression}")
    } else {
        expression.to_string()
    };
    match panic::catch_unwind(AssertUnwindSafe(|| cron::Schedule::from_str(&normalized))) {
        Ok(Ok(schedule)) => Ok(CronSchedule::Calendar(Box::new(schedule))),
        Ok(Err(e)) => Err(StdError::ValidationError(format!("invalid schedule: {e}"))),
        Err(panic) => {
            let reason = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "parser panicked".to_string());
            error!(schedule = expression, %reason, "panic parsing schedule");
            Err(StdError::ValidationError(format!("invalid schedule: {reason}")))
        }
    }
}

/// Whether a run is due at `now`, and when the next run after `last_backup`
/// falls. A schedule that never fired is due right away.
pub fn next_run_time(
    last_backup: Option<DateTime<Utc>>,
    schedule: &CronSchedule,
    now: DateTime<Utc>,
) -> (bool, Option<DateTime<Utc>>) {
    let Some(last) = last_backup else {
        return (true, schedule.next(now));
    };
    match schedule.next(last) {
        Some(next) => (now >= next, Some(next)),
        None => (false, None),
    }
}

/// The Backup a schedule fires at `now`: the template verbatim, named after
/// the schedule and the second it fired.
pub fn backup_for(schedule: &BackupSchedule, now: DateTime<Utc>) -> Backup {
    let name = format!("{}-{}", schedule.name_any(), now.format("%Y%m%d%H%M%S"));
    let mut backup = Backup::new(&name, schedule.spec.backup_template.clone());
    backup.metadata.namespace = schedule.namespace();
    backup.metadata.labels = Some(BTreeMap::from([(
        BACKUP_SCHEDULE_LABEL.to_string(),
        schedule.name_any(),
    )]));
    backup
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Fires Backups from BackupSchedules. At most one Backup per pass; missed
/// runs are not caught up.
pub struct BackupScheduleReconciler {
    pub schedules: Store<BackupSchedule>,
    pub backups: Arc<dyn BackupControl>,
    pub schedule_control: Arc<dyn BackupScheduleControl>,
    pub events: Arc<dyn EventPublisher>,
    pub clock: Arc<dyn Clock>,
    pub retry: ConflictRetry,
    pub metrics: Metrics,
    pub diagnostics: Arc<RwLock<Diagnostics>>,
}

#[async_trait]
impl Reconciler for BackupScheduleReconciler {
    type Key = ObjectKey;

    fn name(&self) -> &'static str {
        CONTROLLER_NAME
    }

    fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    async fn sync(&self, key: &ObjectKey) -> Result<()> {
        self.diagnostics.write().await.touch(CONTROLLER_NAME);

        let Some(cached) = self.schedules.get(&key.object_ref()) else {
            debug!(%key, "backup schedule no longer exists");
            return Ok(());
        };
        let mut schedule = (*cached).clone();

        if let Err(e) = schedule.spec.backup_template.validate() {
            self.publish(&schedule, reasons::FAILED_VALIDATION, e.to_string()).await;
            return Err(e.into());
        }

        let current_phase = schedule.phase();
        let parsed = parse_schedule(&schedule.spec.schedule);
        let phase = match &parsed {
            Ok(_) => SchedulePhase::Enabled,
            Err(e) => {
                if current_phase != SchedulePhase::FailedValidation {
                    self.metrics.schedule_validation_failures.inc();
                    self.publish(&schedule, reasons::CRON_VALIDATION, e.to_string()).await;
                }
                SchedulePhase::FailedValidation
            }
        };

        if phase != current_phase {
            info!(%key, ?phase, "updating backup schedule phase");
            schedule = self
                .update_status(key, &schedule, |status| status.phase = Some(phase))
                .await?;
        }

        let Ok(cron) = parsed else {
            return Ok(());
        };
        self.submit_backup_if_due(key, &schedule, &cron).await
    }
}

impl BackupScheduleReconciler {
    async fn publish(&self, schedule: &BackupSchedule, reason: &str, note: String) {
        self.events
            .publish(&schedule.object_ref(&()), EventType::Warning, reason, "Validating", note)
            .await;
    }

    async fn update_status<F>(&self, key: &ObjectKey, schedule: &BackupSchedule, mutate: F) -> Result<BackupSchedule>
    where
        F: Fn(&mut BackupScheduleStatus) + Send + Sync,
    {
        let control = self.schedule_control.clone();
        let mutate = &mutate;
        retry_on_conflict(&self.retry, "update backup schedule status", |attempt| {
            let latest = if attempt == 1 {
                Some(schedule.clone())
            } else {
                self.schedules.get(&key.object_ref()).map(|s| (*s).clone())
            };
            let control = control.clone();
            async move {
                let mut updated = latest
                    .ok_or_else(|| StdError::MetadataMissing(format!("backup schedule {key} is no longer cached")))?;
                mutate(updated.status.get_or_insert_with(Default::default));
                control.update_schedule_status(&updated).await
            }
        })
        .await
    }

    async fn submit_backup_if_due(&self, key: &ObjectKey, schedule: &BackupSchedule, cron: &CronSchedule) -> Result<()> {
        let now = self.clock.now();
        let (due, next) = next_run_time(schedule.last_backup(), cron, now);
        if !due {
            debug!(%key, schedule = %schedule.spec.schedule, ?next, "backup schedule is not due");
            return Ok(());
        }

        let backup = backup_for(schedule, now);
        info!(%key, backup = %backup.name_any(), "backup schedule is due, creating backup");
        match self.backups.create_backup(&backup).await {
            Ok(_) => {
                self.metrics.backups_scheduled.inc();
                self.events
                    .publish(
                        &schedule.object_ref(&()),
                        EventType::Normal,
                        reasons::BACKUP_SCHEDULED,
                        "Scheduling",
                        format!("Created Backup {}", backup.name_any()),
                    )
                    .await;
            }
            Err(e) if e.is_already_exists() => debug!(%key, backup = %backup.name_any(), "backup already exists"),
            Err(e) => return Err(e),
        }

        self.update_status(key, schedule, |status| status.last_backup = Some(now))
            .await?;
        Ok(())
    }
}

/// Initialize the backup schedule controller (given the crd is installed)
pub async fn run(client: Client, config: OperatorConfig, state: State, queue: WorkQueue<ObjectKey>) -> Result<()> {
    let schedules = scoped::<BackupSchedule>(&client, config.namespace.as_deref());
    if let Err(e) = schedules.list(&ListParams::default().limit(1)).await {
        error!("BackupSchedule CRD is not queryable; {e:?}. Is the CRD installed?");
        return Err(e.into());
    }

    let (store, writer) = reflector::store::<BackupSchedule>();
    let watch = tokio::spawn(watch_and_enqueue(
        schedules,
        watcher::Config::default(),
        writer,
        queue.clone(),
        |s: &BackupSchedule| ObjectKey::of(s),
    ));

    info!("waiting for backup schedule cache to sync");
    if let Err(e) = store.wait_until_ready().await {
        return Err(StdError::InvalidArgument(format!("cache writer dropped before sync: {e}")).into());
    }

    let resync = tokio::spawn(resync_periodically(
        store.clone(),
        queue.clone(),
        config.schedule_resync_period,
        |_: &BackupSchedule| true,
    ));

    let control = Arc::new(KubeControl::new(client.clone()));
    let reporter = state.diagnostics().await.reporter;
    let reconciler = BackupScheduleReconciler {
        schedules: store,
        backups: control.clone(),
        schedule_control: control,
        events: Arc::new(KubeEventPublisher::new(client, reporter)),
        clock: Arc::new(SystemClock),
        retry: ConflictRetry::default(),
        metrics: state.recorder(),
        diagnostics: state.diagnostics_handle(),
    };

    run_workers(Arc::new(reconciler), queue, config.schedule_workers).await;

    resync.abort();
    watch.abort();
    Ok(())
}
