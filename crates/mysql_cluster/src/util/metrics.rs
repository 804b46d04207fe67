use crate::util::errors::Error;
use prometheus::{histogram_opts, opts, HistogramVec, IntCounter, IntCounterVec, Registry};
use tokio::time::Instant;

/// Operator metrics. Built once, registered into the [`Registry`] owned by
/// the controller `State`, and handed to every reconciler by value.
#[derive(Clone)]
pub struct Metrics {
    pub reconciliations: IntCounterVec,
    pub failures: IntCounterVec,
    pub reconcile_duration: HistogramVec,
    pub clusters_created: IntCounter,
    pub backups_scheduled: IntCounter,
    pub schedule_validation_failures: IntCounter,
    pub role_label_patches: IntCounterVec,
    pub members_scheduled: IntCounterVec,
    pub membership_actions: IntCounterVec,
}

impl Default for Metrics {
    fn default() -> Self {
        let reconcile_duration = HistogramVec::new(
            histogram_opts!(
                "mysql_operator_reconcile_duration_seconds",
                "The duration of reconcile to complete in seconds",
            )
            .buckets(vec![0.01, 0.1, 0.25, 0.5, 1., 5., 15., 60.]),
            &["controller"],
        )
        .unwrap();
        let failures = IntCounterVec::new(
            opts!("mysql_operator_reconciliation_errors_total", "reconciliation errors",),
            &["controller", "error"],
        )
        .unwrap();
        let reconciliations = IntCounterVec::new(
            opts!("mysql_operator_reconciliations_total", "reconciliations"),
            &["controller"],
        )
        .unwrap();
        let clusters_created =
            IntCounter::new("mysql_operator_clusters_created_total", "clusters given a StatefulSet").unwrap();
        let backups_scheduled =
            IntCounter::new("mysql_operator_backups_scheduled_total", "backups created by schedules").unwrap();
        let schedule_validation_failures = IntCounter::new(
            "mysql_operator_schedule_validation_failures_total",
            "backup schedules rejected for an invalid cron expression",
        )
        .unwrap();
        let role_label_patches = IntCounterVec::new(
            opts!("mysql_agent_role_label_patches_total", "pod role label patches"),
            &["role"],
        )
        .unwrap();
        let members_scheduled = IntCounterVec::new(
            opts!(
                "mysql_operator_members_scheduled_total",
                "backups and restores assigned to a member"
            ),
            &["kind", "role"],
        )
        .unwrap();
        let membership_actions = IntCounterVec::new(
            opts!(
                "mysql_agent_membership_actions_total",
                "InnoDB cluster membership changes attempted by the agent"
            ),
            &["action", "result"],
        )
        .unwrap();
        Metrics {
            reconciliations,
            failures,
            reconcile_duration,
            clusters_created,
            backups_scheduled,
            schedule_validation_failures,
            role_label_patches,
            members_scheduled,
            membership_actions,
        }
    }
}

impl Metrics {
    /// Register API metrics to start tracking them.
    pub fn register(self, registry: &Registry) -> Result<Self, prometheus::Error> {
        registry.register(Box::new(self.reconcile_duration.clone()))?;
        registry.register(Box::new(self.failures.clone()))?;
        registry.register(Box::new(self.reconciliations.clone()))?;
        registry.register(Box::new(self.clusters_created.clone()))?;
        registry.register(Box::new(self.backups_scheduled.clone()))?;
        registry.register(Box::new(self.schedule_validation_failures.clone()))?;
        registry.register(Box::new(self.role_label_patches.clone()))?;
        registry.register(Box::new(self.members_scheduled.clone()))?;
        registry.register(Box::new(self.membership_actions.clone()))?;
        Ok(self)
    }

    pub fn reconcile_failure(&self, controller: &str, e: &Error) {
        self.failures
            .with_label_values(&[controller, e.metric_label().as_ref()])
            .inc()
    }

    pub fn role_label_patched(&self, role: &str) {
        let role = if role.is_empty() { "none" } else { role };
        self.role_label_patches.with_label_values(&[role]).inc()
    }

    pub fn membership_action(&self, action: &str, succeeded: bool) {
        let result = if succeeded { "ok" } else { "error" };
        self.membership_actions.with_label_values(&[action, result]).inc()
    }

    pub fn count_and_measure(&self, controller: &str) -> ReconcileMeasurer {
        self.reconciliations.with_label_values(&[controller]).inc();
        ReconcileMeasurer {
            start: Instant::now(),
            metric: self.reconcile_duration.clone(),
            controller: controller.to_string(),
        }
    }
}

/// Smart function duration measurer
///
/// Relies on Drop to calculate duration and register the observation in the histogram
pub struct ReconcileMeasurer {
    start: Instant,
    metric: HistogramVec,
    controller: String,
}

impl Drop for ReconcileMeasurer {
    fn drop(&mut self) {
        #[allow(clippy::cast_precision_loss)]
        let duration = self.start.elapsed().as_millis() as f64 / 1000.0;
        self.metric
            .with_label_values(&[self.controller.as_str()])
            .observe(duration);
    }
}
