use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use kube::runtime::events::Reporter;
use serde::Serialize;
use tokio::sync::RwLock;

use crate::util::metrics::Metrics;

/// Diagnostics to be exposed by the web server
#[derive(Clone, Serialize)]
pub struct Diagnostics {
    /// Last time each controller picked up a key
    pub last_event: BTreeMap<String, DateTime<Utc>>,
    #[serde(skip)]
    pub reporter: Reporter,
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self {
            last_event: BTreeMap::new(),
            reporter: "mysql-operator".into(),
        }
    }
}

impl Diagnostics {
    pub fn touch(&mut self, controller: &str) {
        self.last_event.insert(controller.to_string(), Utc::now());
    }
}

/// State shared between the controllers and the web server
#[derive(Clone)]
pub struct State {
    /// Diagnostics populated by the reconcilers
    diagnostics: Arc<RwLock<Diagnostics>>,
    /// Metrics registry
    registry: prometheus::Registry,
    metrics: Metrics,
}

impl State {
    pub fn new(reporter: Reporter) -> Result<Self, prometheus::Error> {
        let registry = prometheus::Registry::new();
        let metrics = Metrics::default().register(&registry)?;
        Ok(Self {
            diagnostics: Arc::new(RwLock::new(Diagnostics {
                reporter,
                ..Default::default()
            })),
            registry,
            metrics,
        })
    }

    /// Metrics getter
    pub fn metrics(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// Handle to the registered metrics, cloned into every reconciler
    pub fn recorder(&self) -> Metrics {
        self.metrics.clone()
    }

    /// State getter
    pub async fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.read().await.clone()
    }

    pub fn diagnostics_handle(&self) -> Arc<RwLock<Diagnostics>> {
        self.diagnostics.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn touch_records_per_controller() {
        let state = State::new("test".into()).unwrap();
        state.diagnostics_handle().write().await.touch("cluster");

        let diagnostics = state.diagnostics().await;
        assert!(diagnostics.last_event.contains_key("cluster"));
        assert_eq!(diagnostics.reporter.controller, "test");
        let json = serde_json::to_value(&diagnostics).unwrap();
        assert!(json.get("reporter").is_none());
    }
}
