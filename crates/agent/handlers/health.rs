use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use actix_web::{get, web::Data, HttpRequest, HttpResponse, Responder};
use mysql_cluster::controllers::topology::{ClusterTopology, InstanceStatus};

/// Readiness of the local member as of the last topology poll.
#[derive(Clone, Default)]
pub struct Health {
    ready: Arc<AtomicBool>,
}

impl Health {
    /// Ready while the snapshot lists the local member as online.
    pub fn observe(&self, topology: Option<&ClusterTopology>, pod_name: &str, port: u16) {
        let online = topology.and_then(|t| t.instance_status(pod_name, port)) == Some(InstanceStatus::Online);
        self.ready.store(online, Ordering::Relaxed);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }
}

#[get("/live")]
pub async fn live(_: HttpRequest) -> impl Responder {
    HttpResponse::Ok().json("alive")
}

#[get("/ready")]
pub async fn ready(health: Data<Health>, _req: HttpRequest) -> impl Responder {
    if health.is_ready() {
        HttpResponse::Ok().json("ready")
    } else {
        HttpResponse::ServiceUnavailable().json("not ready")
    }
}
