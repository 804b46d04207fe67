use actix_web::{dev::Server, middleware, web::Data, App, HttpServer};
use anyhow::Result;
use mysql_cluster::controllers::state::State;

use crate::handlers::health::{self, Health};
use crate::handlers::metrics;

/// Configure the probe and metrics server. Serving starts when the returned
/// future is polled.
pub fn start_server(state: State, health: Health, address: &str) -> Result<Server> {
    let server = HttpServer::new(move || {
        App::new()
            .app_data(Data::new(state.clone()))
            .app_data(Data::new(health.clone()))
            .wrap(middleware::Logger::default().exclude("/live").exclude("/ready"))
            .service(health::live)
            .service(health::ready)
            .service(metrics::metrics)
    })
    .bind(address)?
    .disable_signals()
    .workers(1)
    .shutdown_timeout(5);

    Ok(server.run())
}
