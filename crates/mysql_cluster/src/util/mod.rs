pub mod errors;
pub mod events;
pub mod labels;
pub mod metrics;
pub mod retry;
pub mod status;
pub mod telemetry;
pub mod version;
