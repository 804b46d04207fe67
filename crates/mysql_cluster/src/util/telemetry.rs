use serde::{Deserialize, Serialize};
use tracing_subscriber::{prelude::*, EnvFilter, Registry};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "compact" | "text" => Ok(LogFormat::Compact),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format {other:?}, expected compact or json")),
        }
    }
}

/// Initialize tracing
///
/// `RUST_LOG` wins over `default_level` when it is set and parses.
pub fn init(default_level: &str, format: LogFormat) -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(default_level))?;

    let collector = Registry::default().with(env_filter);
    match format {
        LogFormat::Compact => {
            let logger = tracing_subscriber::fmt::layer().compact();
            tracing::subscriber::set_global_default(collector.with(logger))?;
        }
        LogFormat::Json => {
            let logger = tracing_subscriber::fmt::layer().json();
            tracing::subscriber::set_global_default(collector.with(logger))?;
        }
    }
    Ok(())
}
