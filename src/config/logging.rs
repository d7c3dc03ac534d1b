// ============================================================================
// Logging Configuration
// ============================================================================

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    /// `EnvFilter` directive (default: "info")
    pub rust_log: String,
    pub format: LogFormat,
}

impl LoggingConfig {
    pub(crate) fn from_env() -> Self {
        Self {
            rust_log: std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
            format: match std::env::var("LOG_FORMAT")
                .map(|v| v.to_lowercase())
                .as_deref()
            {
                Ok("json") => LogFormat::Json,
                _ => LogFormat::Text,
            },
        }
    }

    /// Install the global tracing subscriber
    pub fn init_tracing(&self) {
        let filter = EnvFilter::try_new(&self.rust_log).unwrap_or_else(|_| EnvFilter::new("info"));
        let registry = tracing_subscriber::registry().with(filter);

        match self.format {
            LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
            LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            rust_log: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}
