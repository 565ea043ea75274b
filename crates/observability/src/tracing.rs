//! Tracing/logging initialization.

use tracing_subscriber::EnvFilter;

/// Subscriber settings resolved from configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TracingSettings {
    /// Default filter directive, used when `RUST_LOG` is not set.
    pub filter: String,
    /// JSON lines (true) or human-readable text (false).
    pub json: bool,
}

impl Default for TracingSettings {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            json: true,
        }
    }
}

impl TracingSettings {
    fn env_filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&self.filter))
            .unwrap_or_else(|_| EnvFilter::new("info"))
    }
}

/// Initialize tracing/logging for the process.
///
/// `RUST_LOG` wins over the configured filter. Safe to call multiple times
/// (subsequent calls are no-ops).
pub fn init(settings: &TracingSettings) {
    let filter = settings.env_filter();

    if settings.json {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .with_timer(tracing_subscriber::fmt::time::SystemTime)
            .with_target(false)
            .try_init();
    } else {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .try_init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        let settings = TracingSettings {
            filter: "debug".to_string(),
            json: false,
        };
        init(&settings);
        init(&settings);
        init(&TracingSettings::default());
    }

    #[test]
    fn invalid_filter_falls_back() {
        let settings = TracingSettings {
            filter: "=[not a directive".to_string(),
            json: true,
        };
        // Must not panic, whatever RUST_LOG says.
        let _ = settings.env_filter();
    }
}
