use std::sync::OnceLock;

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

pub const LOG_ENV_VAR: &str = "SAISON_BACKUP_LOG";
const DEFAULT_FILTER: &str = "info";

static TRACING_INIT: OnceLock<()> = OnceLock::new();

fn build_env_filter_from(saison_log: Option<&str>, rust_log: Option<&str>) -> EnvFilter {
    let default = || EnvFilter::new(DEFAULT_FILTER);

    if let Some(v) = saison_log {
        return EnvFilter::try_new(v).unwrap_or_else(|_| default());
    }
    if let Some(v) = rust_log {
        return EnvFilter::try_new(v).unwrap_or_else(|_| default());
    }
    default()
}

fn build_env_filter() -> EnvFilter {
    build_env_filter_from(
        std::env::var(LOG_ENV_VAR).ok().as_deref(),
        std::env::var("RUST_LOG").ok().as_deref(),
    )
}

/// Installs the process-wide JSON subscriber on stderr. Later calls are no-ops, as is calling
/// this after the host application installed its own subscriber.
pub fn init_logging() {
    TRACING_INIT.get_or_init(|| {
        let layer = tracing_subscriber::fmt::layer()
            .json()
            .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
            .with_writer(std::io::stderr);

        let subscriber = tracing_subscriber::registry()
            .with(build_env_filter())
            .with(layer);
        let _ = subscriber.try_init();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_filter_precedence_is_saison_then_rust_log_then_default() {
        let f1 = build_env_filter_from(Some("debug"), Some("warn"));
        let f2 = build_env_filter_from(None, Some("warn"));
        let f3 = build_env_filter_from(None, None);
        assert_eq!(f1.to_string(), "debug");
        assert_eq!(f2.to_string(), "warn");
        assert_eq!(f3.to_string(), "info");
    }

    #[test]
    fn invalid_filter_falls_back_to_default() {
        let f = build_env_filter_from(Some("=[not a filter"), None);
        assert_eq!(f.to_string(), "info");
    }

    #[test]
    fn init_is_idempotent() {
        init_logging();
        init_logging();
        tracing::info!(event = "logging.test", "logging.test");
    }
}
