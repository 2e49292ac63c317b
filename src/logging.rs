//! Tracing subscriber setup. Everything goes to stderr so stdout stays
//! clean for `--format json`.

use std::io::IsTerminal;

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{LogFormat, LoggingConfig};

/// Directives from `RUST_LOG` if set and valid, else the configured level,
/// else `info`.
fn build_filter(env: Option<&str>, level: &str) -> EnvFilter {
    env.filter(|d| !d.trim().is_empty())
        .and_then(|d| EnvFilter::try_new(d).ok())
        .or_else(|| EnvFilter::try_new(level).ok())
        .unwrap_or_else(|| EnvFilter::new("info"))
}

/// `RUST_LOG` wins over the configured level. A second call is a no-op.
pub fn init(config: &LoggingConfig) {
    let env = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let filter = build_filter(env.as_deref(), &config.level);

    let registry = tracing_subscriber::registry().with(filter);

    let result = match config.format {
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_target(true)
                    .with_writer(std::io::stderr),
            )
            .try_init(),
        LogFormat::Pretty => registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_ansi(std::io::stderr().is_terminal())
                    .with_writer(std::io::stderr),
            )
            .try_init(),
    };

    if let Err(e) = result {
        tracing::debug!(error = %e, "logging already initialized");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_directives_win_over_config() {
        assert_eq!(build_filter(Some("debug"), "warn").to_string(), "debug");
        assert_eq!(build_filter(Some("  "), "warn").to_string(), "warn");
        assert_eq!(build_filter(None, "warn").to_string(), "warn");
    }

    #[test]
    fn invalid_level_falls_back_to_info() {
        assert_eq!(build_filter(None, "clawmeter=loud").to_string(), "info");
        assert_eq!(
            build_filter(Some("clawmeter=loud"), "sync=shouting").to_string(),
            "info"
        );
    }
}
