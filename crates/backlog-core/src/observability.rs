//! Tracing/logging initialization.

use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// Install the global subscriber.
///
/// `RUST_LOG` wins over `filter` when set. Safe to call more than once; later
/// calls are no-ops.
pub fn init_tracing(filter: &str, json: bool) {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false);

    // ignore "already set": tests and embedders may have installed one
    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}

pub fn init_from_config(logging: &LoggingConfig) {
    init_tracing(&logging.filter, logging.json);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_init_is_harmless() {
        init_tracing("debug", false);
        init_tracing("not a valid ==== filter", true);
        init_from_config(&LoggingConfig::default());
        tracing::info!("still logging");
    }
}
