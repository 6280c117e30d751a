#![cfg(not(tarpaulin_include))]

use crate::config::Config;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initializes the global tracing subscriber.
///
/// `RUST_LOG` wins when it is set; otherwise the crate logs at the configured
/// level and request traces from tower-http are kept at `info`.
pub fn init(config: &Config) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "surveytray={},tower_http=info,sqlx=warn",
            config.log_level
        ))
    });

    let registry = tracing_subscriber::registry().with(env_filter);

    if config.json_logs {
        registry.with(fmt::layer().json().with_target(true)).init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_line_number(true)
                    .with_writer(std::io::stdout),
            )
            .init();
    }
}
