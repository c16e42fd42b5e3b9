//! Tracing subscriber setup for hosts embedding cellbridge.

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Environment variable with the log level used when `RUST_LOG` is unset.
pub const LOG_LEVEL_ENV: &str = "CELLBRIDGE_LOG";

const DEFAULT_FILTER: &str = "cellbridge=info";

/// Filter for the crate at `level`. Unparseable levels fall back to info.
fn crate_filter(level: Option<&str>) -> EnvFilter {
    level
        .and_then(|level| EnvFilter::try_new(format!("cellbridge={level}")).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_FILTER))
}

/// Installs a stderr subscriber. `LOG_FORMAT=json` switches to JSON lines.
/// Does nothing if a global subscriber is already set.
pub fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        crate_filter(std::env::var(LOG_LEVEL_ENV).ok().as_deref())
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}
