//! Tracing subscriber setup for processes embedding the transport.

use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

fn default_filter(level: Option<&str>) -> String {
    let level = match level {
        Some("trace") => "trace",
        Some("debug") => "debug",
        Some("warn") | Some("warning") => "warn",
        Some("error") => "error",
        _ => "info",
    };
    format!("tasklink={level},tasklink_values={level}")
}

/// Install a stderr subscriber.
///
/// `RUST_LOG` wins when set; otherwise `TASKLINK_LOG` picks the level for this
/// crate's targets. `LOG_FORMAT=json` switches to JSON lines. Calling this
/// more than once is harmless.
pub fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new(default_filter(std::env::var("TASKLINK_LOG").ok().as_deref()))
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
