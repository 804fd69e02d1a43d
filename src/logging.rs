#![forbid(unsafe_code)]

use tracing_subscriber::EnvFilter;

pub const LOG_ENV: &str = "DUEBELL_LOG";

/// Filter directive when neither `DUEBELL_LOG` nor `RUST_LOG` is set.
#[must_use]
pub fn default_directive(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "duebell=info",
        1 => "duebell=debug",
        _ => "duebell=trace",
    }
}

fn filter(verbosity: u8) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbosity)))
}

/// Logs go to stderr; stdout carries command output. Safe to call twice.
pub fn init(verbosity: u8) {
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter(verbosity))
        .with_target(false)
        .try_init();
}
