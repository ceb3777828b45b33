//! Diagnostics for the `mender` binary.
//!
//! The filter comes from `MENDER_LOG`, then `RUST_LOG`, then the default
//! (`warn`, or `debug` with `--verbose`). Output goes to stderr so that
//! `--json` results on stdout stay machine readable.
//!
//! ```bash
//! MENDER_LOG=mender::orchestrator=debug mender review docs/
//! ```

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub const LOG_ENV: &str = "MENDER_LOG";

/// Filter directives to use when no environment variable is set.
pub fn default_directive(verbose: bool) -> &'static str {
    if verbose { "debug" } else { "warn" }
}

fn filter(verbose: bool) -> EnvFilter {
    let from_env = std::env::var(LOG_ENV)
        .ok()
        .or_else(|| std::env::var(EnvFilter::DEFAULT_ENV).ok())
        .filter(|directives| !directives.trim().is_empty());
    match from_env {
        Some(directives) => EnvFilter::try_new(&directives).unwrap_or_else(|e| {
            eprintln!("Ignoring invalid log filter '{directives}': {e}");
            EnvFilter::new(default_directive(verbose))
        }),
        None => EnvFilter::new(default_directive(verbose)),
    }
}

/// Install the global subscriber. Call once, from `main`.
pub fn init(verbose: bool, json: bool) {
    let registry = tracing_subscriber::registry().with(filter(verbose));
    let result = if json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr).with_target(true))
            .try_init()
    } else {
        registry
            .with(fmt::layer().with_writer(std::io::stderr).compact())
            .try_init()
    };
    if let Err(e) = result {
        eprintln!("Logging already initialised: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directive() {
        assert_eq!(default_directive(false), "warn");
        assert_eq!(default_directive(true), "debug");
    }
}
