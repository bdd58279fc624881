//! Development-time tracing for debugging the swarm.
//!
//! # Separation of Concerns
//!
//! - **Tracing (this module)**: Dev diagnostics via `RUST_LOG` or `-v`, output
//!   to stderr. Not persisted, not part of swarm product output.
//!
//! - **Worker artifacts (`io/report_store`, `looping`)**: `status.json`,
//!   manager reports, `stream.log` and task outputs under `.swarm/`. Always
//!   written, unaffected by log levels.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Default directive for a `-v` count when `RUST_LOG` is unset.
pub fn default_directive(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "warn",
        1 => "swarm=info,warn",
        2 => "swarm=debug,info",
        _ => "trace",
    }
}

/// Initialize tracing subscriber for development logging.
///
/// `RUST_LOG` wins when set; otherwise the level follows `verbosity`.
/// Output: stderr, compact format.
///
/// # Example
/// ```bash
/// RUST_LOG=swarm::orchestrator=debug swarm run
/// swarm -vv run
/// ```
pub fn init(verbosity: u8) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbosity)));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact().with_target(verbosity > 1))
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_raises_the_default_level() {
        assert_eq!(default_directive(0), "warn");
        assert!(default_directive(1).contains("swarm=info"));
        assert_eq!(default_directive(9), "trace");
        for level in 0..4 {
            EnvFilter::try_new(default_directive(level)).expect("valid directive");
        }
    }
}
