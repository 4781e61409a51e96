//! Tracing setup shared by the `reliquary` CLI and `reliquary-server`.
//!
//! Tracing is diagnostics only. The audit trail lives in each run's
//! `decision_log.jsonl` and `evidence.jsonl`, which are written no matter what
//! `RUST_LOG` says.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// CLI default: only warnings and errors unless `RUST_LOG` asks for more.
///
/// ```bash
/// RUST_LOG=reliquary=debug reliquary attempt TICKET-1 --outcome failure
/// ```
pub fn init() {
    init_with("warn");
}

/// Install a compact stderr subscriber. `default_filter` is an `EnvFilter`
/// directive list used when `RUST_LOG` is unset or unparsable.
pub fn init_with(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
