//! Tracing subscriber setup for the `fuse` binary.
//!
//! Filter comes from `FUSE_LOG` (e.g. `FUSE_LOG=fusion_harness=debug,sqlx=warn`),
//! defaulting to `info`. Logs go to stderr so command output on stdout
//! stays clean.

use std::sync::Once;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

static INIT: Once = Once::new();

/// Install the global subscriber. Safe to call more than once.
pub fn init_tracing(json: bool) {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_env("FUSE_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
        let registry = tracing_subscriber::registry().with(filter);
        if json {
            registry
                .with(fmt::layer().json().with_target(true).with_writer(std::io::stderr))
                .init();
        } else {
            registry
                .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
                .init();
        }
    });
}
