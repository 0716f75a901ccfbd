//! Tracing setup for binaries and tests embedding a3s-remote

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install a global subscriber: `RUST_LOG` if set, otherwise `a3s_remote=<level>`.
///
/// Returns `false` when a subscriber was already installed.
pub fn init_tracing(level: &str) -> bool {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("a3s_remote={}", level).into()),
        )
        .with(fmt::layer())
        .try_init()
        .is_ok()
}
