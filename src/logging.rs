//! Tracing subscriber setup
//!
//! Library code only emits `tracing` events; installing a subscriber is the
//! embedding application's call. Servers attach their events to the span
//! held in their `ServerContext`.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Install a fmt subscriber filtered by `RUST_LOG`
///
/// Falls back to `default_directives` when `RUST_LOG` is unset or invalid.
/// Returns false when a global subscriber was already installed.
pub fn init_tracing(default_directives: &str) -> bool {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directives));
    let fmt_layer = tracing_subscriber::fmt::layer().with_thread_names(true);

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(env_filter)
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_is_harmless() {
        init_tracing("warn");
        assert!(!init_tracing("debug"));
        tracing::info!("still logging");
    }
}
