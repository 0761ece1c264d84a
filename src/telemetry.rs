//! Tracing initialisation
//!
//! `RUST_LOG` takes precedence; otherwise the given directive applies.

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

fn filter(default_directive: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive))
}

/// Install the global subscriber
///
/// Panics if a global subscriber is already set; use [`try_init_tracing`]
/// where that can happen.
pub fn init_tracing(default_directive: &str) {
    tracing_subscriber::registry()
        .with(filter(default_directive))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Install the global subscriber unless one is already set
///
/// Returns whether this call installed it.
pub fn try_init_tracing(default_directive: &str) -> bool {
    tracing_subscriber::registry()
        .with(filter(default_directive))
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_init_is_harmless() {
        try_init_tracing("debug");
        assert!(!try_init_tracing("debug"));
        tracing::debug!("still logging");
    }
}
