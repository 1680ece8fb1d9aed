//! Structured logging.
//!
//! # Responsibilities
//! - Install the global tracing subscriber
//! - Resolve the log filter from `RUST_LOG`, falling back to configuration
//!
//! # Design Decisions
//! - `RUST_LOG` wins over the configured level so operators can raise
//!   verbosity without editing config files

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn default_directives(level: &str) -> String {
    format!("quiz_gateway={level},tower_http={level},lapin=warn")
}

/// Install the global subscriber. Calling it twice is harmless.
pub fn init_logging(level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directives(level)));

    if tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .is_err()
    {
        tracing::debug!("Logging already initialized");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directives_scope_crate() {
        let directives = default_directives("debug");
        assert!(directives.starts_with("quiz_gateway=debug"));
        assert!(EnvFilter::try_new(directives).is_ok());
    }
}
