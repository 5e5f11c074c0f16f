//! Tracing/logging initialization.
//!
//! JSON lines on stdout, filtered by `RUST_LOG` (default `info`). Task
//! engine events carry the task key as a `task` field, so one task's claims,
//! failures and commit can be followed across dispatcher workers.

use tracing_subscriber::EnvFilter;

/// Filter used when `RUST_LOG` is unset or invalid.
pub const DEFAULT_FILTER: &str = "info";

/// Initialize tracing with the `RUST_LOG` filter.
///
/// Returns `false` if a global subscriber was already installed.
pub fn init() -> bool {
    init_with_default(DEFAULT_FILTER)
}

/// Initialize tracing, falling back to `default_filter` when `RUST_LOG` is
/// unset or invalid.
pub fn init_with_default(default_filter: &str) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(false)
        .with_current_span(true)
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_init_is_a_no_op() {
        let _ = init_with_default("debug");
        assert!(!init());
        crate::init();
    }
}
