//! Structured logging setup (SPEC_FULL.md §11).
//!
//! Always writes to stderr: stdout is reserved for the `termhost-ptyhost`
//! binary's frame protocol, and even though the daemon itself doesn't speak
//! that protocol on stdout, keeping every binary in this workspace consistent
//! avoids surprises if a module is ever reused across the two.

use tracing_subscriber::EnvFilter;

/// Initialize the global `tracing` subscriber. `json` selects the JSON
/// formatter (for supervisors that parse `daemon.log`); otherwise a compact
/// human-readable formatter is used.
pub fn init(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_writer(std::io::stderr)
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .with_env_filter(filter)
            .init();
    }
}
