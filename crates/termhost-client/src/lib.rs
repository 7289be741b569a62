//! Host-embeddable client for the terminal host daemon (spec.md §4.H/§4.I).
//!
//! Embedding hosts depend on this crate instead of speaking the daemon's
//! wire protocol directly: [`DaemonClient`] handles autostart, hello
//! handshake and typed requests, while [`manager`] supplies the admission
//! and bookkeeping layer a host needs to track many panes concurrently.

pub mod autostart;
pub mod client;
pub mod errors;
pub mod manager;

pub use autostart::ensure_daemon_running;
pub use client::DaemonClient;
pub use errors::ClientError;
pub use manager::{AdmissionGate, AdmissionTicket, SessionIndex, Tombstone, TombstoneTable};
