pub mod config;
pub mod emulator;
pub mod errors;
pub mod logging;
pub mod registry;
pub mod server;
pub mod session;
pub mod subprocess;
pub mod transport;

pub use config::{DaemonConfig, load_daemon_config};
pub use errors::{ConfigError, DaemonError};
pub use registry::SessionRegistry;
pub use server::run_server;
pub use termhost_protocol::{ClientMessage, DaemonMessage, ErrorCode};
