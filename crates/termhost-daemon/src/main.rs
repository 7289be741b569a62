use tracing::{error, info};

fn main() {
    termhost_daemon::logging::init(false);
    info!(event = "daemon.start_started");

    let exit_code = match run() {
        Ok(()) => {
            info!(event = "daemon.start_completed");
            0
        }
        Err(e) => {
            error!(event = "daemon.start_failed", error = %e);
            eprintln!("termhost-daemon: {e}");
            1
        }
    };
    std::process::exit(exit_code);
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    eprintln!("Starting terminal host daemon (PID: {})...", std::process::id());

    let paths = termhost_paths::HostPaths::resolve("termhost", false)?;
    paths.ensure_state_dir()?;
    let config = termhost_daemon::load_daemon_config(&paths.config_file())?;

    let rt = tokio::runtime::Runtime::new().map_err(|e| {
        error!(event = "daemon.runtime_init_failed", error = %e);
        e
    })?;

    rt.block_on(async {
        termhost_daemon::run_server(paths, config).await.map_err(|e| {
            error!(event = "daemon.server_failed", error = %e);
            e
        })
    })?;

    Ok(())
}
