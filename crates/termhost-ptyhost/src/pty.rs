//! Thin wrapper around a single `portable_pty` PTY + child process.
//!
//! Grounded on the daemon's old in-process `ManagedPty` (kild-daemon's
//! `pty/manager.rs`), adapted to run inside a dedicated subprocess that owns
//! exactly one PTY rather than a map of many.

use std::io::Write;
use std::sync::{Arc, Mutex};

use portable_pty::{native_pty_system, CommandBuilder, MasterPty, PtySize};

use crate::errors::PtyHostError;

pub struct ManagedPty {
    master: Box<dyn MasterPty + Send>,
    child: Box<dyn portable_pty::Child + Send + Sync>,
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl ManagedPty {
    pub fn spawn(
        shell: &str,
        args: &[String],
        cwd: &str,
        cols: u16,
        rows: u16,
        env: &std::collections::HashMap<String, String>,
    ) -> Result<Self, PtyHostError> {
        let pty_system = native_pty_system();
        let size = PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        };
        let pair = pty_system
            .openpty(size)
            .map_err(|e| PtyHostError::Pty(format!("openpty: {e}")))?;

        let mut cmd = CommandBuilder::new(shell);
        cmd.args(args);
        cmd.cwd(cwd);
        for (k, v) in env {
            cmd.env(k, v);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| PtyHostError::Pty(format!("spawn: {e}")))?;

        let writer = pair
            .master
            .take_writer()
            .map_err(|e| PtyHostError::Pty(format!("take_writer: {e}")))?;

        Ok(Self {
            master: pair.master,
            child,
            writer: Arc::new(Mutex::new(writer)),
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.process_id()
    }

    pub fn try_clone_reader(&self) -> Result<Box<dyn std::io::Read + Send>, PtyHostError> {
        self.master
            .try_clone_reader()
            .map_err(|e| PtyHostError::Pty(format!("clone_reader: {e}")))
    }

    pub fn write_stdin(&self, data: &[u8]) -> Result<(), PtyHostError> {
        let mut w = self
            .writer
            .lock()
            .map_err(|_| PtyHostError::Pty("writer mutex poisoned".into()))?;
        w.write_all(data)
            .map_err(|e| PtyHostError::Pty(format!("write: {e}")))?;
        w.flush().map_err(|e| PtyHostError::Pty(format!("flush: {e}")))
    }

    pub fn resize(&mut self, cols: u16, rows: u16) -> Result<(), PtyHostError> {
        self.master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| PtyHostError::Pty(format!("resize: {e}")))
    }

    pub fn try_wait(&mut self) -> Result<Option<portable_pty::ExitStatus>, PtyHostError> {
        self.child
            .try_wait()
            .map_err(|e| PtyHostError::Pty(format!("try_wait: {e}")))
    }

    #[cfg(unix)]
    pub fn send_signal(&self, signal: nix::sys::signal::Signal) -> Result<(), PtyHostError> {
        let Some(pid) = self.pid() else {
            return Ok(());
        };
        nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), signal)
            .map_err(|e| PtyHostError::Pty(format!("kill({signal}): {e}")))
    }

    pub fn kill(&mut self) -> Result<(), PtyHostError> {
        self.child
            .kill()
            .map_err(|e| PtyHostError::Pty(format!("kill: {e}")))
    }
}
