//! Kill escalation state machine (spec.md §4.B, §8 "exit latency under kill").
//!
//! `Kill` starts escalation: SIGTERM, wait up to 2000 ms, SIGKILL, wait up to
//! 1000 ms, then synthesize an `Exit` frame regardless of whether the child
//! actually reaped — this is what keeps the 3.1 s worst-case bound from §8.
//! `Signal` sends an arbitrary signal without starting escalation. `Dispose`
//! skips straight to SIGKILL.

use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::Signal;
use tokio::sync::Mutex;

use crate::errors::PtyHostError;
use crate::pty::ManagedPty;

const SIGTERM_GRACE: Duration = Duration::from_millis(2000);
const SIGKILL_GRACE: Duration = Duration::from_millis(1000);
const POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitOutcome {
    pub exit_code: i32,
    pub signal: u32,
}

/// Waits for the child to exit, polling at `POLL_INTERVAL`, up to `timeout`.
async fn wait_for_exit(
    pty: &Arc<Mutex<ManagedPty>>,
    timeout: Duration,
) -> Option<portable_pty::ExitStatus> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        {
            let mut guard = pty.lock().await;
            if let Ok(Some(status)) = guard.try_wait() {
                return Some(status);
            }
        }
        if tokio::time::Instant::now() >= deadline {
            return None;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

fn status_to_outcome(status: Option<portable_pty::ExitStatus>, fallback_signal: u32) -> ExitOutcome {
    match status {
        Some(status) if status.success() => ExitOutcome {
            exit_code: 0,
            signal: 0,
        },
        Some(status) => ExitOutcome {
            exit_code: status.exit_code() as i32,
            signal: 0,
        },
        None => ExitOutcome {
            exit_code: -1,
            signal: fallback_signal,
        },
    }
}

/// Runs the full SIGTERM -> SIGKILL -> synthetic-exit escalation and returns
/// the outcome to report in the `Exit` frame.
pub async fn escalate(
    pty: Arc<Mutex<ManagedPty>>,
    signal_name: &str,
) -> Result<ExitOutcome, PtyHostError> {
    let term_signal = parse_signal(signal_name).unwrap_or(Signal::SIGTERM);
    {
        let guard = pty.lock().await;
        guard.send_signal(term_signal)?;
    }
    if let Some(status) = wait_for_exit(&pty, SIGTERM_GRACE).await {
        return Ok(status_to_outcome(Some(status), 0));
    }

    {
        let guard = pty.lock().await;
        guard.send_signal(Signal::SIGKILL)?;
    }
    if let Some(status) = wait_for_exit(&pty, SIGKILL_GRACE).await {
        return Ok(status_to_outcome(Some(status), 9));
    }

    // The child would not reap within budget. Synthesize Exit so the
    // subprocess's caller never blocks indefinitely on a wedged kill.
    Ok(status_to_outcome(None, 9))
}

/// Sends an arbitrary signal without starting escalation (spec.md §4.B).
pub async fn send_signal(pty: &Arc<Mutex<ManagedPty>>, signal_name: &str) -> Result<(), PtyHostError> {
    let signal = parse_signal(signal_name).unwrap_or(Signal::SIGINT);
    let guard = pty.lock().await;
    guard.send_signal(signal)
}

/// Dispose: flush already happens in the caller before this is invoked;
/// here we just force-kill immediately.
pub async fn dispose(pty: &Arc<Mutex<ManagedPty>>) -> Result<(), PtyHostError> {
    let guard = pty.lock().await;
    guard.send_signal(Signal::SIGKILL)
}

fn parse_signal(name: &str) -> Option<Signal> {
    match name {
        "SIGTERM" => Some(Signal::SIGTERM),
        "SIGINT" => Some(Signal::SIGINT),
        "SIGKILL" => Some(Signal::SIGKILL),
        "SIGHUP" => Some(Signal::SIGHUP),
        "SIGQUIT" => Some(Signal::SIGQUIT),
        "SIGUSR1" => Some(Signal::SIGUSR1),
        "SIGUSR2" => Some(Signal::SIGUSR2),
        "SIGWINCH" => Some(Signal::SIGWINCH),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_signal_names() {
        assert_eq!(parse_signal("SIGTERM"), Some(Signal::SIGTERM));
        assert_eq!(parse_signal("SIGKILL"), Some(Signal::SIGKILL));
        assert_eq!(parse_signal("bogus"), None);
    }

    #[test]
    fn status_to_outcome_reports_synthetic_exit_on_timeout() {
        let outcome = status_to_outcome(None, 9);
        assert_eq!(outcome, ExitOutcome { exit_code: -1, signal: 9 });
    }
}
