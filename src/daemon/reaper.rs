//! Fork-based privilege separation.
//!
//! The server binds its sockets as root and then permanently drops
//! privileges, which leaves it unable to unlink the root-owned sockets
//! and IPC objects on exit. The parent therefore stays around as a
//! reaper: it retains privileges, relays termination signals to the
//! server and performs the cleanup once the server has exited.

use std::io;

use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, ForkResult};
use signal_hook::consts::{SIGHUP, SIGINT, SIGQUIT, SIGTERM};
use signal_hook::iterator::Signals;
use thiserror::Error;

/// Reaper setup failures.
#[derive(Debug, Error)]
pub enum ReaperError {
    /// Forking the server process failed.
    #[error("cannot fork server process: {0}")]
    Fork(nix::Error),
    /// Installing the signal relay failed.
    #[error("signal relay setup failed: {0}")]
    Signals(#[from] io::Error),
}

/// Forks into server and reaper.
///
/// The child runs `server` and exits the process with its return code;
/// this function only returns in the parent. The parent relays SIGHUP,
/// SIGINT, SIGQUIT and SIGTERM to the child, waits for it to exit, runs
/// `cleanup` with retained privileges and returns the child's exit
/// code.
#[allow(unsafe_code)]
pub fn run_with_reaper<S, C>(server: S, cleanup: C) -> Result<i32, ReaperError>
where
    S: FnOnce() -> i32,
    C: FnOnce(),
{
    match unsafe { fork() }.map_err(ReaperError::Fork)? {
        ForkResult::Child => {
            let code = server();
            std::process::exit(code);
        }
        ForkResult::Parent { child } => {
            tracing::debug!(server_pid = %child, "Reaper waiting for server");

            let mut signals = Signals::new([SIGHUP, SIGINT, SIGQUIT, SIGTERM])?;
            let handle = signals.handle();
            let relay = std::thread::spawn(move || {
                for sig in signals.forever() {
                    tracing::debug!(sig, "Relaying signal to server");
                    if let Ok(signal) = Signal::try_from(sig) {
                        let _ = kill(child, signal);
                    }
                }
            });

            let status = waitpid(child, None);
            handle.close();
            let _ = relay.join();

            cleanup();

            match status {
                Ok(WaitStatus::Exited(_, code)) => Ok(code),
                Ok(other) => {
                    tracing::warn!(?other, "Server terminated abnormally");
                    Ok(1)
                }
                Err(err) => {
                    tracing::warn!(%err, "Waiting for server failed");
                    Ok(1)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reaper_collects_exit_code_and_cleans_up() {
        let dir = tempfile::tempdir().expect("tempdir");
        let marker = dir.path().join("cleaned");

        let marker_for_cleanup = marker.clone();
        let code = run_with_reaper(
            || 7,
            move || {
                std::fs::write(&marker_for_cleanup, b"done").expect("marker");
            },
        )
        .expect("reaper");

        assert_eq!(code, 7);
        assert!(marker.exists(), "cleanup did not run");
    }
}
