//! Graceful termination requests.

use std::io;

use tokio::process::Child;

/// Asks a child process to exit.
pub trait Terminator: Send + Sync {
    /// Requests termination of `child` without waiting for it.
    ///
    /// # Errors
    /// Any OS error raised while delivering the request.
    fn terminate(&self, child: &mut Child) -> io::Result<()>;
}

/// SIGTERM on Unix, `TerminateProcess` elsewhere.
#[derive(Debug, Clone, Copy, Default)]
pub struct SignalTerminator;

impl Terminator for SignalTerminator {
    #[cfg(unix)]
    fn terminate(&self, child: &mut Child) -> io::Result<()> {
        // Already reaped; nothing left to signal.
        let Some(pid) = child.id() else {
            return Ok(());
        };
        let pid = libc::pid_t::try_from(pid)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
        // SAFETY: plain signal delivery to a child we spawned and still own.
        let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn terminate(&self, child: &mut Child) -> io::Result<()> {
        child.start_kill()
    }
}
